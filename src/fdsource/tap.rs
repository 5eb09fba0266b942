//! Fd source handing out Linux tap devices
//!
//! # How a tap device is created
//!
//! ```text
//! open("/dev/net/tun", O_RDWR)            ← one descriptor per queue
//!        │
//!        ▼
//! ioctl(fd, TUNSETIFF, ifreq{name, flags}) ← IFF_TAP | IFF_NO_PI [| IFF_VNET_HDR]
//!        │                                   [| IFF_MULTI_QUEUE]
//!        ▼
//! kernel writes the final name back       ← "tap%d" patterns get resolved
//! ```
//!
//! The device is not persistent: once every descriptor for it is closed
//! (the server's copy on release, the VMM's copy when it exits) the kernel
//! removes the interface.
//!
//! Recovery after a restart only re-registers the metadata. The VMM that
//! received the descriptors earlier still holds them, so nothing is reopened.
//!
//! Creating taps requires `CAP_NET_ADMIN`.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::FdSource;
use crate::error::{FdError, Result};

/// Default clone device for tun/tap
pub const TUN_DEVICE: &str = "/dev/net/tun";

/// Upper bound for queues of a multi-queue tap
pub const MAX_QUEUES: u16 = 16;

/// `struct ifreq` restricted to the name + flags members used by TUNSETIFF
#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    _pad: [u8; 22],
}

mod ioctl {
    // TUNSETIFF is _IOW('T', 202, int), but it takes a `struct ifreq *` and writes the name back
    nix::ioctl_readwrite_bad!(
        tun_set_iff,
        nix::request_code_write!(b'T', 202, std::mem::size_of::<libc::c_int>()),
        super::IfReq
    );
}

fn default_queues() -> u16 {
    1
}

/// Request payload understood by [`TapFdSource`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapConfig {
    /// Interface name, or a pattern such as `tap%d`
    pub interface: String,
    /// Prepend a virtio net header to every frame
    #[serde(default)]
    pub vnet_hdr: bool,
    /// Number of queues; more than one creates a multi-queue tap
    #[serde(default = "default_queues")]
    pub queues: u16,
}

impl TapConfig {
    fn validate(&self) -> Result<()> {
        if self.interface.is_empty() {
            return Err(FdError::Backend("empty interface name".to_string()));
        }
        if self.interface.len() >= libc::IFNAMSIZ {
            return Err(FdError::Backend(format!(
                "interface name {:?} is longer than {} bytes",
                self.interface,
                libc::IFNAMSIZ - 1
            )));
        }
        if self.interface.as_bytes().contains(&0) {
            return Err(FdError::Backend(format!(
                "interface name {:?} contains NUL",
                self.interface
            )));
        }
        if self.queues == 0 || self.queues > MAX_QUEUES {
            return Err(FdError::Backend(format!(
                "queue count {} out of range 1..={}",
                self.queues, MAX_QUEUES
            )));
        }
        Ok(())
    }

    fn flags(&self) -> libc::c_short {
        let mut flags = libc::IFF_TAP | libc::IFF_NO_PI;
        if self.vnet_hdr {
            flags |= libc::IFF_VNET_HDR;
        }
        if self.queues > 1 {
            flags |= libc::IFF_MULTI_QUEUE;
        }
        flags as libc::c_short
    }
}

/// Payload returned from `get_fds`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapCreated {
    pub interface: String,
}

/// Payload returned from `get_info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapInfo {
    pub interface: String,
    pub vnet_hdr: bool,
    pub queues: u16,
    /// Registered through `recover` rather than created here
    pub recovered: bool,
}

/// Fd source creating tap devices
#[derive(Debug)]
pub struct TapFdSource {
    device: PathBuf,
    taps: HashMap<String, TapInfo>,
    stopped: bool,
}

impl Default for TapFdSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TapFdSource {
    pub fn new() -> Self {
        Self::with_device(TUN_DEVICE)
    }

    /// Use a different clone device path
    pub fn with_device(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
            taps: HashMap::new(),
            stopped: false,
        }
    }

    fn check_running(&self) -> Result<()> {
        if self.stopped {
            return Err(FdError::Stopped);
        }
        Ok(())
    }

    fn open_queue(&self, name: &str, flags: libc::c_short) -> Result<(OwnedFd, String)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(&self.device)
            .map_err(|e| {
                FdError::Backend(format!("can't open {}: {}", self.device.display(), e))
            })?;

        let mut req = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags,
            _pad: [0; 22],
        };
        for (dst, src) in req.name.iter_mut().zip(name.as_bytes()) {
            *dst = *src as libc::c_char;
        }

        // SAFETY: `file` is an open tun clone device and `req` outlives the call.
        unsafe { ioctl::tun_set_iff(file.as_raw_fd(), &mut req) }
            .map_err(|e| FdError::Backend(format!("TUNSETIFF on {:?}: {}", name, e)))?;

        let actual: Vec<u8> = req
            .name
            .iter()
            .take_while(|c| **c != 0)
            .map(|c| *c as u8)
            .collect();
        Ok((OwnedFd::from(file), String::from_utf8_lossy(&actual).into_owned()))
    }
}

fn parse(payload: &[u8]) -> Result<TapConfig> {
    let config: TapConfig = serde_json::from_slice(payload)
        .map_err(|e| FdError::Backend(format!("bad tap config: {}", e)))?;
    config.validate()?;
    Ok(config)
}

impl FdSource for TapFdSource {
    fn get_fds(&mut self, key: &str, payload: &[u8]) -> Result<(Vec<OwnedFd>, Vec<u8>)> {
        self.check_running()?;
        let config = parse(payload)?;
        if self.taps.contains_key(key) {
            return Err(FdError::DuplicateKey(key.to_string()));
        }

        let flags = config.flags();
        let (first, interface) = self.open_queue(&config.interface, flags)?;
        let mut fds = vec![first];
        // Further queues attach to the resolved name, not the pattern
        for _ in 1..config.queues {
            let (fd, _) = self.open_queue(&interface, flags)?;
            fds.push(fd);
        }

        info!(key, interface = %interface, queues = config.queues, "tap device created");
        self.taps.insert(
            key.to_string(),
            TapInfo {
                interface: interface.clone(),
                vnet_hdr: config.vnet_hdr,
                queues: config.queues,
                recovered: false,
            },
        );

        let response = serde_json::to_vec(&TapCreated { interface })
            .map_err(|e| FdError::Encode(e.to_string()))?;
        Ok((fds, response))
    }

    fn recover(&mut self, key: &str, payload: &[u8]) -> Result<()> {
        self.check_running()?;
        let config = parse(payload)?;
        if self.taps.contains_key(key) {
            return Err(FdError::DuplicateKey(key.to_string()));
        }

        debug!(key, interface = %config.interface, "tap device recovered");
        self.taps.insert(
            key.to_string(),
            TapInfo {
                interface: config.interface,
                vnet_hdr: config.vnet_hdr,
                queues: config.queues,
                recovered: true,
            },
        );
        Ok(())
    }

    fn release(&mut self, key: &str) -> Result<()> {
        self.check_running()?;
        match self.taps.remove(key) {
            Some(tap) => {
                debug!(key, interface = %tap.interface, "tap device released");
                Ok(())
            }
            None => Err(FdError::NotFound(key.to_string())),
        }
    }

    fn get_info(&self, key: &str) -> Result<Vec<u8>> {
        self.check_running()?;
        let tap = self
            .taps
            .get(key)
            .ok_or_else(|| FdError::NotFound(key.to_string()))?;
        serde_json::to_vec(tap).map_err(|e| FdError::Encode(e.to_string()))
    }

    fn stop(&mut self) -> Result<()> {
        self.stopped = true;
        self.taps.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(interface: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({ "interface": interface })).unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let config: TapConfig = serde_json::from_slice(&payload("tap0")).unwrap();
        assert_eq!(config.queues, 1);
        assert!(!config.vnet_hdr);
        assert_eq!(config.flags(), (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short);
    }

    #[test]
    fn test_config_flags() {
        let config = TapConfig {
            interface: "tap%d".to_string(),
            vnet_hdr: true,
            queues: 4,
        };
        let flags = config.flags() as libc::c_int;
        assert_ne!(flags & libc::IFF_VNET_HDR, 0);
        assert_ne!(flags & libc::IFF_MULTI_QUEUE, 0);
    }

    #[test]
    fn test_config_validation() {
        let mut source = TapFdSource::with_device("/nonexistent/tun");
        let long = "x".repeat(libc::IFNAMSIZ);
        assert!(source.get_fds("k", &payload(&long)).is_err());
        assert!(source.get_fds("k", &payload("")).is_err());

        let zero_queues = br#"{"interface": "tap0", "queues": 0}"#;
        assert!(source.recover("k", zero_queues).is_err());
    }

    #[test]
    fn test_missing_device_leaves_key_untracked() {
        let mut source = TapFdSource::with_device("/nonexistent/tun");
        let err = source.get_fds("k", &payload("tap0")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/tun"));
        assert!(matches!(source.get_info("k"), Err(FdError::NotFound(_))));
    }

    #[test]
    fn test_recover_then_info_and_release() {
        let mut source = TapFdSource::new();
        source.recover("vm-1", &payload("tap7")).unwrap();

        let info: TapInfo = serde_json::from_slice(&source.get_info("vm-1").unwrap()).unwrap();
        assert_eq!(info.interface, "tap7");
        assert!(info.recovered);

        assert!(matches!(
            source.recover("vm-1", &payload("tap7")),
            Err(FdError::DuplicateKey(_))
        ));
        source.release("vm-1").unwrap();
        assert!(matches!(source.release("vm-1"), Err(FdError::NotFound(_))));
    }

    #[test]
    fn test_stop() {
        let mut source = TapFdSource::new();
        source.recover("vm-1", &payload("tap7")).unwrap();
        source.stop().unwrap();
        assert!(matches!(source.get_info("vm-1"), Err(FdError::Stopped)));
        assert!(matches!(source.release("vm-1"), Err(FdError::Stopped)));
        assert!(matches!(source.recover("vm-2", &payload("tap8")), Err(FdError::Stopped)));
    }

    #[test]
    #[ignore = "Requires CAP_NET_ADMIN and /dev/net/tun"]
    fn test_create_tap() {
        let mut source = TapFdSource::new();
        let (fds, resp) = source.get_fds("vm-1", &payload("fdtest%d")).unwrap();
        assert_eq!(fds.len(), 1);
        let created: TapCreated = serde_json::from_slice(&resp).unwrap();
        assert!(created.interface.starts_with("fdtest"));
        source.release("vm-1").unwrap();
    }
}
