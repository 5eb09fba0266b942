//! Configuration for the fd server and the daemon around it
//!
//! Every setting has a default; the daemon overrides them from the
//! environment:
//!
//! | Variable              | Setting                         | Default                 |
//! |-----------------------|---------------------------------|-------------------------|
//! | `TAPFD_SOCKET`        | socket path                     | `/run/tapfd/tapfd.sock` |
//! | `TAPFD_QUEUE_DEPTH`   | dispatcher queue depth          | `64`                    |
//! | `TAPFD_OTLP_ENDPOINT` | OTLP collector (tracing export) | unset (disabled)        |

use std::path::PathBuf;

use tracing::warn;

pub const DEFAULT_SOCKET_PATH: &str = "/run/tapfd/tapfd.sock";
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

pub const ENV_SOCKET: &str = "TAPFD_SOCKET";
pub const ENV_QUEUE_DEPTH: &str = "TAPFD_QUEUE_DEPTH";
pub const ENV_OTLP_ENDPOINT: &str = "TAPFD_OTLP_ENDPOINT";

/// Configuration for [`crate::FdServer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdServerConfig {
    /// Unix socket the server listens on; a stale file there is removed
    pub socket_path: PathBuf,
    /// Requests that may wait for the dispatcher before senders block
    pub queue_depth: usize,
}

impl Default for FdServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl FdServerConfig {
    /// Default settings with a custom socket path
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Self::default()
        }
    }

    /// Read overrides from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read overrides through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(path) = lookup(ENV_SOCKET).filter(|p| !p.is_empty()) {
            config.socket_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup(ENV_QUEUE_DEPTH) {
            match raw.parse::<usize>() {
                Ok(depth) if depth > 0 => config.queue_depth = depth,
                _ => warn!(value = %raw, "ignoring invalid {}", ENV_QUEUE_DEPTH),
            }
        }
        config
    }
}

/// Settings for the `tapfd-server` binary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonConfig {
    pub server: FdServerConfig,
    /// OTLP endpoint for span export; `None` keeps tracing local
    pub otlp_endpoint: Option<String>,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            otlp_endpoint: lookup(ENV_OTLP_ENDPOINT).filter(|e| !e.is_empty()),
            server: FdServerConfig::from_lookup(lookup),
        }
    }
}
