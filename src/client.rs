//! Client side of the fd server protocol
//!
//! Every call opens a fresh connection, sends one request and waits for the
//! single response. Descriptors handed out by the server arrive as
//! [`OwnedFd`]s owned by the caller; dropping them closes only the client's
//! copies.
//!
//! # Example
//!
//! ```ignore
//! let client = FdClient::new("/run/tapfd/tapfd.sock");
//! let (fds, created) = client
//!     .add_fds("vm-1", &TapConfig { interface: "tap%d".into(), vnet_hdr: true, queues: 1 })
//!     .await?;
//! // hand `fds` to the VMM ...
//! client.release_fds("vm-1").await?;
//! ```

use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::error::{FdError, Result};
use crate::protocol::{Command, Request, Response};
use crate::transport::{FrameTransport, UnixTransport};

/// Send `request` over `transport` and wait for the matching response
///
/// A response carrying an error becomes [`FdError::Server`]. The number of
/// descriptors received must match the count announced in the response.
pub async fn round_trip<T: FrameTransport>(
    transport: &mut T,
    request: &Request,
) -> Result<(Vec<OwnedFd>, Vec<u8>)> {
    let body = request.encode()?;
    transport.send_frame(&body, &[]).await?;

    let frame = transport.recv_frame().await?;
    let response = Response::decode(&frame.body)?;
    if let Some(message) = response.error {
        return Err(FdError::Server(message));
    }
    if frame.fds.len() != response.fd_count {
        return Err(FdError::Decode(format!(
            "expected {} descriptors, received {}",
            response.fd_count,
            frame.fds.len()
        )));
    }
    Ok((frame.fds, response.payload))
}

/// Client for an fd server listening on a Unix socket
#[derive(Debug, Clone)]
pub struct FdClient {
    socket_path: PathBuf,
}

impl FdClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn call(&self, request: Request) -> Result<(Vec<OwnedFd>, Vec<u8>)> {
        let mut transport = UnixTransport::connect(&self.socket_path).await?;
        let result = round_trip(&mut transport, &request).await;
        debug!(
            command = %request.command,
            key = %request.key,
            ok = result.is_ok(),
            "fd request done"
        );
        result
    }

    /// Create the resource for `key`, serializing `data` as JSON
    ///
    /// Returns the new descriptors and the source's response payload.
    pub async fn add_fds<T: Serialize + ?Sized>(
        &self,
        key: &str,
        data: &T,
    ) -> Result<(Vec<OwnedFd>, Vec<u8>)> {
        let payload = serde_json::to_vec(data).map_err(|e| FdError::Encode(e.to_string()))?;
        self.add_fds_raw(key, payload).await
    }

    /// Like [`add_fds`](Self::add_fds) with an already-encoded payload
    pub async fn add_fds_raw(&self, key: &str, payload: Vec<u8>) -> Result<(Vec<OwnedFd>, Vec<u8>)> {
        self.call(Request::new(Command::Add, key, payload)).await
    }

    /// Fetch fresh copies of the descriptors for `key` plus its info payload
    pub async fn get_fds(&self, key: &str) -> Result<(Vec<OwnedFd>, Vec<u8>)> {
        self.call(Request::new(Command::Get, key, Vec::new())).await
    }

    /// Drop `key` and close the server's descriptors for it
    pub async fn release_fds(&self, key: &str) -> Result<()> {
        self.call(Request::new(Command::Release, key, Vec::new()))
            .await
            .map(|_| ())
    }

    /// Re-register `key` after a server restart, without new descriptors
    pub async fn recover<T: Serialize + ?Sized>(&self, key: &str, data: &T) -> Result<()> {
        let payload = serde_json::to_vec(data).map_err(|e| FdError::Encode(e.to_string()))?;
        self.recover_raw(key, payload).await
    }

    pub async fn recover_raw(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        self.call(Request::new(Command::Recover, key, payload))
            .await
            .map(|_| ())
    }
}
