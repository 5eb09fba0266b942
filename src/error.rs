//! Error type shared by the fd server, the client and the fd sources
//!
//! The variants fall into two groups:
//!
//! ```text
//! ┌───────────────────────────────┬────────────────────────────────────────┐
//! │  Logical (key state)          │  Protocol / plumbing                   │
//! ├───────────────────────────────┼────────────────────────────────────────┤
//! │  DuplicateKey, NotFound,      │  Decode, Encode, Transport             │
//! │  BadKey, Stopped, Backend     │                                        │
//! └───────────────────────────────┴────────────────────────────────────────┘
//! ```
//!
//! Logical errors produced on the server side travel back to the client as
//! text and resurface there as `FdError::Server`, displayed as
//! `server returned error: <message>`. Plumbing errors on the client side
//! keep their own shape, so callers can tell the two apart.

use std::io;

/// Error type for fd passing operations
#[derive(Debug)]
pub enum FdError {
    /// `add`/`recover` on a key the fd source already tracks
    DuplicateKey(String),
    /// The fd source doesn't track the key
    NotFound(String),
    /// The server rejected the key before consulting the fd source
    BadKey(String),
    /// The fd source (and the server owning it) has been stopped
    Stopped,
    /// Malformed frame or payload
    Decode(String),
    /// A request or response can't be represented on the wire
    Encode(String),
    /// Socket create/connect/read/write failure
    Transport(io::Error),
    /// Error reported by the server in a response
    Server(String),
    /// Any other fd source failure
    Backend(String),
}

impl std::fmt::Display for FdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FdError::DuplicateKey(key) => write!(f, "key {:?} is already present", key),
            FdError::NotFound(key) => write!(f, "key {:?} not found", key),
            FdError::BadKey(key) => write!(f, "bad fd key: {:?}", key),
            FdError::Stopped => write!(f, "fd source is stopped"),
            FdError::Decode(msg) => write!(f, "decode error: {}", msg),
            FdError::Encode(msg) => write!(f, "encode error: {}", msg),
            FdError::Transport(e) => write!(f, "transport error: {}", e),
            FdError::Server(msg) => write!(f, "server returned error: {}", msg),
            FdError::Backend(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for FdError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FdError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FdError {
    fn from(e: io::Error) -> Self {
        FdError::Transport(e)
    }
}

impl From<nix::Error> for FdError {
    fn from(e: nix::Error) -> Self {
        FdError::Transport(io::Error::from(e))
    }
}

impl From<serde_json::Error> for FdError {
    fn from(e: serde_json::Error) -> Self {
        FdError::Decode(format!("json: {}", e))
    }
}

impl FdError {
    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            FdError::DuplicateKey(_) => "duplicate_key",
            FdError::NotFound(_) => "not_found",
            FdError::BadKey(_) => "bad_key",
            FdError::Stopped => "stopped",
            FdError::Decode(_) => "decode",
            FdError::Encode(_) => "encode",
            FdError::Transport(_) => "transport",
            FdError::Server(_) => "server",
            FdError::Backend(_) => "backend",
        }
    }
}

pub type Result<T> = std::result::Result<T, FdError>;
