//! tapfd - hands out tap device descriptors to VM processes over a Unix socket
//!
//! A privileged server owns the network resources (tap devices) of a VM
//! runtime. Unprivileged clients ask it to create a resource under a key
//! and get the resulting file descriptors passed back via `SCM_RIGHTS`.
//! The server keeps its own copies, so descriptors can be fetched again
//! later, and re-registers keys after a restart through `recover`.
//!
//! # Modules
//!
//! - `fdsource` - the `FdSource` trait plus the tap and temp-file sources
//! - `server` - `FdServer`, accept loop and serialized dispatcher
//! - `client` - `FdClient`, one connection per request
//! - `protocol` - binary request/response codec
//! - `transport` - frame transport over Unix sockets or in memory
//! - `config` - server and daemon settings
//! - `metrics` - Prometheus metrics
//! - `tracing` - subscriber setup with optional OTLP export
//!
//! # Quick Start
//!
//! ```ignore
//! use tapfd::{FdClient, FdServer, TapConfig, TapFdSource};
//!
//! let mut server = FdServer::new("/run/tapfd/tapfd.sock", TapFdSource::new());
//! server.serve().await?;
//!
//! let client = FdClient::new("/run/tapfd/tapfd.sock");
//! let (fds, _) = client.add_fds("vm-1", &TapConfig { interface: "tap%d".into(), vnet_hdr: false, queues: 1 }).await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod fdsource;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod tracing;
pub mod transport;

pub use client::FdClient;
pub use config::{DaemonConfig, FdServerConfig};
pub use error::{FdError, Result};
pub use fdsource::{FdSource, TapConfig, TapFdSource, TempFileData, TempFileProbe, TempFileSource};
pub use server::FdServer;
