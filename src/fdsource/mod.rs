//! Resource capabilities that produce descriptors for the fd server
//!
//! An [`FdSource`] owns the actual resources (tap devices, files, ...) and
//! knows how to create, recover, inspect and free them by key. The server
//! never calls into a source concurrently: every call happens on the single
//! dispatcher thread, so implementations can use plain `&mut self` state.
//!
//! # Key lifecycle as seen by a source
//!
//! ```text
//!              get_fds / recover
//!   Unknown ─────────────────────► Tracked ──┐
//!      ▲                              │      │ get_info
//!      └──────────── release ─────────┘ ◄────┘
//!
//!   stop() from any state ──► Stopped (every later call fails)
//! ```
//!
//! Available sources:
//! - [`TempFileSource`] - anonymous temp files filled with caller content
//! - [`TapFdSource`] - Linux tap devices opened through `/dev/net/tun`

pub mod tap;
pub mod temp_file;

use std::os::fd::OwnedFd;

use crate::error::Result;

pub use tap::{TapConfig, TapFdSource};
pub use temp_file::{TempFileData, TempFileProbe, TempFileSource};

/// Pluggable backend providing keyed resources
pub trait FdSource: Send + 'static {
    /// Create a brand-new resource for `key`
    ///
    /// Returns the descriptors (ownership moves to the caller, in the order
    /// they must be delivered) and an opaque response payload. Fails with
    /// `DuplicateKey` if the key is already tracked.
    fn get_fds(&mut self, key: &str, payload: &[u8]) -> Result<(Vec<OwnedFd>, Vec<u8>)>;

    /// Track a previously known key without opening anything
    ///
    /// Used after a server restart to resynchronize state with resources
    /// that still exist. Fails with `DuplicateKey` if already tracked.
    fn recover(&mut self, key: &str, payload: &[u8]) -> Result<()>;

    /// Free the resource behind `key`; fails with `NotFound` if untracked
    fn release(&mut self, key: &str) -> Result<()>;

    /// Current opaque metadata for `key`; fails with `NotFound` if untracked
    fn get_info(&self, key: &str) -> Result<Vec<u8>>;

    /// Shut the source down for good
    fn stop(&mut self) -> Result<()>;
}
