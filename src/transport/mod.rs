//! Frame transport with out-of-band descriptors
//!
//! A transport moves one length-delimited frame at a time, optionally with a
//! list of descriptors attached to it. The protocol logic in
//! [`crate::server`] and [`crate::client`] only talks to the
//! [`FrameTransport`] trait, so it can run over:
//!
//! - [`UnixTransport`] - a Unix stream socket, descriptors travel as
//!   `SCM_RIGHTS` ancillary data on the first `sendmsg` of the frame
//! - [`MemoryTransport`] - an in-process channel pair, descriptors are
//!   duplicated with `dup(2)` instead of going through the kernel socket layer
//!
//! Either way the receiver ends up with its own duplicates: closing them
//! never affects the sender's originals.

pub mod memory;
pub mod unix;

use std::future::Future;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};

use crate::protocol::{MAX_FDS, MAX_FRAME_SIZE};

pub use memory::MemoryTransport;
pub use unix::UnixTransport;

/// One received frame with the descriptors that came with it
#[derive(Debug, Default)]
pub struct Frame {
    pub body: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

/// A bidirectional channel carrying frames plus descriptors
pub trait FrameTransport {
    /// Send `body` as one frame, attaching `fds` in order
    fn send_frame(
        &mut self,
        body: &[u8],
        fds: &[BorrowedFd<'_>],
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Receive one frame and every descriptor attached to it
    fn recv_frame(&mut self) -> impl Future<Output = io::Result<Frame>> + Send;
}

fn check_limits(body_len: usize, fd_count: usize) -> io::Result<()> {
    if body_len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds {} bytes", body_len, MAX_FRAME_SIZE),
        ));
    }
    if fd_count > MAX_FDS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} descriptors exceed the limit of {}", fd_count, MAX_FDS),
        ));
    }
    Ok(())
}
