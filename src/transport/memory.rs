//! In-process transport for exercising the protocol without sockets
//!
//! Frames go through a pair of unbounded tokio channels. Descriptors are
//! duplicated on send, which gives the receiver the same ownership
//! semantics as `SCM_RIGHTS`: its copies are independent of the sender's.

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};

use tokio::sync::mpsc;

use super::{check_limits, Frame, FrameTransport};

/// One end of an in-memory frame channel
#[derive(Debug)]
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryTransport {
    /// Create two connected ends
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Self { tx: a_tx, rx: a_rx },
            Self { tx: b_tx, rx: b_rx },
        )
    }
}

impl FrameTransport for MemoryTransport {
    async fn send_frame(&mut self, body: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<()> {
        check_limits(body.len(), fds.len())?;

        let fds = fds
            .iter()
            .map(|fd| fd.try_clone_to_owned())
            .collect::<io::Result<Vec<OwnedFd>>>()?;
        let frame = Frame {
            body: body.to_vec(),
            fds,
        };

        self.tx
            .send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer transport dropped"))
    }

    async fn recv_frame(&mut self) -> io::Result<Frame> {
        self.rx.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "peer transport dropped")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::{AsFd, AsRawFd};

    #[tokio::test]
    async fn test_pair_is_bidirectional() {
        let (mut a, mut b) = MemoryTransport::pair();
        a.send_frame(b"ping", &[]).await.unwrap();
        assert_eq!(b.recv_frame().await.unwrap().body, b"ping");
        b.send_frame(b"pong", &[]).await.unwrap();
        assert_eq!(a.recv_frame().await.unwrap().body, b"pong");
    }

    #[tokio::test]
    async fn test_fds_are_duplicated() {
        let (mut a, mut b) = MemoryTransport::pair();
        let file = tempfile::tempfile().unwrap();
        a.send_frame(b"", &[file.as_fd()]).await.unwrap();
        let frame = b.recv_frame().await.unwrap();
        assert_eq!(frame.fds.len(), 1);
        assert_ne!(frame.fds[0].as_raw_fd(), file.as_raw_fd());
    }

    #[tokio::test]
    async fn test_dropped_peer_is_eof() {
        let (a, mut b) = MemoryTransport::pair();
        drop(a);
        let err = b.recv_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
