//! Unix domain socket transport with `SCM_RIGHTS` descriptor passing
//!
//! # How descriptors travel
//!
//! ```text
//!   sender                                            receiver
//!   ──────                                            ────────
//!   sendmsg(len+body, SCM_RIGHTS[fd0, fd1])  ──────►  recvmsg(header) → [fd0', fd1']
//!   write_all(rest of frame)                 ──────►  read_exact(body)
//! ```
//!
//! On a stream socket the ancillary data sticks to the first byte of the
//! `sendmsg` that carried it, so the receiver picks the descriptors up while
//! reading the 4-byte length header. The kernel installs fresh descriptor
//! numbers in the receiving process (`fd0'`, `fd1'`) that share the open
//! file description with the sender's originals.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::UnixStream;

use super::{check_limits, Frame, FrameTransport};
use crate::protocol::{MAX_FDS, MAX_FRAME_SIZE};

/// Frame transport over a connected tokio `UnixStream`
#[derive(Debug)]
pub struct UnixTransport {
    stream: UnixStream,
}

impl UnixTransport {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Connect to a listening fd server socket
    pub async fn connect(path: impl AsRef<Path>) -> io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::new(stream))
    }
}

impl FrameTransport for UnixTransport {
    async fn send_frame(&mut self, body: &[u8], fds: &[BorrowedFd<'_>]) -> io::Result<()> {
        check_limits(body.len(), fds.len())?;

        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(body);

        let raw_fds: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
        let sock = self.stream.as_raw_fd();

        // Descriptors go out with the first chunk only
        let sent = self
            .stream
            .async_io(Interest::WRITABLE, || send_with_fds(sock, &frame, &raw_fds))
            .await?;
        if sent < frame.len() {
            self.stream.write_all(&frame[sent..]).await?;
        }
        self.stream.flush().await
    }

    async fn recv_frame(&mut self) -> io::Result<Frame> {
        let mut header = [0u8; 4];
        let mut filled = 0;
        let mut fds = Vec::new();
        let sock = self.stream.as_raw_fd();

        while filled < header.len() {
            let (n, received) = self
                .stream
                .async_io(Interest::READABLE, || {
                    recv_with_fds(sock, &mut header[filled..])
                })
                .await?;
            fds.extend(received);
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before frame header",
                ));
            }
            filled += n;
        }

        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds {} bytes", len, MAX_FRAME_SIZE),
            ));
        }

        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await?;

        Ok(Frame { body, fds })
    }
}

fn send_with_fds(sock: RawFd, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let iov = [IoSlice::new(data)];

    let cmsgs_storage;
    let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() {
        &[]
    } else {
        cmsgs_storage = [ControlMessage::ScmRights(fds)];
        &cmsgs_storage
    };

    sendmsg::<()>(sock, &iov, cmsgs, MsgFlags::empty(), None).map_err(io::Error::from)
}

fn recv_with_fds(sock: RawFd, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_FDS]);

    let msg = recvmsg::<()>(
        sock,
        &mut iov,
        Some(&mut cmsg_buffer),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )
    .map_err(io::Error::from)?;

    let mut fds = Vec::new();
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(raw) = cmsg {
            // SAFETY: the kernel just installed these descriptors for us and
            // nothing else refers to them yet.
            fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
        }
    }

    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "ancillary data truncated (too many descriptors)",
        ));
    }

    Ok((msg.bytes, fds))
}
