//! Fd server - hands out descriptors from an [`FdSource`] over a Unix socket
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  FdServer                                                            │
//! │                                                                      │
//! │  accept loop (tokio task)                                            │
//! │       │ one task per connection                                      │
//! │       ▼                                                              │
//! │  serve_connection: recv Request ──► DispatchHandle ──► send Response │
//! │                                          │              + SCM_RIGHTS │
//! │                                          ▼                           │
//! │                            dispatcher thread (serialized)            │
//! │                            ├── FdSource                              │
//! │                            └── key → [OwnedFd] cache                 │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each connection carries exactly one request and one response. Frame I/O
//! runs concurrently across connections; only the dispatch itself is
//! serialized.

pub mod dispatcher;

use std::fs;
use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::Path;
use std::thread;

use tokio::net::UnixListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::FdServerConfig;
use crate::error::{FdError, Result};
use crate::fdsource::FdSource;
use crate::metrics::{FD_CONNECTION_ERRORS, FD_DESCRIPTORS_SENT, FD_REQUESTS_TOTAL};
use crate::protocol::{Request, Response};
use crate::transport::{FrameTransport, UnixTransport};

pub use dispatcher::{DispatchHandle, Dispatcher, Reply};

/// Pause after a failed accept (e.g. EMFILE) before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

enum State<S: FdSource> {
    /// Created, not serving yet
    Idle(S),
    Serving(Running),
    Stopped,
}

struct Running {
    dispatch: DispatchHandle,
    dispatch_thread: thread::JoinHandle<()>,
    shutdown: oneshot::Sender<()>,
    accept_task: JoinHandle<()>,
}

/// Server owning one fd source
///
/// # Example
///
/// ```ignore
/// let mut server = FdServer::new("/run/tapfd/tapfd.sock", TapFdSource::new());
/// server.serve().await?;
/// // ... clients connect ...
/// server.stop().await?;
/// ```
pub struct FdServer<S: FdSource> {
    config: FdServerConfig,
    state: State<S>,
}

impl<S: FdSource> FdServer<S> {
    /// Create a server for `socket_path` with default settings
    pub fn new(socket_path: impl AsRef<Path>, source: S) -> Self {
        Self::with_config(FdServerConfig::new(socket_path.as_ref()), source)
    }

    pub fn with_config(config: FdServerConfig, source: S) -> Self {
        Self {
            config,
            state: State::Idle(source),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    /// Whether `stop` has run
    pub fn is_stopped(&self) -> bool {
        matches!(self.state, State::Stopped)
    }

    /// Start accepting connections
    ///
    /// Returns once the listener is bound, so clients may connect right
    /// away. Must be called from within a tokio runtime.
    pub async fn serve(&mut self) -> Result<()> {
        let source = match std::mem::replace(&mut self.state, State::Stopped) {
            State::Idle(source) => source,
            State::Serving(running) => {
                self.state = State::Serving(running);
                return Err(FdError::Backend("fd server is already serving".to_string()));
            }
            State::Stopped => return Err(FdError::Stopped),
        };

        let listener = match bind(&self.config.socket_path) {
            Ok(listener) => listener,
            Err(e) => {
                self.state = State::Idle(source);
                return Err(e.into());
            }
        };

        let (dispatch, dispatch_thread) =
            DispatchHandle::spawn(Dispatcher::new(source), self.config.queue_depth)?;
        let (shutdown, shutdown_rx) = oneshot::channel();
        let accept_task = tokio::spawn(accept_loop(listener, dispatch.clone(), shutdown_rx));

        info!(
            socket = %self.config.socket_path.display(),
            queue_depth = self.config.queue_depth,
            "fd server listening"
        );

        self.state = State::Serving(Running {
            dispatch,
            dispatch_thread,
            shutdown,
            accept_task,
        });
        Ok(())
    }

    /// Stop accepting, finish queued requests, then stop the fd source
    ///
    /// Idempotent. Once this returns no further request reaches the source.
    pub async fn stop(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Stopped) {
            State::Idle(mut source) => source.stop(),
            State::Stopped => Ok(()),
            State::Serving(running) => {
                let _ = running.shutdown.send(());
                if let Err(e) = running.accept_task.await {
                    warn!(error = %e, "accept loop ended abnormally");
                }

                let result = running.dispatch.stop().await;
                if !join_dispatcher(running.dispatch_thread).await {
                    warn!("dispatcher thread panicked");
                }

                match fs::remove_file(&self.config.socket_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!(error = %e, "can't remove socket file"),
                }

                info!(socket = %self.config.socket_path.display(), "fd server stopped");
                result
            }
        }
    }
}

impl<S: FdSource> Drop for FdServer<S> {
    fn drop(&mut self) {
        // The dispatcher thread exits on its own once every handle is gone
        if let State::Serving(running) = &self.state {
            running.accept_task.abort();
        }
    }
}

/// Wait for the dispatcher thread to exit; false if it panicked
async fn join_dispatcher(thread: thread::JoinHandle<()>) -> bool {
    match tokio::task::spawn_blocking(move || thread.join()).await {
        Ok(Ok(())) => true,
        Ok(Err(_)) => false,
        Err(e) => {
            warn!(error = %e, "can't join dispatcher thread");
            false
        }
    }
}

fn bind(path: &Path) -> io::Result<UnixListener> {
    match fs::remove_file(path) {
        Ok(()) => debug!(socket = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    UnixListener::bind(path)
}

async fn accept_loop(
    listener: UnixListener,
    dispatch: DispatchHandle,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let dispatch = dispatch.clone();
                    let request_id = Uuid::now_v7();
                    let span = info_span!("fd_connection", request_id = %request_id);
                    tokio::spawn(
                        async move {
                            if let Err(e) = serve_connection(UnixTransport::new(stream), &dispatch).await {
                                FD_CONNECTION_ERRORS.with_label_values(&[e.kind()]).inc();
                                warn!(error = %e, "connection aborted");
                            }
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    FD_CONNECTION_ERRORS.with_label_values(&["accept"]).inc();
                    warn!(error = %e, "accept failed");
                    sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }
    debug!("accept loop exiting");
}

/// Run one request/response cycle on `transport`
///
/// Source errors are sent back to the client. Only decode and transport
/// failures are returned, in which case the connection is simply dropped.
pub async fn serve_connection<T: FrameTransport>(
    mut transport: T,
    dispatch: &DispatchHandle,
) -> Result<()> {
    let frame = transport.recv_frame().await?;
    if !frame.fds.is_empty() {
        warn!(count = frame.fds.len(), "dropping descriptors attached to a request");
    }
    let request = Request::decode(&frame.body)?;
    let command = request.command;
    debug!(command = %command, key = %request.key, "request");

    let (response, fds) = match dispatch.dispatch(request).await {
        Ok(reply) => (Response::ok(reply.payload, reply.fds.len()), reply.fds),
        Err(e) => {
            debug!(command = %command, error = %e, "request failed");
            FD_REQUESTS_TOTAL
                .with_label_values(&[command.as_str(), e.kind()])
                .inc();
            (Response::error(e.to_string()), Vec::new())
        }
    };
    if response.error.is_none() {
        FD_REQUESTS_TOTAL
            .with_label_values(&[command.as_str(), "ok"])
            .inc();
    }

    let (body, fds) = match response.encode() {
        Ok(body) => (body, fds),
        Err(e) => (Response::error(e.to_string()).encode()?, Vec::new()),
    };
    let borrowed: Vec<BorrowedFd<'_>> = fds.iter().map(|fd| fd.as_fd()).collect();
    transport.send_frame(&body, &borrowed).await?;
    FD_DESCRIPTORS_SENT.inc_by(borrowed.len() as f64);
    Ok(())
}
