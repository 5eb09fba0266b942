//! Serialized dispatch of requests against the fd source
//!
//! All state that requests mutate - the [`FdSource`] and the key →
//! descriptor-set cache - lives on one dedicated thread. Connection tasks
//! talk to it through a bounded queue:
//!
//! ```text
//!   conn task ─┐
//!   conn task ─┼──► mpsc queue ──► dispatcher thread ──► FdSource
//!   conn task ─┘         ▲                │
//!                        └── oneshot ◄────┘  (Reply: payload + dup'ed fds)
//! ```
//!
//! Only one request is ever being processed, so no two fd source calls can
//! overlap regardless of how many clients connect at once. Sources are not
//! required to be safe under concurrent mutation.

use std::collections::HashMap;
use std::io;
use std::os::fd::OwnedFd;
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{FdError, Result};
use crate::fdsource::FdSource;
use crate::metrics::{FD_DISPATCH_DURATION, FD_TRACKED_KEYS};
use crate::protocol::{Command, Request, Response};

/// Successful outcome of a dispatched request
///
/// `fds` are fresh duplicates of the server-held descriptors; the caller
/// owns them and closes them after sending.
#[derive(Debug, Default)]
pub struct Reply {
    pub payload: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

/// The fd source plus the descriptors delivered for each key
pub struct Dispatcher<S: FdSource> {
    source: S,
    delivered: HashMap<String, Vec<OwnedFd>>,
}

impl<S: FdSource> Dispatcher<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            delivered: HashMap::new(),
        }
    }

    /// Number of keys currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.delivered.len()
    }

    /// Number of server-held descriptors for `key`, if tracked
    pub fn descriptor_count(&self, key: &str) -> Option<usize> {
        self.delivered.get(key).map(Vec::len)
    }

    /// Process one request
    ///
    /// Presence preconditions are checked here, before the source is
    /// consulted, and fail with `BadKey`.
    pub fn dispatch(&mut self, request: &Request) -> Result<Reply> {
        let key = request.key.as_str();
        match request.command {
            Command::Add => self.add(key, &request.payload),
            Command::Get => self.get(key),
            Command::Release => self.release(key).map(|()| Reply::default()),
            Command::Recover => self
                .recover(key, &request.payload)
                .map(|()| Reply::default()),
        }
    }

    fn add(&mut self, key: &str, payload: &[u8]) -> Result<Reply> {
        if self.delivered.contains_key(key) {
            return Err(FdError::BadKey(key.to_string()));
        }

        let (fds, payload) = self.source.get_fds(key, payload)?;
        // Only track the key once its reply can actually be sent
        let dups = match Response::check_ok_limits(payload.len(), fds.len())
            .and_then(|()| dup_all(&fds))
        {
            Ok(dups) => dups,
            Err(e) => {
                drop(fds);
                self.undo_add(key);
                return Err(e);
            }
        };
        self.delivered.insert(key.to_string(), fds);
        debug!(key, "fds added");

        Ok(Reply { payload, fds: dups })
    }

    fn undo_add(&mut self, key: &str) {
        match self.source.release(key) {
            Ok(()) => debug!(key, "add rolled back"),
            Err(e) => warn!(key, error = %e, "can't roll back failed add"),
        }
    }

    fn get(&mut self, key: &str) -> Result<Reply> {
        let Some(fds) = self.delivered.get(key) else {
            return Err(FdError::BadKey(key.to_string()));
        };

        let payload = self.source.get_info(key)?;
        Ok(Reply {
            payload,
            fds: dup_all(fds)?,
        })
    }

    fn release(&mut self, key: &str) -> Result<()> {
        if !self.delivered.contains_key(key) {
            return Err(FdError::BadKey(key.to_string()));
        }

        self.source.release(key)?;
        // Dropping the set closes the server-held descriptors
        self.delivered.remove(key);
        debug!(key, "fds released");
        Ok(())
    }

    fn recover(&mut self, key: &str, payload: &[u8]) -> Result<()> {
        if self.delivered.contains_key(key) {
            return Err(FdError::BadKey(key.to_string()));
        }

        self.source.recover(key, payload)?;
        self.delivered.insert(key.to_string(), Vec::new());
        debug!(key, "key recovered");
        Ok(())
    }

    /// Stop the source and drop every cached descriptor
    pub fn stop(&mut self) -> Result<()> {
        let result = self.source.stop();
        self.delivered.clear();
        result
    }
}

impl<S: FdSource> Dispatcher<S> {
    fn run(mut self, mut jobs: mpsc::Receiver<Job>) {
        while let Some(job) = jobs.blocking_recv() {
            match job {
                Job::Dispatch { request, reply } => {
                    let timer = FD_DISPATCH_DURATION
                        .with_label_values(&[request.command.as_str()])
                        .start_timer();
                    let result = self.dispatch(&request);
                    timer.observe_duration();
                    FD_TRACKED_KEYS.set(self.tracked_keys() as f64);

                    if reply.send(result).is_err() {
                        warn!(key = %request.key, command = %request.command, "connection gone before reply");
                    }
                }
                Job::Stop { done } => {
                    let result = self.stop();
                    FD_TRACKED_KEYS.set(0.0);
                    let _ = done.send(result);
                    // Jobs still queued are dropped; their callers see `Stopped`
                    break;
                }
            }
        }
        debug!("dispatcher exiting");
    }
}

fn dup_all(fds: &[OwnedFd]) -> Result<Vec<OwnedFd>> {
    fds.iter()
        .map(|fd| fd.try_clone().map_err(FdError::from))
        .collect()
}

enum Job {
    Dispatch {
        request: Request,
        reply: oneshot::Sender<Result<Reply>>,
    },
    Stop {
        done: oneshot::Sender<Result<()>>,
    },
}

/// Cloneable sender side of the dispatcher queue
#[derive(Clone)]
pub struct DispatchHandle {
    jobs: mpsc::Sender<Job>,
}

impl DispatchHandle {
    /// Move `dispatcher` onto its own thread and return a handle to it
    pub fn spawn<S: FdSource>(
        dispatcher: Dispatcher<S>,
        queue_depth: usize,
    ) -> io::Result<(Self, thread::JoinHandle<()>)> {
        let (jobs, rx) = mpsc::channel(queue_depth.max(1));
        let thread = thread::Builder::new()
            .name("tapfd-dispatch".to_string())
            .spawn(move || dispatcher.run(rx))?;
        Ok((Self { jobs }, thread))
    }

    /// Queue a request and wait for its outcome
    pub async fn dispatch(&self, request: Request) -> Result<Reply> {
        let (reply, outcome) = oneshot::channel();
        self.jobs
            .send(Job::Dispatch { request, reply })
            .await
            .map_err(|_| FdError::Stopped)?;
        outcome.await.map_err(|_| FdError::Stopped)?
    }

    /// Stop the dispatcher after everything queued before this call
    pub async fn stop(&self) -> Result<()> {
        let (done, outcome) = oneshot::channel();
        self.jobs
            .send(Job::Stop { done })
            .await
            .map_err(|_| FdError::Stopped)?;
        outcome.await.map_err(|_| FdError::Stopped)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fdsource::{TempFileData, TempFileSource};
    use crate::protocol::MAX_FRAME_SIZE;
    use std::fs::File;
    use std::io::Read;

    /// Source that only counts how often it gets called
    #[derive(Default)]
    struct CountingSource {
        calls: usize,
    }

    impl FdSource for CountingSource {
        fn get_fds(&mut self, _key: &str, _payload: &[u8]) -> Result<(Vec<OwnedFd>, Vec<u8>)> {
            self.calls += 1;
            Ok((Vec::new(), Vec::new()))
        }

        fn recover(&mut self, _key: &str, _payload: &[u8]) -> Result<()> {
            self.calls += 1;
            Ok(())
        }

        fn release(&mut self, key: &str) -> Result<()> {
            self.calls += 1;
            Err(FdError::Backend(format!("can't release {}", key)))
        }

        fn get_info(&self, _key: &str) -> Result<Vec<u8>> {
            Ok(b"info".to_vec())
        }

        fn stop(&mut self) -> Result<()> {
            Ok(())
        }
    }

    /// Source whose replies never fit in a response frame
    #[derive(Default)]
    struct OversizedSource {
        live: usize,
        released: usize,
    }

    impl FdSource for OversizedSource {
        fn get_fds(&mut self, _key: &str, _payload: &[u8]) -> Result<(Vec<OwnedFd>, Vec<u8>)> {
            self.live += 1;
            let file = tempfile::tempfile()?;
            Ok((vec![OwnedFd::from(file)], vec![b'x'; MAX_FRAME_SIZE]))
        }

        fn recover(&mut self, _key: &str, _payload: &[u8]) -> Result<()> {
            Ok(())
        }

        fn release(&mut self, _key: &str) -> Result<()> {
            self.live -= 1;
            self.released += 1;
            Ok(())
        }

        fn get_info(&self, _key: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn stop(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn request(command: Command, key: &str, content: &str) -> Request {
        let payload = serde_json::to_vec(&TempFileData::new(content)).unwrap();
        Request::new(command, key, payload)
    }

    #[test]
    fn test_add_then_get_redelivers_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = Dispatcher::new(TempFileSource::new(dir.path()));

        let added = dispatcher.dispatch(&request(Command::Add, "k_foo", "foo")).unwrap();
        assert_eq!(added.payload, b"abcdef");
        assert_eq!(added.fds.len(), 1);
        drop(added);

        let got = dispatcher.dispatch(&request(Command::Get, "k_foo", "")).unwrap();
        assert_eq!(got.payload, b"info_k_foo");
        let mut content = String::new();
        File::from(got.fds.into_iter().next().unwrap())
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "foo");
        assert_eq!(dispatcher.descriptor_count("k_foo"), Some(1));
    }

    #[test]
    fn test_bad_key_never_reaches_source() {
        let mut dispatcher = Dispatcher::new(CountingSource::default());

        for command in [Command::Get, Command::Release] {
            let err = dispatcher.dispatch(&Request::new(command, "nope", Vec::new())).unwrap_err();
            assert_eq!(err.to_string(), "bad fd key: \"nope\"");
        }

        dispatcher.dispatch(&Request::new(Command::Add, "k", Vec::new())).unwrap();
        assert_eq!(dispatcher.source.calls, 1);

        for command in [Command::Add, Command::Recover] {
            let err = dispatcher.dispatch(&Request::new(command, "k", Vec::new())).unwrap_err();
            assert!(matches!(err, FdError::BadKey(_)));
        }
        assert_eq!(dispatcher.source.calls, 1);
    }

    #[test]
    fn test_failed_release_keeps_key() {
        let mut dispatcher = Dispatcher::new(CountingSource::default());
        dispatcher.dispatch(&Request::new(Command::Add, "k", Vec::new())).unwrap();

        let err = dispatcher.dispatch(&Request::new(Command::Release, "k", Vec::new())).unwrap_err();
        assert_eq!(err.to_string(), "can't release k");
        assert_eq!(dispatcher.tracked_keys(), 1);
    }

    #[test]
    fn test_failed_add_leaves_key_untracked() {
        let dir = tempfile::tempdir().unwrap();
        let mut dispatcher = Dispatcher::new(TempFileSource::new(dir.path()));

        let bad = Request::new(Command::Add, "k", b"{".to_vec());
        assert!(dispatcher.dispatch(&bad).is_err());
        assert_eq!(dispatcher.tracked_keys(), 0);
        assert!(matches!(
            dispatcher.dispatch(&request(Command::Get, "k", "")),
            Err(FdError::BadKey(_))
        ));
    }

    #[test]
    fn test_unsendable_add_is_rolled_back() {
        let mut dispatcher = Dispatcher::new(OversizedSource::default());

        for _ in 0..2 {
            let err = dispatcher
                .dispatch(&Request::new(Command::Add, "k", Vec::new()))
                .unwrap_err();
            assert!(matches!(err, FdError::Encode(_)), "unexpected error: {}", err);
            assert_eq!(dispatcher.tracked_keys(), 0);
        }
        assert_eq!(dispatcher.source.live, 0);
        assert_eq!(dispatcher.source.released, 2);
    }

    #[test]
    fn test_recovered_key_has_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let source = TempFileSource::new(dir.path());
        let probe = source.probe();
        let mut dispatcher = Dispatcher::new(source);

        dispatcher.dispatch(&request(Command::Recover, "foobar", "42")).unwrap();
        assert!(probe.is_recovered("foobar"));
        assert_eq!(dispatcher.descriptor_count("foobar"), Some(0));

        let got = dispatcher.dispatch(&request(Command::Get, "foobar", "")).unwrap();
        assert!(got.fds.is_empty());
        assert_eq!(got.payload, b"info_foobar");

        dispatcher.dispatch(&request(Command::Release, "foobar", "")).unwrap();
        assert!(probe.is_empty());
    }

    #[test]
    fn test_stop_clears_cache() {
        let dir = tempfile::tempdir().unwrap();
        let source = TempFileSource::new(dir.path());
        let probe = source.probe();
        let mut dispatcher = Dispatcher::new(source);
        dispatcher.dispatch(&request(Command::Add, "k", "x")).unwrap();

        dispatcher.stop().unwrap();
        assert!(probe.is_stopped());
        assert_eq!(dispatcher.tracked_keys(), 0);
        assert!(matches!(
            dispatcher.dispatch(&request(Command::Add, "k", "x")),
            Err(FdError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = Dispatcher::new(TempFileSource::new(dir.path()));
        let (handle, thread) = DispatchHandle::spawn(dispatcher, 4).unwrap();

        handle.dispatch(request(Command::Add, "k", "x")).await.unwrap();
        handle.stop().await.unwrap();
        thread.join().unwrap();

        assert!(matches!(
            handle.dispatch(request(Command::Get, "k", "")).await,
            Err(FdError::Stopped)
        ));
        assert!(matches!(handle.stop().await, Err(FdError::Stopped)));
    }
}
