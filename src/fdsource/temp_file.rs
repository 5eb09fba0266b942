//! Fd source backed by anonymous temp files
//!
//! Each `get_fds` call creates an already-unlinked file in the configured
//! directory, fills it with the requested content and hands out a single
//! descriptor for it. This is the simplest possible resource with real
//! kernel descriptors, which makes it the workhorse of the fd server tests.
//!
//! The source itself moves into the server's dispatcher thread, so its state
//! is shared with a [`TempFileProbe`] that callers keep for inspection.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::FdSource;
use crate::error::{FdError, Result};

/// Response payload returned by every successful `get_fds`
pub const ADD_RESPONSE: &[u8] = b"abcdef";

/// The only content `recover` accepts
pub const RECOVER_CONTENT: &str = "42";

/// Request payload understood by [`TempFileSource`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempFileData {
    pub content: String,
}

impl TempFileData {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

#[derive(Debug)]
enum Entry {
    /// Created by `get_fds`; holds our copy open until release
    Live { _file: File },
    /// Registered by `recover`, no file behind it
    Recovered { content: String },
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    stopped: bool,
}

/// Fd source handing out anonymous temp files
#[derive(Debug)]
pub struct TempFileSource {
    dir: PathBuf,
    state: Arc<Mutex<State>>,
}

impl TempFileSource {
    /// Create a source that places its files in `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Handle for observing the source after it moved into a server
    pub fn probe(&self) -> TempFileProbe {
        TempFileProbe {
            state: Arc::clone(&self.state),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parse(payload: &[u8]) -> Result<TempFileData> {
    serde_json::from_slice(payload)
        .map_err(|e| FdError::Backend(format!("error unmarshalling json: {}", e)))
}

impl FdSource for TempFileSource {
    fn get_fds(&mut self, key: &str, payload: &[u8]) -> Result<(Vec<OwnedFd>, Vec<u8>)> {
        let dir = self.dir.clone();
        let mut state = self.state();
        if state.stopped {
            return Err(FdError::Stopped);
        }

        let data = parse(payload)?;
        if state.entries.contains_key(key) {
            return Err(FdError::DuplicateKey(key.to_string()));
        }

        let mut file = tempfile::tempfile_in(&dir).map_err(|e| {
            FdError::Backend(format!("error creating file in {}: {}", dir.display(), e))
        })?;
        file.write_all(data.content.as_bytes())
            .map_err(|e| FdError::Backend(format!("write(): {}", e)))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| FdError::Backend(format!("seek(): {}", e)))?;

        let delivered = file
            .try_clone()
            .map_err(|e| FdError::Backend(format!("dup(): {}", e)))?;
        state.entries.insert(key.to_string(), Entry::Live { _file: file });
        debug!(key, bytes = data.content.len(), "temp file created");

        Ok((vec![OwnedFd::from(delivered)], ADD_RESPONSE.to_vec()))
    }

    fn recover(&mut self, key: &str, payload: &[u8]) -> Result<()> {
        let mut state = self.state();
        if state.stopped {
            return Err(FdError::Stopped);
        }

        let data = parse(payload)?;
        if data.content != RECOVER_CONTENT {
            return Err(FdError::Backend(format!(
                "bad data passed to recover: {:?}",
                String::from_utf8_lossy(payload)
            )));
        }
        if state.entries.contains_key(key) {
            return Err(FdError::DuplicateKey(key.to_string()));
        }

        state.entries.insert(
            key.to_string(),
            Entry::Recovered {
                content: data.content,
            },
        );
        Ok(())
    }

    fn release(&mut self, key: &str) -> Result<()> {
        let mut state = self.state();
        if state.stopped {
            return Err(FdError::Stopped);
        }

        // Dropping a live entry closes our copy of the file
        match state.entries.remove(key) {
            Some(_) => Ok(()),
            None => Err(FdError::NotFound(key.to_string())),
        }
    }

    fn get_info(&self, key: &str) -> Result<Vec<u8>> {
        let state = self.state();
        if state.stopped {
            return Err(FdError::Stopped);
        }
        if !state.entries.contains_key(key) {
            return Err(FdError::NotFound(key.to_string()));
        }
        Ok(format!("info_{}", key).into_bytes())
    }

    fn stop(&mut self) -> Result<()> {
        let mut state = self.state();
        state.stopped = true;
        state.entries.clear();
        Ok(())
    }
}

/// Read-only view of a [`TempFileSource`]
#[derive(Debug, Clone)]
pub struct TempFileProbe {
    state: Arc<Mutex<State>>,
}

impl TempFileProbe {
    /// Whether no key is tracked
    pub fn is_empty(&self) -> bool {
        lock(&self.state).entries.is_empty()
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    /// Whether `key` is tracked through `recover` (no file behind it)
    pub fn is_recovered(&self, key: &str) -> bool {
        matches!(
            lock(&self.state).entries.get(key),
            Some(Entry::Recovered { .. })
        )
    }

    /// Content passed to `recover` for `key`
    pub fn recovered_content(&self, key: &str) -> Option<String> {
        match lock(&self.state).entries.get(key) {
            Some(Entry::Recovered { content }) => Some(content.clone()),
            _ => None,
        }
    }

    /// Whether `stop` was called
    pub fn is_stopped(&self) -> bool {
        lock(&self.state).stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn payload(content: &str) -> Vec<u8> {
        serde_json::to_vec(&TempFileData::new(content)).unwrap()
    }

    #[test]
    fn test_get_fds_returns_readable_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = TempFileSource::new(dir.path());

        let (fds, resp) = source.get_fds("k_foo", &payload("foo")).unwrap();
        assert_eq!(resp, ADD_RESPONSE);
        assert_eq!(fds.len(), 1);

        let mut content = String::new();
        File::from(fds.into_iter().next().unwrap())
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "foo");

        // The file is anonymous, nothing is left in the directory
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_duplicate_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = TempFileSource::new(dir.path());
        source.get_fds("k", &payload("a")).unwrap();

        assert!(matches!(
            source.get_fds("k", &payload("b")),
            Err(FdError::DuplicateKey(_))
        ));
        assert!(matches!(
            source.recover("k", &payload("42")),
            Err(FdError::DuplicateKey(_))
        ));
    }

    #[test]
    fn test_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = TempFileSource::new(dir.path());
        let err = source.get_fds("k", b"not json").unwrap_err();
        assert!(err.to_string().starts_with("error unmarshalling json"));
        assert!(source.probe().is_empty());
    }

    #[test]
    fn test_recovered_key_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = TempFileSource::new(dir.path());
        let probe = source.probe();

        source.recover("foobar", &payload("42")).unwrap();
        assert!(probe.is_recovered("foobar"));
        assert_eq!(probe.recovered_content("foobar").as_deref(), Some("42"));
        assert_eq!(source.get_info("foobar").unwrap(), b"info_foobar");

        source.release("foobar").unwrap();
        assert!(probe.is_empty());
        assert!(matches!(source.release("foobar"), Err(FdError::NotFound(_))));
    }

    #[test]
    fn test_recover_rejects_unexpected_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = TempFileSource::new(dir.path());

        let err = source.recover("foobar", &payload("43")).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"bad data passed to recover: "{\"content\":\"43\"}""#
        );
        assert!(source.probe().is_empty());
        assert!(matches!(source.recover("foobar", b"{"), Err(FdError::Backend(_))));
    }

    #[test]
    fn test_stop_fails_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = TempFileSource::new(dir.path());
        let probe = source.probe();
        source.get_fds("k", &payload("a")).unwrap();

        source.stop().unwrap();
        assert!(probe.is_stopped());
        assert!(matches!(source.get_fds("x", &payload("a")), Err(FdError::Stopped)));
        assert!(matches!(source.recover("x", &payload("a")), Err(FdError::Stopped)));
        assert!(matches!(source.release("k"), Err(FdError::Stopped)));
        assert!(matches!(source.get_info("k"), Err(FdError::Stopped)));
    }
}
