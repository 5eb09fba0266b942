//! Wire encoding for fd server requests and responses
//!
//! This module only deals with frame *bodies*. The length prefix and the
//! descriptors that ride next to a response live in [`crate::transport`].
//!
//! # Request body
//!
//! ```text
//! ┌───────────┬─────────┬──────────┬──────────┬──────────┬──────────────┐
//! │ magic u32 │ cmd u8  │ klen u16 │ plen u32 │ key      │ payload      │
//! └───────────┴─────────┴──────────┴──────────┴──────────┴──────────────┘
//! ```
//!
//! # Response body
//!
//! ```text
//! ┌───────────┬───────────┬─────────────┬──────────┬──────────┬─────────┬─────────┐
//! │ magic u32 │ status u8 │ fd_count u8 │ elen u16 │ plen u32 │ error   │ payload │
//! └───────────┴───────────┴─────────────┴──────────┴──────────┴─────────┴─────────┘
//! ```
//!
//! All integers are big-endian. `fd_count` announces how many descriptors
//! were attached to the frame so the receiver can detect truncation.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{FdError, Result};

/// "TAPF"
pub const MAGIC: u32 = 0x5441_5046;

/// Upper bound for a single frame body
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Upper bound for descriptors attached to a single response
pub const MAX_FDS: usize = 16;

const REQUEST_HEADER_LEN: usize = 4 + 1 + 2 + 4;
const RESPONSE_HEADER_LEN: usize = 4 + 1 + 1 + 2 + 4;

const STATUS_OK: u8 = 0;
const STATUS_ERROR: u8 = 1;

/// Request command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Create a new resource and deliver its descriptors
    Add,
    /// Re-deliver the descriptors of a tracked key
    Get,
    /// Free the resource and forget the key
    Release,
    /// Track a key without live descriptors
    Recover,
}

impl Command {
    fn to_wire(self) -> u8 {
        match self {
            Command::Add => 1,
            Command::Get => 2,
            Command::Release => 3,
            Command::Recover => 4,
        }
    }

    fn from_wire(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Command::Add),
            2 => Ok(Command::Get),
            3 => Ok(Command::Release),
            4 => Ok(Command::Recover),
            other => Err(FdError::Decode(format!("unknown command {}", other))),
        }
    }

    /// Lowercase name, as used in logs and metric labels
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Add => "add",
            Command::Get => "get",
            Command::Release => "release",
            Command::Recover => "recover",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub key: String,
    pub payload: Vec<u8>,
}

impl Request {
    pub fn new(command: Command, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            command,
            key: key.into(),
            payload,
        }
    }

    /// Serialize the request body
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.key.is_empty() {
            return Err(FdError::Encode("empty key".to_string()));
        }
        let key_len = u16::try_from(self.key.len())
            .map_err(|_| FdError::Encode(format!("key too long: {} bytes", self.key.len())))?;
        let total = REQUEST_HEADER_LEN + self.key.len() + self.payload.len();
        if total > MAX_FRAME_SIZE {
            return Err(FdError::Encode(format!(
                "request of {} bytes exceeds the {} byte limit",
                total, MAX_FRAME_SIZE
            )));
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32(MAGIC);
        buf.put_u8(self.command.to_wire());
        buf.put_u16(key_len);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(self.key.as_bytes());
        buf.put_slice(&self.payload);
        Ok(buf.to_vec())
    }

    /// Parse a request body
    pub fn decode(mut body: &[u8]) -> Result<Self> {
        if body.len() < REQUEST_HEADER_LEN {
            return Err(FdError::Decode(format!(
                "short request header: {} bytes",
                body.len()
            )));
        }
        check_magic(body.get_u32())?;
        let command = Command::from_wire(body.get_u8())?;
        let key_len = body.get_u16() as usize;
        let payload_len = body.get_u32() as usize;
        if body.remaining() != key_len + payload_len {
            return Err(FdError::Decode(format!(
                "request length mismatch: header says {}, got {}",
                key_len + payload_len,
                body.remaining()
            )));
        }

        let key = take_string(&mut body, key_len)?;
        if key.is_empty() {
            return Err(FdError::Decode("empty key".to_string()));
        }
        let payload = body[..payload_len].to_vec();

        Ok(Self {
            command,
            key,
            payload,
        })
    }
}

/// A single server response, minus the descriptors themselves
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub error: Option<String>,
    pub payload: Vec<u8>,
    /// Number of descriptors attached to the frame carrying this response
    pub fd_count: usize,
}

impl Response {
    pub fn ok(payload: Vec<u8>, fd_count: usize) -> Self {
        Self {
            error: None,
            payload,
            fd_count,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            payload: Vec::new(),
            fd_count: 0,
        }
    }

    /// Check that a successful response with `payload_len` bytes and
    /// `fd_count` descriptors can be encoded
    pub fn check_ok_limits(payload_len: usize, fd_count: usize) -> Result<()> {
        check_response_limits(0, payload_len, fd_count).map(|_| ())
    }

    /// Serialize the response body
    pub fn encode(&self) -> Result<Vec<u8>> {
        let error = self.error.as_deref().unwrap_or("");
        let error_len = u16::try_from(error.len())
            .map_err(|_| FdError::Encode(format!("error message too long: {} bytes", error.len())))?;
        let total = check_response_limits(error.len(), self.payload.len(), self.fd_count)?;

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32(MAGIC);
        buf.put_u8(if self.error.is_some() { STATUS_ERROR } else { STATUS_OK });
        buf.put_u8(self.fd_count as u8);
        buf.put_u16(error_len);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(error.as_bytes());
        buf.put_slice(&self.payload);
        Ok(buf.to_vec())
    }

    /// Parse a response body
    pub fn decode(mut body: &[u8]) -> Result<Self> {
        if body.len() < RESPONSE_HEADER_LEN {
            return Err(FdError::Decode(format!(
                "short response header: {} bytes",
                body.len()
            )));
        }
        check_magic(body.get_u32())?;
        let status = body.get_u8();
        let fd_count = body.get_u8() as usize;
        let error_len = body.get_u16() as usize;
        let payload_len = body.get_u32() as usize;
        if body.remaining() != error_len + payload_len {
            return Err(FdError::Decode(format!(
                "response length mismatch: header says {}, got {}",
                error_len + payload_len,
                body.remaining()
            )));
        }
        if fd_count > MAX_FDS {
            return Err(FdError::Decode(format!("too many descriptors: {}", fd_count)));
        }

        let message = take_string(&mut body, error_len)?;
        let error = match status {
            STATUS_OK => None,
            STATUS_ERROR => Some(message),
            other => return Err(FdError::Decode(format!("unknown status {}", other))),
        };
        let payload = body[..payload_len].to_vec();

        Ok(Self {
            error,
            payload,
            fd_count,
        })
    }
}

/// Returns the encoded body size
fn check_response_limits(error_len: usize, payload_len: usize, fd_count: usize) -> Result<usize> {
    if fd_count > MAX_FDS {
        return Err(FdError::Encode(format!(
            "{} descriptors exceed the limit of {}",
            fd_count, MAX_FDS
        )));
    }
    let total = RESPONSE_HEADER_LEN + error_len + payload_len;
    if total > MAX_FRAME_SIZE {
        return Err(FdError::Encode(format!(
            "response of {} bytes exceeds the {} byte limit",
            total, MAX_FRAME_SIZE
        )));
    }
    Ok(total)
}

fn check_magic(magic: u32) -> Result<()> {
    if magic != MAGIC {
        return Err(FdError::Decode(format!("bad magic {:#010x}", magic)));
    }
    Ok(())
}

fn take_string(body: &mut &[u8], len: usize) -> Result<String> {
    let raw = body[..len].to_vec();
    body.advance(len);
    String::from_utf8(raw).map_err(|e| FdError::Decode(format!("invalid utf-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let body = Request::new(Command::Release, "k", b"xy".to_vec())
            .encode()
            .unwrap();
        assert_eq!(&body[..4], b"TAPF");
        assert_eq!(body[4], 3);
        assert_eq!(&body[5..7], &[0, 1]);
        assert_eq!(&body[7..11], &[0, 0, 0, 2]);
        assert_eq!(&body[11..], b"kxy");
    }

    #[test]
    fn test_request_decode() {
        let req = Request::new(Command::Recover, "foobar", br#"{"content":"42"}"#.to_vec());
        let decoded = Request::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_error_response_keeps_message() {
        let resp = Response::error("bad fd key: \"k_foo\"");
        let decoded = Response::decode(&resp.encode().unwrap()).unwrap();
        assert_eq!(decoded.error.as_deref(), Some("bad fd key: \"k_foo\""));
        assert_eq!(decoded.fd_count, 0);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_ok_response_with_empty_error_field() {
        let resp = Response::ok(b"abcdef".to_vec(), 2);
        let decoded = Response::decode(&resp.encode().unwrap()).unwrap();
        assert_eq!(decoded.error, None);
        assert_eq!(decoded.payload, b"abcdef");
        assert_eq!(decoded.fd_count, 2);
    }

    #[test]
    fn test_rejects_empty_key() {
        let err = Request::new(Command::Get, "", Vec::new()).encode().unwrap_err();
        assert!(matches!(err, FdError::Encode(_)));
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut body = Request::new(Command::Get, "k", Vec::new()).encode().unwrap();
        body[0] = b'X';
        assert!(matches!(Request::decode(&body), Err(FdError::Decode(_))));
    }

    #[test]
    fn test_rejects_unknown_command() {
        let mut body = Request::new(Command::Get, "k", Vec::new()).encode().unwrap();
        body[4] = 9;
        assert!(matches!(Request::decode(&body), Err(FdError::Decode(_))));
    }

    #[test]
    fn test_rejects_truncated_body() {
        let body = Request::new(Command::Add, "key", b"payload".to_vec())
            .encode()
            .unwrap();
        assert!(Request::decode(&body[..body.len() - 1]).is_err());
        assert!(Response::decode(&body[..5]).is_err());
    }

    #[test]
    fn test_rejects_too_many_fds() {
        let resp = Response::ok(Vec::new(), MAX_FDS + 1);
        assert!(matches!(resp.encode(), Err(FdError::Encode(_))));
    }

    #[test]
    fn test_ok_limits_match_encode() {
        let max_payload = MAX_FRAME_SIZE - RESPONSE_HEADER_LEN;
        assert!(Response::check_ok_limits(max_payload, MAX_FDS).is_ok());
        assert!(Response::ok(vec![0u8; max_payload], MAX_FDS).encode().is_ok());

        assert!(Response::check_ok_limits(max_payload + 1, 0).is_err());
        assert!(Response::ok(vec![0u8; max_payload + 1], 0).encode().is_err());
        assert!(Response::check_ok_limits(0, MAX_FDS + 1).is_err());
    }

    #[test]
    fn test_rejects_oversized_payload() {
        let req = Request::new(Command::Add, "k", vec![0u8; MAX_FRAME_SIZE]);
        assert!(matches!(req.encode(), Err(FdError::Encode(_))));
    }
}
