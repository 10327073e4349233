//! Wire model shared with the HTTP backend
//!
//! One request carries an operation name plus an ordered argument list; one
//! response is an ordered value list whose first element is a signed status
//! (negative = errno, non-negative = success or byte count).
//!
//! Submodules:
//! - `transport`: request/response exchange over HTTP(S)
pub mod transport;

use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, GENERIC_ERROR};

/// The fixed set of filesystem verbs understood by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    Getattr,
    Readdir,
    Readlink,
    Truncate,
    Chown,
    Chmod,
    Read,
    Write,
    Create,
    Utimens,
    Unlink,
    Rename,
    Link,
    Symlink,
    Mkdir,
    Rmdir,
}

impl Verb {
    pub const ALL: [Verb; 16] = [
        Verb::Getattr,
        Verb::Readdir,
        Verb::Readlink,
        Verb::Truncate,
        Verb::Chown,
        Verb::Chmod,
        Verb::Read,
        Verb::Write,
        Verb::Create,
        Verb::Utimens,
        Verb::Unlink,
        Verb::Rename,
        Verb::Link,
        Verb::Symlink,
        Verb::Mkdir,
        Verb::Rmdir,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Getattr => "getattr",
            Verb::Readdir => "readdir",
            Verb::Readlink => "readlink",
            Verb::Truncate => "truncate",
            Verb::Chown => "chown",
            Verb::Chmod => "chmod",
            Verb::Read => "read",
            Verb::Write => "write",
            Verb::Create => "create",
            Verb::Utimens => "utimens",
            Verb::Unlink => "unlink",
            Verb::Rename => "rename",
            Verb::Link => "link",
            Verb::Symlink => "symlink",
            Verb::Mkdir => "mkdir",
            Verb::Rmdir => "rmdir",
        }
    }

    /// Verbs that change the attributes of their path and therefore drop the cached entry first.
    pub fn invalidates_attrs(self) -> bool {
        matches!(
            self,
            Verb::Truncate
                | Verb::Chown
                | Verb::Chmod
                | Verb::Write
                | Verb::Create
                | Verb::Utimens
                | Verb::Unlink
                | Verb::Rename
                | Verb::Rmdir
        )
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Verb::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| CodecError::Decode(format!("unknown operation {s}")))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

impl Timespec {
    pub fn new(sec: i64, nsec: u32) -> Self {
        Self { sec, nsec }
    }
}

/// File status as reported by the backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// `st_mode`, type bits included.
    pub mode: u32,
    pub size: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u32,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

impl Stat {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    Time(Timespec),
    Stat(Stat),
    Names(Vec<String>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Int(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Timespec> for Value {
    fn from(v: Timespec) -> Self {
        Value::Time(v)
    }
}

impl From<Stat> for Value {
    fn from(v: Stat) -> Self {
        Value::Stat(v)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub operation: String,
    pub args: Vec<Value>,
}

impl Request {
    pub fn new(verb: Verb, args: Vec<Value>) -> Self {
        Self {
            operation: verb.as_str().to_string(),
            args,
        }
    }

    pub fn verb(&self) -> Result<Verb, CodecError> {
        self.operation.parse()
    }
}

/// A decoded response: the leading status plus whatever payload followed it.
#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    pub status: i32,
    pub payload: Vec<Value>,
}

impl Reply {
    pub fn new(status: i32, payload: Vec<Value>) -> Self {
        Self { status, payload }
    }

    pub fn failure(status: i32) -> Self {
        debug_assert!(status < 0);
        Self {
            status,
            payload: Vec::new(),
        }
    }

    pub fn generic_failure() -> Self {
        Self::failure(GENERIC_ERROR)
    }

    pub fn is_ok(&self) -> bool {
        self.status >= 0
    }

    pub fn first(&self) -> Option<&Value> {
        self.payload.first()
    }

    pub fn into_first(self) -> Option<Value> {
        self.payload.into_iter().next()
    }

    /// Flattens back into the on-wire value list.
    pub fn into_values(self) -> Vec<Value> {
        let mut values = Vec::with_capacity(self.payload.len() + 1);
        values.push(Value::Int(self.status as i64));
        values.extend(self.payload);
        values
    }
}

/// Serializes requests and parses responses. Implementations must be deterministic.
pub trait Codec: Send + Sync {
    fn encode_request(&self, request: &Request) -> Result<Bytes, CodecError>;

    fn decode_reply(&self, buf: &[u8]) -> Result<Reply, CodecError>;

    fn decode_request(&self, buf: &[u8]) -> Result<Request, CodecError>;

    fn encode_reply(&self, reply: Reply) -> Result<Bytes, CodecError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode_request(&self, request: &Request) -> Result<Bytes, CodecError> {
        bincode::serialize(request)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode_reply(&self, buf: &[u8]) -> Result<Reply, CodecError> {
        let mut values: Vec<Value> = bincode::deserialize(buf)?;
        let status = match values.first() {
            Some(Value::Int(code)) => {
                i32::try_from(*code).map_err(|_| CodecError::Decode(format!("status {code} out of range")))?
            }
            _ => return Err(CodecError::MissingStatus),
        };
        values.remove(0);
        Ok(Reply::new(status, values))
    }

    fn decode_request(&self, buf: &[u8]) -> Result<Request, CodecError> {
        Ok(bincode::deserialize(buf)?)
    }

    fn encode_reply(&self, reply: Reply) -> Result<Bytes, CodecError> {
        bincode::serialize(&reply.into_values())
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_survives_codec() {
        let codec = BincodeCodec;
        let req = Request::new(
            Verb::Write,
            vec![Value::from("/a/b"), Value::from(&b"hello"[..]), Value::from(42u64)],
        );
        let buf = codec.encode_request(&req).unwrap();
        // deterministic
        assert_eq!(buf, codec.encode_request(&req).unwrap());
        let back = codec.decode_request(&buf).unwrap();
        assert_eq!(back, req);
        assert_eq!(back.verb().unwrap(), Verb::Write);
    }

    #[test]
    fn test_reply_keeps_status_and_payload() {
        let codec = BincodeCodec;
        let stat = Stat {
            mode: libc::S_IFREG as u32 | 0o644,
            size: 12,
            ..Default::default()
        };
        let buf = codec
            .encode_reply(Reply::new(0, vec![Value::Stat(stat.clone())]))
            .unwrap();
        let reply = codec.decode_reply(&buf).unwrap();
        assert_eq!(reply.status, 0);
        assert_eq!(reply.first(), Some(&Value::Stat(stat)));
    }

    #[test]
    fn test_reply_without_status_is_rejected() {
        let codec = BincodeCodec;
        let buf = bincode::serialize(&vec![Value::Str("oops".into())]).unwrap();
        assert!(matches!(
            codec.decode_reply(&buf),
            Err(CodecError::MissingStatus)
        ));
        assert!(codec.decode_reply(&[0xff, 0x01]).is_err());
    }

    #[test]
    fn test_verb_names() {
        for verb in Verb::ALL {
            assert_eq!(verb.as_str().parse::<Verb>().unwrap(), verb);
        }
        assert!("mknod".parse::<Verb>().is_err());
        assert!(Verb::Rename.invalidates_attrs());
        assert!(!Verb::Mkdir.invalidates_attrs());
        assert!(!Verb::Link.invalidates_attrs());
    }
}
