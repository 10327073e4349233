//! Error types shared by the runtime.
//!
//! Filesystem verbs never fail with `HttpFsError`: they report a POSIX
//! [`Errno`] that ends up in the kernel reply. `HttpFsError` covers the
//! mount lifecycle and configuration.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Status reported when no more specific errno is known (`-ECOMM`, i.e. -70 on Linux).
pub const GENERIC_ERROR: i32 = -libc::ECOMM;

/// Positive POSIX error number carried back to the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Errno(pub i32);

impl Errno {
    pub const GENERIC: Errno = Errno(libc::ECOMM);
    pub const EBADF: Errno = Errno(libc::EBADF);
    pub const ENOENT: Errno = Errno(libc::ENOENT);

    /// Maps a negative wire status to an errno; anything else becomes the generic error.
    pub fn from_status(status: i32) -> Self {
        if status < 0 {
            Errno(status.saturating_neg())
        } else {
            Errno::GENERIC
        }
    }

    /// The negative status form used on the wire.
    pub fn status(self) -> i32 {
        -self.0
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

impl From<Errno> for rfuse3::Errno {
    fn from(value: Errno) -> Self {
        rfuse3::Errno::from(value.0)
    }
}

pub type FsResult<T> = std::result::Result<T, Errno>;

/// Failure of one request/response exchange.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend answered with http status {0}")]
    Status(u16),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Negative errno of the underlying OS error, if one caused this failure.
    pub fn errno(&self) -> Option<i32> {
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(err) = source {
            if let Some(io) = err.downcast_ref::<std::io::Error>() {
                if let Some(code) = io.raw_os_error() {
                    return Some(-code);
                }
            }
            source = err.source();
        }
        None
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("failed to decode message: {0}")]
    Decode(String),

    #[error("response does not start with an integer status")]
    MissingStatus,
}

impl From<bincode::Error> for CodecError {
    fn from(value: bincode::Error) -> Self {
        CodecError::Decode(value.to_string())
    }
}

#[derive(Debug, Error)]
pub enum HttpFsError {
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("problem mounting {endpoint} to {}: {source}", mountpoint.display())]
    Mount {
        endpoint: String,
        mountpoint: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("filesystem at {} not unmounted after {attempts} attempts", mountpoint.display())]
    UnmountFailed { mountpoint: PathBuf, attempts: u32 },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HttpFsError>;
