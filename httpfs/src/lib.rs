//! Mount an HTTP filesystem backend locally through FUSE.
//!
//! Every filesystem operation is forwarded as one request to the backend.
//! Calls are tracked and retried by [`rpc::CallManager`]; attributes and file
//! blocks can be cached client side ([`cache`]); [`vfs::HttpFs`] routes each
//! verb and [`fuse`] plugs it into the kernel.

pub mod cache;
pub mod config;
pub mod error;
pub mod fuse;
pub mod logging;
pub mod rpc;
pub mod shutdown;
pub mod vfs;
pub mod wire;

pub use config::MountConfig;
pub use error::{Errno, HttpFsError, Result};
pub use fuse::mount::{Mount, mount, mount_with};
pub use vfs::HttpFs;
