//! Client-side caches
//!
//! - `attr`: path -> last observed `getattr` result
//! - `block`: per open descriptor read-ahead block and write-behind buffer
pub mod attr;
pub mod block;
