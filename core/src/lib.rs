//! Async runtime half of the caching range proxy: persistence, origin
//! transport, the per-resource lifecycle/manager facade, the background
//! completer, and the loopback HTTP server.
//!
//! `common` holds everything that doesn't need tokio; this crate wires it
//! up into a running service, the way the teacher's `server` crate wires
//! `common`'s config/types into a running set of services.

pub mod completer;
pub mod http;
pub mod manager;
pub mod metastore;
pub mod mime;
pub mod origin;
pub mod resource;

#[cfg(feature = "capi")]
pub mod ffi;

pub use common::{CacheConfig, CacheError};
pub use manager::{DownloadInfo, FileStat, Manager};
pub use resource::Resource;
