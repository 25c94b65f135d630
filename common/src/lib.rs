//! Shared, runtime-agnostic types for the caching range proxy.
//!
//! Nothing in this crate touches tokio or the filesystem directly; it holds
//! the data model (`RangeSet`), the configuration structs, the error enum,
//! and the resource-id hash, so it can be unit- and property-tested in
//! isolation from the async server in `core`.

pub mod config;
pub mod error;
pub mod id;
pub mod rangeset;

pub use config::CacheConfig;
pub use error::CacheError;
pub use rangeset::RangeSet;
