use thiserror::Error;

/// Error kinds and their disposition, per the error-handling design: I/O and
/// protocol failures are never swallowed (callers log them with the
/// resource id and failing op), but only a small subset ever propagates
/// across the programmatic API — the rest become HTTP status codes or
/// boolean "operation did not apply" returns.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("origin unavailable: {0}")]
    OriginUnavailable(String),

    #[error("origin stream error: {0}")]
    OriginStreamError(String),

    #[error("storage io error for resource {id}: {source}")]
    StorageIo {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("meta store corrupt for resource {id}: {reason}")]
    MetaCorrupt { id: String, reason: String },

    #[error("range not satisfiable")]
    RangeNotSatisfiable,

    #[error("resource is not complete")]
    NotComplete,

    #[error("cache has not been initialized")]
    NotInitialized,

    #[error("cache is already initialized")]
    DoubleInit,

    #[error("no such resource")]
    NotFound,
}

pub type Result<T> = std::result::Result<T, CacheError>;
