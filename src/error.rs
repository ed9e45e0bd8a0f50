//! Error types.

use thiserror::Error;

/// Errors surfaced by the messaging substrate.
///
/// Pool- and buffer-level failures are returned synchronously by the
/// triggering call. Connection-level failures are asynchronous and are
/// delivered to every operation queued on the failed connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// An object pool reached its configured capacity, or a chunk could not
    /// be carved. Recoverable; the caller may retry after releasing objects.
    #[error("object pool exhausted")]
    OutOfMemory,

    /// The handle is stale, out of range, or of the wrong type. Always a
    /// caller bug; never retried internally.
    #[error("invalid object handle")]
    InvalidHandle,

    /// Connection establishment exhausted its retry budget, or the peer tore
    /// the connection down while operations were queued on it.
    #[error("connection to peer failed")]
    ConnectionFailed,

    /// No receive buffer could be posted to the shared receive queue.
    /// Recoverable; the caller should retry after freeing resources.
    #[error("failed to post receive buffers")]
    PostFailed,

    /// The process-wide state has not been initialized (`init` was never
    /// called, or the last `fini` already ran).
    #[error("library not initialized")]
    NotInitialized,

    /// Malformed caller input, e.g. an unknown rank or inconsistent limits.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
