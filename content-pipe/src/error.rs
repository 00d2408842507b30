// Error taxonomy for the caching content pipe.
//
// Mirrors the category/leaf split used by the RTSP error module: a small
// top-level enum that readers match on, with `#[from]` conversions from the
// lower-level handler errors so `?` composes across crate boundaries.

use thiserror::Error;

/// Every outcome the content pipe can report back to a parser.
///
/// Several of these are not failures in the usual sense — `Eos`,
/// `NotReady`, `NotInvalidated` and the cache-resource variants are part of
/// the pipe's normal retry protocol (see module docs on `Cache::read`).
#[derive(Debug, Error)]
pub enum PipeError {
    /// Natural stream termination; no more bytes will ever become available.
    #[error("end of stream")]
    Eos,

    /// Transient: the producer has not yet filled enough of the cache.
    /// The caller should wait for the `BytesAvailable` callback and retry.
    #[error("content pipe not ready")]
    NotReady,

    /// A seek landed on a chunk that is still borrowed by a reader. The
    /// caller must release outstanding `read_buffer` borrows and retry.
    #[error("cache not invalidated: borrowed chunk blocks seek")]
    NotInvalidated,

    /// `check_available_bytes`/`read` was asked for more than `high_mark`
    /// bytes; the caller should raise its buffer size instead of retrying.
    #[error("requested size exceeds cache high-mark")]
    NoData,

    /// The borrow table is full (row cap reached).
    #[error("no free borrow slots")]
    NoFreeBuffers,

    /// A straddling `read_buffer` was requested while the spare area is
    /// already lent out.
    #[error("spare area already in use")]
    SpareAreaInUse,

    /// Pool allocation failed even at the minimum requested size.
    #[error("insufficient memory to allocate cache pool")]
    InsufficientMemory,

    /// An operation that requires caching was called while hard-stopped.
    #[error("content pipe is in non-caching (hard-stop) mode")]
    InNonCachingMode,

    /// An RTSP (or other handler) state-machine invariant was violated.
    #[error("parser/session invariant violated: {0}")]
    ParserFailure(String),

    /// A handler read/connect or RTSP command exchange timed out.
    #[error("operation timed out")]
    Timeout,

    /// Caller passed a nonsensical argument (e.g. seek origin `Time`
    /// without `CanSeekByTime` support).
    #[error("bad parameter: {0}")]
    BadParameter(String),

    /// The handler does not support the requested capability.
    #[error("not supported by this handler")]
    NotSupported,

    /// Recognized but deliberately unimplemented.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// The underlying handler's open/size/seek call failed.
    #[error("protocol handler operation failed: {0}")]
    FileOperationFailed(#[source] std::io::Error),
}

pub type PipeResult<T> = Result<T, PipeError>;

impl From<std::io::Error> for PipeError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            PipeError::Eos
        } else if err.kind() == std::io::ErrorKind::TimedOut {
            PipeError::Timeout
        } else {
            PipeError::FileOperationFailed(err)
        }
    }
}
