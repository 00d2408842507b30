// Error taxonomy, following `content-pipe/src/error.rs`'s category-enum
// shape so `?` composes across the two crates without a translation
// layer at every call site.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RtspError {
    #[error("socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("RTSP message framing failed: {0}")]
    Framing(String),

    #[error("SDP parse failed: {0}")]
    Sdp(String),

    #[error("RTSP {method} failed: {status} {reason}")]
    Status {
        method: &'static str,
        status: u16,
        reason: String,
    },

    #[error("RTSP response missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("too many redirects (> {0})")]
    TooManyRedirects(u32),

    #[error("command timed out")]
    Timeout,

    #[error("session state invariant violated: {0}")]
    BadState(String),

    #[error("more than eight media streams in SDP, extras ignored")]
    TooManyStreams,

    #[error("depacketizer error: {0}")]
    Depack(#[from] rtp_depack::DepackError),

    #[error("content pipe error: {0}")]
    Pipe(#[from] content_pipe::PipeError),

    #[error("exhausted {0} reconnect attempts")]
    ReconnectExhausted(u32),

    #[error("no local UDP port available in the configured range")]
    NoPortAvailable,
}

pub type RtspResult<T> = Result<T, RtspError>;
