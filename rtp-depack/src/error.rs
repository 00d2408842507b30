// Error taxonomy, following `net/rtsp/src/rtspsrc/error.rs`'s
// category-enum-with-leaves shape.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DepackError {
    #[error("malformed packet: {0}")]
    Malformed(String),
    #[error("required sequence gap, NAL chain dropped")]
    SequenceGap,
    #[error("reassembly buffer exceeded its hard cap ({0} bytes)")]
    ReassemblyOverflow(usize),
    #[error("unsupported frameLengthType {0} for AAC-LATM CELP/HVXC tables")]
    UnsupportedFrameLengthType(u8),
    #[error("payload type {0} has no depacketizer configured")]
    NoDepacketizer(u8),
}

pub type DepackResult<T> = Result<T, DepackError>;
