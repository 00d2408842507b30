// §4.C depacketizers, dispatched per §9 as "sum type with one variant per
// codec carrying that codec's state machine; the dispatch is a single
// match at receive time" rather than a function-table of virtual calls.

mod aac_hbr;
mod aac_latm;
mod amr;
mod asf;
mod h263;
mod h264;
mod mpeg4_visual;
mod vc1;

pub use aac_hbr::AacHbrConfig;
pub use aac_latm::AacLatmState;
pub use amr::AmrKind;
pub use asf::AsfState;
pub use h264::{CalculateAbsDon, CalculateDonDiff, CalculateDonDistance, H264Config};
pub use vc1::Vc1State;

use crate::error::DepackResult;
use crate::queues::ReassembledPacket;

/// Per-stream, per-codec depacketizer state. One input RTP payload
/// produces zero or more reassembled packets.
pub enum Depacketizer {
    AmrNbWb(AmrKind),
    AacHbr(AacHbrConfig),
    AacLatm(AacLatmState),
    H263,
    Mpeg4Visual,
    H264(Box<H264Config>),
    Asf(AsfState),
    Vc1(Vc1State),
}

impl Depacketizer {
    pub fn process(
        &mut self,
        payload: &[u8],
        ts: u32,
        ext_seq: u64,
        marker: bool,
    ) -> DepackResult<Vec<ReassembledPacket>> {
        let result = match self {
            Depacketizer::AmrNbWb(kind) => amr::process(*kind, payload, ts, ext_seq),
            Depacketizer::AacHbr(cfg) => aac_hbr::process(cfg, payload, ts, ext_seq),
            Depacketizer::AacLatm(state) => aac_latm::process(state, payload, ts, ext_seq, marker),
            Depacketizer::H263 => h263::process(payload, ts, ext_seq),
            Depacketizer::Mpeg4Visual => mpeg4_visual::process(payload, ts, ext_seq, marker),
            Depacketizer::H264(cfg) => h264::process(cfg, payload, ts, ext_seq, marker),
            Depacketizer::Asf(state) => asf::process(state, payload, ts, ext_seq),
            Depacketizer::Vc1(state) => vc1::process(state, payload, ts, ext_seq),
        };
        if let Err(e) = &result {
            tracing::debug!(ext_seq, error = %e, "dropping malformed RTP payload");
        }
        result
    }
}
