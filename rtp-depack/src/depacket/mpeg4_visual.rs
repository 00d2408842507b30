// MPEG-4 visual, RFC 3016. No payload header beyond the RTP header
// itself; each packet carries a contiguous slice of the elementary
// stream, grounded on `rtp_video.c`'s `ProcessMP4VPacket` (straight
// copy-through, no reassembly).

use smallvec::SmallVec;

use crate::error::{DepackError, DepackResult};
use crate::queues::{PacketFlags, ReassembledPacket};

pub fn process(payload: &[u8], ts: u32, ext_seq: u64, marker: bool) -> DepackResult<Vec<ReassembledPacket>> {
    if payload.is_empty() {
        return Err(DepackError::Malformed("empty MPEG-4 visual payload".into()));
    }
    Ok(vec![ReassembledPacket {
        ext_seq,
        ts,
        marker,
        flags: PacketFlags::default(),
        data: SmallVec::from_slice(payload),
    }])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_payload_through_unchanged() {
        let out = process(&[1, 2, 3], 10, 0, true).unwrap();
        assert_eq!(&out[0].data[..], &[1, 2, 3]);
        assert!(out[0].marker);
    }
}
