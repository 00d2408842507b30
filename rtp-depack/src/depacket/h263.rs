// H.263, RFC 4629. Strips the payload header, preserves the P/V flags,
// and prepends a two-byte start code when P=1, grounded on `rtp_video.c`'s
// `ProcessH263Packet`.

use smallvec::SmallVec;

use crate::error::{DepackError, DepackResult};
use crate::queues::{PacketFlags, ReassembledPacket};

pub fn process(payload: &[u8], ts: u32, ext_seq: u64) -> DepackResult<Vec<ReassembledPacket>> {
    if payload.len() < 2 {
        return Err(DepackError::Malformed("H.263 payload header truncated".into()));
    }
    let header = u16::from_be_bytes([payload[0], payload[1]]);
    let p = (header >> 10) & 0x1 != 0;
    let v = (header >> 9) & 0x1 != 0;
    let plen = ((header >> 3) & 0x3f) as usize;

    let mut cursor = 2;
    if v {
        cursor += 1; // VRC byte
    }
    cursor += plen; // extra picture header, if present
    if cursor > payload.len() {
        return Err(DepackError::Malformed("H.263 payload shorter than its own header".into()));
    }
    let body = &payload[cursor..];

    let mut data = SmallVec::with_capacity(if p { body.len() + 2 } else { body.len() });
    if p {
        // The two-byte picture start code was elided by the sender per
        // RFC 4629 §5.1; restore it.
        data.push(0);
        data.push(0);
    }
    data.extend_from_slice(body);

    Ok(vec![ReassembledPacket {
        ext_seq,
        ts,
        marker: false,
        flags: PacketFlags::default(),
        data,
    }])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restores_start_code_when_p_set() {
        // P=1, V=0, PLEN=0 -> header = 0b0000_0100_0000_0000 = 0x0400.
        let mut payload = vec![0x04, 0x00];
        payload.extend_from_slice(&[1, 2, 3]);
        let out = process(&payload, 0, 0).unwrap();
        assert_eq!(&out[0].data[..], &[0, 0, 1, 2, 3]);
    }

    #[test]
    fn passes_through_without_start_code_when_p_clear() {
        let payload = vec![0x00, 0x00, 9, 9];
        let out = process(&payload, 0, 0).unwrap();
        assert_eq!(&out[0].data[..], &[9, 9]);
    }
}
