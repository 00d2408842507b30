// ASF-carried-over-RTP, grounded on `rtp_video.c`'s `ProcessASFPacket`.
// Per-packet header: one flags byte (L=last-fragment-of-payload, R, D, I
// each gating an optional 4-byte field we skip over), followed by a
// 3-byte big-endian length-or-offset.
//
// `L=0` means this fragment continues (or starts) a multi-packet
// reassembly at the given byte offset; `L=1` means this RTP packet
// carries a complete ASF packet by itself, and also finalizes whatever
// partial reassembly was still open (a still-open buffer at that point
// belongs to a payload that was abandoned mid-stream, e.g. by a lost
// final fragment).

use smallvec::SmallVec;

use crate::error::{DepackError, DepackResult};
use crate::queues::{PacketFlags, ReassembledPacket};

pub struct AsfState {
    max_packet_size: usize,
    recon: Option<Recon>,
}

struct Recon {
    ts: u32,
    buf: Vec<u8>,
}

impl AsfState {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size,
            recon: None,
        }
    }
}

pub fn process(state: &mut AsfState, payload: &[u8], ts: u32, ext_seq: u64) -> DepackResult<Vec<ReassembledPacket>> {
    if payload.len() < 4 {
        return Err(DepackError::Malformed("ASF-in-RTP header truncated".into()));
    }
    let flags = payload[0];
    let last = flags & 0x40 != 0;
    let has_r = flags & 0x20 != 0;
    let has_d = flags & 0x10 != 0;
    let has_i = flags & 0x08 != 0;
    let offset = ((payload[1] as usize) << 16) | ((payload[2] as usize) << 8) | payload[3] as usize;

    let mut cursor = 4;
    if has_r {
        cursor += 4;
    }
    if has_d {
        cursor += 4;
    }
    if has_i {
        cursor += 4;
    }
    let body = payload
        .get(cursor..)
        .ok_or_else(|| DepackError::Malformed("ASF-in-RTP payload shorter than its optional fields".into()))?;

    let mut out = Vec::new();
    if !last {
        match &mut state.recon {
            Some(r) if r.ts == ts => {
                let end = offset + body.len();
                if r.buf.len() < end {
                    r.buf.resize(end, 0);
                }
                r.buf[offset..end].copy_from_slice(body);
            }
            _ => {
                let cap = (offset + body.len()).max(state.max_packet_size);
                let mut buf = vec![0u8; cap];
                buf[offset..offset + body.len()].copy_from_slice(body);
                state.recon = Some(Recon { ts, buf });
            }
        }
        return Ok(out);
    }

    if let Some(prev) = state.recon.take() {
        out.push(ReassembledPacket {
            ext_seq,
            ts: prev.ts,
            marker: false,
            flags: PacketFlags::default(),
            data: SmallVec::from_slice(&prev.buf),
        });
    }
    let cap = body.len().max(state.max_packet_size);
    let mut data = SmallVec::with_capacity(cap);
    data.extend_from_slice(body);
    out.push(ReassembledPacket {
        ext_seq,
        ts,
        marker: false,
        flags: PacketFlags::default(),
        data,
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_packet_emits_immediately() {
        let mut state = AsfState::new(0);
        let mut payload = vec![0x40, 0, 0, 0]; // L=1, no R/D/I, offset unused
        payload.extend_from_slice(&[9, 9, 9]);
        let out = process(&mut state, &payload, 5, 1).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], &[9, 9, 9]);
    }

    #[test]
    fn fragments_reassemble_then_finalize_on_next_complete() {
        let mut state = AsfState::new(16);
        let frag1 = [0x00, 0, 0, 0, 1, 2, 3, 4];
        assert!(process(&mut state, &frag1, 100, 1).unwrap().is_empty());
        let frag2 = [0x00, 0, 0, 4, 5, 6, 7, 8];
        assert!(process(&mut state, &frag2, 100, 2).unwrap().is_empty());

        let complete = [0x40, 0, 0, 0, 99];
        let out = process(&mut state, &complete, 200, 3).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].ts, 100);
        assert_eq!(&out[0].data[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(out[1].ts, 200);
        assert_eq!(&out[1].data[..], &[99]);
    }
}
