// VC-1, grounded on `rtp_video.c`'s `ProcessVC1Packet`. A 12-byte AU
// header precedes the payload; the top two bits of its first byte are
// the fragmentation state: 0=mid, 1=first, 2=last, 3=complete frame.

use smallvec::SmallVec;

use crate::error::{DepackError, DepackResult};
use crate::queues::{PacketFlags, ReassembledPacket};

const AU_HEADER_LEN: usize = 12;

#[derive(Default)]
pub struct Vc1State {
    recon: Option<Vec<u8>>,
}

pub fn process(state: &mut Vc1State, payload: &[u8], ts: u32, ext_seq: u64) -> DepackResult<Vec<ReassembledPacket>> {
    if payload.len() < AU_HEADER_LEN {
        return Err(DepackError::Malformed("VC-1 AU header truncated".into()));
    }
    let frag = (payload[0] >> 6) & 0x3;
    let body = &payload[AU_HEADER_LEN..];

    match frag {
        0 => {
            // mid fragment: continue an already-open reassembly, otherwise
            // there is nothing sane to do with an orphaned middle piece.
            if let Some(buf) = &mut state.recon {
                buf.extend_from_slice(body);
            }
            Ok(Vec::new())
        }
        1 => {
            // first fragment: any previous incomplete frame is abandoned.
            state.recon = Some(body.to_vec());
            Ok(Vec::new())
        }
        2 => {
            // last fragment: finalize and emit.
            match state.recon.take() {
                Some(mut buf) => {
                    buf.extend_from_slice(body);
                    Ok(vec![ReassembledPacket {
                        ext_seq,
                        ts,
                        marker: false,
                        flags: PacketFlags::default(),
                        data: SmallVec::from_slice(&buf),
                    }])
                }
                None => Ok(Vec::new()),
            }
        }
        3 => Ok(vec![ReassembledPacket {
            ext_seq,
            ts,
            marker: false,
            flags: PacketFlags::default(),
            data: SmallVec::from_slice(body),
        }]),
        _ => unreachable!("2-bit field"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn au(frag: u8) -> [u8; 12] {
        let mut h = [0u8; 12];
        h[0] = frag << 6;
        h
    }

    #[test]
    fn complete_frame_passes_through() {
        let mut state = Vc1State::default();
        let mut payload = au(3).to_vec();
        payload.extend_from_slice(&[1, 2, 3]);
        let out = process(&mut state, &payload, 0, 0).unwrap();
        assert_eq!(&out[0].data[..], &[1, 2, 3]);
    }

    #[test]
    fn first_mid_last_reassemble() {
        let mut state = Vc1State::default();
        let mut first = au(1).to_vec();
        first.extend_from_slice(&[1, 2]);
        assert!(process(&mut state, &first, 0, 0).unwrap().is_empty());

        let mut mid = au(0).to_vec();
        mid.extend_from_slice(&[3, 4]);
        assert!(process(&mut state, &mid, 0, 1).unwrap().is_empty());

        let mut last = au(2).to_vec();
        last.extend_from_slice(&[5, 6]);
        let out = process(&mut state, &last, 10, 2).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], &[1, 2, 3, 4, 5, 6]);
    }
}
