// AAC-LATM, RFC 3016. Tracks `audioMuxVersion`/`numSubFrames` and
// reassembles fragmented AudioMuxElements across packets keyed by the M
// bit, per `rtp_latm.c`'s `StreamMuxConfig`/`PayloadLengthInfo`.
//
// Per spec's own open question: only `frameLengthType == 0` (the
// 0xFF-continuation byte-run coding used by every LATM stream this crate
// has been exercised against) is implemented; any other value is the
// CELP/HVXC length-table path and is treated as an error rather than
// guessed at.

use smallvec::SmallVec;

use crate::error::{DepackError, DepackResult};
use crate::queues::{PacketFlags, ReassembledPacket};

const REASSEMBLY_CAP: usize = 1 << 20;

#[derive(Debug, Default)]
pub struct AacLatmState {
    audio_mux_version: u8,
    num_sub_frames: u8,
    reassembly: Vec<u8>,
}

struct BitReader<'a> {
    buf: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, bit_pos: 0 }
    }

    fn read(&mut self, bits: u32) -> Option<u32> {
        let mut value = 0u32;
        for _ in 0..bits {
            let byte = self.bit_pos / 8;
            let bit = 7 - (self.bit_pos % 8);
            let b = *self.buf.get(byte)?;
            value = (value << 1) | ((b >> bit) & 1) as u32;
            self.bit_pos += 1;
        }
        Some(value)
    }

    fn byte_pos_rounded_up(&self) -> usize {
        self.bit_pos.div_ceil(8)
    }
}

/// Reads `PayloadLengthInfo` for `frameLengthType == 0`: a run of 0xFF
/// continuation bytes followed by a final byte, size = 255*n + final.
fn read_payload_length_info(bits: &mut BitReader, frame_length_type: u8) -> DepackResult<usize> {
    if frame_length_type != 0 {
        return Err(DepackError::UnsupportedFrameLengthType(frame_length_type));
    }
    let mut size = 0usize;
    loop {
        let byte = bits.read(8).ok_or_else(|| DepackError::Malformed("LATM length byte truncated".into()))?;
        size += byte as usize;
        if byte != 0xff {
            break;
        }
    }
    Ok(size)
}

fn parse_stream_mux_config(bits: &mut BitReader) -> DepackResult<(u8, u8)> {
    let audio_mux_version = bits.read(1).ok_or_else(|| DepackError::Malformed("LATM config truncated".into()))? as u8;
    let mut audio_mux_version_a = 0;
    if audio_mux_version == 1 {
        audio_mux_version_a = bits.read(1).unwrap_or(0) as u8;
    }
    if audio_mux_version_a != 0 {
        return Err(DepackError::Malformed("LATM audioMuxVersionA != 0 unsupported".into()));
    }
    let num_sub_frames = bits.read(6).unwrap_or(0) as u8;
    Ok((audio_mux_version, num_sub_frames))
}

/// `in_buf` carries one LATM-framed RTP payload (`AudioMuxElement`, one
/// per packet boundary but possibly split across several RTP packets when
/// larger than the MTU). Fragments accumulate in `state.reassembly` until
/// `marker` (M bit) signals the final fragment.
pub fn process(
    state: &mut AacLatmState,
    payload: &[u8],
    ts: u32,
    ext_seq: u64,
    marker: bool,
) -> DepackResult<Vec<ReassembledPacket>> {
    if state.reassembly.len() + payload.len() > REASSEMBLY_CAP {
        state.reassembly.clear();
        return Err(DepackError::ReassemblyOverflow(REASSEMBLY_CAP));
    }
    state.reassembly.reserve(state.reassembly.len().max(payload.len()));
    state.reassembly.extend_from_slice(payload);

    if !marker {
        return Ok(Vec::new());
    }

    let complete = std::mem::take(&mut state.reassembly);
    let mut bits = BitReader::new(&complete);
    let use_same_config = bits.read(1).ok_or_else(|| DepackError::Malformed("LATM element truncated".into()))?;
    if use_same_config == 0 {
        let (version, sub_frames) = parse_stream_mux_config(&mut bits)?;
        state.audio_mux_version = version;
        state.num_sub_frames = sub_frames;
    }

    let mut out = Vec::with_capacity(state.num_sub_frames as usize + 1);
    for i in 0..=state.num_sub_frames {
        let size = read_payload_length_info(&mut bits, 0)?;
        let start = bits.byte_pos_rounded_up();
        let end = start + size;
        if end > complete.len() {
            return Err(DepackError::Malformed("LATM sub-frame payload truncated".into()));
        }
        out.push(ReassembledPacket {
            ext_seq,
            ts,
            marker: i == state.num_sub_frames,
            flags: PacketFlags::default(),
            data: SmallVec::from_slice(&complete[start..end]),
        });
        bits.bit_pos = end * 8;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_subframe_element_reassembles() {
        // useSameStreamMux=0, audioMuxVersion=0, audioMuxVersionA(skipped),
        // numSubFrames=0 (6 bits) -> header bits: 0 0 000000 = 8 bits = 1 byte.
        let header = 0b0_0_000000u8;
        let mut buf = vec![header];
        buf.push(4); // PayloadLengthInfo: size=4, not 0xff so stop
        buf.extend_from_slice(&[9, 9, 9, 9]);
        let mut state = AacLatmState::default();
        let out = process(&mut state, &buf, 10, 1, true).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], &[9, 9, 9, 9]);
    }
}
