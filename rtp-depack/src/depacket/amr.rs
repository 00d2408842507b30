// AMR-NB/WB, RFC 3267 octet-aligned mode. Frame-size tables and FT
// boundaries grounded on `rtp_audio.c`'s `ProcessAMRPacket`
// (`packed_size_amr_nb`/`packed_size_amr_wb`, `sidframe`, NO-DATA at
// FT=15).

use smallvec::SmallVec;

use crate::error::{DepackError, DepackResult};
use crate::queues::{PacketFlags, ReassembledPacket};

#[derive(Debug, Clone, Copy)]
pub enum AmrKind {
    Nb,
    Wb,
}

const PACKED_SIZE_NB: [usize; 9] = [12, 13, 15, 17, 19, 20, 26, 31, 5];
const PACKED_SIZE_WB: [usize; 10] = [17, 23, 32, 36, 40, 46, 50, 58, 60, 5];
const NODATA_FT: u8 = 15;

fn sid_ft(kind: AmrKind) -> u8 {
    match kind {
        AmrKind::Wb => 9,
        AmrKind::Nb => 8,
    }
}

fn frame_size(kind: AmrKind, ft: u8) -> Option<usize> {
    match kind {
        AmrKind::Nb => PACKED_SIZE_NB.get(ft as usize).copied(),
        AmrKind::Wb => PACKED_SIZE_WB.get(ft as usize).copied(),
    }
}

/// Clock rate per RFC 3267 §3.3 (160-sample frame at the given sample
/// rate); used to convert successive frames' 20ms spacing into 100-ns NEM
/// timestamp ticks.
fn frame_duration_100ns(kind: AmrKind) -> u64 {
    match kind {
        AmrKind::Nb => 160 * 10_000_000 / 8_000,
        AmrKind::Wb => 320 * 10_000_000 / 16_000,
    }
}

/// Reads TOC bytes until `F=0`, then slices the payload per the frame-size
/// table, rewriting each frame as "TOC byte followed by frame bytes".
pub fn process(kind: AmrKind, payload: &[u8], ts: u32, ext_seq: u64) -> DepackResult<Vec<ReassembledPacket>> {
    let mut toc = Vec::new();
    let mut idx = 0;
    loop {
        let byte = *payload
            .get(idx)
            .ok_or_else(|| DepackError::Malformed("AMR TOC truncated".into()))?;
        let f = byte & 0x80 != 0;
        let ft = (byte >> 3) & 0x0f;
        toc.push(ft);
        idx += 1;
        if !f {
            break;
        }
    }

    let mut frames = Vec::with_capacity(toc.len());
    let mut cursor = idx;
    let sid = sid_ft(kind);
    for &ft in &toc {
        if ft == NODATA_FT {
            frames.push((ft, 0usize));
            continue;
        }
        let size = if ft == sid {
            frame_size(kind, ft).unwrap_or(0)
        } else {
            frame_size(kind, ft)
                .ok_or_else(|| DepackError::Malformed(format!("unknown AMR FT {ft}")))?
        };
        if cursor + size > payload.len() {
            return Err(DepackError::Malformed("AMR frame payload truncated".into()));
        }
        cursor += size;
        frames.push((ft, size));
    }

    let mut cursor = idx;
    let mut out = Vec::with_capacity(frames.len());
    let step = frame_duration_100ns(kind);
    for (i, (ft, size)) in frames.into_iter().enumerate() {
        let mut data = SmallVec::with_capacity(1 + size);
        data.push((ft << 3) | 0x04); // single-frame TOC byte, F=0, Q=1
        data.extend_from_slice(&payload[cursor..cursor + size]);
        cursor += size;
        out.push(ReassembledPacket {
            ext_seq,
            ts: ts.wrapping_add((i as u64 * step) as u32),
            marker: false,
            flags: PacketFlags::default(),
            data,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_nb_frames_reassemble_with_header_and_spacing() {
        // FT=2 (size 15), FT=4 (size 19): TOC {F=1,FT=2}, {F=0,FT=4}.
        let mut payload = vec![0x80 | (2 << 3), 0x00 | (4 << 3)];
        payload.extend(vec![0xAA; 15]);
        payload.extend(vec![0xBB; 19]);
        let out = process(AmrKind::Nb, &payload, 1000, 7).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].data.len(), 16);
        assert_eq!(out[1].data.len(), 20);
        assert_eq!(out[1].ts - out[0].ts, 160 * 10_000_000 / 8_000);
    }
}
