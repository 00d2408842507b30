// H.264, RFC 3984/6184. Single NALU, STAP-A/B, MTAP16/24, FU-A/B.
//
// DON bookkeeping (`CalculateAbsDon`/`CalculateDonDiff`/`CalculateDonDistance`)
// is carried over verbatim, wrap-arithmetic included, from
// `rtp_video_h264.c`'s functions of the same name; only the storage
// shape (owned Vecs instead of a fixed `RTSPH264InterleaveData` array)
// changed. Fragmentation reassembly (FU-A/FU-B) requires contiguous
// extended sequence numbers and drops the whole chain on a gap, per
// §4.D.5 and the end-to-end scenario in §8.

use smallvec::SmallVec;

use crate::error::{DepackError, DepackResult};
use crate::queues::{PacketFlags, ReassembledPacket};

const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_STAP_B: u8 = 25;
const NAL_TYPE_MTAP16: u8 = 26;
const NAL_TYPE_MTAP24: u8 = 27;
const NAL_TYPE_FU_A: u8 = 28;
const NAL_TYPE_FU_B: u8 = 29;

struct FragState {
    nal_header: u8,
    next_ext_seq: u64,
    buffer: Vec<u8>,
    don: Option<u16>,
}

struct DeinterleaveEntry {
    don: u16,
    abs_don: i64,
    ts: u32,
    ext_seq: u64,
    data: Vec<u8>,
}

/// Per-stream H.264 depacketizer state: the `sprop-*` fmtp parameters
/// that govern reassembly, the in-flight FU-A/FU-B fragment buffer, and,
/// when interleaving is in effect, the deinterleaving buffer that holds
/// VCL NALs until they can be released in decode order. Profile/level and
/// parameter sets from SDP are parsed elsewhere since they do not affect
/// reassembly.
#[derive(Default)]
pub struct H264Config {
    pub packetization_mode: u8,
    pub sprop_interleaving_depth: u32,
    pub sprop_max_don_diff: u32,
    frag: Option<FragState>,
    deint: Vec<DeinterleaveEntry>,
    abs_don: i64,
    last_don: Option<u16>,
    p_don: u16,
    pub lost_packets: u64,
}

impl H264Config {
    pub fn new(packetization_mode: u8, sprop_interleaving_depth: u32, sprop_max_don_diff: u32) -> Self {
        Self {
            packetization_mode,
            sprop_interleaving_depth,
            sprop_max_don_diff,
            ..Default::default()
        }
    }
}

/// `CalculateDonDistance`: forward distance from the last delivered DON
/// (`pDon`) to `don`, wrapping at 2^16.
#[allow(non_snake_case)]
pub fn CalculateDonDistance(don: u16, pDon: u16) -> i32 {
    if don > pDon {
        (don - pDon) as i32
    } else {
        65535 - pDon as i32 + don as i32 + 1
    }
}

/// `CalculateAbsDon`: extends a 16-bit wrapping DON into a running
/// absolute counter given the previous (absDon, don) pair.
#[allow(non_snake_case)]
pub fn CalculateAbsDon(prev_abs_don: i64, prev_don: u16, don: u16) -> i64 {
    let (m, n) = (prev_don as i64, don as i64);
    if prev_don == don {
        prev_abs_don
    } else if prev_don < don && (n - m) < 32768 {
        prev_abs_don + n - m
    } else if prev_don > don && (m - n) >= 32768 {
        prev_abs_don + 65536 - m + n
    } else if prev_don < don && (n - m) >= 32768 {
        prev_abs_don - (m + 65536 - n)
    } else {
        prev_abs_don - (m - n)
    }
}

/// `CalculateDonDiff`: signed difference `don_b - don_a` with 2^16 wrap.
#[allow(non_snake_case)]
pub fn CalculateDonDiff(don_a: u16, don_b: u16) -> i32 {
    let (m, n) = (don_a as i32, don_b as i32);
    if don_a == don_b {
        0
    } else if don_a < don_b && (n - m) < 32768 {
        n - m
    } else if don_a < don_b {
        n - m - 65536
    } else if (m - n) < 32768 {
        -(m - n)
    } else {
        65536 - m + n
    }
}

fn emit(data: &[u8], ts: u32, ext_seq: u64, marker: bool) -> ReassembledPacket {
    ReassembledPacket {
        ext_seq,
        ts,
        marker,
        flags: PacketFlags::default(),
        data: SmallVec::from_slice(data),
    }
}

impl H264Config {
    /// Tracks `don`'s absolute value against the running counter and
    /// returns it; called once per NAL that carries a DON.
    fn track_don(&mut self, don: u16) -> i64 {
        let abs = match self.last_don {
            Some(prev) => CalculateAbsDon(self.abs_don, prev, don),
            None => 0,
        };
        self.abs_don = abs;
        self.last_don = Some(don);
        abs
    }

    /// Queues a NAL for interleaved release, or returns it immediately
    /// when no interleaving depth is configured (RFC 6184 non-interleaved
    /// mode, where STAP-B/MTAP/FU-B degrade to immediate delivery).
    fn deinterleave_or_emit(&mut self, data: Vec<u8>, ts: u32, ext_seq: u64, don: u16) -> Vec<ReassembledPacket> {
        if self.sprop_interleaving_depth == 0 {
            return vec![emit(&data, ts, ext_seq, false)];
        }
        let abs_don = self.track_don(don);
        self.deint.push(DeinterleaveEntry {
            don,
            abs_don,
            ts,
            ext_seq,
            data,
        });
        self.drain_ready()
    }

    fn should_release(&self) -> bool {
        if self.deint.len() as u32 >= self.sprop_interleaving_depth.max(1) {
            return true;
        }
        if self.sprop_max_don_diff > 0 {
            let min = self.deint.iter().map(|e| e.abs_don).min().unwrap_or(0);
            let max = self.deint.iter().map(|e| e.abs_don).max().unwrap_or(0);
            if (max - min) as u64 > self.sprop_max_don_diff as u64 {
                return true;
            }
        }
        false
    }

    fn drain_ready(&mut self) -> Vec<ReassembledPacket> {
        let mut out = Vec::new();
        while self.should_release() && !self.deint.is_empty() {
            out.push(self.release_one());
        }
        out
    }

    /// Releases the buffered NAL whose DON-distance from the previously
    /// delivered DON is smallest (§8's H.264 DON invariant).
    fn release_one(&mut self) -> ReassembledPacket {
        let idx = self
            .deint
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| CalculateDonDistance(e.don, self.p_don))
            .map(|(i, _)| i)
            .expect("deint non-empty");
        let entry = self.deint.remove(idx);
        self.p_don = entry.don;
        emit(&entry.data, entry.ts, entry.ext_seq, false)
    }

    /// Caller-driven flush for the "initial buffering time has elapsed"
    /// release condition (§4.D.5): this crate is clock-free, so the RTSP
    /// session times the interval and calls this when it expires.
    pub fn flush_one(&mut self) -> Option<ReassembledPacket> {
        if self.deint.is_empty() {
            None
        } else {
            Some(self.release_one())
        }
    }
}

pub fn process(
    state: &mut H264Config,
    payload: &[u8],
    ts: u32,
    ext_seq: u64,
    marker: bool,
) -> DepackResult<Vec<ReassembledPacket>> {
    if payload.is_empty() {
        return Err(DepackError::Malformed("empty H.264 payload".into()));
    }
    let nal_header = payload[0];
    let nal_type = nal_header & 0x1f;

    match nal_type {
        1..=23 => Ok(vec![emit(payload, ts, ext_seq, marker)]),
        NAL_TYPE_STAP_A => parse_stap_a(payload, ts, ext_seq),
        NAL_TYPE_STAP_B => parse_stap_b(state, payload, ts, ext_seq),
        NAL_TYPE_MTAP16 => parse_mtap(state, payload, ts, ext_seq, 2),
        NAL_TYPE_MTAP24 => parse_mtap(state, payload, ts, ext_seq, 3),
        NAL_TYPE_FU_A => process_fu(state, payload, ts, ext_seq, marker, false),
        NAL_TYPE_FU_B => process_fu(state, payload, ts, ext_seq, marker, true),
        other => Err(DepackError::Malformed(format!("unsupported H.264 NAL type {other}"))),
    }
}

fn parse_stap_a(payload: &[u8], ts: u32, ext_seq: u64) -> DepackResult<Vec<ReassembledPacket>> {
    let mut out = Vec::new();
    let mut cursor = 1;
    while cursor + 2 <= payload.len() {
        let size = u16::from_be_bytes([payload[cursor], payload[cursor + 1]]) as usize;
        cursor += 2;
        if cursor + size > payload.len() {
            return Err(DepackError::Malformed("STAP-A NALU size exceeds payload".into()));
        }
        out.push(emit(&payload[cursor..cursor + size], ts, ext_seq, false));
        cursor += size;
    }
    Ok(out)
}

fn parse_stap_b(state: &mut H264Config, payload: &[u8], ts: u32, ext_seq: u64) -> DepackResult<Vec<ReassembledPacket>> {
    if payload.len() < 3 {
        return Err(DepackError::Malformed("STAP-B header truncated".into()));
    }
    let mut don = u16::from_be_bytes([payload[1], payload[2]]);
    let mut out = Vec::new();
    let mut cursor = 3;
    while cursor + 2 <= payload.len() {
        let size = u16::from_be_bytes([payload[cursor], payload[cursor + 1]]) as usize;
        cursor += 2;
        if cursor + size > payload.len() {
            return Err(DepackError::Malformed("STAP-B NALU size exceeds payload".into()));
        }
        out.extend(state.deinterleave_or_emit(payload[cursor..cursor + size].to_vec(), ts, ext_seq, don));
        cursor += size;
        don = don.wrapping_add(1);
    }
    Ok(out)
}

fn parse_mtap(
    state: &mut H264Config,
    payload: &[u8],
    ts: u32,
    ext_seq: u64,
    ts_offset_bytes: usize,
) -> DepackResult<Vec<ReassembledPacket>> {
    if payload.len() < 3 {
        return Err(DepackError::Malformed("MTAP header truncated".into()));
    }
    let donb = u16::from_be_bytes([payload[1], payload[2]]);
    let mut out = Vec::new();
    let mut cursor = 3;
    let entry_prefix = 1 + ts_offset_bytes;
    while cursor + 2 + entry_prefix <= payload.len() {
        let size = u16::from_be_bytes([payload[cursor], payload[cursor + 1]]) as usize;
        cursor += 2;
        if size < entry_prefix || cursor + size > payload.len() {
            return Err(DepackError::Malformed("MTAP NALU size exceeds payload".into()));
        }
        let dond = payload[cursor];
        let ts_off_bytes = &payload[cursor + 1..cursor + entry_prefix];
        let ts_offset = ts_off_bytes.iter().fold(0u32, |acc, &b| (acc << 8) | b as u32);
        let don = donb.wrapping_add(dond as u16);
        let nal_start = cursor + entry_prefix;
        let nal_end = cursor + size;
        out.extend(state.deinterleave_or_emit(
            payload[nal_start..nal_end].to_vec(),
            ts.wrapping_add(ts_offset),
            ext_seq,
            don,
        ));
        cursor = nal_end;
    }
    Ok(out)
}

fn process_fu(
    state: &mut H264Config,
    payload: &[u8],
    ts: u32,
    ext_seq: u64,
    marker: bool,
    is_fu_b: bool,
) -> DepackResult<Vec<ReassembledPacket>> {
    if payload.len() < 2 {
        return Err(DepackError::Malformed("FU header truncated".into()));
    }
    let fu_indicator = payload[0];
    let fu_header = payload[1];
    let start = fu_header & 0x80 != 0;
    let end = fu_header & 0x40 != 0;
    let fragment_type = fu_header & 0x1f;
    let reconstructed_header = (fu_indicator & 0xe0) | fragment_type;

    let mut cursor = 2;
    let mut don = None;
    if is_fu_b && start {
        if payload.len() < 4 {
            return Err(DepackError::Malformed("FU-B DON truncated".into()));
        }
        don = Some(u16::from_be_bytes([payload[2], payload[3]]));
        cursor = 4;
    }
    let body = &payload[cursor..];

    if start {
        state.frag = Some(FragState {
            nal_header: reconstructed_header,
            next_ext_seq: ext_seq + 1,
            buffer: {
                let mut b = Vec::with_capacity(body.len() + 1);
                b.push(reconstructed_header);
                b.extend_from_slice(body);
                b
            },
            don,
        });
        return Ok(Vec::new());
    }

    let contiguous = state
        .frag
        .as_ref()
        .map(|f| f.next_ext_seq == ext_seq)
        .unwrap_or(false);
    if !contiguous {
        if state.frag.is_some() {
            state.frag = None;
            state.lost_packets += 1;
        }
        return Ok(Vec::new());
    }

    let frag = state.frag.as_mut().expect("checked contiguous");
    frag.buffer.extend_from_slice(body);
    frag.next_ext_seq += 1;

    if !end {
        return Ok(Vec::new());
    }

    let frag = state.frag.take().expect("checked contiguous");
    if is_fu_b {
        let don = frag.don.unwrap_or(0);
        Ok(state.deinterleave_or_emit(frag.buffer, ts, ext_seq, don))
    } else {
        let _ = frag.nal_header;
        Ok(vec![emit(&frag.buffer, ts, ext_seq, marker)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fu_a_packet(s: bool, e: bool, seq_nal_type: u8, body: &[u8]) -> Vec<u8> {
        let indicator = 0x60 | NAL_TYPE_FU_A; // NRI=3, type=28
        let mut header = seq_nal_type & 0x1f;
        if s {
            header |= 0x80;
        }
        if e {
            header |= 0x40;
        }
        let mut out = vec![indicator, header];
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn fu_a_three_packets_no_loss_reassembles() {
        let mut state = H264Config::new(1, 0, 0);
        let start = fu_a_packet(true, false, 5, &[1, 2]);
        assert!(process(&mut state, &start, 0, 100, false).unwrap().is_empty());
        let mid = fu_a_packet(false, false, 5, &[3, 4]);
        assert!(process(&mut state, &mid, 0, 101, false).unwrap().is_empty());
        let end = fu_a_packet(false, true, 5, &[5, 6]);
        let out = process(&mut state, &end, 1000, 102, true).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], &[5, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn fu_a_gap_drops_chain_and_counts_loss() {
        let mut state = H264Config::new(1, 0, 0);
        let start = fu_a_packet(true, false, 5, &[1, 2]);
        process(&mut state, &start, 0, 100, false).unwrap();
        // seq 101 lost; mid arrives as seq 102.
        let mid = fu_a_packet(false, false, 5, &[3, 4]);
        let out_mid = process(&mut state, &mid, 0, 102, false).unwrap();
        assert!(out_mid.is_empty());
        let end = fu_a_packet(false, true, 5, &[5, 6]);
        let out_end = process(&mut state, &end, 0, 103, true).unwrap();
        assert!(out_end.is_empty());
        assert_eq!(state.lost_packets, 1);
    }

    #[test]
    fn stap_a_splits_into_independent_nals() {
        let mut payload = vec![NAL_TYPE_STAP_A];
        payload.extend_from_slice(&2u16.to_be_bytes());
        payload.extend_from_slice(&[9, 9]);
        payload.extend_from_slice(&3u16.to_be_bytes());
        payload.extend_from_slice(&[1, 2, 3]);
        let out = parse_stap_a(&payload, 0, 0).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0].data[..], &[9, 9]);
        assert_eq!(&out[1].data[..], &[1, 2, 3]);
    }

    #[test]
    fn don_distance_wraps_forward() {
        assert_eq!(CalculateDonDistance(10, 5), 5);
        assert_eq!(CalculateDonDistance(2, 65534), 4);
    }

    #[test]
    fn deinterleave_releases_min_distance_entry_first() {
        let mut state = H264Config::new(2, 2, 0);
        // First STAP-B establishes DON base 10; interleaving depth 2 means
        // the buffer releases once two NALs are queued.
        let mut p1 = vec![NAL_TYPE_STAP_B];
        p1.extend_from_slice(&10u16.to_be_bytes());
        p1.extend_from_slice(&2u16.to_be_bytes());
        p1.extend_from_slice(&[1, 1]);
        let out1 = process(&mut state, &p1, 0, 0, false).unwrap();
        assert!(out1.is_empty());

        let mut p2 = vec![NAL_TYPE_STAP_B];
        p2.extend_from_slice(&11u16.to_be_bytes());
        p2.extend_from_slice(&2u16.to_be_bytes());
        p2.extend_from_slice(&[2, 2]);
        let out2 = process(&mut state, &p2, 0, 1, false).unwrap();
        assert_eq!(out2.len(), 1);
        assert_eq!(&out2[0].data[..], &[1, 1]);
    }
}
