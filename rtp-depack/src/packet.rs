// §3 "RTP packet" and the extended-sequence rollover tracking of §4.D.4.

use smallvec::SmallVec;

/// A raw RTP packet after header validation and CSRC/extension stripping.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub seq: u16,
    pub ts: u32,
    pub marker: bool,
    pub payload_type: u8,
    pub payload: SmallVec<[u8; 1460]>,
}

const RTP_VERSION: u8 = 2;

/// Parses a single UDP datagram into an [`RtpPacket`], stripping CSRC
/// identifiers and any header extension. Returns `None` for a datagram
/// that fails basic validation (wrong version, truncated header,
/// mismatched payload type is left to the caller since it is a per-stream
/// decision).
pub fn parse_rtp_header(buf: &[u8]) -> Option<RtpPacket> {
    if buf.len() < 12 {
        return None;
    }
    let version = buf[0] >> 6;
    if version != RTP_VERSION {
        return None;
    }
    let has_padding = buf[0] & 0x20 != 0;
    let has_extension = buf[0] & 0x10 != 0;
    let csrc_count = (buf[0] & 0x0f) as usize;
    let marker = buf[1] & 0x80 != 0;
    let payload_type = buf[1] & 0x7f;
    let seq = u16::from_be_bytes([buf[2], buf[3]]);
    let ts = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

    let mut offset = 12 + 4 * csrc_count;
    if offset > buf.len() {
        return None;
    }
    if has_extension {
        if offset + 4 > buf.len() {
            return None;
        }
        let ext_len_words = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        offset += 4 + 4 * ext_len_words;
        if offset > buf.len() {
            return None;
        }
    }
    let mut end = buf.len();
    if has_padding {
        let pad = *buf.last()? as usize;
        if pad == 0 || pad > end - offset {
            return None;
        }
        end -= pad;
    }

    Some(RtpPacket {
        seq,
        ts,
        marker,
        payload_type,
        payload: SmallVec::from_slice(&buf[offset..end]),
    })
}

/// Tracks sequence-number rollover for one RTP stream, producing a
/// monotonic "extended sequence number" (48 bits of headroom is plenty;
/// stored as `u64`).
#[derive(Debug, Default)]
pub struct SequenceTracker {
    rollovers: u64,
    last_seq: Option<u16>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// §4.D.4: "when seq=65535 is seen, a rollover counter increments".
    pub fn extend(&mut self, seq: u16) -> u64 {
        if self.last_seq == Some(u16::MAX) {
            self.rollovers += 1;
        }
        self.last_seq = Some(seq);
        self.rollovers * (u16::MAX as u64 + 1) + seq as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extends_across_rollover() {
        let mut t = SequenceTracker::new();
        assert_eq!(t.extend(65534), 65534);
        assert_eq!(t.extend(65535), 65535);
        assert_eq!(t.extend(0), 65536);
        assert_eq!(t.extend(1), 65537);
    }

    #[test]
    fn rejects_wrong_version() {
        let mut buf = vec![0u8; 16];
        buf[0] = 0b0100_0000; // version 1
        assert!(parse_rtp_header(&buf).is_none());
    }

    #[test]
    fn parses_minimal_header() {
        let mut buf = vec![0u8; 12];
        buf[0] = 0b1000_0000; // version 2, no padding/extension/csrc
        buf[1] = 0x80 | 96; // marker set, payload type 96
        buf[2..4].copy_from_slice(&42u16.to_be_bytes());
        buf[4..8].copy_from_slice(&123456u32.to_be_bytes());
        buf.extend_from_slice(b"hi");
        let pkt = parse_rtp_header(&buf).unwrap();
        assert_eq!(pkt.seq, 42);
        assert_eq!(pkt.ts, 123456);
        assert!(pkt.marker);
        assert_eq!(pkt.payload_type, 96);
        assert_eq!(&pkt.payload[..], b"hi");
    }
}
