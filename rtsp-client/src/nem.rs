// NEM synthesis, §4.D.9/§6. The original emitter was a small state machine
// (FILE_HEADER -> NEW_PACKET -> MID_PACKET -> END_PACKET -> ...) because its
// caller handed over fixed-size buffers and the emitter had to resume
// mid-header or mid-payload across calls. Here the emitter writes complete
// records into a `VecDeque<u8>` that the handler's blocking `read` drains
// byte-for-byte, so the same resumable-partial-drain behavior falls out of
// the queue itself rather than needing an explicit state enum.

use std::collections::VecDeque;

const NEM_MAGIC: u32 = 0x4d4d_764e; // "NvMM", little-endian on the wire
const NEM_VERSION: u32 = 1;

const TAG_AUDIO_FMT: u16 = 0x6861; // 'ah'
const TAG_VIDEO_FMT: u16 = 0x6876; // 'vh'
const TAG_DATA: u16 = 0x6164; // 'da'

pub const FLAG_END_OF_PACKET: u32 = 1;
pub const FLAG_SKIP_PACKET: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NemMode {
    /// Standard carriers: NEM file header, per-stream format headers, then
    /// tagged data packets.
    Framed,
    /// ASF-in-RTP, §4.D.9: "emit the recovered ASF header first, then raw
    /// reassembled packets without NEM framing".
    Asf,
}

#[derive(Debug, Clone)]
pub struct AudioFormat {
    pub codec_tag: u32,
    pub duration_100ns: u64,
    pub sample_rate: u32,
    pub bit_rate: u32,
    pub channels: u32,
    pub bits_per_sample: u32,
}

#[derive(Debug, Clone)]
pub struct VideoFormat {
    pub codec_tag: u32,
    pub duration_100ns: u64,
    pub width: u32,
    pub height: u32,
    /// Q16.16 fixed point, matching the wire format in §6.
    pub fps_q16: u32,
    pub bit_rate: u32,
}

#[derive(Debug, Clone)]
pub enum StreamFormat {
    Audio(AudioFormat),
    Video(VideoFormat),
}

fn push_u16(buf: &mut VecDeque<u8>, v: u16) {
    buf.extend(v.to_le_bytes());
}
fn push_u32(buf: &mut VecDeque<u8>, v: u32) {
    buf.extend(v.to_le_bytes());
}
fn push_u64(buf: &mut VecDeque<u8>, v: u64) {
    buf.extend(v.to_le_bytes());
}

/// Accumulates NEM (or raw ASF) bytes for the handler to drain. One per
/// RTSP session.
pub struct NemEncoder {
    mode: NemMode,
    out: VecDeque<u8>,
    header_sent: bool,
}

impl NemEncoder {
    pub fn new(mode: NemMode) -> Self {
        Self {
            mode,
            out: VecDeque::new(),
            header_sent: false,
        }
    }

    /// Writes the file/stream-format headers (`Framed`) or the recovered
    /// ASF header (`Asf`); a no-op if already sent.
    pub fn emit_session_header(&mut self, formats: &[StreamFormat], asf_header: Option<&[u8]>) {
        if self.header_sent {
            return;
        }
        self.header_sent = true;
        match self.mode {
            NemMode::Asf => {
                if let Some(header) = asf_header {
                    self.out.extend(header.iter().copied());
                }
            }
            NemMode::Framed => {
                push_u32(&mut self.out, NEM_MAGIC);
                let size_placeholder_index = self.out.len();
                push_u32(&mut self.out, 0); // patched below
                push_u32(&mut self.out, NEM_VERSION);
                push_u32(&mut self.out, formats.len() as u32);
                push_u64(&mut self.out, 0); // indexOffset, always 0 here

                for fmt in formats {
                    match fmt {
                        StreamFormat::Audio(a) => {
                            push_u16(&mut self.out, TAG_AUDIO_FMT);
                            push_u16(&mut self.out, 0);
                            push_u32(&mut self.out, a.codec_tag);
                            push_u64(&mut self.out, a.duration_100ns);
                            push_u32(&mut self.out, a.sample_rate);
                            push_u32(&mut self.out, a.bit_rate);
                            push_u32(&mut self.out, a.channels);
                            push_u32(&mut self.out, a.bits_per_sample);
                        }
                        StreamFormat::Video(v) => {
                            push_u16(&mut self.out, TAG_VIDEO_FMT);
                            push_u16(&mut self.out, 0);
                            push_u32(&mut self.out, v.codec_tag);
                            push_u64(&mut self.out, v.duration_100ns);
                            push_u32(&mut self.out, v.width);
                            push_u32(&mut self.out, v.height);
                            push_u32(&mut self.out, v.fps_q16);
                            push_u32(&mut self.out, v.bit_rate);
                        }
                    }
                }

                let total = (self.out.len() - size_placeholder_index) as u32;
                let bytes = total.to_le_bytes();
                for (i, b) in bytes.into_iter().enumerate() {
                    self.out[size_placeholder_index + i] = b;
                }
            }
        }
    }

    /// Appends one reassembled packet as a tagged NEM data record, or the
    /// raw bytes alone when in `Asf` mode.
    pub fn emit_packet(&mut self, stream_index: u16, payload: &[u8], flags: u32, ts_100ns: u64) {
        match self.mode {
            NemMode::Asf => self.out.extend(payload.iter().copied()),
            NemMode::Framed => {
                push_u16(&mut self.out, TAG_DATA);
                push_u16(&mut self.out, stream_index);
                push_u32(&mut self.out, payload.len() as u32);
                push_u32(&mut self.out, flags);
                push_u64(&mut self.out, ts_100ns);
                self.out.extend(payload.iter().copied());
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.out.len()
    }

    /// Drains up to `buf.len()` bytes, returning the count written.
    pub fn drain_into(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.out.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.out.pop_front().unwrap();
        }
        n
    }

    pub fn reset(&mut self) {
        self.out.clear();
        self.header_sent = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_header_carries_stream_count_and_magic() {
        let mut enc = NemEncoder::new(NemMode::Framed);
        enc.emit_session_header(
            &[StreamFormat::Audio(AudioFormat {
                codec_tag: 1,
                duration_100ns: 0,
                sample_rate: 8000,
                bit_rate: 12_200,
                channels: 1,
                bits_per_sample: 16,
            })],
            None,
        );
        let mut buf = vec![0u8; 4];
        assert_eq!(enc.drain_into(&mut buf), 4);
        assert_eq!(u32::from_le_bytes(buf.try_into().unwrap()), NEM_MAGIC);
    }

    #[test]
    fn asf_mode_skips_framing_and_emits_recovered_header_then_raw_packets() {
        let mut enc = NemEncoder::new(NemMode::Asf);
        enc.emit_session_header(&[], Some(&[0xAA, 0xBB]));
        enc.emit_packet(0, &[1, 2, 3], 0, 0);
        let mut buf = vec![0u8; 5];
        assert_eq!(enc.drain_into(&mut buf), 5);
        assert_eq!(buf, vec![0xAA, 0xBB, 1, 2, 3]);
    }

    #[test]
    fn data_packet_header_round_trips_fields() {
        let mut enc = NemEncoder::new(NemMode::Framed);
        enc.emit_session_header(&[], None);
        let mut discard = vec![0u8; enc.pending()];
        enc.drain_into(&mut discard);

        enc.emit_packet(2, &[9, 9], FLAG_END_OF_PACKET, 12_345);
        let mut buf = vec![0u8; 2 + 2 + 4 + 4 + 8 + 2];
        assert_eq!(enc.drain_into(&mut buf), buf.len());
        assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), TAG_DATA);
        assert_eq!(u16::from_le_bytes([buf[2], buf[3]]), 2);
        assert_eq!(u32::from_le_bytes(buf[4..8].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(buf[8..12].try_into().unwrap()), FLAG_END_OF_PACKET);
        assert_eq!(u64::from_le_bytes(buf[12..20].try_into().unwrap()), 12_345);
        assert_eq!(&buf[20..22], &[9, 9]);
    }
}
