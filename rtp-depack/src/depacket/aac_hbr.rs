// AAC-hbr generic, RFC 3640 non-interleaved mode.

use smallvec::SmallVec;

use crate::error::{DepackError, DepackResult};
use crate::queues::{PacketFlags, ReassembledPacket};

#[derive(Debug, Clone, Copy)]
pub struct AacHbrConfig {
    pub size_length: u8,
    pub index_length: u8,
}

impl Default for AacHbrConfig {
    fn default() -> Self {
        Self {
            size_length: 13,
            index_length: 3,
        }
    }
}

struct BitReader<'a> {
    buf: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, bit_pos: 0 }
    }

    fn read(&mut self, bits: u8) -> Option<u32> {
        if bits == 0 {
            return Some(0);
        }
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
}

/// Parses the AU-header block, then slices the payload into AUs, emitting
/// one reassembled packet per AU.
pub fn process(cfg: &AacHbrConfig, payload: &[u8], ts: u32, ext_seq: u64) -> DepackResult<Vec<ReassembledPacket>> {
    if payload.len() < 2 {
        return Err(DepackError::Malformed("AAC-hbr payload too short".into()));
    }
    let au_headers_len_bits = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let au_headers_bytes = au_headers_len_bits.div_ceil(8);
    if 2 + au_headers_bytes > payload.len() {
        return Err(DepackError::Malformed("AAC-hbr AU-header block truncated".into()));
    }
    let au_header_size = cfg.size_length as usize + cfg.index_length as usize;
    if au_header_size == 0 {
        return Err(DepackError::Malformed("AAC-hbr zero-length AU header".into()));
    }
    let count = au_headers_len_bits / au_header_size;

    let mut header_reader = BitReader::new(&payload[2..2 + au_headers_bytes]);
    let mut sizes = Vec::with_capacity(count);
    for _ in 0..count {
        let size = header_reader
            .read(cfg.size_length)
            .ok_or_else(|| DepackError::Malformed("AAC-hbr AU size truncated".into()))?;
        let _index = header_reader.read(cfg.index_length);
        sizes.push(size as usize);
    }

    let mut out = Vec::with_capacity(sizes.len());
    let mut cursor = 2 + au_headers_bytes;
    for size in sizes {
        if cursor + size > payload.len() {
            return Err(DepackError::Malformed("AAC-hbr AU payload truncated".into()));
        }
        out.push(ReassembledPacket {
            ext_seq,
            ts,
            marker: false,
            flags: PacketFlags::default(),
            data: SmallVec::from_slice(&payload[cursor..cursor + size]),
        });
        cursor += size;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_au_round_trips() {
        let cfg = AacHbrConfig::default();
        let au_header_bits = 13u16 + 3;
        let mut payload = vec![];
        payload.extend_from_slice(&au_header_bits.to_be_bytes());
        // AU size = 4 (13 bits) << 3, index = 0 (3 bits) -> pack into 2 bytes.
        let size: u32 = 4;
        let packed = (size << 3) | 0;
        payload.push((packed >> 8) as u8);
        payload.push((packed & 0xff) as u8);
        payload.extend_from_slice(&[1, 2, 3, 4]);
        let out = process(&cfg, &payload, 0, 0).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(&out[0].data[..], &[1, 2, 3, 4]);
    }
}
