// RTCP parsing and RR generation, §4.D.8.

use crate::error::{DepackError, DepackResult};

const RTCP_VERSION: u8 = 2;
const PT_SR: u8 = 200;
const PT_RR: u8 = 201;
const PT_SDES: u8 = 202;
const PT_BYE: u8 = 203;
const PT_APP: u8 = 204;

#[derive(Debug, Clone, Copy)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_hi: u32,
    pub ntp_lo: u32,
    pub rtp_ts: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ReceiverReportBlock {
    pub ssrc: u32,
    pub fraction_lost: u8,
    pub cumulative_lost: u32,
    pub highest_ext_seq: u32,
    pub jitter: u32,
    pub last_sr_ntp_mid: u32,
    pub delay_since_last_sr: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdesField {
    Cname,
    Name,
    Email,
    Phone,
    Loc,
    Tool,
    Note,
    Priv,
}

#[derive(Debug, Clone)]
pub struct SdesChunk {
    pub ssrc: u32,
    pub items: Vec<(SdesField, String)>,
}

#[derive(Debug, Clone)]
pub struct AppPacket {
    pub ssrc: u32,
    pub name: [u8; 4],
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum RtcpPacket {
    Sr(SenderReport, Vec<ReceiverReportBlock>),
    Rr(Vec<ReceiverReportBlock>),
    Sdes(Vec<SdesChunk>),
    Bye { ssrcs: Vec<u32>, reason: Option<String> },
    App(AppPacket),
}

fn sdes_field_from_type(t: u8) -> Option<SdesField> {
    Some(match t {
        1 => SdesField::Cname,
        2 => SdesField::Name,
        3 => SdesField::Email,
        4 => SdesField::Phone,
        5 => SdesField::Loc,
        6 => SdesField::Tool,
        7 => SdesField::Note,
        8 => SdesField::Priv,
        _ => return None,
    })
}

fn parse_rr_blocks(buf: &[u8], count: usize) -> DepackResult<Vec<ReceiverReportBlock>> {
    let mut out = Vec::with_capacity(count);
    let mut off = 0;
    for _ in 0..count {
        if off + 24 > buf.len() {
            return Err(DepackError::Malformed("truncated RR block".into()));
        }
        let ssrc = u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        let fraction_lost = buf[off + 4];
        let cumulative_lost = u32::from_be_bytes([0, buf[off + 5], buf[off + 6], buf[off + 7]]);
        let highest_ext_seq = u32::from_be_bytes(buf[off + 8..off + 12].try_into().unwrap());
        let jitter = u32::from_be_bytes(buf[off + 12..off + 16].try_into().unwrap());
        let last_sr_ntp_mid = u32::from_be_bytes(buf[off + 16..off + 20].try_into().unwrap());
        let delay_since_last_sr = u32::from_be_bytes(buf[off + 20..off + 24].try_into().unwrap());
        out.push(ReceiverReportBlock {
            ssrc,
            fraction_lost,
            cumulative_lost,
            highest_ext_seq,
            jitter,
            last_sr_ntp_mid,
            delay_since_last_sr,
        });
        off += 24;
    }
    Ok(out)
}

/// Parses one or more compound RTCP packets from `buf`.
pub fn parse_rtcp(mut buf: &[u8]) -> DepackResult<Vec<RtcpPacket>> {
    let mut packets = Vec::new();
    while buf.len() >= 4 {
        let version = buf[0] >> 6;
        if version != RTCP_VERSION {
            return Err(DepackError::Malformed("bad RTCP version".into()));
        }
        let rc = (buf[0] & 0x1f) as usize;
        let pt = buf[1];
        let length_words = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        let total_len = (length_words + 1) * 4;
        if total_len > buf.len() {
            return Err(DepackError::Malformed("truncated RTCP packet".into()));
        }
        let body = &buf[4..total_len];

        match pt {
            PT_SR => {
                if body.len() < 20 {
                    return Err(DepackError::Malformed("truncated SR".into()));
                }
                let sr = SenderReport {
                    ssrc: u32::from_be_bytes(body[0..4].try_into().unwrap()),
                    ntp_hi: u32::from_be_bytes(body[4..8].try_into().unwrap()),
                    ntp_lo: u32::from_be_bytes(body[8..12].try_into().unwrap()),
                    rtp_ts: u32::from_be_bytes(body[12..16].try_into().unwrap()),
                    packet_count: u32::from_be_bytes(body[16..20].try_into().unwrap()),
                    octet_count: u32::from_be_bytes(body[20..24].try_into().unwrap()),
                };
                let blocks = parse_rr_blocks(&body[24..], rc)?;
                packets.push(RtcpPacket::Sr(sr, blocks));
            }
            PT_RR => {
                if body.len() < 4 {
                    return Err(DepackError::Malformed("truncated RR".into()));
                }
                let blocks = parse_rr_blocks(&body[4..], rc)?;
                packets.push(RtcpPacket::Rr(blocks));
            }
            PT_SDES => {
                let mut chunks = Vec::with_capacity(rc);
                let mut off = 0;
                for _ in 0..rc {
                    if off + 4 > body.len() {
                        break;
                    }
                    let ssrc = u32::from_be_bytes(body[off..off + 4].try_into().unwrap());
                    off += 4;
                    let mut items = Vec::new();
                    loop {
                        if off >= body.len() || body[off] == 0 {
                            off += 1;
                            break;
                        }
                        if off + 2 > body.len() {
                            break;
                        }
                        let item_type = body[off];
                        let item_len = body[off + 1] as usize;
                        let Some(text_bytes) = body.get(off + 2..off + 2 + item_len) else {
                            break;
                        };
                        let text = String::from_utf8_lossy(text_bytes).into_owned();
                        if let Some(field) = sdes_field_from_type(item_type) {
                            items.push((field, text));
                        }
                        off += 2 + item_len;
                    }
                    off = off.div_ceil(4) * 4;
                    chunks.push(SdesChunk { ssrc, items });
                }
                packets.push(RtcpPacket::Sdes(chunks));
            }
            PT_BYE => {
                let mut ssrcs = Vec::with_capacity(rc);
                let mut off = 0;
                for _ in 0..rc {
                    if off + 4 > body.len() {
                        break;
                    }
                    ssrcs.push(u32::from_be_bytes(body[off..off + 4].try_into().unwrap()));
                    off += 4;
                }
                let reason = if off < body.len() {
                    let len = body[off] as usize;
                    body.get(off + 1..off + 1 + len)
                        .map(|s| String::from_utf8_lossy(s).into_owned())
                } else {
                    None
                };
                packets.push(RtcpPacket::Bye { ssrcs, reason });
            }
            PT_APP => {
                if body.len() < 8 {
                    return Err(DepackError::Malformed("truncated APP".into()));
                }
                let ssrc = u32::from_be_bytes(body[0..4].try_into().unwrap());
                let name = [body[4], body[5], body[6], body[7]];
                packets.push(RtcpPacket::App(AppPacket {
                    ssrc,
                    name,
                    data: body[8..].to_vec(),
                }));
            }
            _ => {}
        }
        buf = &buf[total_len..];
    }
    Ok(packets)
}

/// Builds one compound RR packet: "V=2, RC=1, PT=201, length=7 words, one
/// report block per stream" (§4.D.8), one RR packet per call covering all
/// streams passed in (RC is clamped to 31 per the 5-bit field; a session
/// with more streams than that is out of scope).
pub fn build_receiver_report(blocks: &[ReceiverReportBlock]) -> Vec<u8> {
    let rc = blocks.len().min(31);
    let length_words = 1 + rc * 6; // 1 header word + 6 words per block
    let mut out = Vec::with_capacity((length_words + 1) * 4);
    out.push((RTCP_VERSION << 6) | rc as u8);
    out.push(PT_RR);
    out.extend_from_slice(&(length_words as u16).to_be_bytes());
    out.extend_from_slice(&0u32.to_be_bytes()); // sender SSRC, filled by caller if needed
    for b in blocks.iter().take(rc) {
        out.extend_from_slice(&b.ssrc.to_be_bytes());
        out.push(0); // fraction-lost = 0 per §4.D.8
        out.extend_from_slice(&[0, 0, 0]); // cumulative-lost = 0
        out.extend_from_slice(&b.highest_ext_seq.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes()); // jitter = 0
        out.extend_from_slice(&b.last_sr_ntp_mid.to_be_bytes());
        out.extend_from_slice(&0u32.to_be_bytes()); // DLSR = 0
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_receiver_report() {
        let blocks = vec![ReceiverReportBlock {
            ssrc: 0x1234,
            fraction_lost: 0,
            cumulative_lost: 0,
            highest_ext_seq: 999,
            jitter: 0,
            last_sr_ntp_mid: 0xabcd,
            delay_since_last_sr: 0,
        }];
        let bytes = build_receiver_report(&blocks);
        let parsed = parse_rtcp(&bytes).unwrap();
        match &parsed[0] {
            RtcpPacket::Rr(got) => {
                assert_eq!(got.len(), 1);
                assert_eq!(got[0].ssrc, 0x1234);
                assert_eq!(got[0].highest_ext_seq, 999);
            }
            other => panic!("expected RR, got {other:?}"),
        }
    }

    #[test]
    fn parses_bye() {
        let mut buf = vec![(RTCP_VERSION << 6) | 1, PT_BYE, 0, 1];
        buf.extend_from_slice(&42u32.to_be_bytes());
        let parsed = parse_rtcp(&buf).unwrap();
        match &parsed[0] {
            RtcpPacket::Bye { ssrcs, .. } => assert_eq!(ssrcs, &[42]),
            other => panic!("expected BYE, got {other:?}"),
        }
    }
}
