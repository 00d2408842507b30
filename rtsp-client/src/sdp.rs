// SDP parsing, §4.D.3. Builds one [`StreamDescriptor`] per `m=` line,
// grounded on how `net/rtsp`'s `imp.rs` walks `sdp_types::Session`
// (`.medias`, `.attributes`, `get_first_attribute_value`, `a=rtpmap`/`a=fmtp`
// string splitting) but folded into the fixed fields this core's RTP layer
// actually needs rather than a generic caps structure.

use std::collections::HashMap;

use rtp_depack::depacket::{AacHbrConfig, AmrKind, H264Config};
use rtp_depack::Depacketizer;
use url::Url;

use crate::error::{RtspError, RtspResult};

pub const MAX_STREAMS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// H.264-specific fmtp keys (§4.D.3's "H.264-specific keys" list), kept
/// as a sub-struct so other codecs' `process_fmtp` stays uncluttered.
#[derive(Debug, Clone, Default)]
pub struct H264Fmtp {
    pub sprop_parameter_sets: Option<String>,
    pub packetization_mode: u8,
    pub sprop_interleaving_depth: u32,
    pub sprop_max_don_diff: u32,
    pub sprop_init_buf_time: Option<u32>,
    pub sprop_deint_buf_req: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct Fmtp {
    pub config: Option<Vec<u8>>,
    pub mode: Option<String>,
    pub size_length: Option<u8>,
    pub index_length: Option<u8>,
    pub index_delta_length: Option<u8>,
    pub profile_level_id: Option<String>,
    pub bitrate: Option<u32>,
    pub cpresent: Option<u8>,
    pub object: Option<u32>,
    pub sbr_enabled: Option<bool>,
    pub h264: H264Fmtp,
}

#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub index: usize,
    pub kind: MediaKind,
    pub payload_type: u8,
    pub codec_name: String,
    pub clock_rate: u32,
    pub channels: u32,
    pub control_url: Url,
    pub fmtp: Fmtp,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub avg_bitrate: Option<u32>,
    pub bandwidth_as: Option<u32>,
    /// `true` for a duplicate media of a kind already seen past the
    /// first; §4.D.3: "duplicate media of the same kind past the first
    /// is marked skip".
    pub skip: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    pub duration_npt: Option<f64>,
    pub is_live: bool,
    pub asf_header: Option<Vec<u8>>,
    pub max_asf_packet_size: Option<usize>,
    pub streams: Vec<StreamDescriptor>,
}

fn resolve_control(value: &str, base: &Url) -> Option<Url> {
    if value == "*" {
        return Some(base.clone());
    }
    Url::parse(value).ok().or_else(|| base.join(value).ok())
}

fn parse_fmtp_params(params: &str, fmtp: &mut Fmtp) {
    for kv in params.split(';') {
        let kv = kv.trim();
        let Some((key, val)) = kv.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let val = val.trim();
        match key {
            "config" => fmtp.config = data_encoding::HEXLOWER_PERMISSIVE.decode(val.as_bytes()).ok(),
            "mode" => fmtp.mode = Some(val.to_string()),
            "sizelength" => fmtp.size_length = val.parse().ok(),
            "indexlength" => fmtp.index_length = val.parse().ok(),
            "indexdeltalength" => fmtp.index_delta_length = val.parse().ok(),
            "profile-level-id" => fmtp.profile_level_id = Some(val.to_string()),
            "bitrate" => fmtp.bitrate = val.parse().ok(),
            "cpresent" => fmtp.cpresent = val.parse().ok(),
            "object" => fmtp.object = val.parse().ok(),
            "sbr-enabled" => fmtp.sbr_enabled = Some(val == "1"),
            "sprop-parameter-sets" => fmtp.h264.sprop_parameter_sets = Some(val.to_string()),
            "packetization-mode" => fmtp.h264.packetization_mode = val.parse().unwrap_or(0),
            "sprop-interleaving-depth" => fmtp.h264.sprop_interleaving_depth = val.parse().unwrap_or(0),
            "sprop-max-don-diff" => fmtp.h264.sprop_max_don_diff = val.parse().unwrap_or(0),
            "sprop-init-buf-time" => fmtp.h264.sprop_init_buf_time = val.parse().ok(),
            "sprop-deint-buf-req" => fmtp.h264.sprop_deint_buf_req = val.parse().ok(),
            _ => {}
        }
    }
}

/// Decodes `a=pgmpu:data:application/vnd.ms.wms-hdr.asfv1;base64,<...>`
/// per §4.D.3, recovering the original ASF header blob.
fn decode_pgmpu(value: &str) -> Option<Vec<u8>> {
    let (_, b64) = value.rsplit_once("base64,")?;
    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, b64.trim()).ok()
}

/// Parses `a=range:npt=<start>-<end>`; `now`/`now-` marks a live session
/// with no fixed duration.
fn parse_range_npt(value: &str) -> (Option<f64>, bool) {
    let Some(npt) = value.strip_prefix("npt=") else {
        return (None, false);
    };
    if npt.starts_with("now") {
        return (None, true);
    }
    let Some((_, end)) = npt.split_once('-') else {
        return (None, false);
    };
    (end.trim().parse::<f64>().ok(), false)
}

pub fn parse_session(body: &[u8], base: &Url) -> RtspResult<SessionInfo> {
    let sdp = sdp_types::Session::parse(body).map_err(|e| RtspError::Sdp(e.to_string()))?;
    let mut info = SessionInfo::default();

    let aggregate_control = sdp
        .get_first_attribute_value("control")
        .ok()
        .flatten()
        .and_then(|v| resolve_control(v, base));

    for attr in &sdp.attributes {
        match attr.attribute.as_str() {
            "range" => {
                if let Some(value) = &attr.value {
                    let (dur, live) = parse_range_npt(value);
                    if dur.is_some() {
                        info.duration_npt = dur;
                    }
                    info.is_live |= live;
                }
            }
            "pgmpu" => {
                if let Some(value) = &attr.value {
                    info.asf_header = decode_pgmpu(value);
                }
            }
            "maxps" => {
                if let Some(value) = &attr.value {
                    info.max_asf_packet_size = value.trim().parse().ok();
                }
            }
            _ => {}
        }
    }

    let mut kinds_seen: HashMap<&'static str, usize> = HashMap::new();
    for (raw_index, media) in sdp.medias.iter().enumerate() {
        if info.streams.len() >= MAX_STREAMS {
            break;
        }
        let kind = match media.media.as_str() {
            "audio" => MediaKind::Audio,
            "video" => MediaKind::Video,
            _ => continue,
        };
        let kind_key = match kind {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        };
        let seen = kinds_seen.entry(kind_key).or_insert(0);
        let skip = *seen > 0;
        *seen += 1;

        let Ok(payload_type) = media.fmt.trim().parse::<u8>() else {
            continue;
        };

        let media_control = media
            .get_first_attribute_value("control")
            .ok()
            .flatten()
            .and_then(|v| resolve_control(v, base));
        let Some(control_url) = media_control.or_else(|| aggregate_control.clone()) else {
            continue;
        };

        let mut codec_name = String::new();
        let mut clock_rate = 0u32;
        let mut channels = 1u32;
        let mut fmtp = Fmtp::default();
        let mut width = None;
        let mut height = None;
        let mut avg_bitrate = None;
        let mut bandwidth_as = None;

        for attr in &media.attributes {
            match attr.attribute.as_str() {
                "rtpmap" => {
                    if let Some(value) = &attr.value {
                        let mut parts = value.split_whitespace();
                        let Some(pt_str) = parts.next() else { continue };
                        if pt_str.parse::<u8>() != Ok(payload_type) {
                            continue;
                        }
                        if let Some(rest) = parts.next() {
                            let mut fields = rest.split('/');
                            codec_name = fields.next().unwrap_or_default().to_ascii_uppercase();
                            clock_rate = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                            channels = fields.next().and_then(|v| v.parse().ok()).unwrap_or(1);
                        }
                    }
                }
                "fmtp" => {
                    if let Some(value) = &attr.value {
                        if let Some((pt_str, params)) = value.split_once(' ') {
                            if pt_str.trim().parse::<u8>() == Ok(payload_type) {
                                parse_fmtp_params(params, &mut fmtp);
                            }
                        }
                    }
                }
                "width" => width = attr.value.as_ref().and_then(|v| v.parse().ok()),
                "height" => height = attr.value.as_ref().and_then(|v| v.parse().ok()),
                "avgbitrate" => avg_bitrate = attr.value.as_ref().and_then(|v| v.parse().ok()),
                _ => {}
            }
        }
        for bw in &media.bandwidths {
            if bw.bwtype == "AS" {
                bandwidth_as = Some(bw.bandwidth);
            }
        }

        info.streams.push(StreamDescriptor {
            index: raw_index,
            kind,
            payload_type,
            codec_name,
            clock_rate,
            channels,
            control_url,
            fmtp,
            width,
            height,
            avg_bitrate,
            bandwidth_as,
            skip,
        });
    }

    Ok(info)
}

/// Builds the depacketizer state the codec named in SDP needs. Unknown
/// codec names fall back to MPEG-4 visual/pass-through so an unrecognized
/// stream still produces framed output instead of silently stalling.
pub fn depacketizer_for(desc: &StreamDescriptor) -> Depacketizer {
    match (desc.kind, desc.codec_name.as_str()) {
        (MediaKind::Audio, "AMR") => Depacketizer::AmrNbWb(AmrKind::Nb),
        (MediaKind::Audio, "AMR-WB") => Depacketizer::AmrNbWb(AmrKind::Wb),
        (MediaKind::Audio, "MPEG4-GENERIC") if desc.fmtp.mode.as_deref() != Some("AAC-lbr") => {
            Depacketizer::AacHbr(AacHbrConfig {
                size_length: desc.fmtp.size_length.unwrap_or(13),
                index_length: desc.fmtp.index_length.unwrap_or(3),
            })
        }
        (MediaKind::Audio, "MP4A-LATM") => Depacketizer::AacLatm(Default::default()),
        (MediaKind::Video, "H263" | "H263-1998" | "H263-2000") => Depacketizer::H263,
        (MediaKind::Video, "MP4V-ES") => Depacketizer::Mpeg4Visual,
        (MediaKind::Video, "H264") => Depacketizer::H264(Box::new(H264Config::new(
            desc.fmtp.h264.packetization_mode,
            desc.fmtp.h264.sprop_interleaving_depth,
            desc.fmtp.h264.sprop_max_don_diff,
        ))),
        (MediaKind::Video, "VC1") => Depacketizer::Vc1(Default::default()),
        _ => Depacketizer::Mpeg4Visual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_SDP: &str = "v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=stream\r\n\
c=IN IP4 127.0.0.1\r\n\
t=0 0\r\n\
a=range:npt=0-12.5\r\n\
a=control:rtsp://example.invalid/stream\r\n\
m=audio 0 RTP/AVP 97\r\n\
a=rtpmap:97 AMR/8000\r\n\
a=control:trackID=0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1;sprop-interleaving-depth=0\r\n\
a=control:trackID=1\r\n";

    #[test]
    fn parses_two_streams_with_control_and_duration() {
        let base = Url::parse("rtsp://example.invalid/stream").unwrap();
        let info = parse_session(SAMPLE_SDP.as_bytes(), &base).unwrap();
        assert_eq!(info.streams.len(), 2);
        assert_eq!(info.duration_npt, Some(12.5));
        assert!(!info.is_live);
        assert_eq!(info.streams[0].codec_name, "AMR");
        assert_eq!(info.streams[0].clock_rate, 8000);
        assert_eq!(info.streams[1].codec_name, "H264");
        assert_eq!(info.streams[1].fmtp.h264.packetization_mode, 1);
        assert_eq!(
            info.streams[1].control_url.as_str(),
            "rtsp://example.invalid/stream/trackID=1"
        );
    }

    #[test]
    fn live_range_marks_session_live() {
        let sdp = SAMPLE_SDP.replace("a=range:npt=0-12.5", "a=range:npt=now-");
        let base = Url::parse("rtsp://example.invalid/stream").unwrap();
        let info = parse_session(sdp.as_bytes(), &base).unwrap();
        assert!(info.is_live);
        assert!(info.duration_npt.is_none());
    }
}
