// Per-stream RTP state, §3 "RTP stream" and §4.D.4-4.D.6.

use std::net::SocketAddr;

use tokio::net::UdpSocket;

use rtp_depack::{
    parse_rtp_header, Depacketizer, PacketFlags, RawQueue, ReassembledPacket, ReorderList,
    SdesField as RtcpSdesField, SenderReport, SequenceTracker, RAW_QUEUE_THRESHOLD_AAC,
    RAW_QUEUE_THRESHOLD_AMR, RAW_QUEUE_THRESHOLD_DEFAULT,
};

use crate::sdp::{MediaKind, StreamDescriptor};

/// §4.D.6: "each stream must have >= 20 reassembled packets before normal
/// service", and skip a stream below this depth to keep AV alignment.
pub const INITIAL_BUFFERING_DEPTH: usize = 20;
pub const AV_ALIGN_MIN_DEPTH: usize = 5;

fn raw_queue_threshold(codec_name: &str) -> usize {
    match codec_name {
        "AMR" | "AMR-WB" => RAW_QUEUE_THRESHOLD_AMR,
        "MPEG4-GENERIC" | "MP4A-LATM" => RAW_QUEUE_THRESHOLD_AAC,
        _ => RAW_QUEUE_THRESHOLD_DEFAULT,
    }
}

#[derive(Debug, Clone, Default)]
pub struct SdesSlots {
    pub cname: Option<String>,
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub loc: Option<String>,
    pub tool: Option<String>,
    pub note: Option<String>,
    pub private: Option<String>,
}

impl SdesSlots {
    pub fn set(&mut self, field: RtcpSdesField, value: String) {
        match field {
            RtcpSdesField::Cname => self.cname = Some(value),
            RtcpSdesField::Name => self.name = Some(value),
            RtcpSdesField::Email => self.email = Some(value),
            RtcpSdesField::Phone => self.phone = Some(value),
            RtcpSdesField::Loc => self.loc = Some(value),
            RtcpSdesField::Tool => self.tool = Some(value),
            RtcpSdesField::Note => self.note = Some(value),
            RtcpSdesField::Priv => self.private = Some(value),
        }
    }
}

pub struct RtpStream {
    pub index: u16,
    pub kind: MediaKind,
    pub codec_name: String,
    pub clock_rate: u32,
    pub channels: u32,
    pub payload_type: u8,
    pub control_url: url::Url,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub avg_bitrate: Option<u32>,

    pub local_rtp_port: u16,
    pub local_rtcp_port: u16,
    pub remote_rtcp_addr: Option<SocketAddr>,
    pub rtp_socket: UdpSocket,
    pub rtcp_socket: UdpSocket,

    pub tracker: SequenceTracker,
    pub raw_queue: RawQueue,
    pub raw_queue_threshold: usize,
    pub reorder: ReorderList,
    pub depack: Depacketizer,

    /// Set once from `RTP-Info` after PLAY, per §4.D.2. Packets that
    /// arrive before this sequence are dropped per §4.D.6.
    pub first_seq: Option<u16>,
    pub first_ts: Option<u32>,
    pub last_seq: Option<u64>,
    pub ts_offset: i64,
    pub reset_ts: bool,

    pub lost_packets: u64,
    pub socket_errors: u32,
    pub is_at_eos: bool,

    pub last_sr: Option<SenderReport>,
    pub sdes: SdesSlots,
    pub app_data: Option<(u32, Vec<u8>)>,

    pub delivered_ts: u64,
}

impl RtpStream {
    pub fn new(
        index: u16,
        desc: &StreamDescriptor,
        depack: Depacketizer,
        local_rtp_port: u16,
        local_rtcp_port: u16,
        rtp_socket: UdpSocket,
        rtcp_socket: UdpSocket,
    ) -> Self {
        Self {
            index,
            kind: desc.kind,
            codec_name: desc.codec_name.clone(),
            clock_rate: desc.clock_rate.max(1),
            channels: desc.channels,
            payload_type: desc.payload_type,
            control_url: desc.control_url.clone(),
            width: desc.width,
            height: desc.height,
            avg_bitrate: desc.avg_bitrate,
            local_rtp_port,
            local_rtcp_port,
            remote_rtcp_addr: None,
            rtp_socket,
            rtcp_socket,
            tracker: SequenceTracker::default(),
            raw_queue: RawQueue::new(raw_queue_threshold(&desc.codec_name)),
            raw_queue_threshold: raw_queue_threshold(&desc.codec_name),
            reorder: ReorderList::new(false),
            depack,
            first_seq: None,
            first_ts: None,
            last_seq: None,
            ts_offset: 0,
            reset_ts: false,
            lost_packets: 0,
            socket_errors: 0,
            is_at_eos: false,
            last_sr: None,
            sdes: SdesSlots::default(),
            app_data: None,
            delivered_ts: 0,
        }
    }

    /// §4.D.4: parses, extends the sequence, and queues a raw packet;
    /// drains into the reorder list once the per-codec threshold is hit.
    /// Reassembled packets stay in `self.reorder` — §4.D.6's `GetNextPacket`
    /// dequeue discipline (initial buffering + AV-alignment alternation),
    /// not arrival order, decides when they leave the queue; see
    /// `RtspSession::dispatch_ready_packets`.
    pub fn on_rtp_datagram(&mut self, datagram: &[u8]) {
        let Some(packet) = parse_rtp_header(datagram) else {
            return;
        };
        if packet.payload_type != self.payload_type {
            return;
        }
        let ext_seq = self.tracker.extend(packet.seq);
        self.raw_queue.insert(ext_seq, packet);

        while self.raw_queue.should_drain() {
            let Some((drained_seq, raw, gap)) = self.raw_queue.drain_one() else {
                break;
            };
            if gap {
                self.lost_packets += 1;
            }
            if let Ok(reassembled) = self.depack.process(&raw.payload, raw.ts, drained_seq, raw.marker) {
                for packet in reassembled {
                    self.reorder.insert_in_order(packet);
                }
            }
        }
    }

    /// Pops the single next packet ready for delivery, per the dequeue
    /// discipline the session applies via `reorder_depth`.
    pub fn pop_ready(&mut self) -> Option<ReassembledPacket> {
        self.reorder.pop_front()
    }

    /// Flushes remaining raw packets at EOS/teardown, per §4.D.4 "drained
    /// ... or at EOS".
    pub fn flush(&mut self) -> Vec<ReassembledPacket> {
        let mut out = Vec::new();
        for (drained_seq, raw, gap) in self.raw_queue.drain_all() {
            if gap {
                self.lost_packets += 1;
            }
            if let Ok(reassembled) = self.depack.process(&raw.payload, raw.ts, drained_seq, raw.marker) {
                for packet in reassembled {
                    self.reorder.insert_in_order(packet);
                }
            }
        }
        while let Some(packet) = self.reorder.pop_front() {
            out.push(packet);
        }
        out
    }

    pub fn reorder_depth(&self) -> usize {
        self.reorder.len()
    }

    /// §4.D.6: adjusts a reassembled packet's timestamp by `serverts +
    /// TSOffset` and drops it if it arrived before the negotiated
    /// `firstseq`.
    pub fn adjust_and_gate(&mut self, packet: &ReassembledPacket) -> Option<(u32, PacketFlags)> {
        if let Some(first) = self.first_seq {
            if (packet.ext_seq as u16) < first && !self.reset_ts {
                return None;
            }
        }
        let adjusted_ts = (packet.ts as i64 + self.ts_offset).max(0) as u32;
        let mut flags = packet.flags;
        if let Some(last) = self.last_seq {
            if packet.ext_seq != last.wrapping_add(1) {
                flags.skip = true;
            }
        }
        self.last_seq = Some(packet.ext_seq);
        self.delivered_ts = adjusted_ts as u64;
        Some((adjusted_ts, flags))
    }

    /// §4.D.7: resets per-stream sequencing state for a fresh PLAY/seek,
    /// preserving codec config already negotiated via SDP/fmtp.
    pub fn reset_for_seek(&mut self, new_ts_offset: i64) {
        self.first_seq = None;
        self.first_ts = None;
        self.last_seq = None;
        self.ts_offset = new_ts_offset;
        self.reset_ts = true;
        self.tracker = SequenceTracker::default();
        self.raw_queue = RawQueue::new(self.raw_queue_threshold);
        self.reorder = ReorderList::new(false);
        self.is_at_eos = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtp_depack::AmrKind;
    use url::Url;

    fn descriptor() -> StreamDescriptor {
        StreamDescriptor {
            index: 0,
            kind: MediaKind::Audio,
            payload_type: 97,
            codec_name: "AMR".to_string(),
            clock_rate: 8000,
            channels: 1,
            control_url: Url::parse("rtsp://example.invalid/stream/trackID=0").unwrap(),
            fmtp: Default::default(),
            width: None,
            height: None,
            avg_bitrate: None,
            bandwidth_as: None,
            skip: false,
        }
    }

    async fn bound_pair() -> (UdpSocket, UdpSocket) {
        (
            UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        )
    }

    #[tokio::test]
    async fn amr_stream_uses_the_amr_raw_queue_threshold() {
        let desc = descriptor();
        let (rtp, rtcp) = bound_pair().await;
        let stream = RtpStream::new(0, &desc, Depacketizer::AmrNbWb(AmrKind::Nb), 7000, 7001, rtp, rtcp);
        assert_eq!(stream.raw_queue_threshold, RAW_QUEUE_THRESHOLD_AMR);
    }

    #[tokio::test]
    async fn packet_before_first_seq_is_gated_out() {
        let desc = descriptor();
        let (rtp, rtcp) = bound_pair().await;
        let mut stream = RtpStream::new(0, &desc, Depacketizer::AmrNbWb(AmrKind::Nb), 7000, 7001, rtp, rtcp);
        stream.first_seq = Some(100);
        let pkt = ReassembledPacket {
            ext_seq: 50,
            ts: 0,
            marker: true,
            flags: PacketFlags::default(),
            data: Default::default(),
        };
        assert!(stream.adjust_and_gate(&pkt).is_none());
    }
}
