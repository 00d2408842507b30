// RTSP control-plane state machine (§4.D.1/4.D.2/4.D.7) plus the RTP/RTCP
// receive loop (§4.D.4/4.D.8). Grounded on how `net/rtsp`'s `imp.rs` drives
// `rtsp_types` (`Request::builder`, `typed_header::<CSeq>`, `Session`,
// `Transports`) and on `moonshine`'s raw `Message::parse` read loop (no
// framed-codec crate available here, so responses are accumulated into a
// growable buffer and reparsed until complete).

use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use rtsp_types::headers::{
    self, CSeq, NptRange, NptTime, Public, Range, RtpLowerTransport, RtpProfile, RtpTransport,
    RtpTransportParameters, Session as SessionHeader, Transport, TransportMode, Transports,
};
use rtsp_types::{Message, Method, Request, Response, StatusCode, Version};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;
use url::Url;

use crate::config::RtspConfig;
use crate::error::{RtspError, RtspResult};
use crate::nem::{NemEncoder, NemMode, StreamFormat};
use crate::sdp::{self, SessionInfo};
use crate::stream::RtpStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    Paused,
    Playing,
    Closed,
}

/// Binds a UDP socket on a random even port within the configured range,
/// §4.D.1: "random even port in [7000, 7998], 1000 attempts before
/// failing".
async fn bind_even_port(cfg: &RtspConfig) -> RtspResult<(UdpSocket, u16)> {
    let span = (cfg.port_range_high - cfg.port_range_low) / 2;
    for _ in 0..cfg.port_alloc_attempts {
        let offset: u16 = rand::rng().random_range(0..=span);
        let port = cfg.port_range_low + offset * 2;
        if let Ok(sock) = UdpSocket::bind(("0.0.0.0", port)).await {
            return Ok((sock, port));
        }
    }
    Err(RtspError::NoPortAvailable)
}

async fn read_message(stream: &mut TcpStream, timeout: Duration) -> RtspResult<Message<Vec<u8>>> {
    let mut buf = Vec::new();
    let deadline = Instant::now() + timeout;
    loop {
        match Message::parse(&buf) {
            Ok((message, _consumed)) => return Ok(message),
            Err(rtsp_types::ParseError::Incomplete(_)) => {}
            Err(e) => return Err(RtspError::Framing(e.to_string())),
        }
        let mut chunk = [0u8; 4096];
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(RtspError::Timeout);
        }
        let n = tokio::time::timeout(remaining, stream.read(&mut chunk))
            .await
            .map_err(|_| RtspError::Timeout)?
            .map_err(RtspError::Io)?;
        if n == 0 {
            return Err(RtspError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "RTSP control connection closed",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn response_or_err(message: Message<Vec<u8>>) -> RtspResult<Response<Vec<u8>>> {
    match message {
        Message::Response(rsp) => Ok(rsp),
        _ => Err(RtspError::Framing("expected RTSP response".into())),
    }
}

pub struct RtspSession {
    cfg: RtspConfig,
    url: Url,
    control: TcpStream,
    cseq: u32,
    session_id: Option<String>,
    aggregate_control: Url,
    redirects_followed: u32,
    pub state: SessionState,
    pub streams: Vec<RtpStream>,
    pub info: SessionInfo,
    pub nem: NemEncoder,
    pub got_bye: bool,
    pub last_rr_at: Instant,
    pub last_keepalive_at: Instant,
    /// §4.D.2: the NPT start time the server actually granted on the last
    /// PLAY-with-`Range`, exposed as `ConfigKey::ActualSeekTime`.
    pub actual_seek_secs: Option<f64>,
    /// §4.D.6 `GetNextPacket` dequeue state: whether every stream has
    /// cleared the initial-buffering depth yet, and which stream was last
    /// served (for round-robin alternation).
    dequeue_bootstrapped: bool,
    last_served: Option<usize>,
}

impl RtspSession {
    /// Connects and runs DESCRIBE + SETUP for every SDP stream, up to the
    /// configured redirect budget.
    pub async fn open(url: Url, cfg: RtspConfig) -> RtspResult<Self> {
        let mut current = url.clone();
        let mut redirects = 0u32;
        loop {
            let host = current
                .host_str()
                .ok_or_else(|| RtspError::BadState("RTSP URL has no host".into()))?
                .to_string();
            let port = current.port().unwrap_or(554);
            let control = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(RtspError::Io)?;

            let mut session = Self {
                cfg: cfg.clone(),
                url: current.clone(),
                control,
                cseq: 0,
                session_id: None,
                aggregate_control: current.clone(),
                redirects_followed: redirects,
                state: SessionState::Ready,
                streams: Vec::new(),
                info: SessionInfo::default(),
                nem: NemEncoder::new(NemMode::Framed),
                got_bye: false,
                last_rr_at: Instant::now(),
                last_keepalive_at: Instant::now(),
                actual_seek_secs: None,
                dequeue_bootstrapped: false,
                last_served: None,
            };

            match session.describe().await {
                Ok(Some(redirect_url)) => {
                    redirects += 1;
                    if redirects > cfg.redirect_limit {
                        return Err(RtspError::TooManyRedirects(cfg.redirect_limit));
                    }
                    current = redirect_url;
                    continue;
                }
                Ok(None) => {
                    session.setup_all().await?;
                    return Ok(session);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn next_cseq(&mut self) -> u32 {
        self.cseq += 1;
        self.cseq
    }

    async fn roundtrip(&mut self, request: Request<Vec<u8>>) -> RtspResult<Response<Vec<u8>>> {
        let mut buf = Vec::new();
        request
            .write(&mut buf)
            .map_err(|e| RtspError::Framing(e.to_string()))?;
        self.control.write_all(&buf).await.map_err(RtspError::Io)?;
        let timeout = Duration::from_secs(self.cfg.control_read_timeout_secs);
        let message = read_message(&mut self.control, timeout).await?;
        response_or_err(message)
    }

    fn check_status(&self, method: &'static str, rsp: &Response<Vec<u8>>) -> RtspResult<()> {
        if rsp.status() != StatusCode::Ok {
            return Err(RtspError::Status {
                method,
                status: rsp.status().into(),
                reason: rsp.reason_phrase().to_string(),
            });
        }
        Ok(())
    }

    /// §4.D.1: "4xx/5xx are fatal", 3xx handled by the caller via a
    /// redirect URL.
    fn redirect_target(rsp: &Response<Vec<u8>>) -> Option<Url> {
        let status: u16 = rsp.status().into();
        if !(300..400).contains(&status) {
            return None;
        }
        rsp.header(&headers::LOCATION)
            .and_then(|v| Url::parse(v.as_str()).ok())
    }

    pub async fn options(&mut self) -> RtspResult<Vec<Method>> {
        let cseq = self.next_cseq();
        let req = Request::builder(Method::Options, Version::V1_0)
            .typed_header::<CSeq>(&cseq.into())
            .header(headers::USER_AGENT, self.cfg.user_agent.clone())
            .request_uri(self.url.clone())
            .build(Vec::new());
        let rsp = self.roundtrip(req).await?;
        self.check_status("OPTIONS", &rsp)?;
        Ok(rsp
            .typed_header::<Public>()
            .ok()
            .flatten()
            .map(|p| p.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn describe(&mut self) -> RtspResult<Option<Url>> {
        let cseq = self.next_cseq();
        let req = Request::builder(Method::Describe, Version::V1_0)
            .typed_header::<CSeq>(&cseq.into())
            .header(headers::USER_AGENT, self.cfg.user_agent.clone())
            .header(headers::ACCEPT, "application/sdp")
            .request_uri(self.url.clone())
            .build(Vec::new());
        let rsp = self.roundtrip(req).await?;
        if let Some(redirect) = Self::redirect_target(&rsp) {
            return Ok(Some(redirect));
        }
        self.check_status("DESCRIBE", &rsp)?;

        if let Some(base) = rsp.header(&headers::CONTENT_BASE).or_else(|| rsp.header(&headers::CONTENT_LOCATION)) {
            if let Ok(url) = Url::parse(base.as_str()) {
                self.aggregate_control = url;
            }
        }

        let info = sdp::parse_session(rsp.body(), &self.aggregate_control)?;
        self.nem = NemEncoder::new(if info.asf_header.is_some() {
            NemMode::Asf
        } else {
            NemMode::Framed
        });
        self.info = info;
        Ok(None)
    }

    async fn setup_all(&mut self) -> RtspResult<()> {
        if self.info.streams.len() > sdp::MAX_STREAMS {
            return Err(RtspError::TooManyStreams);
        }
        let descriptors = self.info.streams.clone();
        for (index, desc) in descriptors.iter().enumerate() {
            if desc.skip {
                continue;
            }
            let (rtp_sock, rtp_port) = bind_even_port(&self.cfg).await?;
            let (rtcp_sock, rtcp_port) = bind_even_port(&self.cfg).await?;

            let params = RtpTransportParameters {
                mode: vec![TransportMode::Play],
                unicast: true,
                client_port: Some((rtp_port, Some(rtcp_port))),
                ..Default::default()
            };
            let transports: Transports = [Transport::Rtp(RtpTransport {
                profile: RtpProfile::Avp,
                lower_transport: Some(RtpLowerTransport::Udp),
                params,
            })]
            .as_slice()
            .into();

            let cseq = self.next_cseq();
            let mut builder = Request::builder(Method::Setup, Version::V1_0)
                .typed_header::<CSeq>(&cseq.into())
                .header(headers::USER_AGENT, self.cfg.user_agent.clone())
                .typed_header::<Transports>(&transports)
                .request_uri(desc.control_url.clone());
            if let Some(sid) = &self.session_id {
                builder = builder.typed_header::<SessionHeader>(&SessionHeader(sid.clone(), None));
            }
            let rsp = self.roundtrip(builder.build(Vec::new())).await?;
            self.check_status("SETUP", &rsp)?;

            if self.session_id.is_none() {
                if let Some(session_hdr) = rsp.typed_header::<SessionHeader>().ok().flatten() {
                    self.session_id = Some(session_hdr.0);
                }
            }

            if let Some(remote) = rsp
                .typed_header::<Transports>()
                .ok()
                .flatten()
                .and_then(|t| t.iter().next().cloned())
            {
                if let Transport::Rtp(rtp_transport) = remote {
                    if let Some((server_port, _)) = rtp_transport.params.server_port {
                        let host = desc
                            .control_url
                            .host_str()
                            .unwrap_or("0.0.0.0")
                            .to_string();
                        if let Ok(addr) = format!("{host}:{server_port}").parse::<SocketAddr>() {
                            let _ = rtp_sock.connect(addr).await;
                        }
                    }
                }
            }

            let depack = sdp::depacketizer_for(desc);
            let stream = RtpStream::new(index as u16, desc, depack, rtp_port, rtcp_port, rtp_sock, rtcp_sock);
            self.streams.push(stream);
        }
        self.state = SessionState::Ready;
        Ok(())
    }

    fn build_npt_range(seconds: Option<f64>) -> Range {
        match seconds {
            Some(s) => {
                let whole = s.trunc() as u32;
                let frac = ((s.fract()) * 1000.0).round() as u32;
                Range::Npt(NptRange::From(NptTime::Seconds(
                    whole as u64,
                    if frac > 0 { Some(frac) } else { None },
                )))
            }
            None => Range::Npt(NptRange::From(NptTime::Now)),
        }
    }

    /// §4.D.7 `RTSPPlayFrom(ts)`: pauses if playing, clears per-stream
    /// state, and issues PLAY with an NPT range.
    pub async fn play_from(&mut self, seconds: Option<f64>) -> RtspResult<()> {
        if self.state == SessionState::Playing {
            self.pause().await?;
        }
        for stream in &mut self.streams {
            stream.reset_for_seek(0);
        }
        self.got_bye = false;
        self.dequeue_bootstrapped = false;
        self.last_served = None;

        let range = Self::build_npt_range(seconds);
        let cseq = self.next_cseq();
        let session_id = self
            .session_id
            .clone()
            .ok_or_else(|| RtspError::BadState("PLAY before SETUP".into()))?;
        let req = Request::builder(Method::Play, Version::V1_0)
            .typed_header::<CSeq>(&cseq.into())
            .header(headers::USER_AGENT, self.cfg.user_agent.clone())
            .typed_header::<Range>(&range)
            .typed_header::<SessionHeader>(&SessionHeader(session_id, None))
            .request_uri(self.aggregate_control.clone())
            .build(Vec::new());
        let rsp = self.roundtrip(req).await?;
        self.check_status("PLAY", &rsp)?;
        self.state = SessionState::Playing;
        if let Some(requested) = seconds {
            self.actual_seek_secs = rsp
                .typed_header::<Range>()
                .ok()
                .flatten()
                .and_then(|r| Self::npt_seconds(&r))
                .or(Some(requested));
        }
        Ok(())
    }

    /// Extracts a concrete NPT start time in seconds from a `Range`
    /// header, the "actual seek time" the server granted back on a PLAY
    /// response (§4.D.2, §4.E.7 `ActualSeekTime`). Only the `npt=<secs>-`
    /// form this client ever sends (see `build_npt_range`) is recognized;
    /// any other form falls back to the caller's requested value.
    fn npt_seconds(range: &Range) -> Option<f64> {
        if let Range::Npt(NptRange::From(NptTime::Seconds(whole, frac))) = range {
            Some(*whole as f64 + frac.unwrap_or(0) as f64 / 1000.0)
        } else {
            None
        }
    }

    pub async fn pause(&mut self) -> RtspResult<()> {
        let cseq = self.next_cseq();
        let session_id = self
            .session_id
            .clone()
            .ok_or_else(|| RtspError::BadState("PAUSE before SETUP".into()))?;
        let req = Request::builder(Method::Pause, Version::V1_0)
            .typed_header::<CSeq>(&cseq.into())
            .header(headers::USER_AGENT, self.cfg.user_agent.clone())
            .typed_header::<SessionHeader>(&SessionHeader(session_id, None))
            .request_uri(self.aggregate_control.clone())
            .build(Vec::new());
        let rsp = self.roundtrip(req).await?;
        self.check_status("PAUSE", &rsp)?;
        self.state = SessionState::Paused;
        Ok(())
    }

    pub async fn teardown(&mut self) -> RtspResult<()> {
        let Some(session_id) = self.session_id.clone() else {
            return Ok(());
        };
        let cseq = self.next_cseq();
        let req = Request::builder(Method::Teardown, Version::V1_0)
            .typed_header::<CSeq>(&cseq.into())
            .header(headers::USER_AGENT, self.cfg.user_agent.clone())
            .typed_header::<SessionHeader>(&SessionHeader(session_id, None))
            .request_uri(self.aggregate_control.clone())
            .build(Vec::new());
        let _ = self.roundtrip(req).await;
        self.state = SessionState::Closed;
        Ok(())
    }

    pub fn stream_formats(&self) -> Vec<StreamFormat> {
        use crate::nem::{AudioFormat, VideoFormat};
        use crate::sdp::MediaKind;

        self.streams
            .iter()
            .map(|s| match s.kind {
                MediaKind::Audio => StreamFormat::Audio(AudioFormat {
                    codec_tag: codec_tag(&s.codec_name),
                    duration_100ns: 0,
                    sample_rate: s.clock_rate,
                    bit_rate: s.avg_bitrate.unwrap_or(0),
                    channels: s.channels,
                    bits_per_sample: 16,
                }),
                MediaKind::Video => StreamFormat::Video(VideoFormat {
                    codec_tag: codec_tag(&s.codec_name),
                    duration_100ns: 0,
                    width: s.width.unwrap_or(0),
                    height: s.height.unwrap_or(0),
                    fps_q16: 0,
                    bit_rate: s.avg_bitrate.unwrap_or(0),
                }),
            })
            .collect()
    }
}

/// Stable small integer per codec name for the NEM `codec` field; an
/// internal tag, not a registered fourCC.
fn codec_tag(name: &str) -> u32 {
    let mut tag = 0u32;
    for b in name.as_bytes().iter().take(4) {
        tag = (tag << 8) | *b as u32;
    }
    tag
}

impl RtspSession {
    /// §4.D.7: "during playback, if ... the receive thread tears down and
    /// re-establishes the session ... Reconnect attempts are capped at 3
    /// before giving up." Re-seeking to the last delivered timestamp is
    /// left to the caller, which knows each stream's `delivered_ts`.
    pub async fn reconnect(&mut self) -> RtspResult<()> {
        let _ = self.teardown().await;
        for _ in 0..self.cfg.reconnect_attempts {
            if let Ok(fresh) = RtspSession::open(self.url.clone(), self.cfg.clone()).await {
                *self = fresh;
                return Ok(());
            }
        }
        Err(RtspError::ReconnectExhausted(self.cfg.reconnect_attempts))
    }

    /// §4.D.1: "one RTP receive thread per session multiplexes all stream
    /// sockets via `select` with a 1-second budget". `tokio::select!` over
    /// every stream's RTP and RTCP sockets plays the same role; ties are
    /// broken by `select!`'s own pseudo-random branch choice, matching the
    /// "no interleaving guarantee" note in §5.
    pub async fn receive_tick(&mut self) -> RtspResult<()> {
        if self.streams.is_empty() {
            tokio::time::sleep(Duration::from_secs(self.cfg.receive_select_timeout_secs)).await;
            return Ok(());
        }
        let mut rtp_bufs = vec![[0u8; 2048]; self.streams.len()];
        let mut rtcp_bufs = vec![[0u8; 2048]; self.streams.len()];

        let timeout = Duration::from_secs(self.cfg.receive_select_timeout_secs);
        let outcome = tokio::time::timeout(
            timeout,
            futures_select(&mut self.streams, &mut rtp_bufs, &mut rtcp_bufs),
        )
        .await;

        let Ok((index, is_rtcp, result)) = outcome else {
            return Ok(());
        };
        let n = match result {
            Ok(n) => n,
            Err(_) => {
                self.streams[index].socket_errors += 1;
                return Ok(());
            }
        };
        if is_rtcp {
            self.handle_rtcp(index, &rtcp_bufs[index][..n]);
        } else {
            self.streams[index].on_rtp_datagram(&rtp_bufs[index][..n]);
            self.dispatch_ready_packets();
        }
        self.maybe_send_periodic().await;
        Ok(())
    }

    /// Drains reassembled packets into NEM following §4.D.6's
    /// `GetNextPacket` discipline (`next_packet_stream`) rather than the
    /// arrival order datagrams happened to land in.
    fn dispatch_ready_packets(&mut self) {
        while let Some(index) = self.next_packet_stream() {
            let Some(packet) = self.streams[index].pop_ready() else {
                break;
            };
            let Some((ts, flags)) = self.streams[index].adjust_and_gate(&packet) else {
                continue;
            };
            let ts_100ns = (ts as u64).saturating_mul(10_000_000) / self.streams[index].clock_rate as u64;
            let mut wire_flags = 0u32;
            if flags.end_of_packet {
                wire_flags |= crate::nem::FLAG_END_OF_PACKET;
            }
            if flags.skip {
                wire_flags |= crate::nem::FLAG_SKIP_PACKET;
            }
            self.nem
                .emit_packet(self.streams[index].index, &packet.data, wire_flags, ts_100ns);
        }
    }

    fn handle_rtcp(&mut self, index: usize, datagram: &[u8]) {
        let Ok(packets) = rtp_depack::parse_rtcp(datagram) else {
            return;
        };
        let stream = &mut self.streams[index];
        for packet in packets {
            match packet {
                rtp_depack::RtcpPacket::Sr(sr, _) => stream.last_sr = Some(sr),
                rtp_depack::RtcpPacket::Sdes(chunks) => {
                    for chunk in chunks {
                        for (field, value) in chunk.items {
                            stream.sdes.set(field, value);
                        }
                    }
                }
                rtp_depack::RtcpPacket::Bye { .. } => {
                    stream.is_at_eos = true;
                    self.got_bye = true;
                }
                rtp_depack::RtcpPacket::App(app) => {
                    stream.app_data = Some((u32::from_be_bytes(app.name), app.data));
                }
                rtp_depack::RtcpPacket::Rr(_) => {}
            }
        }
    }

    /// §4.D.8: RR every 15s plus an OPTIONS keep-alive over the control
    /// socket on the same cadence.
    async fn maybe_send_periodic(&mut self) {
        let now = Instant::now();
        if now.duration_since(self.last_rr_at) >= Duration::from_secs(self.cfg.rtcp_interval_secs) {
            self.last_rr_at = now;
            for i in 0..self.streams.len() {
                let block = self.build_rr_block(i);
                let rr = rtp_depack::build_receiver_report(&[block]);
                let _ = self.streams[i].rtcp_socket.send(&rr).await;
            }
        }
        if now.duration_since(self.last_keepalive_at) >= Duration::from_secs(self.cfg.keepalive_interval_secs) {
            self.last_keepalive_at = now;
            let _ = self.options().await;
        }
    }

    fn build_rr_block(&self, index: usize) -> rtp_depack::ReceiverReportBlock {
        let stream = &self.streams[index];
        let highest = stream.last_seq.unwrap_or(0) as u32;
        let last_ntp_mid = stream
            .last_sr
            .map(|sr| ((sr.ntp_hi << 16) | (sr.ntp_lo >> 16)))
            .unwrap_or(0);
        rtp_depack::ReceiverReportBlock {
            ssrc: 0,
            fraction_lost: 0,
            cumulative_lost: stream.lost_packets as u32,
            highest_ext_seq: highest,
            jitter: 0,
            last_sr_ntp_mid: last_ntp_mid,
            delay_since_last_sr: 0,
        }
    }

    /// §4.D.6 `GetNextPacket`: multi-stream sessions require every stream
    /// to carry >= 20 buffered packets before normal service starts; once
    /// bootstrapped, alternate between streams round-robin, skipping any
    /// below 5 to keep AV alignment. Single-stream sessions have no
    /// alignment to preserve, so they serve as soon as a packet is queued.
    pub fn next_packet_stream(&mut self) -> Option<usize> {
        let n = self.streams.len();
        if n == 0 {
            return None;
        }
        if n == 1 {
            return (self.streams[0].reorder_depth() > 0).then_some(0);
        }
        if !self.dequeue_bootstrapped {
            let all_buffered = self
                .streams
                .iter()
                .all(|s| s.reorder_depth() >= crate::stream::INITIAL_BUFFERING_DEPTH);
            if !all_buffered {
                return None;
            }
            self.dequeue_bootstrapped = true;
        }
        let start = self.last_served.map(|i| (i + 1) % n).unwrap_or(0);
        for offset in 0..n {
            let idx = (start + offset) % n;
            if self.streams[idx].reorder_depth() >= crate::stream::AV_ALIGN_MIN_DEPTH {
                self.last_served = Some(idx);
                return Some(idx);
            }
        }
        None
    }
}

/// Polls every stream's RTP and RTCP sockets once, returning the first one
/// ready. `select_all`-style fan-in kept hand-rolled since `tokio::select!`
/// cannot loop over a runtime-sized list of branches directly.
async fn futures_select(
    streams: &mut [RtpStream],
    rtp_bufs: &mut [[u8; 2048]],
    rtcp_bufs: &mut [[u8; 2048]],
) -> (usize, bool, std::io::Result<usize>) {
    use std::future::poll_fn;
    use std::task::Poll;

    poll_fn(|cx| {
        for (i, stream) in streams.iter().enumerate() {
            let mut buf = tokio::io::ReadBuf::new(&mut rtp_bufs[i]);
            if let Poll::Ready(res) = stream.rtp_socket.poll_recv(cx, &mut buf) {
                let n = buf.filled().len();
                return Poll::Ready((i, false, res.map(|_| n)));
            }
            let mut buf = tokio::io::ReadBuf::new(&mut rtcp_bufs[i]);
            if let Poll::Ready(res) = stream.rtcp_socket.poll_recv(cx, &mut buf) {
                let n = buf.filled().len();
                return Poll::Ready((i, true, res.map(|_| n)));
            }
        }
        Poll::Pending
    })
    .await
}
