// Bridges the async RTSP/RTP session (§4.D) into content-pipe's blocking
// `ProtocolHandler` trait (§4.A). The cache's producer thread is already a
// dedicated blocking thread (see `content_pipe::cache`), so this handler
// gives it a blocking `read` backed by a byte queue that a private
// single-thread tokio runtime fills by driving `RtspSession::receive_tick`,
// the same split `net/rtsp`'s `imp.rs` makes between its GStreamer element
// thread and the task actually doing socket I/O.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use url::Url;

use content_pipe::{
    ConfigKey, ConfigValue, OpenAccess, ParserKind, PipeError, PipeResult, ProtocolHandler,
    ProtocolHandlerFactory, SdesField, SeekOrigin,
};

use crate::config::RtspConfig;
use crate::sdp::MediaKind;
use crate::session::RtspSession;
use crate::stream::SdesSlots;

/// §4.D.7's reconnect trigger generalized to a plain stall detector: if no
/// stream's delivered timestamp has advanced in this window, and it isn't
/// because of a BYE, the driver tears down and reconnects.
const STALL_WINDOW: Duration = Duration::from_secs(10);
const MAX_SOCKET_ERRORS: u32 = 5;

enum Command {
    SeekTime(f64),
    Pause(bool),
}

/// Per-stream RTCP/timestamp state last observed by the driver thread,
/// published so the blocking `query_config` side of the handle can answer
/// §4.A's `ActualSeekTime`/`TimeStamps`/`RTCP-APP`/`RTCP-SDES-*` keys
/// instead of falling through to `NotSupported`. `sdes`/`app` hold the
/// most recently updated stream's values since these keys carry no stream
/// index of their own (§4.E.7 "the RTCP-related keys (forwarded)").
#[derive(Default, Clone)]
struct ConfigSnapshot {
    sdes: SdesSlots,
    app: Option<(u32, Vec<u8>)>,
    audio_ts_100ns: Option<u64>,
    video_ts_100ns: Option<u64>,
}

struct Shared {
    buf: Mutex<VecDeque<u8>>,
    cond: Condvar,
    eos: AtomicBool,
    fatal: Mutex<Option<String>>,
    delivered: AtomicU64,
    is_live: AtomicBool,
    duration_100ns: AtomicU64,
    config: Mutex<ConfigSnapshot>,
    actual_seek_secs: Mutex<Option<f64>>,
}

const DURATION_UNKNOWN: u64 = u64::MAX;

impl Shared {
    fn push(&self, bytes: VecDeque<u8>) {
        if bytes.is_empty() {
            return;
        }
        let mut buf = self.buf.lock().unwrap();
        buf.extend(bytes);
        self.cond.notify_all();
    }

    fn set_eos(&self) {
        self.eos.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }

    fn set_fatal(&self, msg: String) {
        *self.fatal.lock().unwrap() = Some(msg);
        self.set_eos();
    }
}

/// `content_pipe::ProtocolHandler` for `rtsp://` URIs (and `.sdp`-suffixed
/// `http://`, resolved upstream by `ProtocolRegistry::resolve_scheme`).
pub struct RtspHandler {
    shared: Arc<Shared>,
    cmd_tx: Mutex<Option<UnboundedSender<Command>>>,
    driver: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl RtspHandler {
    pub fn open(uri: &str, cfg: RtspConfig) -> PipeResult<Self> {
        let url = Url::parse(uri).map_err(|e| PipeError::BadParameter(e.to_string()))?;
        let shared = Arc::new(Shared {
            buf: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            eos: AtomicBool::new(false),
            fatal: Mutex::new(None),
            delivered: AtomicU64::new(0),
            is_live: AtomicBool::new(false),
            duration_100ns: AtomicU64::new(DURATION_UNKNOWN),
            config: Mutex::new(ConfigSnapshot::default()),
            actual_seek_secs: Mutex::new(None),
        });
        let (cmd_tx, cmd_rx) = unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let driver_shared = Arc::clone(&shared);
        let driver = std::thread::Builder::new()
            .name("rtsp-client-driver".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("failed to start RTSP driver runtime: {e}")));
                        return;
                    }
                };
                rt.block_on(drive(url, cfg, driver_shared, cmd_rx, ready_tx));
            })
            .map_err(|e| {
                PipeError::FileOperationFailed(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(PipeError::FileOperationFailed(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    e,
                )))
            }
            Err(_) => {
                return Err(PipeError::FileOperationFailed(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "RTSP driver thread exited before SETUP/PLAY completed",
                )))
            }
        }

        Ok(Self {
            shared,
            cmd_tx: Mutex::new(Some(cmd_tx)),
            driver: Mutex::new(Some(driver)),
        })
    }

    fn send(&self, cmd: Command) -> PipeResult<()> {
        self.cmd_tx
            .lock()
            .unwrap()
            .as_ref()
            .ok_or_else(|| PipeError::ParserFailure("RTSP driver thread already shut down".into()))?
            .send(cmd)
            .map_err(|_| PipeError::ParserFailure("RTSP driver thread is gone".into()))
    }
}

impl Drop for RtspHandler {
    fn drop(&mut self) {
        // Drop the sender first so the driver's `cmd_rx.recv()` branch
        // resolves to `None` and the loop exits before we try to join it.
        self.cmd_tx.lock().unwrap().take();
        if let Some(handle) = self.driver.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

async fn drive(
    url: Url,
    cfg: RtspConfig,
    shared: Arc<Shared>,
    mut cmd_rx: UnboundedReceiver<Command>,
    ready_tx: std::sync::mpsc::Sender<Result<(), String>>,
) {
    let mut session = match RtspSession::open(url.clone(), cfg.clone()).await {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(e.to_string()));
            return;
        }
    };

    shared.is_live.store(session.info.is_live, Ordering::SeqCst);
    if let Some(d) = session.info.duration_npt {
        shared
            .duration_100ns
            .store((d * 10_000_000.0) as u64, Ordering::SeqCst);
    }
    emit_session_header(&mut session, &shared);

    if let Err(e) = session.play_from(None).await {
        let _ = ready_tx.send(Err(e.to_string()));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    let mut last_progress = Instant::now();
    let mut last_delivered_sum = 0u64;
    let mut reconnects = 0u32;

    loop {
        tokio::select! {
            biased;
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::SeekTime(seconds)) => {
                        if let Err(e) = session.play_from(Some(seconds)).await {
                            shared.set_fatal(e.to_string());
                            return;
                        }
                        session.nem.reset();
                        emit_session_header(&mut session, &shared);
                        *shared.actual_seek_secs.lock().unwrap() = session.actual_seek_secs;
                        last_progress = Instant::now();
                        last_delivered_sum = 0;
                    }
                    Some(Command::Pause(pause)) => {
                        let result = if pause { session.pause().await } else { session.play_from(None).await };
                        if let Err(e) = result {
                            tracing::warn!(error = %e, "RTSP pause/resume request failed");
                        }
                    }
                    None => {
                        let _ = session.teardown().await;
                        shared.set_eos();
                        return;
                    }
                }
            }
            result = session.receive_tick() => {
                if let Err(e) = result {
                    shared.set_fatal(e.to_string());
                    return;
                }
                drain_nem(&mut session, &shared);
                update_config_snapshot(&session, &shared);

                let sum: u64 = session.streams.iter().map(|s| s.delivered_ts).sum();
                if sum != last_delivered_sum {
                    last_delivered_sum = sum;
                    last_progress = Instant::now();
                }

                if session.got_bye && session.streams.iter().all(|s| s.is_at_eos) {
                    shared.set_eos();
                    return;
                }

                let errored = session.streams.iter().any(|s| s.socket_errors >= MAX_SOCKET_ERRORS);
                let stalled = !session.got_bye
                    && !session.streams.is_empty()
                    && last_progress.elapsed() >= STALL_WINDOW;

                if (errored || stalled) && reconnects < cfg.reconnect_attempts {
                    reconnects += 1;
                    let stream_count = session.streams.len().max(1) as f64;
                    let resume_secs = (last_delivered_sum as f64 / stream_count) / 10_000_000.0;
                    tracing::warn!(reconnects, resume_secs, "RTSP session stalled, reconnecting");
                    match session.reconnect().await {
                        Ok(()) => {
                            session.nem.reset();
                            emit_session_header(&mut session, &shared);
                            if let Err(e) = session.play_from(Some(resume_secs)).await {
                                shared.set_fatal(e.to_string());
                                return;
                            }
                            *shared.actual_seek_secs.lock().unwrap() = session.actual_seek_secs;
                            last_progress = Instant::now();
                        }
                        Err(e) => {
                            shared.set_fatal(e.to_string());
                            return;
                        }
                    }
                } else if errored || stalled {
                    shared.set_fatal("RTSP session stalled and exhausted its reconnect budget".into());
                    return;
                }
            }
        }
    }
}

fn emit_session_header(session: &mut RtspSession, shared: &Shared) {
    let formats = session.stream_formats();
    let asf = session.info.asf_header.clone();
    session.nem.emit_session_header(&formats, asf.as_deref());
    drain_nem(session, shared);
}

/// Publishes per-stream SDES/APP/last-seen-timestamp state captured by
/// `RtspSession::handle_rtcp` (§4.D.8) so the blocking `query_config` side
/// can answer it; otherwise that capture is a dead write nothing ever
/// reads.
fn update_config_snapshot(session: &RtspSession, shared: &Shared) {
    let mut snap = shared.config.lock().unwrap();
    for stream in &session.streams {
        let has_sdes = stream.sdes.cname.is_some()
            || stream.sdes.name.is_some()
            || stream.sdes.email.is_some()
            || stream.sdes.phone.is_some()
            || stream.sdes.loc.is_some()
            || stream.sdes.tool.is_some()
            || stream.sdes.note.is_some()
            || stream.sdes.private.is_some();
        if has_sdes {
            snap.sdes = stream.sdes.clone();
        }
        if stream.app_data.is_some() {
            snap.app = stream.app_data.clone();
        }
        match stream.kind {
            MediaKind::Audio => snap.audio_ts_100ns = Some(stream.delivered_ts),
            MediaKind::Video => snap.video_ts_100ns = Some(stream.delivered_ts),
        }
    }
}

fn drain_nem(session: &mut RtspSession, shared: &Shared) {
    let pending = session.nem.pending();
    if pending == 0 {
        return;
    }
    let mut tmp = vec![0u8; pending];
    let n = session.nem.drain_into(&mut tmp);
    tmp.truncate(n);
    shared.push(tmp.into());
}

impl ProtocolHandler for RtspHandler {
    fn read(&self, buf: &mut [u8]) -> PipeResult<usize> {
        let mut guard = self.shared.buf.lock().unwrap();
        loop {
            if !guard.is_empty() {
                let n = buf.len().min(guard.len());
                for slot in buf.iter_mut().take(n) {
                    *slot = guard.pop_front().unwrap();
                }
                self.shared.delivered.fetch_add(n as u64, Ordering::SeqCst);
                return Ok(n);
            }
            if self.shared.eos.load(Ordering::SeqCst) {
                if let Some(msg) = self.shared.fatal.lock().unwrap().take() {
                    return Err(PipeError::FileOperationFailed(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        msg,
                    )));
                }
                return Ok(0);
            }
            let (g, _timeout) = self
                .shared
                .cond
                .wait_timeout(guard, Duration::from_millis(200))
                .unwrap();
            guard = g;
        }
    }

    fn write(&self, _buf: &[u8]) -> PipeResult<usize> {
        Err(PipeError::NotSupported)
    }

    fn seek(&self, offset: i64, origin: SeekOrigin) -> PipeResult<u64> {
        match origin {
            SeekOrigin::Time => {
                let seconds = offset as f64 / 10_000_000.0;
                self.shared.buf.lock().unwrap().clear();
                self.shared.eos.store(false, Ordering::SeqCst);
                self.send(Command::SeekTime(seconds))?;
                Ok(0)
            }
            _ => Err(PipeError::NotSupported),
        }
    }

    fn position(&self) -> PipeResult<u64> {
        Ok(self.shared.delivered.load(Ordering::SeqCst))
    }

    fn size(&self) -> Option<u64> {
        None
    }

    fn is_streaming(&self) -> bool {
        true
    }

    fn preferred_chunk_size(&self) -> Option<usize> {
        Some(64 * 1024)
    }

    fn query_config(&self, key: &ConfigKey) -> PipeResult<ConfigValue> {
        match key {
            ConfigKey::CanSeekByTime => Ok(ConfigValue::Bool(
                !self.shared.is_live.load(Ordering::SeqCst),
            )),
            ConfigKey::PreBufferAmount => Ok(ConfigValue::U64(32 * 1024)),
            ConfigKey::ActualSeekTime => self
                .shared
                .actual_seek_secs
                .lock()
                .unwrap()
                .map(|secs| ConfigValue::Text(format!("{secs:.3}")))
                .ok_or(PipeError::NotSupported),
            ConfigKey::TimeStamps => {
                let snap = self.shared.config.lock().unwrap();
                let mut parts = Vec::new();
                if let Some(a) = snap.audio_ts_100ns {
                    parts.push(format!("audio={a}"));
                }
                if let Some(v) = snap.video_ts_100ns {
                    parts.push(format!("video={v}"));
                }
                if parts.is_empty() {
                    Err(PipeError::NotSupported)
                } else {
                    Ok(ConfigValue::Text(parts.join(";")))
                }
            }
            ConfigKey::RtcpApp => {
                let snap = self.shared.config.lock().unwrap();
                snap.app
                    .as_ref()
                    .map(|(name, data)| {
                        let name_str = String::from_utf8_lossy(&name.to_be_bytes()).into_owned();
                        ConfigValue::Text(format!("{name_str}:{}", data_encoding::BASE64.encode(data)))
                    })
                    .ok_or(PipeError::NotSupported)
            }
            ConfigKey::RtcpSdes(field) => {
                let snap = self.shared.config.lock().unwrap();
                let value = match field {
                    SdesField::Cname => snap.sdes.cname.clone(),
                    SdesField::Name => snap.sdes.name.clone(),
                    SdesField::Email => snap.sdes.email.clone(),
                    SdesField::Phone => snap.sdes.phone.clone(),
                    SdesField::Loc => snap.sdes.loc.clone(),
                    SdesField::Tool => snap.sdes.tool.clone(),
                    SdesField::Note => snap.sdes.note.clone(),
                    SdesField::Priv => snap.sdes.private.clone(),
                };
                value.map(ConfigValue::Text).ok_or(PipeError::NotSupported)
            }
            _ => Err(PipeError::NotSupported),
        }
    }

    fn set_pause(&self, paused: bool) -> PipeResult<()> {
        self.send(Command::Pause(paused))
    }

    fn close(&self) -> PipeResult<()> {
        self.shared.set_eos();
        Ok(())
    }
}

pub struct RtspHandlerFactory {
    config: RtspConfig,
}

impl RtspHandlerFactory {
    pub fn new(config: RtspConfig) -> Self {
        Self { config }
    }
}

impl ProtocolHandlerFactory for RtspHandlerFactory {
    fn open(&self, uri: &str, access: OpenAccess) -> PipeResult<Arc<dyn ProtocolHandler>> {
        if access != OpenAccess::Read {
            return Err(PipeError::NotSupported);
        }
        Ok(Arc::new(RtspHandler::open(uri, self.config.clone())?))
    }

    fn probe_parser(&self, _uri: &str) -> ParserKind {
        ParserKind::Nem
    }
}
