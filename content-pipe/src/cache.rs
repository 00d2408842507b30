// The caching content pipe, §4.E — the hardest component per §2.
//
// Concurrency note (see DESIGN.md "merged cache lock"): the C ancestor
// serialized chunk-status transitions, `bytes_available` updates and
// borrow-table mutation behind three separate mutexes (`chunk_lock`,
// `avail_lock`, a borrow-table lock) so that a reader copying bytes out of
// the pool never had to wait on the producer. Replaying that exactly in
// safe Rust either needs unsafe aliasing the borrow checker can't verify or
// buys nothing for this rewrite: the three pieces of state change together
// on every transition anyway (a chunk going `Full` always changes
// `bytes_available` too). They are merged into one `Mutex<CacheState>`,
// held only for the short bookkeeping step of each operation; the actual
// pool bytes live outside that mutex in `RawBuf` so a lent `ReadBuffer`
// never blocks the producer or another reader once its borrow is recorded.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::borrow::{BorrowBase, BorrowId, BorrowTable};
use crate::chunk::{ChunkMeta, ChunkStatus};
use crate::error::{PipeError, PipeResult};
use crate::handler::{ConfigKey, ConfigValue, OpenAccess, ProtocolHandler, ProtocolRegistry, SeekOrigin};

const MIN_POOL_SHRINK_STEP: usize = 1024 * 1024;
const STREAMING_POOL_CAP: usize = 10 * 1024 * 1024;
const STREAMING_SPARE_CAP: usize = 256 * 1024;
const DEFAULT_CHUNK_SIZE_FLOOR: usize = 256 * 1024;
const PRODUCER_IDLE_SLEEP: Duration = Duration::from_millis(1);
const PRODUCER_IDLE_SLEEP_STREAMING: Duration = Duration::from_millis(5);
/// §4.E.1 item 10: wake the producer when the contiguous lookahead shrinks
/// past this.
const LOOKAHEAD_WAKE_THRESHOLD: u64 = 3 * 1024 * 1024 / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvailabilityStatus {
    Ok,
    AtEos,
    NotReady,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PositionEx {
    pub data_begin: u64,
    pub data_cur: u64,
    pub data_end: u64,
    pub data_first: u64,
    pub data_last: u64,
}

#[derive(Debug, Clone, Copy)]
pub enum CacheEvent {
    BytesAvailable,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheLimits {
    pub min: usize,
    pub max: usize,
    pub spare: usize,
}

/// Raw backing storage for the pool/spare areas. Mutated only while the
/// caller holds `CacheState`'s mutex (producer fill, chunk reuse); read via
/// raw pointer once a chunk's `Full`-and-borrowed status guarantees no
/// concurrent writer, matching §5's invariant "while any borrow intersects
/// a chunk, that chunk cannot be written".
struct RawBuf(UnsafeCell<Box<[u8]>>);
unsafe impl Sync for RawBuf {}

impl RawBuf {
    fn new(len: usize) -> Self {
        RawBuf(UnsafeCell::new(vec![0u8; len].into_boxed_slice()))
    }

    fn len(&self) -> usize {
        unsafe { (*self.0.get()).len() }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn as_mut(&self) -> &mut [u8] {
        &mut *self.0.get()
    }

    unsafe fn as_ref(&self) -> &[u8] {
        &*self.0.get()
    }
}

/// Everything about pool sizing that is fixed once `initialize` runs. Held
/// behind a `OnceLock` rather than plain fields so `initialize` never needs
/// unsafe interior mutation of an already-shared `Inner`.
struct PoolConfig {
    fully_cached: bool,
    pool_size: usize,
    chunk_size: usize,
    pool: RawBuf,
    spare: RawBuf,
}

struct CacheState {
    chunks: Vec<ChunkMeta>,
    borrows: BorrowTable,
    read_head: u64,
    write_head: u64,
    next_chunk_to_write: usize,
    bytes_available: u64,
    high_mark: u64,
    read_trigger: u64,
    eos: bool,
    invalidation_in_progress: bool,
    caching_paused: bool,
    hard_stop: bool,
    triggered: bool,
    client_waiting: bool,
}

impl CacheState {
    fn empty() -> Self {
        Self {
            chunks: Vec::new(),
            borrows: BorrowTable::new(),
            read_head: 0,
            write_head: 0,
            next_chunk_to_write: 0,
            bytes_available: 0,
            high_mark: 0,
            read_trigger: 0,
            eos: false,
            invalidation_in_progress: false,
            caching_paused: false,
            hard_stop: false,
            triggered: false,
            client_waiting: false,
        }
    }
}

struct WorkerSignal {
    mutex: Mutex<bool>,
    condvar: Condvar,
}

impl WorkerSignal {
    fn new() -> Self {
        Self {
            mutex: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn wake(&self) {
        let mut woken = self.mutex.lock().unwrap();
        *woken = true;
        self.condvar.notify_one();
    }

    fn wait_timeout(&self, timeout: Duration) {
        let woken = self.mutex.lock().unwrap();
        let (mut woken, _) = self.condvar.wait_timeout(woken, timeout).unwrap();
        *woken = false;
    }
}

pub(crate) struct Inner {
    handler: Arc<dyn ProtocolHandler>,
    file_size: Option<u64>,
    is_streaming: bool,
    cfg: OnceLock<PoolConfig>,
    state: Mutex<CacheState>,
    write_lock: Mutex<()>,
    shutdown: AtomicBool,
    initialized: AtomicBool,
    signal: WorkerSignal,
    producer: Mutex<Option<JoinHandle<()>>>,
    callback: Mutex<Option<Box<dyn Fn(CacheEvent) + Send + Sync>>>,
}

/// A lent, zero-copy view into the pool (or the spare area, for a
/// straddling request). Dropping it releases the borrow, equivalent to an
/// explicit `release-read-buffer` call in the original API.
pub struct ReadBuffer {
    inner: Arc<Inner>,
    id: BorrowId,
    ptr: *const u8,
    len: usize,
}

// SAFETY: the pointer is valid for as long as `inner` is alive and the
// borrow it names is active; both conditions are upheld for the lifetime
// of `ReadBuffer`.
unsafe impl Send for ReadBuffer {}

impl std::ops::Deref for ReadBuffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for ReadBuffer {
    fn drop(&mut self) {
        let _ = self.inner.release_borrow(self.id);
    }
}

/// The public handle to a content pipe. Cheap to clone; clones share the
/// same cache and handler.
#[derive(Clone)]
pub struct ContentPipe(Arc<Inner>);

fn new_inner(handler: Arc<dyn ProtocolHandler>) -> Arc<Inner> {
    let file_size = handler.size();
    let is_streaming = handler.is_streaming();
    Arc::new(Inner {
        handler,
        file_size,
        is_streaming,
        cfg: OnceLock::new(),
        state: Mutex::new(CacheState::empty()),
        write_lock: Mutex::new(()),
        shutdown: AtomicBool::new(false),
        initialized: AtomicBool::new(false),
        signal: WorkerSignal::new(),
        producer: Mutex::new(None),
        callback: Mutex::new(None),
    })
}

impl ContentPipe {
    /// §4.E.1 item 1: select a handler for `uri` and open it.
    pub fn open(registry: &ProtocolRegistry, uri: &str, access: OpenAccess) -> PipeResult<Self> {
        let handler = registry.open(uri, access)?;
        Ok(ContentPipe(new_inner(handler)))
    }

    /// Wraps an already-open handler directly; used by `rtsp-client`, whose
    /// handler is constructed through its own session rather than a
    /// registry lookup.
    pub fn from_handler(handler: Arc<dyn ProtocolHandler>) -> Self {
        ContentPipe(new_inner(handler))
    }

    pub fn register_client_callback<F>(&self, cb: F)
    where
        F: Fn(CacheEvent) + Send + Sync + 'static,
    {
        *self.0.callback.lock().unwrap() = Some(Box::new(cb));
    }

    /// §4.E.1 item 2.
    pub fn initialize(&self, limits: CacheLimits) -> PipeResult<()> {
        let inner = &self.0;
        if inner.cfg.get().is_some() {
            return Err(PipeError::BadParameter("already initialized".into()));
        }
        let is_streaming = inner.is_streaming;
        let (min, mut max, mut spare) = (limits.min, limits.max, limits.spare);
        if is_streaming {
            max = max.min(STREAMING_POOL_CAP);
            spare = spare.min(STREAMING_SPARE_CAP);
        }

        let mut requested = max;
        let pool_bytes = loop {
            match try_alloc(requested) {
                Some(buf) => break buf,
                None => {
                    if requested <= min || requested < MIN_POOL_SHRINK_STEP {
                        return Err(PipeError::InsufficientMemory);
                    }
                    requested -= MIN_POOL_SHRINK_STEP;
                    requested = requested.max(min);
                }
            }
        };
        let pool_size = pool_bytes.len();

        let chunk_size = if is_streaming {
            inner.handler.preferred_chunk_size().unwrap_or(DEFAULT_CHUNK_SIZE_FLOOR)
        } else {
            (pool_size / 32).max(DEFAULT_CHUNK_SIZE_FLOOR)
        };
        let chunk_size = match inner.file_size {
            Some(size) if size > 0 => chunk_size.min(size as usize).max(1),
            _ => chunk_size,
        };
        let total_chunks = pool_size.div_ceil(chunk_size).max(1);
        let aligned_pool_size = total_chunks * chunk_size;

        let fully_cached = !is_streaming
            && inner
                .file_size
                .is_some_and(|size| size <= aligned_pool_size as u64);

        let mut chunks = vec![ChunkMeta::new(); total_chunks];
        if fully_cached {
            for (i, c) in chunks.iter_mut().enumerate() {
                c.origin = Some((i * chunk_size) as u64);
            }
        }

        let _ = inner.cfg.set(PoolConfig {
            fully_cached,
            pool_size: aligned_pool_size,
            chunk_size,
            pool: RawBuf::new(aligned_pool_size),
            spare: RawBuf::new(spare),
        });

        {
            let mut state = inner.state.lock().unwrap();
            state.chunks = chunks;
            state.high_mark = (3 * aligned_pool_size as u64) / 4;
            state.read_trigger = aligned_pool_size as u64 / 4;
        }

        inner.initialized.store(true, Ordering::SeqCst);
        spawn_producer(Arc::clone(inner));

        if is_streaming {
            if let Ok(ConfigValue::U64(prebuffer)) = inner.handler.query_config(&ConfigKey::PreBufferAmount) {
                if prebuffer > 0 {
                    let deadline = Instant::now() + Duration::from_secs(30);
                    loop {
                        let (avail, eos) = {
                            let state = inner.state.lock().unwrap();
                            (state.bytes_available, state.eos)
                        };
                        if avail >= prebuffer || eos || Instant::now() > deadline {
                            break;
                        }
                        std::thread::sleep(Duration::from_millis(5));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn close(&self) -> PipeResult<()> {
        self.0.shutdown.store(true, Ordering::SeqCst);
        self.0.signal.wake();
        if let Some(handle) = self.0.producer.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.0.handler.close()
    }

    pub fn read(&self, buf: &mut [u8]) -> PipeResult<usize> {
        self.0.read(buf)
    }

    pub fn read_buffer(&self, len: usize, forbid_copy: bool) -> PipeResult<ReadBuffer> {
        Arc::clone(&self.0).read_buffer_impl(len, forbid_copy)
    }

    pub fn check_available_bytes(&self, n: u64) -> AvailabilityStatus {
        self.0.check_available_bytes(n)
    }

    pub fn seek_64(&self, offset: i64, origin: SeekOrigin) -> PipeResult<u64> {
        self.0.seek_64(offset, origin)
    }

    pub fn get_position_64(&self) -> u64 {
        self.0.state.lock().unwrap().read_head
    }

    pub fn get_size(&self) -> Option<u64> {
        self.0.file_size
    }

    pub fn get_available_bytes(&self) -> u64 {
        self.0.state.lock().unwrap().bytes_available
    }

    pub fn get_position_ex(&self) -> PositionEx {
        self.0.position_ex()
    }

    pub fn get_config(&self, key: ConfigKey) -> PipeResult<ConfigValue> {
        match key {
            ConfigKey::ChunkSize => Ok(ConfigValue::U64(self.0.cfg().chunk_size as u64)),
            _ => self.0.handler.query_config(&key),
        }
    }

    pub fn set_config(&self, _key: ConfigKey, _value: ConfigValue) -> PipeResult<()> {
        Err(PipeError::NotSupported)
    }

    /// `Threshold { HighMark, LowMark }`, §4.E.7.
    pub fn set_thresholds(&self, high_mark: u64, low_mark: u64) {
        let _g = self.0.write_lock.lock().unwrap();
        let mut state = self.0.state.lock().unwrap();
        state.high_mark = high_mark;
        state.read_trigger = low_mark;
    }

    pub fn invalidate_cache(&self) -> PipeResult<()> {
        self.0.invalidate_cache()
    }

    pub fn pause_caching(&self, pause: bool) -> PipeResult<()> {
        self.0.state.lock().unwrap().caching_paused = pause;
        if self.0.is_streaming {
            self.0.handler.set_pause(pause)?;
        }
        Ok(())
    }

    pub fn stop_caching(&self) {
        self.0.state.lock().unwrap().hard_stop = true;
    }

    pub fn start_caching(&self) {
        self.0.state.lock().unwrap().hard_stop = false;
        self.0.signal.wake();
    }
}

impl Inner {
    /// Panics if called before `initialize`; every method reachable from
    /// `ContentPipe` other than `open`/`initialize` itself requires it.
    fn cfg(&self) -> &PoolConfig {
        self.cfg.get().expect("content pipe used before initialize()")
    }

    fn notify(&self) {
        if let Some(cb) = self.callback.lock().unwrap().as_ref() {
            cb(CacheEvent::BytesAvailable);
        }
    }

    fn pool_index(&self, offset: u64) -> usize {
        (offset % self.cfg().pool_size as u64) as usize
    }

    fn chunk_for_offset(&self, chunks: &[ChunkMeta], offset: u64) -> Option<usize> {
        let cfg = self.cfg();
        if cfg.fully_cached {
            if let Some(size) = self.file_size {
                if offset >= size {
                    return None;
                }
            }
            let idx = (offset / cfg.chunk_size as u64) as usize;
            if idx < chunks.len() {
                Some(idx)
            } else {
                None
            }
        } else {
            chunks
                .iter()
                .position(|c| matches!(c.origin, Some(o) if offset >= o && offset < o + c.valid_len as u64))
        }
    }

    // ---- §4.E.4 prepare-for-processing ----
    fn prepare_for_processing(&self, state: &mut CacheState) -> PipeResult<usize> {
        if state.eos {
            return Err(PipeError::Eos);
        }
        let cfg = self.cfg();
        if cfg.fully_cached {
            let total = state.chunks.len();
            let start = state.next_chunk_to_write;
            let mut saw_blocked_pending = false;
            for i in 0..total {
                let idx = (start + i) % total;
                let c = state.chunks[idx];
                if c.status == ChunkStatus::Invalid {
                    state.chunks[idx].status = ChunkStatus::Filling;
                    return Ok(idx);
                }
                if c.pending_invalidate && c.status == ChunkStatus::Full {
                    if state.borrows.chunk_is_borrowed(idx) {
                        saw_blocked_pending = true;
                    } else {
                        state.chunks[idx].status = ChunkStatus::Filling;
                        return Ok(idx);
                    }
                }
            }
            if saw_blocked_pending {
                return Err(PipeError::NotInvalidated);
            }
            if !state.invalidation_in_progress {
                state.eos = true;
                self.notify();
                return Err(PipeError::Eos);
            }
            Err(PipeError::NotReady)
        } else {
            let idx = state.next_chunk_to_write;
            if let Some(read_chunk) = self.chunk_for_offset(&state.chunks, state.read_head) {
                if read_chunk == idx && state.bytes_available > 0 {
                    return Err(PipeError::NotReady);
                }
            }
            if state.bytes_available >= cfg.pool_size as u64 {
                return Err(PipeError::Eos);
            }
            if state.borrows.chunk_is_borrowed(idx) {
                return Err(PipeError::NotReady);
            }
            state.chunks[idx].status = ChunkStatus::Filling;
            Ok(idx)
        }
    }

    // ---- §4.E.3 do-read ----
    fn do_read(&self) -> PipeResult<()> {
        let cfg = self.cfg();
        {
            let mut state = self.state.lock().unwrap();
            if !cfg.fully_cached && state.bytes_available > state.high_mark {
                state.triggered = false;
                return Ok(());
            }
        }

        let chunk_idx = {
            let mut state = self.state.lock().unwrap();
            match self.prepare_for_processing(&mut state) {
                Ok(idx) => idx,
                Err(PipeError::Eos) => return Ok(()),
                Err(e) => return Err(e),
            }
        };

        let origin = if cfg.fully_cached {
            let origin = (chunk_idx * cfg.chunk_size) as u64;
            self.handler.seek(origin as i64, SeekOrigin::Begin)?;
            origin
        } else {
            let pos = self.handler.position()?;
            if let Some(size) = self.file_size {
                if pos >= size {
                    let mut state = self.state.lock().unwrap();
                    state.chunks[chunk_idx].status = ChunkStatus::Invalid;
                    state.eos = true;
                    self.notify();
                    return Ok(());
                }
            }
            pos
        };

        let read_len = match self.file_size {
            Some(size) => (size.saturating_sub(origin)).min(cfg.chunk_size as u64) as usize,
            None => cfg.chunk_size,
        };
        if read_len == 0 {
            let mut state = self.state.lock().unwrap();
            state.chunks[chunk_idx].status = ChunkStatus::Invalid;
            state.eos = true;
            self.notify();
            return Ok(());
        }

        let pool_off = self.pool_index(origin);
        // SAFETY: this chunk was just transitioned to `Filling` while
        // holding `state`'s lock, and `prepare_for_processing` guarantees
        // no outstanding borrow overlaps it — no other reader or writer
        // can observe `[pool_off, pool_off+read_len)` until we flip it
        // back to `Full`/`Invalid` below.
        let slice = unsafe { &mut cfg.pool.as_mut()[pool_off..pool_off + read_len] };
        let n = match self.handler.read(slice) {
            Ok(n) => n,
            Err(e) => {
                let mut state = self.state.lock().unwrap();
                state.chunks[chunk_idx].status = ChunkStatus::Invalid;
                return Err(e);
            }
        };

        if n == 0 {
            let mut state = self.state.lock().unwrap();
            state.chunks[chunk_idx].status = ChunkStatus::Invalid;
            state.eos = true;
            self.notify();
            return Ok(());
        }

        let mut state = self.state.lock().unwrap();
        state.chunks[chunk_idx].status = ChunkStatus::Full;
        state.chunks[chunk_idx].valid_len = n;
        state.chunks[chunk_idx].origin = Some(origin);
        state.chunks[chunk_idx].pending_invalidate = false;

        if cfg.fully_cached {
            // Walk forward from the chunk containing `read_head`, summing
            // contiguous `Full` non-invalidated chunks.
            let total = state.chunks.len();
            let mut avail = 0u64;
            let mut eos = false;
            if let Some(start) = self.chunk_for_offset(&state.chunks, state.read_head) {
                let intra = state.read_head - state.chunks[start].origin.unwrap();
                let mut cur = start;
                loop {
                    let c = state.chunks[cur];
                    if c.status != ChunkStatus::Full || c.pending_invalidate {
                        break;
                    }
                    avail += c.valid_len as u64 - if cur == start { intra } else { 0 };
                    if cur + 1 >= total {
                        eos = true;
                        break;
                    }
                    cur += 1;
                }
            }
            state.bytes_available = avail;
            state.eos = eos;
        } else {
            state.bytes_available += n as u64;
            if let Some(size) = self.file_size {
                if origin + n as u64 >= size {
                    state.eos = true;
                }
            }
        }
        state.write_head = origin + n as u64;
        self.notify();

        let total = state.chunks.len();
        let should_pause = !cfg.fully_cached && state.bytes_available >= state.high_mark;
        state.next_chunk_to_write = (chunk_idx + 1) % total;
        if should_pause {
            state.caching_paused = true;
        }
        drop(state);
        if should_pause {
            let _ = self.handler.set_pause(true);
        } else {
            self.signal.wake();
        }
        Ok(())
    }

    // ---- §4.E.6 read ----
    fn read(self: &Arc<Self>, buf: &mut [u8]) -> PipeResult<usize> {
        let hard_stop_or_uninit = {
            if !self.initialized.load(Ordering::SeqCst) {
                true
            } else {
                self.state.lock().unwrap().hard_stop
            }
        };
        if hard_stop_or_uninit {
            return self.handler.read(buf);
        }

        let n = buf.len() as u64;
        {
            let state = self.state.lock().unwrap();
            if state.eos && state.bytes_available == 0 {
                return Err(PipeError::Eos);
            }
        }

        let need_fill = {
            let state = self.state.lock().unwrap();
            state.bytes_available < n && !state.eos
        };
        if need_fill {
            let high_mark = self.state.lock().unwrap().high_mark;
            if high_mark < n {
                return Err(PipeError::NoData);
            }
            let _g = self.write_lock.lock().unwrap();
            loop {
                let (avail, eos) = {
                    let state = self.state.lock().unwrap();
                    (state.bytes_available, state.eos)
                };
                if avail >= n || eos {
                    break;
                }
                match self.do_read() {
                    Ok(()) => {}
                    Err(PipeError::NotReady) | Err(PipeError::NotInvalidated) => {
                        let avail_now = self.state.lock().unwrap().bytes_available;
                        if avail_now == 0 {
                            if self.cfg().fully_cached {
                                let pos = self.state.lock().unwrap().read_head;
                                self.handler.seek(pos as i64, SeekOrigin::Begin)?;
                            }
                            return self.handler.read(buf);
                        }
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let cfg = self.cfg();
        let mut state = self.state.lock().unwrap();
        let avail = state.bytes_available;
        let to_copy = avail.min(n) as usize;
        if to_copy == 0 {
            return if state.eos { Err(PipeError::Eos) } else { Err(PipeError::NotReady) };
        }
        let start = self.pool_index(state.read_head);
        // SAFETY: `to_copy` never exceeds `bytes_available`, which is only
        // incremented after the producer commits a chunk to `Full`; the
        // bytes in `[start, start+to_copy)` (wrapping at `pool_size`) are
        // therefore stable for the duration of this copy.
        unsafe {
            let pool = cfg.pool.as_ref();
            if start + to_copy <= cfg.pool_size {
                buf[..to_copy].copy_from_slice(&pool[start..start + to_copy]);
            } else {
                let first = cfg.pool_size - start;
                buf[..first].copy_from_slice(&pool[start..]);
                buf[first..to_copy].copy_from_slice(&pool[..to_copy - first]);
            }
        }
        state.read_head += to_copy as u64;
        state.bytes_available -= to_copy as u64;
        if !state.triggered && !state.eos && !cfg.fully_cached && state.bytes_available <= state.read_trigger {
            state.triggered = true;
            drop(state);
            self.signal.wake();
        }
        Ok(to_copy)
    }

    fn read_buffer_impl(self: Arc<Self>, len: usize, forbid_copy: bool) -> PipeResult<ReadBuffer> {
        let cfg = self.cfg.get().expect("content pipe used before initialize()");
        let mut state = self.state.lock().unwrap();
        if state.bytes_available < len as u64 {
            return Err(if state.eos { PipeError::Eos } else { PipeError::NotReady });
        }
        let start = self.pool_index(state.read_head);
        let straddles = start + len > cfg.pool_size;

        let (base, ptr, chunk_range) = if straddles {
            if forbid_copy {
                return Err(PipeError::BadParameter("range straddles pool end and copy is forbidden".into()));
            }
            if state.borrows.spare_in_use() {
                return Err(PipeError::SpareAreaInUse);
            }
            if len > cfg.spare.len() {
                return Err(PipeError::InsufficientMemory);
            }
            // SAFETY: spare is sized at initialize() time and not
            // concurrently written except through this same path, which is
            // excluded by the `spare_in_use` check above under the state
            // lock.
            unsafe {
                let pool = cfg.pool.as_ref();
                let spare = cfg.spare.as_mut();
                let first = cfg.pool_size - start;
                spare[..first].copy_from_slice(&pool[start..]);
                spare[first..len].copy_from_slice(&pool[..len - first]);
            }
            let chunk_a = self.chunk_for_offset(&state.chunks, state.read_head).unwrap_or(0);
            (BorrowBase::Spare, cfg.spare.0.get() as *const u8, (chunk_a, state.chunks.len()))
        } else {
            let chunk_start = self.chunk_for_offset(&state.chunks, state.read_head).unwrap_or(0);
            let chunk_end = self
                .chunk_for_offset(&state.chunks, state.read_head + len as u64 - 1)
                .map(|c| c + 1)
                .unwrap_or(state.chunks.len());
            // SAFETY: pool storage is a `Box<[u8]>` behind `UnsafeCell`;
            // taking a raw pointer here does not alias any `&mut` access,
            // since producer writes to this range are excluded by the
            // borrow we are about to record.
            let ptr = unsafe { cfg.pool.as_ref().as_ptr().add(start) };
            (BorrowBase::Pool(start), ptr, (chunk_start, chunk_end))
        };

        let id = state.borrows.alloc(base, len, chunk_range)?;
        state.bytes_available -= len as u64;
        state.read_head += len as u64;
        if !state.triggered && !state.eos && !cfg.fully_cached && state.bytes_available <= state.read_trigger {
            state.triggered = true;
            drop(state);
            self.signal.wake();
        }

        Ok(ReadBuffer {
            inner: self,
            id,
            ptr,
            len,
        })
    }

    fn release_borrow(&self, id: BorrowId) -> PipeResult<()> {
        let mut state = self.state.lock().unwrap();
        let (start, end) = state.borrows.release(id)?;
        if state.invalidation_in_progress {
            for idx in start..end {
                if state.chunks[idx].pending_invalidate && !state.borrows.chunk_is_borrowed(idx) {
                    state.chunks[idx].status = ChunkStatus::Invalid;
                    state.chunks[idx].pending_invalidate = false;
                }
            }
            let still_pending = state.chunks.iter().any(|c| c.pending_invalidate);
            state.invalidation_in_progress = still_pending;
            drop(state);
            self.signal.wake();
        }
        Ok(())
    }

    fn check_available_bytes(&self, n: u64) -> AvailabilityStatus {
        let mut state = self.state.lock().unwrap();
        if n <= state.bytes_available {
            return AvailabilityStatus::Ok;
        }
        if state.eos {
            return AvailabilityStatus::AtEos;
        }
        state.client_waiting = true;
        drop(state);
        self.signal.wake();
        AvailabilityStatus::NotReady
    }

    fn position_ex(&self) -> PositionEx {
        let state = self.state.lock().unwrap();
        let data_cur = state.read_head;
        let data_begin = state
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Full && !c.pending_invalidate)
            .filter_map(|c| c.origin)
            .min()
            .unwrap_or(data_cur);
        let data_end = data_cur + state.bytes_available;
        let data_first = data_begin;
        let data_last = state
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Full && !c.pending_invalidate)
            .filter_map(|c| c.origin.map(|o| o + c.valid_len as u64))
            .max()
            .unwrap_or(data_cur);
        let should_wake = state.bytes_available < LOOKAHEAD_WAKE_THRESHOLD && !state.eos;
        drop(state);
        if should_wake {
            self.signal.wake();
        }

        PositionEx {
            data_begin,
            data_cur,
            data_end,
            data_first,
            data_last,
        }
    }

    // ---- §4.E.5 seek ----
    fn seek_64(self: &Arc<Self>, offset: i64, origin: SeekOrigin) -> PipeResult<u64> {
        match origin {
            SeekOrigin::Time => {
                if self.handler.version() < 2 {
                    return Err(PipeError::NotSupported);
                }
                match self.handler.query_config(&ConfigKey::CanSeekByTime) {
                    Ok(ConfigValue::Bool(true)) => {}
                    _ => return Err(PipeError::NotSupported),
                }
                let _g = self.write_lock.lock().unwrap();
                self.invalidate_cache()?;
                let new_pos = self.handler.seek(offset, SeekOrigin::Time)?;
                {
                    let mut state = self.state.lock().unwrap();
                    let idx = self.find_next_chunk_to_write(&mut state, new_pos)?;
                    let total = state.chunks.len().max(1);
                    state.next_chunk_to_write = idx % total;
                    state.caching_paused = false;
                }
                self.signal.wake();
                Ok(new_pos)
            }
            SeekOrigin::Current => {
                let cur = self.state.lock().unwrap().read_head;
                self.seek_64((cur as i64) + offset, SeekOrigin::Begin)
            }
            SeekOrigin::End => {
                let size = self.file_size.ok_or(PipeError::NotSupported)?;
                let mut target = size as i64 + offset;
                target = target.clamp(0, size as i64);
                self.seek_64(target, SeekOrigin::Begin)
            }
            SeekOrigin::Begin => {
                let target = offset.max(0) as u64;
                if let Some(size) = self.file_size {
                    if target > size {
                        return Err(PipeError::BadParameter("seek beyond end of stream".into()));
                    }
                }
                let _g = self.write_lock.lock().unwrap();
                let fully_cached = self.cfg().fully_cached;
                let mut state = self.state.lock().unwrap();

                if fully_cached {
                    match self.chunk_for_offset(&state.chunks, target) {
                        Some(idx) => {
                            let c = state.chunks[idx];
                            if c.status == ChunkStatus::Full && !c.pending_invalidate {
                                self.cache_hit_seek(&mut state, target, idx);
                                Ok(target)
                            } else {
                                self.cache_miss_seek(&mut state, target)
                            }
                        }
                        None => {
                            // target == file size (EOF) or no chunk owns it yet.
                            state.read_head = target;
                            state.bytes_available = 0;
                            state.eos = true;
                            Ok(target)
                        }
                    }
                } else {
                    match self.chunk_for_offset(&state.chunks, target) {
                        Some(idx) => {
                            self.cache_hit_seek(&mut state, target, idx);
                            Ok(target)
                        }
                        None => self.cache_miss_seek(&mut state, target),
                    }
                }
            }
        }
    }

    fn cache_hit_seek(&self, state: &mut CacheState, target: u64, start_idx: usize) {
        let fully_cached = self.cfg().fully_cached;
        let total = state.chunks.len();
        let mut avail = 0u64;
        let mut eos = false;
        let mut cur = start_idx;
        let intra = target - state.chunks[start_idx].origin.unwrap();
        loop {
            let c = state.chunks[cur];
            if c.status != ChunkStatus::Full || c.pending_invalidate {
                break;
            }
            avail += c.valid_len as u64 - if cur == start_idx { intra } else { 0 };
            let next = cur + 1;
            if next >= total {
                eos = fully_cached;
                break;
            }
            if fully_cached {
                cur = next;
            } else {
                // ring mode: allow wrapping once back to the start.
                let wrapped = next % total;
                if wrapped == start_idx {
                    break;
                }
                cur = wrapped;
            }
        }
        state.read_head = target;
        state.write_head = target + avail;
        state.bytes_available = avail;
        state.eos = eos;
    }

    fn cache_miss_seek(&self, state: &mut CacheState, target: u64) -> PipeResult<u64> {
        let cfg = self.cfg();
        let idx = self.find_next_chunk_to_write(state, target)?;
        let total = state.chunks.len().max(1);
        state.next_chunk_to_write = idx % total;
        state.caching_paused = false;
        self.signal.wake();
        if cfg.fully_cached {
            self.handler.seek((idx * cfg.chunk_size) as i64, SeekOrigin::Begin)?;
        } else {
            self.handler.seek(target as i64, SeekOrigin::Begin)?;
        }
        Ok(target)
    }

    fn find_next_chunk_to_write(&self, state: &mut CacheState, offset: u64) -> PipeResult<usize> {
        let cfg = self.cfg();
        let total = state.chunks.len();
        if total == 0 {
            return Err(PipeError::NotInvalidated);
        }
        let start = if cfg.fully_cached {
            ((offset / cfg.chunk_size as u64) as usize).min(total - 1)
        } else {
            state.next_chunk_to_write
        };
        for i in 0..total {
            let idx = (start + i) % total;
            if !state.borrows.chunk_is_borrowed(idx) {
                state.chunks[idx].origin = Some(offset);
                state.chunks[idx].status = ChunkStatus::Invalid;
                state.chunks[idx].pending_invalidate = false;
                state.chunks[idx].valid_len = 0;
                state.read_head = offset;
                state.write_head = offset;
                state.bytes_available = 0;
                state.eos = self.file_size.is_some_and(|size| offset == size);
                return Ok(idx);
            }
        }
        Err(PipeError::NotInvalidated)
    }

    fn invalidate_cache(&self) -> PipeResult<()> {
        let mut state = self.state.lock().unwrap();
        let mut any_pending = false;
        for idx in 0..state.chunks.len() {
            if state.chunks[idx].status == ChunkStatus::Full {
                if state.borrows.chunk_is_borrowed(idx) {
                    state.chunks[idx].pending_invalidate = true;
                    any_pending = true;
                } else {
                    state.chunks[idx].status = ChunkStatus::Invalid;
                    state.chunks[idx].pending_invalidate = false;
                }
            }
        }
        state.invalidation_in_progress = any_pending;
        Ok(())
    }
}

fn try_alloc(size: usize) -> Option<Box<[u8]>> {
    let mut v: Vec<u8> = Vec::new();
    v.try_reserve_exact(size).ok()?;
    v.resize(size, 0);
    Some(v.into_boxed_slice())
}

fn spawn_producer(inner: Arc<Inner>) {
    let handle = std::thread::Builder::new()
        .name("content-pipe-producer".into())
        .spawn(move || producer_loop(inner.clone()))
        .expect("failed to spawn producer thread");
    *inner.producer.lock().unwrap() = Some(handle);
}

fn producer_loop(inner: Arc<Inner>) {
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let (paused, hard_stop) = {
            let state = inner.state.lock().unwrap();
            (state.caching_paused, state.hard_stop)
        };
        if !paused && !hard_stop {
            let _g = inner.write_lock.lock().unwrap();
            if let Err(e) = inner.do_read() {
                tracing::debug!(error = %e, "producer do_read step did not advance");
            }
        }
        let sleep = if inner.is_streaming {
            PRODUCER_IDLE_SLEEP_STREAMING
        } else {
            PRODUCER_IDLE_SLEEP
        };
        inner.signal.wait_timeout(sleep);
    }
}
