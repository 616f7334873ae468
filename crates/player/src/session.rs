// One playback session: cache entry, fetch transfers, byte buffer and decode thread

use crate::backoff::Backoff;
use crate::decode_worker::{DecodeWorker, DecoderMessage, WorkerCommand};
use crossbeam_channel::{unbounded, Sender};
use spool_cache::{CacheHandle, CacheStore};
use spool_core::{
    AudioError, DecoderFactory, ErrorKind, FormatInfo, PlayerConfig, Result, SessionToken, Track,
    TrackSource,
};
use spool_engine::PlaybackEngine;
use spool_source_buffer::{FillLevel, StreamingBuffer};
use spool_transport::{FetchEvent, FetchMessage, FetchSink, FetcherFactory, SourceFetcher};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Largest cache read per pump step
const PUMP_CHUNK: usize = 64 * 1024;

/// Window for the download speed estimate
const SPEED_WINDOW: Duration = Duration::from_secs(1);

/// Something the controller must act on
#[derive(Debug)]
pub(crate) enum Notice {
    Warning { kind: ErrorKind, message: String },
    /// The session cannot continue
    Fatal(AudioError),
}

/// Long-lived pieces every session is built from
pub(crate) struct Services {
    pub config: PlayerConfig,
    pub cache: Arc<CacheStore>,
    pub fetchers: Arc<dyn FetcherFactory>,
    pub decoders: Arc<dyn DecoderFactory>,
    pub engine: Arc<PlaybackEngine>,
    pub fetch_tx: Sender<FetchMessage>,
    pub decoder_tx: Sender<DecoderMessage>,
}

/// The transfer whose events drive control
#[derive(Debug)]
struct ActiveFetch {
    generation: u64,
    /// Offset the transfer delivers next
    next: u64,
    delivered: u64,
    last_bytes: Instant,
}

/// Bytes per second over a sliding window
#[derive(Debug, Default)]
pub(crate) struct SpeedMeter {
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedMeter {
    pub fn record(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.prune(now);
    }

    pub fn bytes_per_sec(&mut self, now: Instant) -> u64 {
        self.prune(now);
        let total: u64 = self.samples.iter().map(|(_, bytes)| bytes).sum();
        total * 1000 / SPEED_WINDOW.as_millis() as u64
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > SPEED_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

pub(crate) struct PlaybackSession {
    pub token: SessionToken,
    pub track: Track,
    pub buffer: StreamingBuffer,
    /// Set once the decoder has parsed the header
    pub format: Option<FormatInfo>,
    /// Seek requested before the decoder opened
    pub pending_seek: Option<u64>,
    /// Target of the seek in flight
    pub seek_target: Option<u64>,

    cache: Arc<CacheStore>,
    handle: CacheHandle,
    fetcher: Box<dyn SourceFetcher>,
    sink: FetchSink,
    fetch: Option<ActiveFetch>,
    backoff: Backoff,
    stall_timeout: Duration,
    capacity: usize,
    fetch_while_paused: bool,
    fetch_paused: bool,
    /// The source failed for good; play out what the cache holds
    source_failed: bool,

    /// Cache unusable: out-of-order bytes are held here instead
    degraded: bool,
    pending: BTreeMap<u64, Vec<u8>>,
    pending_bytes: usize,
    pending_limit: usize,
    /// Over the pending limit; fetching waits for the decoder to catch up
    suspended: bool,

    speed: SpeedMeter,
    worker_tx: Sender<WorkerCommand>,
    worker: Option<JoinHandle<()>>,
}

impl PlaybackSession {
    pub fn start(source: TrackSource, services: &Services) -> Result<Self> {
        let mut track = Track::new(source);
        let fetcher = services.fetchers.create(&track.source)?;
        let handle = services.cache.open(&track.id)?;
        services.cache.pin(&track.id);

        let token = SessionToken::new();
        let buffer = StreamingBuffer::new(&services.config.buffer);
        if let Some(total) = services.cache.total_len(&handle) {
            buffer.set_total_len(total);
            track.byte_len = Some(total);
        }

        let (worker_tx, worker_rx) = unbounded();
        let spawned = DecodeWorker {
            token: token.clone(),
            buffer: buffer.clone(),
            hint: track.source.extension_hint(),
            decoders: services.decoders.clone(),
            engine: services.engine.clone(),
            commands: worker_rx,
            events: services.decoder_tx.clone(),
            idle: services.config.engine.tick(),
        }
        .spawn();
        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => {
                services.cache.close(&handle);
                services.cache.unpin(&track.id);
                return Err(e);
            }
        };

        log::info!(
            "[session {}] starting {} ({} bytes cached)",
            token.id(),
            track.source,
            services.cache.covered_len(&handle)
        );

        Ok(Self {
            sink: FetchSink::new(token.id(), services.fetch_tx.clone()),
            token,
            track,
            buffer,
            format: None,
            pending_seek: None,
            seek_target: None,
            cache: services.cache.clone(),
            handle,
            fetcher,
            fetch: None,
            backoff: Backoff::new(services.config.retry.clone()),
            stall_timeout: services.config.fetch.stall_timeout(),
            capacity: services.config.buffer.capacity,
            fetch_while_paused: services.config.fetch.fetch_while_paused,
            fetch_paused: false,
            source_failed: false,
            degraded: false,
            pending: BTreeMap::new(),
            pending_bytes: 0,
            pending_limit: services.config.buffer.pending_limit,
            suspended: false,
            speed: SpeedMeter::default(),
            worker_tx,
            worker: Some(worker),
        })
    }

    pub fn id(&self) -> u64 {
        self.token.id()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.format.and_then(|f| f.duration_ms)
    }

    pub fn total_len(&self) -> Option<u64> {
        self.track.byte_len
    }

    /// Bytes available to this session, cached or held in memory
    pub fn received_len(&self) -> u64 {
        if self.degraded {
            self.pending_bytes as u64 + self.buffer.available() as u64
        } else {
            self.cache.covered_len(&self.handle)
        }
    }

    pub fn download_speed(&mut self, now: Instant) -> u64 {
        self.speed.bytes_per_sec(now)
    }

    pub fn is_fetching(&self) -> bool {
        self.fetch.is_some()
    }

    /// Whether the buffer holds enough to start or continue playback
    pub fn is_ready(&self) -> bool {
        self.buffer.fill_level() == FillLevel::Sated || self.buffer.is_end_of_stream()
    }

    pub fn is_starved(&self) -> bool {
        self.buffer.fill_level() == FillLevel::Starved && !self.buffer.is_end_of_stream()
    }

    /// Hand a seek to the decode thread, waking it if it is blocked on bytes
    pub fn seek(&mut self, target_ms: u64) {
        self.seek_target = Some(target_ms);
        self.buffer.interrupt();
        if self.worker_tx.send(WorkerCommand::Seek(target_ms)).is_err() {
            log::warn!("[session {}] decode thread is gone", self.id());
        }
    }

    pub fn pause_fetching(&mut self) {
        if self.fetch_while_paused {
            return;
        }
        if self.fetch.take().is_some() {
            self.fetcher.cancel();
            log::debug!("[fetch] paused with playback");
        }
        self.fetch_paused = true;
    }

    pub fn resume_fetching(&mut self) {
        self.fetch_paused = false;
    }

    /// Apply one fetcher event
    pub fn on_fetch(&mut self, msg: FetchMessage, now: Instant) -> Vec<Notice> {
        let mut notices = Vec::new();
        let live = self
            .fetch
            .as_ref()
            .map_or(false, |f| f.generation == msg.generation);

        match msg.event {
            FetchEvent::Opened { offset, total_len } => {
                if live {
                    log::debug!(
                        "[fetch] transfer {} opened at {} of {:?}",
                        msg.generation,
                        offset,
                        total_len
                    );
                    if let Some(total) = total_len {
                        self.set_total_len(total, &mut notices);
                    }
                }
            }
            FetchEvent::Chunk { offset, bytes } => {
                // Stale transfers still fill the cache
                self.store(offset, &bytes, &mut notices);
                if live {
                    let len = bytes.len() as u64;
                    if let Some(fetch) = self.fetch.as_mut() {
                        fetch.next = offset + len;
                        fetch.delivered += len;
                        fetch.last_bytes = now;
                    }
                    self.backoff.reset();
                    self.speed.record(now, len);
                }
            }
            FetchEvent::Complete { end } => {
                let finished = if live { self.fetch.take() } else { None };
                if let Some(fetch) = finished {
                    log::info!("[fetch] transfer {} complete at byte {}", fetch.generation, end);
                    match self.total_len() {
                        None => self.set_total_len(end, &mut notices),
                        Some(total) if end < total && fetch.delivered == 0 => {
                            let error = AudioError::PersistentSource(format!(
                                "source ends at byte {} of {}",
                                end, total
                            ));
                            notices.push(self.source_error(error, now));
                        }
                        _ => {}
                    }
                } else if !live {
                    log::trace!("[fetch] stale transfer {} complete", msg.generation);
                }
            }
            FetchEvent::Failed(error) => {
                if live {
                    self.fetch = None;
                    log::warn!("[fetch] transfer {} failed: {}", msg.generation, error);
                    notices.push(self.source_error(error, now));
                } else {
                    log::debug!("[fetch] stale transfer {} failed: {}", msg.generation, error);
                }
            }
        }

        self.pump(&mut notices);
        notices
    }

    /// Periodic upkeep: refill the buffer, keep a transfer running where needed
    pub fn service(&mut self, now: Instant) -> Vec<Notice> {
        let mut notices = Vec::new();

        if let Some(offset) = self.buffer.take_reposition() {
            log::debug!("[buffer] decoder repositioned to byte {}", offset);
        }
        self.pump(&mut notices);

        if self.suspended && self.held_ahead() <= self.pending_limit as u64 / 2 {
            log::debug!("[fetch] pending bytes drained, resuming");
            self.suspended = false;
        }

        self.check_stall(now, &mut notices);
        self.ensure_fetch(now, &mut notices);

        if self.source_failed && self.is_exhausted() {
            notices.push(Notice::Fatal(AudioError::PersistentSource(
                "source unavailable and cached bytes exhausted".to_string(),
            )));
        }
        notices
    }

    /// Stop every worker and release the cache entry
    pub fn shutdown(mut self) {
        self.token.revoke();
        self.fetcher.cancel();
        let _ = self.worker_tx.send(WorkerCommand::Stop);
        self.buffer.close();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("[decoder] decode thread panicked");
            }
        }
        self.cache.close(&self.handle);
        self.cache.unpin(&self.track.id);
        log::info!("[session {}] torn down", self.id());
    }

    fn set_total_len(&mut self, total: u64, notices: &mut Vec<Notice>) {
        self.track.byte_len = Some(total);
        self.buffer.set_total_len(total);
        if !self.degraded {
            if let Err(e) = self.cache.set_total_len(&self.handle, total) {
                self.degrade(e, notices);
            }
        }
    }

    fn degrade(&mut self, error: AudioError, notices: &mut Vec<Notice>) {
        if self.degraded {
            return;
        }
        log::warn!("[session {}] cache unusable, streaming from memory: {}", self.id(), error);
        self.degraded = true;
        notices.push(Notice::Warning {
            kind: ErrorKind::CacheIo,
            message: error.to_string(),
        });
    }

    fn store(&mut self, offset: u64, bytes: &[u8], notices: &mut Vec<Notice>) {
        if !self.degraded {
            match self.cache.write_range(&self.handle, offset, bytes) {
                Ok(_) => return,
                Err(e) => self.degrade(e, notices),
            }
        }

        // Only the window just past the cursor is held; anything further is re-fetched later
        let write = self.buffer.write_offset();
        let limit = write + self.pending_limit as u64;
        let start = self.covered_end(offset.max(write));
        let end = (offset + bytes.len() as u64).min(limit);
        if end <= start {
            return;
        }
        let data = bytes[(start - offset) as usize..(end - offset) as usize].to_vec();
        self.pending_bytes += data.len();
        if let Some(old) = self.pending.insert(start, data) {
            self.pending_bytes -= old.len();
        }

        if !self.suspended && self.held_ahead() >= self.pending_limit as u64 {
            log::warn!(
                "[fetch] {} bytes pending without a cache, holding the transfer",
                self.pending_bytes
            );
            self.suspended = true;
            self.fetcher.cancel();
            self.fetch = None;
        }
    }

    /// Pending bytes contiguous from the buffer's write cursor
    fn held_ahead(&self) -> u64 {
        let write = self.buffer.write_offset();
        self.covered_end(write) - write
    }

    /// Move cached (or pending) bytes into the buffer at its write cursor
    fn pump(&mut self, notices: &mut Vec<Notice>) {
        loop {
            if self.buffer.is_closed() {
                return;
            }
            let space = self.buffer.space();
            if space == 0 {
                return;
            }
            let at = self.buffer.write_offset();
            if self.total_len().map_or(false, |total| at >= total) {
                return;
            }

            let data = if self.degraded {
                self.take_pending(at, space)
            } else {
                match self.cache.read_range(&self.handle, at, space.min(PUMP_CHUNK)) {
                    Ok(read) => read.into_data(),
                    Err(e) => {
                        self.degrade(e, notices);
                        continue;
                    }
                }
            };
            if data.is_empty() {
                return;
            }
            if self.buffer.push_at(at, &data).accepted == 0 {
                return;
            }
        }
    }

    fn take_pending(&mut self, at: u64, max: usize) -> Vec<u8> {
        // Everything behind the cursor has been pushed already
        while let Some((&start, data)) = self.pending.first_key_value() {
            if start + data.len() as u64 > at {
                break;
            }
            self.pending_bytes -= data.len();
            self.pending.remove(&start);
        }

        match self.pending.range(..=at).next_back() {
            Some((&start, data)) if start + data.len() as u64 > at => {
                let from = (at - start) as usize;
                let to = data.len().min(from + max);
                data[from..to].to_vec()
            }
            _ => Vec::new(),
        }
    }

    /// End of the run of available bytes starting at `from`
    fn covered_end(&self, from: u64) -> u64 {
        if !self.degraded {
            return self.cache.resume_offset(&self.handle, from);
        }
        let mut end = from;
        while let Some((&start, data)) = self.pending.range(..=end).next_back() {
            let next = start + data.len() as u64;
            if next <= end {
                break;
            }
            end = next;
        }
        end
    }

    fn check_stall(&mut self, now: Instant, notices: &mut Vec<Notice>) {
        let stalled = match &self.fetch {
            Some(fetch) => self.is_starved() && now.duration_since(fetch.last_bytes) >= self.stall_timeout,
            None => false,
        };
        if !stalled {
            return;
        }

        log::warn!(
            "[fetch] no bytes for {} ms while starved, restarting transfer",
            self.stall_timeout.as_millis()
        );
        self.fetcher.cancel();
        self.fetch = None;
        let error = AudioError::TransientNetwork(format!(
            "no data for {} ms",
            self.stall_timeout.as_millis()
        ));
        notices.push(self.source_error(error, now));
    }

    fn ensure_fetch(&mut self, now: Instant, notices: &mut Vec<Notice>) {
        if self.source_failed || self.suspended || self.fetch_paused {
            return;
        }
        if self.backoff.is_waiting() && !self.backoff.take_due(now) {
            return;
        }

        let at = self.buffer.write_offset();
        let gap = self.covered_end(at);
        let needed = self.total_len().map_or(true, |total| gap < total);

        match self.fetch.as_ref().map(|f| f.next) {
            None if needed => self.start_fetch(gap, now, notices),
            None => {
                // Playback is covered to the end; fill earlier holes in the background
                if !self.degraded && !self.cache.is_complete(&self.handle) {
                    let hole = self.cache.resume_offset(&self.handle, 0);
                    if self.total_len().map_or(false, |total| hole < total) {
                        self.start_fetch(hole, now, notices);
                    }
                }
            }
            Some(next) if needed => {
                let ahead = next > gap;
                let far_behind = gap - next.min(gap) > self.capacity as u64;
                if ahead || far_behind {
                    log::debug!(
                        "[fetch] transfer at byte {} cannot serve byte {}, restarting",
                        next,
                        gap
                    );
                    self.start_fetch(gap, now, notices);
                }
            }
            Some(_) => {}
        }
    }

    fn start_fetch(&mut self, from: u64, now: Instant, notices: &mut Vec<Notice>) {
        match self.fetcher.start(from, self.sink.clone()) {
            Ok(generation) => {
                log::info!("[fetch] transfer {} from byte {}", generation, from);
                self.fetch = Some(ActiveFetch {
                    generation,
                    next: from,
                    delivered: 0,
                    last_bytes: now,
                });
            }
            Err(e) => {
                self.fetch = None;
                notices.push(self.source_error(e, now));
            }
        }
    }

    fn source_error(&mut self, error: AudioError, now: Instant) -> Notice {
        if error.is_transient() {
            return match self.backoff.schedule(now) {
                Some(delay) => Notice::Warning {
                    kind: ErrorKind::TransientNetwork,
                    message: format!("{}; retrying in {} ms", error, delay.as_millis()),
                },
                None => Notice::Fatal(AudioError::TransientNetwork(format!(
                    "giving up after {} retries: {}",
                    self.backoff.attempts(),
                    error
                ))),
            };
        }

        if self.received_len() == 0 {
            return Notice::Fatal(error);
        }
        self.source_failed = true;
        Notice::Warning {
            kind: error.kind().unwrap_or(ErrorKind::PersistentSource),
            message: format!("{}; playing cached bytes only", error),
        }
    }

    /// Nothing left to play and nothing more can arrive
    fn is_exhausted(&self) -> bool {
        let at = self.buffer.write_offset();
        self.buffer.available() == 0 && !self.buffer.is_end_of_stream() && self.covered_end(at) == at
    }
}
