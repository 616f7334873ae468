// Controller thread: sole owner of the session, the state machine and the renderer

use crate::decode_worker::{DecoderEvent, DecoderMessage};
use crate::session::{Notice, PlaybackSession, Services};
use crossbeam_channel::{select, tick, Receiver, Sender};
use spool_core::{
    AudioError, CallbackEvent, CallbackManager, ErrorKind, PlaybackStatus, PlayerState,
    PlayerStateContainer, Result, TrackSource,
};
use spool_renderer_api::AudioRenderer;
use spool_transport::FetchMessage;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimum spacing of repeated underrun warnings
const UNDERRUN_WARNING_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub(crate) enum Command {
    Play(TrackSource),
    Pause,
    Resume,
    Seek(u64),
    Stop,
    SetVolume(f32),
    Shutdown,
}

pub(crate) struct Request {
    pub command: Command,
    pub reply: Sender<Result<()>>,
}

pub(crate) struct Controller {
    services: Services,
    state: PlayerStateContainer,
    callbacks: Arc<CallbackManager>,
    renderer: Box<dyn AudioRenderer>,
    session: Option<PlaybackSession>,
    /// The user asked for pause; survives seeks and buffering
    paused: bool,
    rendering: bool,
    last_underrun_warning: Option<Instant>,
    last_position: Option<u64>,
    last_received: Option<u64>,
}

impl Controller {
    pub fn new(
        services: Services,
        state: PlayerStateContainer,
        callbacks: Arc<CallbackManager>,
        renderer: Box<dyn AudioRenderer>,
    ) -> Self {
        Self {
            services,
            state,
            callbacks,
            renderer,
            session: None,
            paused: false,
            rendering: false,
            last_underrun_warning: None,
            last_position: None,
            last_received: None,
        }
    }

    pub fn run(
        mut self,
        requests: Receiver<Request>,
        fetch_rx: Receiver<FetchMessage>,
        decoder_rx: Receiver<DecoderMessage>,
    ) {
        log::info!("[engine] controller started");
        let ticker = tick(self.services.config.engine.tick());

        loop {
            select! {
                recv(requests) -> request => {
                    let Ok(Request { command, reply }) = request else {
                        self.shutdown();
                        break;
                    };
                    let shutdown = matches!(command, Command::Shutdown);
                    let result = self.handle(command);
                    let _ = reply.send(result);
                    if shutdown {
                        break;
                    }
                }
                recv(fetch_rx) -> msg => {
                    if let Ok(msg) = msg {
                        self.on_fetch(msg);
                    }
                }
                recv(decoder_rx) -> msg => {
                    if let Ok(msg) = msg {
                        self.on_decoder(msg);
                    }
                }
                recv(ticker) -> _ => self.on_tick(),
            }
        }
        log::info!("[engine] controller stopped");
    }

    fn handle(&mut self, command: Command) -> Result<()> {
        log::debug!("[engine] command {:?} in {:?}", command, self.state.get_state());
        match command {
            Command::Play(source) => self.play(source),
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::Seek(position_ms) => self.seek(position_ms),
            Command::Stop => {
                self.stop();
                Ok(())
            }
            Command::SetVolume(volume) => {
                self.services.engine.set_volume(volume);
                self.state.update_status(|status| status.volume = volume);
                Ok(())
            }
            Command::Shutdown => {
                self.shutdown();
                Ok(())
            }
        }
    }

    fn play(&mut self, source: TrackSource) -> Result<()> {
        self.teardown();
        self.paused = false;
        self.reset_status();
        self.set_state(PlayerState::Preparing)?;

        match PlaybackSession::start(source, &self.services) {
            Ok(session) => {
                self.session = Some(session);
                self.service_session();
            }
            Err(e) => self.fail(e),
        }
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        let state = self.state.get_state();
        match state {
            PlayerState::Paused => return Ok(()),
            PlayerState::Idle | PlayerState::Finished | PlayerState::Failed => {
                return Err(AudioError::InvalidState(format!("Cannot pause while {:?}", state)));
            }
            _ => {}
        }

        self.paused = true;
        if let Some(session) = self.session.as_mut() {
            session.pause_fetching();
        }
        // A seek in flight settles into Paused on its own
        if state != PlayerState::Seeking {
            self.set_state(PlayerState::Paused)?;
        }
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        let state = self.state.get_state();
        match state {
            PlayerState::Paused | PlayerState::Seeking => {}
            PlayerState::Preparing
            | PlayerState::Buffering
            | PlayerState::Playing
            | PlayerState::Stalled => return Ok(()),
            PlayerState::Idle | PlayerState::Finished | PlayerState::Failed => {
                return Err(AudioError::InvalidState(format!("Cannot resume while {:?}", state)));
            }
        }

        self.paused = false;
        if let Some(session) = self.session.as_mut() {
            session.resume_fetching();
        }
        if state == PlayerState::Seeking {
            return Ok(());
        }

        let next = match &self.session {
            Some(session) if session.format.is_none() => PlayerState::Preparing,
            Some(session) if session.is_ready() => PlayerState::Playing,
            _ => PlayerState::Buffering,
        };
        self.set_state(next)
    }

    fn seek(&mut self, position_ms: u64) -> Result<()> {
        let state = self.state.get_state();
        let Some(session) = self.session.as_mut() else {
            return Err(AudioError::InvalidState(format!("Cannot seek while {:?}", state)));
        };

        if session.format.is_none() {
            log::debug!("[engine] deferring seek to {} ms until the stream opens", position_ms);
            session.pending_seek = Some(position_ms);
            return Ok(());
        }
        self.begin_seek(position_ms)
    }

    fn begin_seek(&mut self, position_ms: u64) -> Result<()> {
        let duration = self.session.as_ref().and_then(|s| s.duration_ms());

        if let Some(duration) = duration.filter(|d| position_ms >= *d) {
            log::info!(
                "[engine] seek to {} ms is past the end ({} ms)",
                position_ms,
                duration
            );
            if let Some(session) = self.session.as_mut() {
                session.seek_target = None;
            }
            self.services.engine.flush(duration);
            self.state.update_status(|status| status.position_ms = duration);
            return self.set_state(PlayerState::Finished);
        }

        self.set_state(PlayerState::Seeking)?;
        self.services.engine.flush(position_ms);
        self.state.update_status(|status| status.position_ms = position_ms);
        if let Some(session) = self.session.as_mut() {
            log::info!("[engine] seeking to {} ms", position_ms);
            session.seek(position_ms);
        }
        Ok(())
    }

    fn stop(&mut self) {
        self.teardown();
        self.paused = false;
        self.reset_status();
        if let Err(e) = self.set_state(PlayerState::Idle) {
            log::warn!("[engine] stop: {}", e);
        }
    }

    fn shutdown(&mut self) {
        self.stop();
        if let Err(e) = self.renderer.release() {
            log::warn!("[renderer] release failed: {}", e);
        }
    }

    /// End the session with a terminal error
    fn fail(&mut self, error: AudioError) {
        let kind = error.kind().unwrap_or(ErrorKind::PersistentSource);
        log::error!("[engine] playback failed ({:?}): {}", kind, error);
        self.teardown();
        if let Err(e) = self.set_state(PlayerState::Failed) {
            log::warn!("[engine] {}", e);
        }
        self.callbacks.dispatch_event(CallbackEvent::Error {
            kind,
            message: error.to_string(),
        });
    }

    fn warn(&self, kind: ErrorKind, message: String) {
        log::warn!("[engine] {:?}: {}", kind, message);
        self.callbacks
            .dispatch_event(CallbackEvent::Warning { kind, message });
    }

    fn teardown(&mut self) {
        self.set_rendering(false);
        let Some(session) = self.session.take() else {
            return;
        };

        let id = session.track.id.clone();
        session.shutdown();
        self.services.engine.flush(0);

        let cache = &self.services.cache;
        if self.services.config.cache.remove_on_teardown {
            if let Err(e) = cache.remove(&id) {
                log::warn!("[cache] failed to remove {}: {}", id, e);
            }
        }
        let evicted = cache.evict_if_needed(self.services.config.cache.budget_bytes);
        if !evicted.is_empty() {
            log::info!("[cache] evicted {} entries", evicted.len());
        }
    }

    fn set_state(&mut self, to: PlayerState) -> Result<()> {
        let from = self.state.get_state();
        if from == to {
            return Ok(());
        }
        self.state.transition(to)?;
        self.set_rendering(to == PlayerState::Playing);
        log::info!("[engine] {:?} -> {:?}", from, to);
        self.callbacks.dispatch_event(CallbackEvent::StateChanged {
            old_state: from,
            new_state: to,
        });
        Ok(())
    }

    /// Let the device pull PCM, or hold it on silence
    fn set_rendering(&mut self, on: bool) {
        if self.rendering == on {
            return;
        }
        self.rendering = on;
        self.services.engine.set_active(on);

        let result = if on {
            self.renderer.start()
        } else {
            self.renderer.pause()
        };
        if let Err(e) = result {
            self.warn(ErrorKind::RenderUnderrun, format!("output device: {}", e));
        }
    }

    fn reset_status(&mut self) {
        self.last_position = None;
        self.last_received = None;
        self.state.update_status(|status| {
            *status = PlaybackStatus {
                volume: status.volume,
                ..PlaybackStatus::default()
            };
        });
    }

    fn live_session(&mut self, session_id: u64) -> Option<&mut PlaybackSession> {
        self.session.as_mut().filter(|s| s.id() == session_id)
    }

    fn on_fetch(&mut self, msg: FetchMessage) {
        let now = Instant::now();
        let Some(session) = self.live_session(msg.session) else {
            return;
        };
        let notices = session.on_fetch(msg, now);
        self.apply(notices);
    }

    fn on_decoder(&mut self, msg: DecoderMessage) {
        let Some(session) = self.live_session(msg.session) else {
            return;
        };

        match msg.event {
            DecoderEvent::Opened(format) => {
                session.format = Some(format);
                session.track.format = Some(format);
                let pending_seek = session.pending_seek.take();
                self.state
                    .update_status(|status| status.duration_ms = format.duration_ms.unwrap_or(0));

                if self.state.get_state() == PlayerState::Preparing {
                    let next = if self.paused {
                        PlayerState::Paused
                    } else {
                        PlayerState::Buffering
                    };
                    if let Err(e) = self.set_state(next) {
                        log::warn!("[engine] {}", e);
                    }
                }
                if let Some(position_ms) = pending_seek {
                    if let Err(e) = self.begin_seek(position_ms) {
                        log::warn!("[engine] deferred seek: {}", e);
                    }
                }
            }
            DecoderEvent::OpenFailed(error) | DecoderEvent::Failed(error) => self.fail(error),
            DecoderEvent::FrameErrors(errors) => {
                for message in errors {
                    self.warn(ErrorKind::DecoderFrame, message);
                }
            }
            DecoderEvent::Seeked {
                target_ms,
                actual_ms,
            } => {
                if session.seek_target != Some(target_ms) {
                    return;
                }
                session.seek_target = None;
                self.services.engine.reset_position(actual_ms);
                self.state.update_status(|status| status.position_ms = actual_ms);
                self.finish_seek();
            }
            DecoderEvent::SeekFailed { target_ms, error } => {
                if session.seek_target != Some(target_ms) {
                    return;
                }
                session.seek_target = None;
                self.warn(
                    ErrorKind::DecoderFrame,
                    format!("seek to {} ms failed: {}", target_ms, error),
                );
                self.finish_seek();
            }
        }
    }

    fn finish_seek(&mut self) {
        if self.state.get_state() != PlayerState::Seeking {
            return;
        }
        let next = if self.paused {
            PlayerState::Paused
        } else {
            PlayerState::Buffering
        };
        if let Err(e) = self.set_state(next) {
            log::warn!("[engine] {}", e);
        }
    }

    fn on_tick(&mut self) {
        if self.session.is_none() {
            return;
        }
        self.service_session();
        self.advance_state();
        self.publish_status();
    }

    fn service_session(&mut self) {
        let now = Instant::now();
        if let Some(session) = self.session.as_mut() {
            let notices = session.service(now);
            self.apply(notices);
        }
    }

    fn apply(&mut self, notices: Vec<Notice>) {
        for notice in notices {
            match notice {
                Notice::Warning { kind, message } => self.warn(kind, message),
                Notice::Fatal(error) => {
                    self.fail(error);
                    return;
                }
            }
        }
    }

    /// Watermark and drain driven transitions
    fn advance_state(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let engine = &self.services.engine;
        let ready = session.is_ready();
        let starved = session.is_starved();
        let duration = session.duration_ms();

        let next = match self.state.get_state() {
            PlayerState::Buffering if ready => Some(PlayerState::Playing),
            PlayerState::Stalled if ready => Some(PlayerState::Playing),
            PlayerState::Playing if engine.is_drained() => Some(PlayerState::Finished),
            PlayerState::Playing if engine.take_underrun() => {
                if starved {
                    Some(PlayerState::Stalled)
                } else {
                    self.underrun_warning();
                    None
                }
            }
            _ => None,
        };

        if let Some(next) = next {
            if next == PlayerState::Finished {
                if let Some(duration) = duration {
                    self.state.update_status(|status| status.position_ms = duration);
                }
            }
            if let Err(e) = self.set_state(next) {
                log::warn!("[engine] {}", e);
            }
        }
    }

    fn underrun_warning(&mut self) {
        let now = Instant::now();
        let due = self
            .last_underrun_warning
            .map_or(true, |at| now.duration_since(at) >= UNDERRUN_WARNING_INTERVAL);
        if due {
            self.last_underrun_warning = Some(now);
            let count = self.services.engine.underrun_count();
            self.warn(
                ErrorKind::RenderUnderrun,
                format!("decoder fell behind the device ({} short pulls)", count),
            );
        }
    }

    fn publish_status(&mut self) {
        let now = Instant::now();
        let state = self.state.get_state();
        let engine = self.services.engine.clone();
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let duration = session.duration_ms();
        let position = match state {
            PlayerState::Finished => duration.unwrap_or_else(|| engine.position_ms()),
            PlayerState::Preparing => 0,
            _ => {
                let position = engine.position_ms();
                duration.map_or(position, |d| position.min(d))
            }
        };
        let expected = session.total_len();
        let received = session.received_len();
        let speed = session.download_speed(now);
        let buffered = session.buffer.available();

        self.state.update_status(|status| {
            status.position_ms = position;
            status.duration_ms = duration.unwrap_or(0);
            status.volume = engine.volume();
            status.expected_length = expected;
            status.received_length = received;
            status.buffering_ratio = match expected {
                Some(total) if total > 0 => (received as f64 / total as f64).min(1.0),
                _ => 0.0,
            };
            status.download_speed = speed;
            status.buffered_bytes = buffered;
        });

        if self.last_position != Some(position) && state == PlayerState::Playing {
            self.last_position = Some(position);
            self.callbacks.dispatch_event(CallbackEvent::PositionChanged {
                position_ms: position,
                duration_ms: duration.unwrap_or(0),
            });
        }
        if self.last_received != Some(received) {
            self.last_received = Some(received);
            self.callbacks.dispatch_event(CallbackEvent::DownloadProgress {
                received,
                expected,
                bytes_per_sec: speed,
            });
        }
    }
}
