// Public player: a command channel in front of the controller thread

use crate::controller::{Command, Controller, Request};
use crate::session::Services;
use crossbeam_channel::{bounded, unbounded, Sender};
use spool_cache::CacheStore;
use spool_core::{
    AudioError, AudioPlayer, CallbackManager, DecoderFactory, PlaybackStatus, PlayerCallback,
    PlayerConfig, PlayerState, PlayerStateContainer, Result, TrackSource,
};
use spool_decode_symphonia::SymphoniaDecoderFactory;
use spool_engine::PlaybackEngine;
use spool_renderer_api::{AudioRenderer, AudioSpec};
use spool_renderer_cpal::CpalRenderer;
use spool_transport::{DefaultFetcherFactory, FetcherFactory};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Assembles a [`Player`]; every collaborator has a default
pub struct PlayerBuilder {
    config: PlayerConfig,
    cache: Option<Arc<CacheStore>>,
    fetchers: Option<Arc<dyn FetcherFactory>>,
    decoders: Option<Arc<dyn DecoderFactory>>,
    renderer: Option<Box<dyn AudioRenderer>>,
}

impl PlayerBuilder {
    pub fn new() -> Self {
        Self {
            config: PlayerConfig::default(),
            cache: None,
            fetchers: None,
            decoders: None,
            renderer: None,
        }
    }

    pub fn config(mut self, config: PlayerConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a cache store between players
    pub fn cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn fetcher_factory(mut self, fetchers: Arc<dyn FetcherFactory>) -> Self {
        self.fetchers = Some(fetchers);
        self
    }

    pub fn decoder_factory(mut self, decoders: Arc<dyn DecoderFactory>) -> Self {
        self.decoders = Some(decoders);
        self
    }

    pub fn renderer(mut self, renderer: Box<dyn AudioRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn build(self) -> Result<Player> {
        let config = self.config;
        config.validate()?;

        let cache = match self.cache {
            Some(cache) => cache,
            None => Arc::new(CacheStore::from_config(&config.cache)?),
        };
        let cleaned = cache.clean_incomplete();
        if cleaned > 0 {
            log::info!("[cache] removed {} unusable entries", cleaned);
        }

        let fetchers: Arc<dyn FetcherFactory> = match self.fetchers {
            Some(fetchers) => fetchers,
            None => Arc::new(DefaultFetcherFactory::new(&config.fetch)),
        };
        let decoders: Arc<dyn DecoderFactory> = match self.decoders {
            Some(decoders) => decoders,
            None => Arc::new(SymphoniaDecoderFactory),
        };
        let mut renderer: Box<dyn AudioRenderer> = match self.renderer {
            Some(renderer) => renderer,
            None => Box::new(CpalRenderer::new(AudioSpec::default())?),
        };

        let output = AudioSpec {
            sample_rate: renderer.get_sample_rate(),
            channels: renderer.get_channels(),
            buffer_size: renderer.get_buffer_size(),
        };
        let engine = Arc::new(PlaybackEngine::new(output, &config.engine));
        renderer.set_audio_callback(engine.callback())?;

        let (fetch_tx, fetch_rx) = unbounded();
        let (decoder_tx, decoder_rx) = unbounded();
        let (request_tx, request_rx) = unbounded();

        let state = PlayerStateContainer::new();
        let callbacks = Arc::new(CallbackManager::new());
        let controller = Controller::new(
            Services {
                config: config.clone(),
                cache: cache.clone(),
                fetchers,
                decoders,
                engine,
                fetch_tx,
                decoder_tx,
            },
            state.clone(),
            callbacks.clone(),
            renderer,
        );

        let handle = thread::Builder::new()
            .name("spool-controller".to_string())
            .spawn(move || controller.run(request_rx, fetch_rx, decoder_rx))
            .map_err(|e| AudioError::Io(format!("spawn controller thread: {}", e)))?;

        log::info!(
            "[engine] player ready: {} Hz, {} ch output",
            output.sample_rate,
            output.channels
        );

        Ok(Player {
            requests: Some(request_tx),
            controller: Some(handle),
            state,
            callbacks,
            cache,
            config,
        })
    }
}

impl Default for PlayerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Streaming player with a resumable download cache.
///
/// Every call is forwarded to a single controller thread and answered once
/// that thread has applied it; state and status reads never block on it.
pub struct Player {
    requests: Option<Sender<Request>>,
    controller: Option<JoinHandle<()>>,
    state: PlayerStateContainer,
    callbacks: Arc<CallbackManager>,
    cache: Arc<CacheStore>,
    config: PlayerConfig,
}

impl Player {
    pub fn builder() -> PlayerBuilder {
        PlayerBuilder::new()
    }

    /// Start a track from an already classified source
    pub fn play_source(&mut self, source: TrackSource) -> Result<()> {
        self.request(Command::Play(source))
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn config(&self) -> &PlayerConfig {
        &self.config
    }

    fn request(&self, command: Command) -> Result<()> {
        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| AudioError::InvalidState("Player released".to_string()))?;
        let (reply_tx, reply_rx) = bounded(1);
        requests
            .send(Request {
                command,
                reply: reply_tx,
            })
            .map_err(|_| AudioError::InvalidState("Controller thread is gone".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| AudioError::InvalidState("Controller thread is gone".to_string()))?
    }
}

impl AudioPlayer for Player {
    fn play(&mut self, source: &str) -> Result<()> {
        let source = TrackSource::parse(source)?;
        self.play_source(source)
    }

    fn pause(&mut self) -> Result<()> {
        self.request(Command::Pause)
    }

    fn resume(&mut self) -> Result<()> {
        self.request(Command::Resume)
    }

    fn seek(&mut self, position_ms: u64) -> Result<()> {
        self.request(Command::Seek(position_ms))
    }

    fn stop(&mut self) -> Result<()> {
        self.request(Command::Stop)
    }

    fn set_volume(&mut self, volume: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(AudioError::InvalidState(format!(
                "Volume {} outside 0.0..=1.0",
                volume
            )));
        }
        self.request(Command::SetVolume(volume))
    }

    fn get_state(&self) -> PlayerState {
        self.state.get_state()
    }

    fn get_status(&self) -> PlaybackStatus {
        self.state.get_status()
    }

    fn set_callback(&mut self, callback: Option<Arc<dyn PlayerCallback>>) {
        self.callbacks.clear_callbacks();
        if let Some(callback) = callback {
            self.callbacks
                .add_callback(callback, self.config.engine.position_update_ms);
        }
    }

    fn release(&mut self) -> Result<()> {
        if self.requests.is_none() {
            return Ok(());
        }
        let result = self.request(Command::Shutdown);
        self.requests = None;
        if let Some(controller) = self.controller.take() {
            if controller.join().is_err() {
                log::error!("[engine] controller thread panicked");
            }
        }
        self.callbacks.clear_callbacks();
        result
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("[engine] release on drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{corrupt_frame, track_bytes, wait_until, RawDecoderFactory, Script};
    use spool_core::{CallbackEvent, ErrorKind, RecordingCallback};
    use spool_renderer_api::{NullRenderer, NullRendererHandle};
    use tempfile::TempDir;

    const URL: &str = "https://example.test/episode.raw";

    struct Harness {
        player: Player,
        script: Script,
        output: NullRendererHandle,
        events: Arc<RecordingCallback>,
        dir: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self::with(|_| {})
        }

        fn with(tune: impl FnOnce(&mut PlayerConfig)) -> Self {
            let mut config = PlayerConfig::default();
            config.buffer.capacity = 16_000;
            config.buffer.low_watermark = 2_000;
            config.buffer.high_watermark = 8_000;
            config.buffer.history = 1_000;
            config.engine.ring_ms = 100;
            config.engine.tick_ms = 5;
            config.engine.position_update_ms = 0;
            config.retry.max_retries = 2;
            config.retry.initial_backoff_ms = 20;
            config.retry.max_backoff_ms = 50;
            tune(&mut config);

            let dir = tempfile::tempdir().unwrap();
            let cache = Arc::new(
                CacheStore::open_dir(dir.path().join("cache"))
                    .unwrap()
                    .with_sidecar_interval(std::time::Duration::ZERO),
            );
            let script = Script::default();
            let renderer = NullRenderer::new(AudioSpec {
                sample_rate: 8000,
                channels: 1,
                buffer_size: 80,
            });
            let output = renderer.handle();

            let mut player = PlayerBuilder::new()
                .config(config)
                .cache(cache)
                .fetcher_factory(script.factory())
                .decoder_factory(Arc::new(RawDecoderFactory))
                .renderer(Box::new(renderer))
                .build()
                .unwrap();
            let events = Arc::new(RecordingCallback::new());
            let callback: Arc<dyn PlayerCallback> = events.clone();
            player.set_callback(Some(callback));

            Self {
                player,
                script,
                output,
                events,
                dir,
            }
        }

        fn cache_dir(&self) -> std::path::PathBuf {
            self.dir.path().join("cache")
        }

        fn wait_for_state(&self, state: PlayerState) {
            wait_until(&format!("{:?}", state), || self.player.get_state() == state);
        }

        /// Act as the device until `state` is reached
        fn play_until(&self, state: PlayerState) {
            wait_until(&format!("{:?}", state), || {
                self.output.pull(80);
                self.player.get_state() == state
            });
        }

        fn errors(&self) -> Vec<ErrorKind> {
            self.events
                .events()
                .into_iter()
                .filter_map(|e| match e {
                    CallbackEvent::Error { kind, .. } => Some(kind),
                    _ => None,
                })
                .collect()
        }

        fn warnings(&self) -> Vec<ErrorKind> {
            self.events
                .events()
                .into_iter()
                .filter_map(|e| match e {
                    CallbackEvent::Warning { kind, .. } => Some(kind),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn test_stall_then_recover_to_finish() {
        let mut h = Harness::new();
        let data = track_bytes(100);
        h.player.play(URL).unwrap();
        assert_eq!(h.script.wait_for_starts(1), vec![0]);

        h.script.open(0, Some(data.len() as u64));
        h.script.chunk(0, &data[..14_000]);
        h.wait_for_state(PlayerState::Playing);
        h.play_until(PlayerState::Stalled);

        h.script.chunk(14_000, &data[14_000..]);
        h.script.complete(data.len() as u64);
        h.play_until(PlayerState::Finished);

        assert_eq!(
            h.events.states(),
            vec![
                PlayerState::Preparing,
                PlayerState::Buffering,
                PlayerState::Playing,
                PlayerState::Stalled,
                PlayerState::Playing,
                PlayerState::Finished,
            ]
        );
        assert!(h.errors().is_empty());
        assert_eq!(h.player.get_status().position_ms, 1000);
        assert_eq!(h.player.get_status().duration_ms, 1000);
    }

    #[test]
    fn test_corrupt_frame_is_a_warning() {
        let mut h = Harness::new();
        let mut data = track_bytes(50);
        corrupt_frame(&mut data, 10);

        h.player.play(URL).unwrap();
        h.script.wait_for_starts(1);
        h.script.open(0, Some(data.len() as u64));
        h.script.chunk(0, &data);
        h.script.complete(data.len() as u64);
        h.play_until(PlayerState::Finished);

        assert!(h.warnings().contains(&ErrorKind::DecoderFrame));
        assert!(h.errors().is_empty());
    }

    #[test]
    fn test_malformed_header_fails_once() {
        let mut h = Harness::new();
        let mut data = b"BAD!".to_vec();
        data.extend([0u8; 1000]);

        h.player.play(URL).unwrap();
        h.script.wait_for_starts(1);
        h.script.open(0, Some(data.len() as u64));
        h.script.chunk(0, &data);
        h.wait_for_state(PlayerState::Failed);

        // Let any straggling events land before counting
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(h.events.states(), vec![PlayerState::Preparing, PlayerState::Failed]);
        assert_eq!(h.errors(), vec![ErrorKind::DecoderFormat]);
        assert!(h.player.resume().is_err());
    }

    #[test]
    fn test_persistent_error_without_bytes_fails() {
        let mut h = Harness::new();
        h.player.play(URL).unwrap();
        h.script.wait_for_starts(1);
        h.script.fail(AudioError::PersistentSource("404".to_string()));

        h.wait_for_state(PlayerState::Failed);
        assert_eq!(h.errors(), vec![ErrorKind::PersistentSource]);
    }

    #[test]
    fn test_transient_error_resumes_from_cached_offset() {
        let mut h = Harness::new();
        let data = track_bytes(100);
        h.player.play(URL).unwrap();
        h.script.wait_for_starts(1);
        h.script.open(0, Some(data.len() as u64));
        h.script.chunk(0, &data[..6_000]);
        h.script.fail(AudioError::TransientNetwork("connection reset".to_string()));

        let starts = h.script.wait_for_starts(2);
        assert_eq!(starts, vec![0, 6_000]);
        assert!(h.warnings().contains(&ErrorKind::TransientNetwork));
        assert_ne!(h.player.get_state(), PlayerState::Failed);

        h.script.open(6_000, Some(data.len() as u64));
        h.script.chunk(6_000, &data[6_000..]);
        h.script.complete(data.len() as u64);
        h.play_until(PlayerState::Finished);
        assert!(h.errors().is_empty());
    }

    #[test]
    fn test_exhausted_retries_fail() {
        let mut h = Harness::new();
        h.player.play(URL).unwrap();
        for attempt in 1..=3 {
            h.script.wait_for_starts(attempt);
            h.script.fail(AudioError::TransientNetwork("timed out".to_string()));
        }

        h.wait_for_state(PlayerState::Failed);
        assert_eq!(h.script.starts().len(), 3);
        assert_eq!(h.errors(), vec![ErrorKind::TransientNetwork]);
    }

    #[test]
    fn test_replay_resumes_from_cache() {
        let mut h = Harness::new();
        let data = track_bytes(100);
        h.player.play(URL).unwrap();
        h.script.wait_for_starts(1);
        h.script.open(0, Some(data.len() as u64));
        h.script.chunk(0, &data[..10_000]);
        wait_until("cached bytes", || {
            h.player.get_status().received_length == 10_000
        });

        h.player.play("https://example.test/other.raw").unwrap();
        assert_eq!(h.script.wait_for_starts(2)[1], 0);

        h.player.play(URL).unwrap();
        assert_eq!(h.script.wait_for_starts(3)[2], 10_000);
        assert!(h.player.cache().contains(&TrackSource::parse(URL).unwrap().track_id()));
    }

    #[test]
    fn test_seek_while_paused_stays_paused() {
        let mut h = Harness::new();
        let data = track_bytes(100);
        h.player.play(URL).unwrap();
        h.script.wait_for_starts(1);
        h.script.open(0, Some(data.len() as u64));
        h.script.chunk(0, &data);
        h.script.complete(data.len() as u64);
        h.wait_for_state(PlayerState::Playing);

        h.player.pause().unwrap();
        h.player.seek(500).unwrap();
        wait_until("seek settles", || {
            h.player.get_state() == PlayerState::Paused && h.player.get_status().position_ms == 500
        });

        let states = h.events.states();
        assert_eq!(
            &states[states.len() - 3..],
            &[PlayerState::Paused, PlayerState::Seeking, PlayerState::Paused]
        );

        h.player.resume().unwrap();
        h.play_until(PlayerState::Finished);
        assert_eq!(h.player.get_status().position_ms, 1000);
    }

    #[test]
    fn test_seek_before_open_is_deferred() {
        let mut h = Harness::new();
        let data = track_bytes(100);
        h.player.play(URL).unwrap();
        h.player.seek(300).unwrap();
        assert_eq!(h.player.get_state(), PlayerState::Preparing);

        h.script.wait_for_starts(1);
        h.script.open(0, Some(data.len() as u64));
        h.script.chunk(0, &data);
        h.script.complete(data.len() as u64);
        h.wait_for_state(PlayerState::Playing);

        assert!(h.events.states().contains(&PlayerState::Seeking));
        assert!(h.player.get_status().position_ms >= 300);
    }

    #[test]
    fn test_seek_past_end_finishes() {
        let mut h = Harness::new();
        let data = track_bytes(100);
        h.player.play(URL).unwrap();
        h.script.wait_for_starts(1);
        h.script.open(0, Some(data.len() as u64));
        h.script.chunk(0, &data);
        h.script.complete(data.len() as u64);
        h.wait_for_state(PlayerState::Playing);

        h.player.seek(5_000).unwrap();
        assert_eq!(h.player.get_state(), PlayerState::Finished);
        assert_eq!(h.player.get_status().position_ms, 1000);
        assert!(h.player.resume().is_err());

        // Seeking back from the end replays
        h.player.seek(0).unwrap();
        h.play_until(PlayerState::Finished);
    }

    #[test]
    fn test_commands_rejected_in_idle() {
        let mut h = Harness::new();
        assert!(h.player.pause().is_err());
        assert!(h.player.resume().is_err());
        assert!(h.player.seek(100).is_err());
        assert!(h.player.set_volume(1.5).is_err());
        assert!(h.player.set_volume(f32::NAN).is_err());

        h.player.set_volume(0.5).unwrap();
        assert_eq!(h.player.get_status().volume, 0.5);
        h.player.stop().unwrap();
        assert_eq!(h.player.get_state(), PlayerState::Idle);
    }

    #[test]
    fn test_stop_tears_down_session() {
        let mut h = Harness::new();
        h.player.play(URL).unwrap();
        h.script.wait_for_starts(1);
        h.player.stop().unwrap();

        assert_eq!(h.player.get_state(), PlayerState::Idle);
        assert_eq!(h.player.get_status().position_ms, 0);
        h.player.release().unwrap();
        assert!(h.player.play(URL).is_err());
    }

    #[test]
    fn test_cache_failure_refetches_gap_past_pending_window() {
        let mut h = Harness::with(|config| config.buffer.pending_limit = 4_000);
        let data = track_bytes(100);
        let total = data.len() as u64;
        h.player.play(URL).unwrap();
        h.script.wait_for_starts(1);
        h.script.open(0, Some(total));
        h.script.chunk(0, &data[..16_000]);
        h.wait_for_state(PlayerState::Playing);

        // The disk goes away; bytes far past the cursor cannot be held
        std::fs::remove_dir_all(h.cache_dir()).unwrap();
        h.script.chunk(30_000, &data[30_000..]);

        let starts = h.script.wait_for_starts(2);
        assert!(starts[1] > 0 && starts[1] <= 16_000, "restarted at {}", starts[1]);
        assert!(h.warnings().contains(&ErrorKind::CacheIo));

        let mut served = 1;
        wait_until("Finished", || {
            let starts = h.script.starts();
            if starts.len() > served {
                served = starts.len();
                let from = starts[served - 1] as usize;
                h.script.open(from as u64, Some(total));
                for at in (from..data.len()).step_by(2_000) {
                    let end = (at + 2_000).min(data.len());
                    h.script.chunk(at as u64, &data[at..end]);
                }
                h.script.complete(total);
            }
            h.output.pull(80);
            h.player.get_state() == PlayerState::Finished
        });

        assert!(h.errors().is_empty());
        assert_eq!(h.player.get_status().position_ms, 1000);
    }
}
