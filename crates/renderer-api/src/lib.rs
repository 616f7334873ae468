// Audio output boundary

use parking_lot::Mutex;
use spool_core::{AudioError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Pull callback run on the output's real-time thread.
///
/// Fills the slice with interleaved f32 samples and returns how many it wrote.
/// It must not block or allocate.
pub type AudioCallback = Box<dyn FnMut(&mut [f32]) -> usize + Send + 'static>;

/// An audio output device.
///
/// The device owns its clock; the player only supplies the pull callback and
/// starts or stops pulls.
pub trait AudioRenderer: Send + Sync {
    /// Start the audio stream
    fn start(&mut self) -> Result<()>;

    /// Stop the audio stream
    fn stop(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    fn resume(&mut self) -> Result<()>;

    /// Install the callback that provides PCM data
    fn set_audio_callback(&mut self, callback: AudioCallback) -> Result<()>;

    /// Output sample rate
    fn get_sample_rate(&self) -> u32;

    fn get_channels(&self) -> u16;

    /// Device buffer size in frames
    fn get_buffer_size(&self) -> usize;

    fn is_playing(&self) -> bool;

    /// Release all audio resources
    fn release(&mut self) -> Result<()>;
}

/// Output format of a renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpec {
    pub sample_rate: u32,
    pub channels: u16,
    pub buffer_size: usize,
}

impl Default for AudioSpec {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            buffer_size: 1024,
        }
    }
}

struct NullShared {
    callback: Mutex<Option<AudioCallback>>,
    playing: AtomicBool,
    released: AtomicBool,
    frames_pulled: AtomicU64,
}

/// Device-less renderer for tests and headless use.
///
/// Pulls happen either by hand through a [`NullRendererHandle`] or on a
/// background clock started with [`NullRenderer::with_clock`].
pub struct NullRenderer {
    spec: AudioSpec,
    shared: Arc<NullShared>,
    period: Option<Duration>,
    clock: Option<JoinHandle<()>>,
}

impl NullRenderer {
    pub fn new(spec: AudioSpec) -> Self {
        Self {
            spec,
            shared: Arc::new(NullShared {
                callback: Mutex::new(None),
                playing: AtomicBool::new(false),
                released: AtomicBool::new(false),
                frames_pulled: AtomicU64::new(0),
            }),
            period: None,
            clock: None,
        }
    }

    /// Pull one device buffer every `period` while playing
    pub fn with_clock(mut self, period: Duration) -> Self {
        self.period = Some(period);
        self
    }

    pub fn handle(&self) -> NullRendererHandle {
        NullRendererHandle {
            spec: self.spec,
            shared: self.shared.clone(),
        }
    }

    fn spawn_clock(&mut self) -> Result<()> {
        let Some(period) = self.period else {
            return Ok(());
        };
        if self.clock.is_some() {
            return Ok(());
        }

        let handle = self.handle();
        let frames = self.spec.buffer_size;
        let clock = thread::Builder::new()
            .name("null-renderer".to_string())
            .spawn(move || {
                while !handle.shared.released.load(Ordering::Acquire) {
                    if handle.is_playing() {
                        handle.pull(frames);
                    }
                    thread::sleep(period);
                }
            })
            .map_err(|e| AudioError::Device(format!("Failed to start clock thread: {}", e)))?;
        self.clock = Some(clock);
        Ok(())
    }
}

impl AudioRenderer for NullRenderer {
    fn start(&mut self) -> Result<()> {
        if self.shared.released.load(Ordering::Acquire) {
            return Err(AudioError::Device("Renderer released".to_string()));
        }
        self.shared.playing.store(true, Ordering::Release);
        self.spawn_clock()
    }

    fn stop(&mut self) -> Result<()> {
        self.shared.playing.store(false, Ordering::Release);
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.stop()
    }

    fn resume(&mut self) -> Result<()> {
        self.start()
    }

    fn set_audio_callback(&mut self, callback: AudioCallback) -> Result<()> {
        *self.shared.callback.lock() = Some(callback);
        Ok(())
    }

    fn get_sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }

    fn get_channels(&self) -> u16 {
        self.spec.channels
    }

    fn get_buffer_size(&self) -> usize {
        self.spec.buffer_size
    }

    fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }

    fn release(&mut self) -> Result<()> {
        self.stop()?;
        self.shared.released.store(true, Ordering::Release);
        if let Some(clock) = self.clock.take() {
            if clock.join().is_err() {
                log::warn!("[renderer] clock thread panicked");
            }
        }
        *self.shared.callback.lock() = None;
        Ok(())
    }
}

impl Drop for NullRenderer {
    fn drop(&mut self) {
        self.shared.released.store(true, Ordering::Release);
    }
}

/// Test-side view of a [`NullRenderer`] that outlives handing it to a player
#[derive(Clone)]
pub struct NullRendererHandle {
    spec: AudioSpec,
    shared: Arc<NullShared>,
}

impl NullRendererHandle {
    /// Run the callback for `frames` frames, as a device would.
    /// Returns silence without calling back while stopped.
    pub fn pull(&self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames * self.spec.channels as usize];
        if !self.is_playing() {
            return out;
        }
        let written = match self.shared.callback.lock().as_mut() {
            Some(callback) => callback(&mut out),
            None => 0,
        };
        let len = out.len();
        out[written.min(len)..].fill(0.0);
        self.shared.frames_pulled.fetch_add(frames as u64, Ordering::Relaxed);
        out
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }

    pub fn frames_pulled(&self) -> u64 {
        self.shared.frames_pulled.load(Ordering::Relaxed)
    }
}
