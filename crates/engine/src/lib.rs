// Playback engine: decoded PCM in, device pulls out

use spool_core::{EngineConfig, FormatInfo, PcmFrame};
use spool_renderer_api::{AudioCallback, AudioSpec};
use spool_resampler::Converter;
use spool_ringbuffer::SharedPcmRing;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// State shared between the render callback and everyone else; atomics only
struct EngineShared {
    active: AtomicBool,
    /// f32 bits
    volume: AtomicU32,
    base_position_ms: AtomicU64,
    frames_rendered: AtomicU64,
    underrun: AtomicBool,
    underrun_count: AtomicU64,
    /// Epoch + 1 of the stream that ended, 0 while none has
    end_of_stream: AtomicU64,
    /// Mirror of the ring's epoch for the end-of-stream mark; the ring's own
    /// copy decides whether a feeder may write
    epoch: AtomicU64,
}

impl EngineShared {
    fn has_ended(&self) -> bool {
        self.end_of_stream.load(Ordering::Acquire) == self.epoch.load(Ordering::Acquire) + 1
    }

    /// A mark from before the latest flush never matches the current epoch
    fn mark_ended(&self, epoch: u64) {
        self.end_of_stream.store(epoch + 1, Ordering::Release);
    }
}

/// The real-time half: reads the ring, never blocks
#[derive(Clone)]
struct RenderPath {
    ring: SharedPcmRing,
    shared: Arc<EngineShared>,
    channels: usize,
}

impl RenderPath {
    fn render(&self, out: &mut [f32]) -> usize {
        if !self.shared.active.load(Ordering::Acquire) {
            out.fill(0.0);
            return 0;
        }

        let read = self.ring.try_read(out).unwrap_or(0);
        if read < out.len() {
            out[read..].fill(0.0);
            if !self.shared.has_ended() {
                self.shared.underrun.store(true, Ordering::Release);
                self.shared.underrun_count.fetch_add(1, Ordering::Relaxed);
            }
        }

        let volume = f32::from_bits(self.shared.volume.load(Ordering::Relaxed));
        if volume != 1.0 {
            for sample in &mut out[..read] {
                *sample *= volume;
            }
        }

        self.shared
            .frames_rendered
            .fetch_add((read / self.channels) as u64, Ordering::AcqRel);
        read
    }
}

/// Pull-driven output stage.
///
/// Position is the base set by the last flush plus the frames the device has
/// actually consumed, so it never runs ahead of what was heard.
pub struct PlaybackEngine {
    output: AudioSpec,
    ring_ms: u64,
    render_path: RenderPath,
}

impl PlaybackEngine {
    pub fn new(output: AudioSpec, config: &EngineConfig) -> Self {
        let channels = output.channels.max(1);
        let ring = SharedPcmRing::for_duration(config.ring_ms, output.sample_rate, channels);
        let shared = Arc::new(EngineShared {
            active: AtomicBool::new(false),
            volume: AtomicU32::new(1.0f32.to_bits()),
            base_position_ms: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
            underrun: AtomicBool::new(false),
            underrun_count: AtomicU64::new(0),
            end_of_stream: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
        });

        Self {
            output,
            ring_ms: config.ring_ms,
            render_path: RenderPath {
                ring,
                shared,
                channels: channels as usize,
            },
        }
    }

    fn shared(&self) -> &EngineShared {
        &self.render_path.shared
    }

    pub fn output_spec(&self) -> AudioSpec {
        self.output
    }

    /// Start a new stream: empties the ring and returns the decoder-side feeder
    pub fn configure(&self, format: &FormatInfo) -> PcmFeeder {
        let frames = (self.output.sample_rate as u64 * self.ring_ms / 1000) as usize;
        self.render_path
            .ring
            .reconfigure(frames, self.output.channels.max(1));
        self.flush(0);

        log::info!(
            "[engine] {} Hz {} ch -> {} Hz {} ch",
            format.sample_rate,
            format.channels,
            self.output.sample_rate,
            self.output.channels
        );

        PcmFeeder {
            ring: self.render_path.ring.clone(),
            shared: self.render_path.shared.clone(),
            converter: Converter::new(
                format.sample_rate,
                self.output.sample_rate,
                format.channels,
                self.output.channels,
            ),
            epoch: self.render_path.ring.epoch(),
            pending: Vec::new(),
            offset: 0,
        }
    }

    /// Fill `out` from the ring; the shortfall is silence.
    /// Returns the number of real samples written.
    pub fn render(&self, out: &mut [f32]) -> usize {
        self.render_path.render(out)
    }

    /// Callback for [`spool_renderer_api::AudioRenderer::set_audio_callback`]
    pub fn callback(&self) -> AudioCallback {
        let path = self.render_path.clone();
        Box::new(move |out: &mut [f32]| {
            path.render(out);
            // Silence counts as written; the device must not replay stale data
            out.len()
        })
    }

    /// Drop queued PCM and restart the position clock at `position_ms`
    pub fn flush(&self, position_ms: u64) {
        let shared = self.shared();
        let epoch = self.render_path.ring.flush();
        shared.epoch.store(epoch, Ordering::Release);
        shared.end_of_stream.store(0, Ordering::Release);
        shared.underrun.store(false, Ordering::Release);
        self.reset_position(position_ms);
    }

    pub fn reset_position(&self, position_ms: u64) {
        let shared = self.shared();
        shared.frames_rendered.store(0, Ordering::Release);
        shared.base_position_ms.store(position_ms, Ordering::Release);
    }

    pub fn position_ms(&self) -> u64 {
        let shared = self.shared();
        let frames = shared.frames_rendered.load(Ordering::Acquire);
        let rate = self.output.sample_rate.max(1) as u64;
        shared.base_position_ms.load(Ordering::Acquire) + frames * 1000 / rate
    }

    /// Whether pulls consume PCM; inactive pulls render silence
    pub fn set_active(&self, active: bool) {
        self.shared().active.store(active, Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.shared().active.load(Ordering::Acquire)
    }

    /// Linear gain, expected in 0.0..=1.0
    pub fn set_volume(&self, volume: f32) {
        self.shared().volume.store(volume.to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.shared().volume.load(Ordering::Relaxed))
    }

    /// Whether a pull came up short since the last call
    pub fn take_underrun(&self) -> bool {
        self.shared().underrun.swap(false, Ordering::AcqRel)
    }

    pub fn underrun_count(&self) -> u64 {
        self.shared().underrun_count.load(Ordering::Relaxed)
    }

    /// No more PCM will be fed; shortfalls stop counting as underruns
    pub fn mark_end_of_stream(&self) {
        let shared = self.shared();
        shared.mark_ended(shared.epoch.load(Ordering::Acquire));
    }

    /// End of stream reached and the ring is empty
    pub fn is_drained(&self) -> bool {
        self.shared().has_ended() && self.render_path.ring.available_read() == 0
    }

    /// Decoded audio queued ahead of the device
    pub fn buffered_ms(&self) -> u64 {
        let frames = self.render_path.ring.available_frames() as u64;
        frames * 1000 / self.output.sample_rate.max(1) as u64
    }
}

/// Decoder-side writer into the engine's ring.
///
/// Converts each frame to the output format and queues it; `drain` moves as
/// much as fits. Output from before the last flush is discarded.
pub struct PcmFeeder {
    ring: SharedPcmRing,
    shared: Arc<EngineShared>,
    converter: Converter,
    epoch: u64,
    pending: Vec<f32>,
    offset: usize,
}

impl PcmFeeder {
    fn is_stale(&self) -> bool {
        self.ring.epoch() != self.epoch
    }

    /// Adopt the current epoch after a flush, dropping anything queued
    pub fn resync(&mut self) {
        self.epoch = self.ring.epoch();
        self.pending.clear();
        self.offset = 0;
        self.converter.reset();
    }

    /// Queue one decoded frame; returns true once all of it reached the ring
    pub fn write(&mut self, frame: &PcmFrame) -> bool {
        if self.is_stale() {
            return true;
        }
        if self.offset > 0 {
            self.pending.drain(..self.offset);
            self.offset = 0;
        }
        self.follow_format(frame);
        self.converter.process_into(&frame.samples, &mut self.pending);
        self.drain()
    }

    /// Move queued samples into the ring; true when nothing is left
    pub fn drain(&mut self) -> bool {
        if self.offset < self.pending.len() {
            match self.ring.write_if(self.epoch, &self.pending[self.offset..]) {
                Some(written) => self.offset += written,
                None => {
                    self.pending.clear();
                    self.offset = 0;
                    return true;
                }
            }
        }
        if self.offset >= self.pending.len() {
            self.pending.clear();
            self.offset = 0;
            return true;
        }
        false
    }

    /// Signal that no more PCM follows. Returns false, and marks nothing,
    /// if the engine was flushed since this feeder last synced.
    pub fn finish(&mut self) -> bool {
        if self.is_stale() {
            return false;
        }
        self.shared.mark_ended(self.epoch);
        true
    }

    pub fn has_pending(&self) -> bool {
        self.offset < self.pending.len()
    }

    /// Rebuild the converter when the decoder changed its output format
    fn follow_format(&mut self, frame: &PcmFrame) {
        if frame.sample_rate == 0 || frame.channels == 0 {
            return;
        }
        if frame.sample_rate == self.converter.input_rate()
            && frame.channels == self.converter.input_channels()
        {
            return;
        }
        log::info!(
            "[engine] stream format now {} Hz {} ch",
            frame.sample_rate,
            frame.channels
        );
        self.converter = Converter::new(
            frame.sample_rate,
            self.converter.output_rate(),
            frame.channels,
            self.converter.output_channels(),
        );
    }
}
