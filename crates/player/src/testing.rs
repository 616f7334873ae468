// Scriptable fetcher and a byte-counting decoder for controller tests

use parking_lot::Mutex;
use spool_core::{
    AudioError, ByteSource, DecodeStatus, DecoderFactory, FormatInfo, FrameDecoder, PcmFrame,
    Result, SeekTarget, TrackSource,
};
use spool_transport::{FetchEvent, FetchSink, FetcherFactory, SourceFetcher};
use std::io::{Read, SeekFrom};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const HEADER: &[u8; 4] = b"RAW1";
pub const FRAME_BYTES: usize = 400;
pub const FRAME_MS: u64 = 10;
pub const SAMPLE_RATE: u32 = 8000;
const SAMPLES_PER_FRAME: usize = 80;
const CORRUPT: u8 = 0xEE;

/// Header plus `frames` frames of 10 ms each
pub fn track_bytes(frames: usize) -> Vec<u8> {
    let mut bytes = HEADER.to_vec();
    for i in 0..frames {
        bytes.extend(std::iter::repeat((i % 200) as u8 + 1).take(FRAME_BYTES));
    }
    bytes
}

pub fn corrupt_frame(bytes: &mut [u8], index: usize) {
    bytes[HEADER.len() + index * FRAME_BYTES] = CORRUPT;
}

pub fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(2));
    }
}

#[derive(Default)]
struct ScriptState {
    sink: Option<FetchSink>,
    generation: u64,
    starts: Vec<u64>,
}

/// Test-side control of every fetcher built by [`Script::factory`].
/// Events go to the most recently started transfer.
#[derive(Clone, Default)]
pub struct Script(Arc<Mutex<ScriptState>>);

impl Script {
    pub fn factory(&self) -> Arc<dyn FetcherFactory> {
        Arc::new(ScriptedFactory(self.clone()))
    }

    pub fn starts(&self) -> Vec<u64> {
        self.0.lock().starts.clone()
    }

    pub fn wait_for_starts(&self, count: usize) -> Vec<u64> {
        wait_until("fetch start", || self.0.lock().starts.len() >= count);
        self.starts()
    }

    pub fn open(&self, offset: u64, total_len: Option<u64>) {
        self.send(FetchEvent::Opened { offset, total_len });
    }

    pub fn chunk(&self, offset: u64, bytes: &[u8]) {
        self.send(FetchEvent::Chunk {
            offset,
            bytes: bytes.to_vec(),
        });
    }

    pub fn complete(&self, end: u64) {
        self.send(FetchEvent::Complete { end });
    }

    pub fn fail(&self, error: AudioError) {
        self.send(FetchEvent::Failed(error));
    }

    fn send(&self, event: FetchEvent) {
        let st = self.0.lock();
        if let Some(sink) = &st.sink {
            sink.send(st.generation, event);
        }
    }
}

struct ScriptedFactory(Script);

impl FetcherFactory for ScriptedFactory {
    fn create(&self, _source: &TrackSource) -> Result<Box<dyn SourceFetcher>> {
        Ok(Box::new(ScriptedFetcher(self.0.clone())))
    }
}

struct ScriptedFetcher(Script);

impl SourceFetcher for ScriptedFetcher {
    fn start(&mut self, from: u64, sink: FetchSink) -> Result<u64> {
        let mut st = (self.0).0.lock();
        st.generation += 1;
        st.sink = Some(sink);
        st.starts.push(from);
        Ok(st.generation)
    }

    fn cancel(&mut self) {}
}

/// Decodes [`track_bytes`] output: one 8 kHz mono frame per 400 bytes
pub struct RawDecoderFactory;

impl DecoderFactory for RawDecoderFactory {
    fn open(&self, mut source: Box<dyn ByteSource>, _hint: Option<&str>) -> Result<Box<dyn FrameDecoder>> {
        let mut header = [0u8; 4];
        source.read_exact(&mut header)?;
        if &header != HEADER {
            return Err(AudioError::DecoderFormat(format!("bad header {:?}", header)));
        }

        let duration_ms = source
            .byte_len()
            .map(|len| len.saturating_sub(HEADER.len() as u64) / FRAME_BYTES as u64 * FRAME_MS);
        Ok(Box::new(RawDecoder {
            source,
            format: FormatInfo {
                sample_rate: SAMPLE_RATE,
                channels: 1,
                bits_per_sample: Some(8),
                duration_ms,
                total_frames: None,
            },
            frame: 0,
            errors: Vec::new(),
        }))
    }
}

struct RawDecoder {
    source: Box<dyn ByteSource>,
    format: FormatInfo,
    frame: u64,
    errors: Vec<String>,
}

impl FrameDecoder for RawDecoder {
    fn format(&self) -> FormatInfo {
        self.format
    }

    fn decode_next(&mut self) -> Result<DecodeStatus> {
        loop {
            if !self.source.has_bytes(FRAME_BYTES) {
                return Ok(DecodeStatus::NeedMoreBytes);
            }

            let mut data = vec![0u8; FRAME_BYTES];
            let mut filled = 0;
            while filled < data.len() {
                let n = self.source.read(&mut data[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                return Ok(DecodeStatus::EndOfStream);
            }

            let index = self.frame;
            self.frame += 1;
            if data[0] == CORRUPT {
                self.errors.push(format!("frame {} is corrupt", index));
                continue;
            }

            let step = FRAME_BYTES / SAMPLES_PER_FRAME;
            let samples = data[..filled]
                .iter()
                .step_by(step)
                .map(|b| *b as f32 / 255.0)
                .collect();
            return Ok(DecodeStatus::Frame(PcmFrame {
                samples,
                channels: 1,
                sample_rate: SAMPLE_RATE,
                timestamp_frames: index * SAMPLES_PER_FRAME as u64,
            }));
        }
    }

    fn seek(&mut self, target: SeekTarget) -> Result<u64> {
        let frame = match target {
            SeekTarget::Time(ms) => ms / FRAME_MS,
            SeekTarget::Byte(offset) => offset.saturating_sub(HEADER.len() as u64) / FRAME_BYTES as u64,
        };
        let offset = HEADER.len() as u64 + frame * FRAME_BYTES as u64;
        self.source.seek(SeekFrom::Start(offset))?;
        self.frame = frame;
        Ok(frame * FRAME_MS)
    }

    fn take_frame_errors(&mut self) -> Vec<String> {
        std::mem::take(&mut self.errors)
    }
}
