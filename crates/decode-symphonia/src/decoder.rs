// Symphonia-backed frame decoder

use crate::demux::{Demuxer, PacketRead};
use crate::sniff::{ContainerFormat, SNIFF_LEN};
use parking_lot::Mutex;
use spool_core::{
    AudioError, ByteSource, DecodeStatus, DecoderFactory, FormatInfo, FrameDecoder, PcmFrame, Result,
    SeekTarget,
};
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use symphonia::core::audio::{AudioBuffer, AudioBufferRef, Signal};
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::conv::IntoSample;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::io::MediaSource;
use symphonia::core::sample::Sample;

/// Corrupt packets skipped in one call before control returns to the caller
const CORRUPT_PER_CALL: usize = 8;

/// Corrupt packets in a row after which the stream is unplayable
const MAX_CORRUPT_RUN: usize = 64;

/// The byte source, shared between the demuxer and the decoder's
/// availability checks. Both run on the decode thread.
#[derive(Clone)]
struct SharedSource(Arc<Mutex<Box<dyn ByteSource>>>);

impl SharedSource {
    fn has_bytes(&self, min: usize) -> bool {
        self.0.lock().has_bytes(min)
    }

    fn byte_len(&self) -> Option<u64> {
        self.0.lock().byte_len()
    }
}

impl Read for SharedSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.lock().read(buf)
    }
}

impl Seek for SharedSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.lock().seek(pos)
    }
}

impl MediaSource for SharedSource {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        SharedSource::byte_len(self)
    }
}

pub struct SymphoniaDecoder {
    container: ContainerFormat,
    demuxer: Demuxer,
    decoder: Box<dyn Decoder>,
    format: FormatInfo,
    source: SharedSource,
    frame_errors: Vec<String>,
    /// Corrupt packets since the last good one
    corrupt_run: usize,
}

impl SymphoniaDecoder {
    /// Sniff, probe and build a decoder over `source`
    pub fn open(mut source: Box<dyn ByteSource>) -> Result<Self> {
        let header = match source.peek_header(SNIFF_LEN) {
            Some(header) => header,
            None => read_header(&mut *source)?,
        };
        let container = ContainerFormat::sniff(&header)
            .ok_or_else(|| AudioError::DecoderFormat("Unrecognized container header".to_string()))?;
        log::debug!("[decoder] sniffed {} container", container);

        let source = SharedSource(Arc::new(Mutex::new(source)));
        let demuxer = Demuxer::probe(Box::new(source.clone()), container)?;
        let decoder = make_decoder(demuxer.codec_params()?)?;
        let format = demuxer.format_info()?;

        log::info!(
            "[decoder] opened {}: {} Hz, {} ch, duration {:?} ms",
            container,
            format.sample_rate,
            format.channels,
            format.duration_ms
        );

        Ok(Self {
            container,
            demuxer,
            decoder,
            format,
            source,
            frame_errors: Vec::new(),
            corrupt_run: 0,
        })
    }

    pub fn container(&self) -> ContainerFormat {
        self.container
    }

    /// Note a skipped packet; fails once the run of bad packets gets too long
    fn record_frame_error(&mut self, message: String) -> Result<()> {
        log::warn!("[decoder] skipping corrupt frame: {}", message);
        self.frame_errors.push(message);
        self.corrupt_run += 1;
        if self.corrupt_run >= MAX_CORRUPT_RUN {
            return Err(AudioError::DecoderFrame(format!(
                "{} corrupt packets in a row",
                self.corrupt_run
            )));
        }
        Ok(())
    }

    fn rebuild(&mut self) -> Result<()> {
        log::info!("[decoder] stream parameters changed, rebuilding decoder");
        self.decoder = make_decoder(self.demuxer.codec_params()?)?;
        self.format = self.demuxer.format_info()?;
        Ok(())
    }

    fn byte_to_ms(&self, offset: u64) -> Result<u64> {
        match (self.source.byte_len(), self.format.duration_ms) {
            (Some(len), Some(duration)) if len > 0 => {
                Ok((offset.min(len) as u128 * duration as u128 / len as u128) as u64)
            }
            _ => Err(AudioError::InvalidState(
                "Byte seek needs a known length and duration".to_string(),
            )),
        }
    }
}

impl FrameDecoder for SymphoniaDecoder {
    fn format(&self) -> FormatInfo {
        self.format
    }

    fn decode_next(&mut self) -> Result<DecodeStatus> {
        let mut skipped = 0;
        loop {
            if !self.source.has_bytes(1) {
                return Ok(DecodeStatus::NeedMoreBytes);
            }
            // Let the caller see commands while resyncing through damage
            if skipped >= CORRUPT_PER_CALL {
                return Ok(DecodeStatus::NeedMoreBytes);
            }

            let packet = match self.demuxer.next_packet()? {
                PacketRead::Packet(packet) => packet,
                PacketRead::End => return Ok(DecodeStatus::EndOfStream),
                PacketRead::Corrupt(message) => {
                    self.record_frame_error(message)?;
                    skipped += 1;
                    continue;
                }
                PacketRead::Reset => {
                    self.rebuild()?;
                    continue;
                }
            };

            let sample_rate = self.format.sample_rate;
            let timestamp_frames = self.demuxer.ts_to_frames(packet.ts(), sample_rate);

            // The decoded buffer borrows the decoder; copy it out first
            let decoded = self.decoder.decode(&packet).map(|decoded| {
                if decoded.frames() == 0 {
                    return None;
                }
                let spec = *decoded.spec();
                let channels = spec.channels.count();
                let mut samples = Vec::with_capacity(decoded.frames() * channels);
                interleave_any(decoded, &mut samples);
                Some(PcmFrame {
                    samples,
                    channels: channels as u16,
                    sample_rate: spec.rate,
                    timestamp_frames,
                })
            });

            match decoded {
                Ok(Some(frame)) => {
                    self.corrupt_run = 0;
                    return Ok(DecodeStatus::Frame(frame));
                }
                Ok(None) => continue,
                Err(SymphoniaError::IoError(e)) if e.kind() != io::ErrorKind::UnexpectedEof => {
                    return Err(AudioError::Io(e.to_string()));
                }
                Err(SymphoniaError::ResetRequired) => self.rebuild()?,
                Err(e) => {
                    self.record_frame_error(e.to_string())?;
                    skipped += 1;
                }
            }
        }
    }

    fn seek(&mut self, target: SeekTarget) -> Result<u64> {
        let time_ms = match target {
            SeekTarget::Time(ms) => ms,
            SeekTarget::Byte(offset) => self.byte_to_ms(offset)?,
        };
        let actual = self.demuxer.seek(time_ms)?;
        self.decoder.reset();
        self.corrupt_run = 0;
        log::debug!("[decoder] seek to {} ms landed at {} ms", time_ms, actual);
        Ok(actual)
    }

    fn take_frame_errors(&mut self) -> Vec<String> {
        std::mem::take(&mut self.frame_errors)
    }
}

/// Read the sniffing header when the source cannot peek, then rewind
fn read_header(source: &mut dyn ByteSource) -> Result<Vec<u8>> {
    let mut header = Vec::with_capacity(SNIFF_LEN);
    (&mut *source).take(SNIFF_LEN as u64).read_to_end(&mut header)?;
    source.seek(SeekFrom::Start(0))?;
    Ok(header)
}

fn make_decoder(params: &CodecParameters) -> Result<Box<dyn Decoder>> {
    symphonia::default::get_codecs()
        .make(params, &DecoderOptions::default())
        .map_err(|e| AudioError::DecoderFormat(format!("Failed to create decoder: {}", e)))
}

/// Append `buffer` to `output` as interleaved f32
fn interleave_any(buffer: AudioBufferRef<'_>, output: &mut Vec<f32>) {
    match buffer {
        AudioBufferRef::U8(buf) => interleave(&*buf, output),
        AudioBufferRef::U16(buf) => interleave(&*buf, output),
        AudioBufferRef::U24(buf) => interleave(&*buf, output),
        AudioBufferRef::U32(buf) => interleave(&*buf, output),
        AudioBufferRef::S8(buf) => interleave(&*buf, output),
        AudioBufferRef::S16(buf) => interleave(&*buf, output),
        AudioBufferRef::S24(buf) => interleave(&*buf, output),
        AudioBufferRef::S32(buf) => interleave(&*buf, output),
        AudioBufferRef::F32(buf) => interleave(&*buf, output),
        AudioBufferRef::F64(buf) => interleave(&*buf, output),
    }
}

fn interleave<S>(buffer: &AudioBuffer<S>, output: &mut Vec<f32>)
where
    S: Sample + IntoSample<f32>,
{
    let channels = buffer.spec().channels.count();
    for frame in 0..buffer.frames() {
        for ch in 0..channels {
            output.push(buffer.chan(ch)[frame].into_sample());
        }
    }
}

/// [`DecoderFactory`] for everything Symphonia can read
#[derive(Debug, Default, Clone, Copy)]
pub struct SymphoniaDecoderFactory;

impl DecoderFactory for SymphoniaDecoderFactory {
    fn open(&self, source: Box<dyn ByteSource>, hint: Option<&str>) -> Result<Box<dyn FrameDecoder>> {
        let decoder = SymphoniaDecoder::open(source)?;
        if let Some(ext) = hint {
            if !ext.eq_ignore_ascii_case(decoder.container().extension()) {
                log::debug!(
                    "[decoder] source extension {} but content is {}",
                    ext,
                    decoder.container()
                );
            }
        }
        Ok(Box::new(decoder))
    }
}
