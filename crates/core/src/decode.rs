// Decoder-facing traits shared by the buffer, the decoder and the player

use crate::error::Result;
use crate::track::FormatInfo;
use std::io::{Read, Seek};

/// A block of decoded, interleaved PCM
#[derive(Debug, Clone, PartialEq)]
pub struct PcmFrame {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
    /// Position of the first frame, in frames from the start of the track
    pub timestamp_frames: u64,
}

impl PcmFrame {
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    pub fn timestamp_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.timestamp_frames * 1000 / self.sample_rate as u64
    }
}

/// Outcome of one decode step
#[derive(Debug)]
pub enum DecodeStatus {
    Frame(PcmFrame),
    /// Not an error: the byte source is temporarily short, or the decoder
    /// stopped part way through skipping damaged data. Call again.
    NeedMoreBytes,
    EndOfStream,
}

/// Seek request for a decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekTarget {
    Time(u64),
    Byte(u64),
}

/// A container/codec decoder pulling from a [`ByteSource`]
pub trait FrameDecoder: Send {
    fn format(&self) -> FormatInfo;

    /// Decode the next block of PCM.
    ///
    /// Corrupt frames are skipped internally and reported through
    /// [`FrameDecoder::take_frame_errors`].
    fn decode_next(&mut self) -> Result<DecodeStatus>;

    /// Seek to the nearest frame boundary at or before `target`.
    /// Returns the actual position in milliseconds.
    fn seek(&mut self, target: SeekTarget) -> Result<u64>;

    /// Drain the corrupt-frame messages recorded since the last call
    fn take_frame_errors(&mut self) -> Vec<String>;
}

/// Blocking byte source handed to decoders
pub trait ByteSource: Read + Seek + Send + Sync {
    /// Total length in bytes, if known
    fn byte_len(&self) -> Option<u64>;

    /// Whether at least `min` bytes can be read without blocking
    /// (end of stream counts as available)
    fn has_bytes(&self, min: usize) -> bool;

    /// Copy of the first `len` bytes of the stream, for format sniffing
    fn peek_header(&self, len: usize) -> Option<Vec<u8>>;
}

/// Builds decoders; injected into the player
pub trait DecoderFactory: Send + Sync {
    fn open(&self, source: Box<dyn ByteSource>, hint: Option<&str>) -> Result<Box<dyn FrameDecoder>>;
}
