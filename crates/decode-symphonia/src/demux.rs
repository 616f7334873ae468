// Container demuxing using Symphonia

use crate::sniff::ContainerFormat;
use spool_core::{AudioError, FormatInfo, Result};
use symphonia::core::codecs::CodecParameters;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, Packet, SeekMode, SeekTo};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::units::{Time, TimeBase};

/// Result of pulling one packet
pub(crate) enum PacketRead {
    Packet(Packet),
    End,
    /// Damaged container data; the reader has already resynced
    Corrupt(String),
    /// The stream's codec parameters changed
    Reset,
}

/// Format reader bound to the default audio track
pub(crate) struct Demuxer {
    reader: Box<dyn FormatReader>,
    track_id: u32,
}

impl Demuxer {
    pub fn probe(source: Box<dyn MediaSource>, container: ContainerFormat) -> Result<Self> {
        let stream = MediaSourceStream::new(source, Default::default());
        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };

        let probed = symphonia::default::get_probe()
            .format(
                &container.hint(),
                stream,
                &format_opts,
                &MetadataOptions::default(),
            )
            .map_err(|e| AudioError::DecoderFormat(format!("Failed to probe {} stream: {}", container, e)))?;

        let reader = probed.format;
        let track_id = reader
            .default_track()
            .map(|t| t.id)
            .ok_or_else(|| AudioError::DecoderFormat("No audio track found".to_string()))?;

        Ok(Self { reader, track_id })
    }

    pub fn codec_params(&self) -> Result<&CodecParameters> {
        self.reader
            .tracks()
            .iter()
            .find(|t| t.id == self.track_id)
            .map(|t| &t.codec_params)
            .ok_or_else(|| AudioError::DecoderFormat("Track not found".to_string()))
    }

    fn time_base(&self) -> Option<TimeBase> {
        self.codec_params().ok().and_then(|p| p.time_base)
    }

    pub fn format_info(&self) -> Result<FormatInfo> {
        let params = self.codec_params()?;
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| AudioError::DecoderFormat("Sample rate not specified".to_string()))?;

        let duration_ms = match (params.time_base, params.n_frames) {
            (Some(tb), Some(n)) => Some(ts_to_ms(tb, n)),
            (None, Some(n)) => Some(n * 1000 / sample_rate as u64),
            _ => None,
        };

        Ok(FormatInfo {
            sample_rate,
            channels: params.channels.map(|c| c.count() as u16).unwrap_or(2),
            bits_per_sample: params.bits_per_sample,
            duration_ms,
            total_frames: params.n_frames,
        })
    }

    /// Next packet of our track
    pub fn next_packet(&mut self) -> Result<PacketRead> {
        loop {
            match self.reader.next_packet() {
                Ok(packet) if packet.track_id() == self.track_id => return Ok(PacketRead::Packet(packet)),
                Ok(_) => continue,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(PacketRead::End)
                }
                Err(SymphoniaError::IoError(e)) => return Err(AudioError::Io(e.to_string())),
                Err(SymphoniaError::ResetRequired) => return Ok(PacketRead::Reset),
                Err(e) => return Ok(PacketRead::Corrupt(e.to_string())),
            }
        }
    }

    /// Seek to `time_ms`; returns where the reader actually landed
    pub fn seek(&mut self, time_ms: u64) -> Result<u64> {
        let to = match self.time_base() {
            Some(tb) => SeekTo::TimeStamp {
                ts: ms_to_ts(tb, time_ms),
                track_id: self.track_id,
            },
            None => SeekTo::Time {
                time: Time::new(time_ms / 1000, (time_ms % 1000) as f64 / 1000.0),
                track_id: Some(self.track_id),
            },
        };

        let seeked = self.reader.seek(SeekMode::Accurate, to).map_err(|e| match e {
            SymphoniaError::IoError(io) => AudioError::Io(io.to_string()),
            other => AudioError::DecoderFrame(format!("Seek failed: {}", other)),
        })?;

        Ok(match self.time_base() {
            Some(tb) => ts_to_ms(tb, seeked.actual_ts),
            None => time_ms,
        })
    }

    /// Convert a packet timestamp into frames at `sample_rate`
    pub fn ts_to_frames(&self, ts: u64, sample_rate: u32) -> u64 {
        match self.time_base() {
            Some(tb) => (ts as u128 * tb.numer as u128 * sample_rate as u128 / tb.denom.max(1) as u128) as u64,
            None => ts,
        }
    }
}

fn ts_to_ms(tb: TimeBase, ts: u64) -> u64 {
    (ts as u128 * tb.numer as u128 * 1000 / tb.denom.max(1) as u128) as u64
}

fn ms_to_ts(tb: TimeBase, ms: u64) -> u64 {
    (ms as u128 * tb.denom as u128 / (tb.numer.max(1) as u128 * 1000)) as u64
}
