// Track identity, source kinds and decoded format

use crate::error::{AudioError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Canonical identity of a track, used as the cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(String);

impl TrackId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a track's bytes come from
#[derive(Debug, Clone)]
pub enum TrackSource {
    Http(String),
    File(PathBuf),
    /// In-memory bytes with a caller-supplied name
    Memory { name: String, data: Arc<[u8]> },
}

impl TrackSource {
    /// Classify an opaque source string.
    ///
    /// `http://` and `https://` select the network; anything else is a local
    /// path, with an optional `file://` prefix stripped.
    pub fn parse(source: &str) -> Result<Self> {
        let source = source.trim();
        if source.is_empty() {
            return Err(AudioError::PersistentSource("Empty track source".to_string()));
        }

        let lower = source.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return Ok(TrackSource::Http(source.to_string()));
        }

        let path = source.strip_prefix("file://").unwrap_or(source);
        if path.is_empty() {
            return Err(AudioError::PersistentSource(format!(
                "Invalid file source: {}",
                source
            )));
        }
        Ok(TrackSource::File(PathBuf::from(path)))
    }

    pub fn memory(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        TrackSource::Memory {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Canonical identity used to key the cache
    pub fn track_id(&self) -> TrackId {
        match self {
            TrackSource::Http(url) => TrackId::new(url.clone()),
            TrackSource::File(path) => {
                let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
                TrackId::new(format!("file://{}", canonical.display()))
            }
            TrackSource::Memory { name, .. } => TrackId::new(format!("memory://{}", name)),
        }
    }

    /// File extension usable as a probe hint
    pub fn extension_hint(&self) -> Option<String> {
        let name = match self {
            TrackSource::Http(url) => {
                // Ignore query string and fragment
                let end = url.find(|c| c == '?' || c == '#').unwrap_or(url.len());
                url[..end].rsplit('/').next().unwrap_or("").to_string()
            }
            TrackSource::File(path) => path.to_string_lossy().into_owned(),
            TrackSource::Memory { name, .. } => name.clone(),
        };

        Path::new(&name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, TrackSource::Http(_))
    }
}

impl fmt::Display for TrackSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackSource::Http(url) => write!(f, "{}", url),
            TrackSource::File(path) => write!(f, "{}", path.display()),
            TrackSource::Memory { name, data } => write!(f, "memory:{} ({} bytes)", name, data.len()),
        }
    }
}

/// Decoded stream format, known once the header is parsed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: Option<u32>,
    pub duration_ms: Option<u64>,
    pub total_frames: Option<u64>,
}

impl FormatInfo {
    pub fn frames_to_ms(&self, frames: u64) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        frames * 1000 / self.sample_rate as u64
    }

    pub fn ms_to_frames(&self, ms: u64) -> u64 {
        ms * self.sample_rate as u64 / 1000
    }
}

/// A track under playback
#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    pub source: TrackSource,
    /// Total length in bytes, once the fetcher reports it
    pub byte_len: Option<u64>,
    /// Filled in by the decoder
    pub format: Option<FormatInfo>,
}

impl Track {
    pub fn new(source: TrackSource) -> Self {
        Self {
            id: source.track_id(),
            source,
            byte_len: None,
            format: None,
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.format.and_then(|f| f.duration_ms)
    }
}
