// Error taxonomy for the streaming pipeline

use serde::{Deserialize, Serialize};

/// Classification used by the player to decide between retry, warning and failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Network hiccup, retried with backoff
    TransientNetwork,
    /// Track unavailable at the source (404-equivalent)
    PersistentSource,
    /// Cache persistence failed; playback continues without resumability
    CacheIo,
    /// Unsupported or corrupt container header
    DecoderFormat,
    /// Corrupt frame mid-stream; the decoder resynchronizes
    DecoderFrame,
    /// Renderer ran out of decoded frames
    RenderUnderrun,
}

impl ErrorKind {
    /// Whether this kind ends the current playback session
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::PersistentSource | ErrorKind::DecoderFormat)
    }
}

/// Audio player error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum AudioError {
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Source unavailable: {0}")]
    PersistentSource(String),

    #[error("Cache I/O error: {0}")]
    CacheIo(String),

    #[error("Unsupported or corrupt format: {0}")]
    DecoderFormat(String),

    #[error("Corrupt frame: {0}")]
    DecoderFrame(String),

    /// Invalid state transition or use of a torn-down session
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Output device failure
    #[error("Device error: {0}")]
    Device(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl AudioError {
    /// Taxonomy kind, if this error belongs to the pipeline taxonomy
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            AudioError::TransientNetwork(_) => Some(ErrorKind::TransientNetwork),
            AudioError::PersistentSource(_) => Some(ErrorKind::PersistentSource),
            AudioError::CacheIo(_) => Some(ErrorKind::CacheIo),
            AudioError::DecoderFormat(_) => Some(ErrorKind::DecoderFormat),
            AudioError::DecoderFrame(_) => Some(ErrorKind::DecoderFrame),
            AudioError::InvalidState(_) | AudioError::Device(_) | AudioError::Io(_) => None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AudioError::TransientNetwork(_))
    }
}

/// Result type alias for audio operations
pub type Result<T> = std::result::Result<T, AudioError>;

impl From<std::io::Error> for AudioError {
    fn from(err: std::io::Error) -> Self {
        AudioError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_kinds() {
        assert!(ErrorKind::PersistentSource.is_fatal());
        assert!(ErrorKind::DecoderFormat.is_fatal());
        assert!(!ErrorKind::TransientNetwork.is_fatal());
        assert!(!ErrorKind::CacheIo.is_fatal());
        assert!(!ErrorKind::DecoderFrame.is_fatal());
        assert!(!ErrorKind::RenderUnderrun.is_fatal());
    }

    #[test]
    fn test_kind_mapping() {
        let err = AudioError::CacheIo("disk full".into());
        assert_eq!(err.kind(), Some(ErrorKind::CacheIo));
        assert_eq!(err.to_string(), "Cache I/O error: disk full");
        assert_eq!(AudioError::InvalidState("x".into()).kind(), None);
    }
}
