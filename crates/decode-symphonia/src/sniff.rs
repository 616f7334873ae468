// Container detection from the first bytes of a stream

use std::fmt;
use symphonia::core::probe::Hint;

/// Bytes needed to tell every supported container apart
pub const SNIFF_LEN: usize = 12;

/// Containers the player accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerFormat {
    Mp3,
    Adts,
    Flac,
    Wav,
    Ogg,
    Mp4,
    Aiff,
}

impl ContainerFormat {
    /// Identify the container from its leading bytes
    pub fn sniff(header: &[u8]) -> Option<Self> {
        if header.len() >= 12 {
            match (&header[0..4], &header[8..12]) {
                (b"RIFF", b"WAVE") => return Some(Self::Wav),
                (b"FORM", b"AIFF") | (b"FORM", b"AIFC") => return Some(Self::Aiff),
                _ => {}
            }
        }
        if header.len() >= 8 && &header[4..8] == b"ftyp" {
            return Some(Self::Mp4);
        }
        if header.len() >= 4 {
            match &header[0..4] {
                b"fLaC" => return Some(Self::Flac),
                b"OggS" => return Some(Self::Ogg),
                _ => {}
            }
        }
        if header.len() >= 3 && &header[0..3] == b"ID3" {
            return Some(Self::Mp3);
        }
        if header.len() >= 2 && header[0] == 0xFF && header[1] & 0xE0 == 0xE0 {
            // Frame sync; ADTS carries layer bits 00, MPEG audio never does
            return Some(if header[1] & 0x06 == 0 { Self::Adts } else { Self::Mp3 });
        }
        None
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            Self::Adts => "aac",
            Self::Flac => "flac",
            Self::Wav => "wav",
            Self::Ogg => "ogg",
            Self::Mp4 => "m4a",
            Self::Aiff => "aiff",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Adts => "audio/aac",
            Self::Flac => "audio/flac",
            Self::Wav => "audio/wav",
            Self::Ogg => "audio/ogg",
            Self::Mp4 => "audio/mp4",
            Self::Aiff => "audio/aiff",
        }
    }

    /// Probe hint pinned to this container
    pub fn hint(&self) -> Hint {
        let mut hint = Hint::new();
        hint.with_extension(self.extension());
        hint.mime_type(self.mime_type());
        hint
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}
