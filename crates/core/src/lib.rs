// Core types and traits for the Spool streaming player

pub mod callback;
pub mod config;
pub mod decode;
pub mod error;
pub mod player;
pub mod state;
pub mod token;
pub mod track;

// Re-export commonly used types
pub use callback::{CallbackEvent, CallbackManager, PlayerCallback, RecordingCallback};
pub use config::{BufferConfig, CacheConfig, EngineConfig, FetchConfig, PlayerConfig, RetryPolicy};
pub use decode::{ByteSource, DecodeStatus, DecoderFactory, FrameDecoder, PcmFrame, SeekTarget};
pub use error::{AudioError, ErrorKind, Result};
pub use player::AudioPlayer;
pub use state::{PlaybackStatus, PlayerState, PlayerStateContainer};
pub use token::SessionToken;
pub use track::{FormatInfo, Track, TrackId, TrackSource};
