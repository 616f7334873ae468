// Spool: streaming audio player with a resumable download cache

mod backoff;
mod controller;
mod decode_worker;
mod player;
mod session;

#[cfg(test)]
mod testing;

use std::sync::Once;

pub use player::{Player, PlayerBuilder};
pub use spool_cache::CacheStore;
pub use spool_core::{
    AudioError, AudioPlayer, CallbackEvent, ErrorKind, PlaybackStatus, PlayerCallback,
    PlayerConfig, PlayerState, Result, TrackSource,
};
pub use spool_renderer_api::{AudioRenderer, AudioSpec, NullRenderer, NullRendererHandle};

static INIT_LOGGER: Once = Once::new();

/// Install env_logger at Info level; `RUST_LOG` takes precedence
pub fn init_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder()
            .is_test(false)
            .filter_level(log::LevelFilter::Info)
            .parse_default_env()
            .try_init();
    });
}
