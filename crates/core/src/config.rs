// Player configuration
//
// Every policy knob (watermarks, retry schedule, timeouts, cache budget) lives
// here; nothing downstream hard-codes them.

use crate::error::{AudioError, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlayerConfig {
    pub buffer: BufferConfig,
    pub fetch: FetchConfig,
    pub retry: RetryPolicy,
    pub cache: CacheConfig,
    pub engine: EngineConfig,
}

impl PlayerConfig {
    pub fn validate(&self) -> Result<()> {
        self.buffer.validate()?;
        self.retry.validate()?;
        if self.fetch.chunk_size == 0 {
            return Err(invalid("fetch.chunk_size must be > 0"));
        }
        if self.engine.ring_ms == 0 {
            return Err(invalid("engine.ring_ms must be > 0"));
        }
        if self.engine.tick_ms == 0 {
            return Err(invalid("engine.tick_ms must be > 0"));
        }
        Ok(())
    }

    /// Parse a JSON document; missing fields keep their defaults
    pub fn from_json(text: &str) -> Result<Self> {
        let config: PlayerConfig =
            serde_json::from_str(text).map_err(|e| invalid(&e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

/// Streaming buffer sizing, in bytes
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub capacity: usize,
    /// At or below this the buffer is starved
    pub low_watermark: usize,
    /// At or above this the buffer is sated
    pub high_watermark: usize,
    /// Already-read bytes kept for short backward seeks
    pub history: usize,
    /// Out-of-order bytes held in memory when the cache cannot absorb them
    pub pending_limit: usize,
}

impl BufferConfig {
    fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(invalid("buffer.capacity must be > 0"));
        }
        if self.low_watermark >= self.high_watermark {
            return Err(invalid("buffer.low_watermark must be below high_watermark"));
        }
        if self.high_watermark > self.capacity {
            return Err(invalid("buffer.high_watermark must not exceed capacity"));
        }
        if self.pending_limit == 0 {
            return Err(invalid("buffer.pending_limit must be > 0"));
        }
        Ok(())
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 512 * 1024,
            low_watermark: 32 * 1024,
            high_watermark: 256 * 1024,
            history: 64 * 1024,
            pending_limit: 4 * 1024 * 1024,
        }
    }
}

/// Source fetch settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Size of each delivered chunk
    pub chunk_size: usize,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// No bytes for this long while starved counts as a transient error
    pub stall_timeout_ms: u64,
    pub user_agent: String,
    /// Keep downloading while paused
    pub fetch_while_paused: bool,
}

impl FetchConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            connect_timeout_ms: 30_000,
            read_timeout_ms: 60_000,
            stall_timeout_ms: 10_000,
            user_agent: "Mozilla/5.0 (compatible; Spool/0.1)".to_string(),
            fetch_while_paused: true,
        }
    }
}

/// Exponential backoff schedule for transient fetch errors
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl RetryPolicy {
    fn validate(&self) -> Result<()> {
        if self.multiplier < 1.0 {
            return Err(invalid("retry.multiplier must be >= 1.0"));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(invalid("retry.initial_backoff_ms must not exceed max_backoff_ms"));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (0-based), or `None` once exhausted
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let scaled = self.initial_backoff_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_backoff_ms as f64);
        Some(Duration::from_millis(capped as u64))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

/// On-disk cache settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub directory: PathBuf,
    /// Upper bound on cached bytes across all tracks
    pub budget_bytes: u64,
    /// Upper bound on cached tracks, if any
    pub max_entries: Option<usize>,
    /// Delete a track's entry when its session ends
    pub remove_on_teardown: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: std::env::temp_dir().join("spool-cache"),
            budget_bytes: 512 * 1024 * 1024,
            max_entries: None,
            remove_on_teardown: false,
        }
    }
}

/// Playback engine and controller cadence
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Decoded PCM held ahead of the renderer
    pub ring_ms: u64,
    /// Controller housekeeping interval
    pub tick_ms: u64,
    /// Minimum spacing of position/progress callbacks
    pub position_update_ms: u64,
}

impl EngineConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ring_ms: 2_000,
            tick_ms: 10,
            position_update_ms: 250,
        }
    }
}

fn invalid(message: &str) -> AudioError {
    AudioError::InvalidState(format!("Invalid configuration: {}", message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        PlayerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_watermark_order_enforced() {
        let mut config = PlayerConfig::default();
        config.buffer.low_watermark = 8000;
        config.buffer.high_watermark = 2000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_pending_limit_rejected() {
        let mut config = PlayerConfig::default();
        config.buffer.pending_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = PlayerConfig::from_json(
            r#"{ "buffer": { "low_watermark": 2000, "high_watermark": 8000 },
                 "retry": { "max_retries": 2 } }"#,
        )
        .unwrap();
        assert_eq!(config.buffer.low_watermark, 2000);
        assert_eq!(config.buffer.high_watermark, 8000);
        assert_eq!(config.buffer.capacity, BufferConfig::default().capacity);
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.initial_backoff_ms, 500);
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy {
            max_retries: 4,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(400)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(500)));
        assert_eq!(policy.delay_for(4), None);
    }
}
