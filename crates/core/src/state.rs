// Player state and playback status

use crate::error::{AudioError, Result};
use parking_lot::RwLock;
use std::sync::Arc;

/// Player state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlayerState {
    /// No session
    Idle,
    /// Session created, waiting for the decoder to parse the header
    Preparing,
    /// Format known, filling the buffer up to the high watermark
    Buffering,
    /// Render pulls running
    Playing,
    /// Render pulls stopped by the user
    Paused,
    /// Flushing and re-targeting after a seek request
    Seeking,
    /// Underrun with a starved buffer; resumes on its own
    Stalled,
    /// Decoder reached end of stream and the renderer drained
    Finished,
    /// Unrecoverable error; terminal until the next play request
    Failed,
}

impl PlayerState {
    /// States in which pause is meaningful
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PlayerState::Preparing
                | PlayerState::Buffering
                | PlayerState::Playing
                | PlayerState::Seeking
                | PlayerState::Stalled
        )
    }

    /// Whether `self -> to` is a legal transition.
    ///
    /// Play requests (`-> Preparing`) and stop requests (`-> Idle`) are legal
    /// from every state because they replace or destroy the session.
    pub fn can_transition_to(self, to: PlayerState) -> bool {
        use PlayerState::*;

        if matches!(to, Preparing | Idle) {
            return true;
        }

        match (self, to) {
            (Preparing, Buffering) | (Preparing, Paused) | (Preparing, Failed) => true,

            (Buffering, Playing)
            | (Buffering, Paused)
            | (Buffering, Seeking)
            | (Buffering, Finished)
            | (Buffering, Failed) => true,

            (Playing, Stalled)
            | (Playing, Paused)
            | (Playing, Seeking)
            | (Playing, Finished)
            | (Playing, Failed) => true,

            (Stalled, Playing)
            | (Stalled, Paused)
            | (Stalled, Seeking)
            | (Stalled, Finished)
            | (Stalled, Failed) => true,

            (Paused, Buffering)
            | (Paused, Playing)
            | (Paused, Stalled)
            | (Paused, Seeking)
            | (Paused, Finished)
            | (Paused, Failed) => true,

            (Seeking, Buffering)
            | (Seeking, Paused)
            | (Seeking, Finished)
            | (Seeking, Failed) => true,

            // Replay or seek after the end
            (Finished, Seeking) => true,

            _ => false,
        }
    }
}

/// Playback status information
#[derive(Debug, Clone)]
pub struct PlaybackStatus {
    /// Current playback position in milliseconds
    pub position_ms: u64,
    /// Total duration in milliseconds (0 while unknown)
    pub duration_ms: u64,
    /// Current volume (0.0 - 1.0)
    pub volume: f32,
    /// Received bytes over expected bytes (0.0 - 1.0)
    pub buffering_ratio: f64,
    /// Total track length in bytes, if the source reported it
    pub expected_length: Option<u64>,
    /// Bytes covered by the cache or received this session
    pub received_length: u64,
    /// Download speed in bytes per second
    pub download_speed: u64,
    /// Bytes waiting in the streaming buffer
    pub buffered_bytes: usize,
}

impl Default for PlaybackStatus {
    fn default() -> Self {
        Self {
            position_ms: 0,
            duration_ms: 0,
            volume: 1.0,
            buffering_ratio: 0.0,
            expected_length: None,
            received_length: 0,
            download_speed: 0,
            buffered_bytes: 0,
        }
    }
}

/// Thread-safe player state container.
///
/// The controller is the only writer; everything else holds a clone and reads.
#[derive(Clone)]
pub struct PlayerStateContainer {
    state: Arc<RwLock<PlayerState>>,
    status: Arc<RwLock<PlaybackStatus>>,
}

impl PlayerStateContainer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(PlayerState::Idle)),
            status: Arc::new(RwLock::new(PlaybackStatus::default())),
        }
    }

    pub fn get_state(&self) -> PlayerState {
        *self.state.read()
    }

    /// Moves to `to`, returning the previous state.
    pub fn transition(&self, to: PlayerState) -> Result<PlayerState> {
        let mut state = self.state.write();
        let from = *state;
        if !from.can_transition_to(to) {
            return Err(AudioError::InvalidState(format!(
                "Invalid state transition from {:?} to {:?}",
                from, to
            )));
        }
        *state = to;
        log::debug!("Player state changed: {:?} -> {:?}", from, to);
        Ok(from)
    }

    pub fn get_status(&self) -> PlaybackStatus {
        self.status.read().clone()
    }

    pub fn update_status<F>(&self, f: F)
    where
        F: FnOnce(&mut PlaybackStatus),
    {
        let mut status = self.status.write();
        f(&mut status);
    }
}

impl Default for PlayerStateContainer {
    fn default() -> Self {
        Self::new()
    }
}
