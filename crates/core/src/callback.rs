// Player event signals with throttling for high-frequency updates

use crate::error::ErrorKind;
use crate::state::PlayerState;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Player event types
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackEvent {
    /// Player state changed
    StateChanged {
        old_state: PlayerState,
        new_state: PlayerState,
    },

    /// Playback position updated
    PositionChanged {
        position_ms: u64,
        duration_ms: u64,
    },

    /// Terminal error; the player is now `Failed`
    Error { kind: ErrorKind, message: String },

    /// Recoverable problem, playback intent is kept
    Warning { kind: ErrorKind, message: String },

    /// Download progress for the current track
    DownloadProgress {
        received: u64,
        expected: Option<u64>,
        bytes_per_sec: u64,
    },
}

impl CallbackEvent {
    fn is_throttled(&self) -> bool {
        matches!(
            self,
            CallbackEvent::PositionChanged { .. } | CallbackEvent::DownloadProgress { .. }
        )
    }
}

/// Player callback trait
/// Implementations should be lightweight and non-blocking
pub trait PlayerCallback: Send + Sync {
    /// Called on the controller thread when an event occurs
    fn on_event(&self, event: CallbackEvent);
}

/// Throttled callback wrapper
/// Prevents excessive callback frequency for position and progress updates
pub struct ThrottledCallback {
    inner: Arc<dyn PlayerCallback>,
    last_position_update: Mutex<Option<Instant>>,
    last_progress_update: Mutex<Option<Instant>>,
    interval: Duration,
}

impl ThrottledCallback {
    pub fn new(callback: Arc<dyn PlayerCallback>, update_interval_ms: u64) -> Self {
        Self {
            inner: callback,
            last_position_update: Mutex::new(None),
            last_progress_update: Mutex::new(None),
            interval: Duration::from_millis(update_interval_ms),
        }
    }

    pub fn dispatch(&self, event: CallbackEvent) {
        if !event.is_throttled() {
            self.inner.on_event(event);
            return;
        }

        let slot = match event {
            CallbackEvent::PositionChanged { .. } => &self.last_position_update,
            _ => &self.last_progress_update,
        };
        let mut last = slot.lock();
        let due = last.map_or(true, |at| at.elapsed() >= self.interval);
        if due {
            *last = Some(Instant::now());
            drop(last);
            self.inner.on_event(event);
        }
    }
}

/// Fan-out of events to every registered callback
pub struct CallbackManager {
    callbacks: Mutex<Vec<Arc<ThrottledCallback>>>,
}

impl CallbackManager {
    pub fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn add_callback(&self, callback: Arc<dyn PlayerCallback>, throttle_ms: u64) {
        let throttled = Arc::new(ThrottledCallback::new(callback, throttle_ms));
        self.callbacks.lock().push(throttled);
    }

    pub fn clear_callbacks(&self) {
        self.callbacks.lock().clear();
    }

    pub fn dispatch_event(&self, event: CallbackEvent) {
        // Snapshot so a callback may register or clear callbacks re-entrantly
        let callbacks: Vec<_> = self.callbacks.lock().clone();
        for callback in callbacks.iter() {
            callback.dispatch(event.clone());
        }
    }
}

impl Default for CallbackManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback that records every event, for tests
#[derive(Default)]
pub struct RecordingCallback {
    events: Mutex<Vec<CallbackEvent>>,
}

impl RecordingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CallbackEvent> {
        self.events.lock().clone()
    }

    pub fn states(&self) -> Vec<PlayerState> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                CallbackEvent::StateChanged { new_state, .. } => Some(*new_state),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl PlayerCallback for RecordingCallback {
    fn on_event(&self, event: CallbackEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_throttled_callback() {
        let recorder = Arc::new(RecordingCallback::new());
        let throttled = ThrottledCallback::new(recorder.clone(), 100);

        for i in 0..10 {
            throttled.dispatch(CallbackEvent::PositionChanged {
                position_ms: i * 100,
                duration_ms: 1000,
            });
            thread::sleep(Duration::from_millis(10));
        }

        let events = recorder.events();
        assert!(events.len() < 10);
        // First update always goes through
        assert_eq!(
            events[0],
            CallbackEvent::PositionChanged {
                position_ms: 0,
                duration_ms: 1000
            }
        );
    }

    #[test]
    fn test_non_throttled_events() {
        let recorder = Arc::new(RecordingCallback::new());
        let throttled = ThrottledCallback::new(recorder.clone(), 100);

        throttled.dispatch(CallbackEvent::StateChanged {
            old_state: PlayerState::Idle,
            new_state: PlayerState::Preparing,
        });
        throttled.dispatch(CallbackEvent::Warning {
            kind: ErrorKind::DecoderFrame,
            message: "skipped".into(),
        });
        throttled.dispatch(CallbackEvent::StateChanged {
            old_state: PlayerState::Preparing,
            new_state: PlayerState::Failed,
        });

        assert_eq!(recorder.events().len(), 3);
        assert_eq!(
            recorder.states(),
            vec![PlayerState::Preparing, PlayerState::Failed]
        );
    }

    #[test]
    fn test_progress_and_position_throttle_independently() {
        let recorder = Arc::new(RecordingCallback::new());
        let manager = CallbackManager::new();
        manager.add_callback(recorder.clone(), 10_000);

        manager.dispatch_event(CallbackEvent::PositionChanged {
            position_ms: 1,
            duration_ms: 2,
        });
        manager.dispatch_event(CallbackEvent::DownloadProgress {
            received: 10,
            expected: None,
            bytes_per_sec: 0,
        });
        manager.dispatch_event(CallbackEvent::PositionChanged {
            position_ms: 2,
            duration_ms: 2,
        });

        assert_eq!(recorder.events().len(), 2);
    }
}
