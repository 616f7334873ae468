// Control surface of the audio player

use crate::callback::PlayerCallback;
use crate::error::Result;
use crate::state::{PlaybackStatus, PlayerState};
use std::sync::Arc;

/// What a front end drives. Every method applies on the controller thread
/// before returning; state and status reads never block.
pub trait AudioPlayer: Send + Sync {
    /// Start playing a track; replaces any current session.
    /// `http(s)://` sources stream from the network, anything else is a local path.
    fn play(&mut self, source: &str) -> Result<()>;

    /// Pause playback (fetching continues unless configured otherwise)
    fn pause(&mut self) -> Result<()>;

    /// Leave Paused; an error from Idle, Finished or Failed
    fn resume(&mut self) -> Result<()>;

    /// Seek to `position_ms`; before the stream opens the seek is deferred
    fn seek(&mut self, position_ms: u64) -> Result<()>;

    /// Stop playback and tear down the session
    fn stop(&mut self) -> Result<()>;

    /// Linear gain in 0.0..=1.0; anything else is rejected
    fn set_volume(&mut self, volume: f32) -> Result<()>;

    fn get_state(&self) -> PlayerState;

    fn get_status(&self) -> PlaybackStatus;

    /// Replace the event listener; `None` removes it
    fn set_callback(&mut self, callback: Option<Arc<dyn PlayerCallback>>);

    /// Tear down the session and the output device; later calls fail
    fn release(&mut self) -> Result<()>;

    fn as_any(&self) -> &dyn std::any::Any;
}
