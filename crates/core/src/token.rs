// Session liveness token

use crate::error::{AudioError, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Shared liveness flag for one playback session.
///
/// Workers hold clones and check the token before every cache write, buffer
/// push and emitted event. Teardown revokes it once for all clones.
#[derive(Debug, Clone)]
pub struct SessionToken {
    live: Arc<AtomicBool>,
    id: u64,
}

impl SessionToken {
    pub fn new() -> Self {
        Self {
            live: Arc::new(AtomicBool::new(true)),
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    pub fn revoke(&self) {
        self.live.store(false, Ordering::Release);
    }

    pub fn ensure_live(&self) -> Result<()> {
        if self.is_live() {
            Ok(())
        } else {
            Err(AudioError::InvalidState(format!(
                "Session {} has been torn down",
                self.id
            )))
        }
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}
