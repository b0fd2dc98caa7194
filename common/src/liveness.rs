use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::error::CoreError;

/// Heartbeat written by the control unit, checked by a supervisor.
///
/// Used where no hardware task watchdog exists. Expiry is meant to be fatal.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    last_beat_ms: Arc<AtomicU64>,
    timeout_ms: u64,
}

impl LivenessMonitor {
    pub fn new(timeout_ms: u64, now_ms: u64) -> Self {
        Self {
            last_beat_ms: Arc::new(AtomicU64::new(now_ms)),
            timeout_ms,
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    pub fn beat(&self, now_ms: u64) {
        self.last_beat_ms.fetch_max(now_ms, Ordering::AcqRel);
    }

    pub fn check(&self, now_ms: u64) -> Result<(), CoreError> {
        let silent_ms = now_ms.saturating_sub(self.last_beat_ms.load(Ordering::Acquire));
        if silent_ms >= self.timeout_ms {
            return Err(CoreError::LivenessTimeout { silent_ms });
        }
        Ok(())
    }
}
