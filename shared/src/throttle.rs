use tracing::trace;

use crate::config::DEFAULT_FRAME_INTERVAL_MS;

/// Admits at most one live frame per `min_interval_ms`.
///
/// Timestamps come from the capture pipeline, so a frame stamped earlier than the last
/// admitted one is skipped rather than treated as a new stream. Call [`reset`](Self::reset)
/// when the camera restarts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameThrottle {
    min_interval_ms: u64,
    last_ms: Option<u64>,
}

impl Default for FrameThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_INTERVAL_MS)
    }
}

impl FrameThrottle {
    #[must_use]
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            min_interval_ms,
            last_ms: None,
        }
    }

    #[must_use]
    pub fn min_interval_ms(&self) -> u64 {
        self.min_interval_ms
    }

    /// Returns true and records `now_ms` if enough time has passed since the last admitted frame.
    pub fn should_process(&mut self, now_ms: u64) -> bool {
        if let Some(last) = self.last_ms {
            if now_ms.saturating_sub(last) < self.min_interval_ms {
                trace!(now_ms, last, "frame throttled");
                return false;
            }
        }
        self.last_ms = Some(now_ms);
        true
    }

    /// Gives back a slot taken by `should_process` for a frame that was not run.
    pub(crate) fn release(&mut self, taken_ms: u64) {
        if self.last_ms == Some(taken_ms) {
            self.last_ms = None;
        }
    }

    pub fn reset(&mut self) {
        self.last_ms = None;
    }
}
