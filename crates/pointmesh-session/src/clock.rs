//! Wall-clock milliseconds anchored to the tokio clock.
//!
//! Reaction timestamps travel between peers as unix millis, while timers
//! are armed on `tokio::time`. Reading the wall clock once and advancing it
//! with tokio's monotonic `Instant` keeps both views in step, including under
//! a paused test runtime.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    base_ms: u64,
    origin: Instant,
}

impl Clock {
    pub(crate) fn new() -> Self {
        let base_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self {
            base_ms,
            origin: Instant::now(),
        }
    }

    /// Current unix time in milliseconds.
    pub(crate) fn now_ms(&self) -> u64 {
        let elapsed = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.base_ms.saturating_add(elapsed)
    }

    /// The tokio instant at which `now_ms()` reaches `ms`.
    pub(crate) fn instant_at(&self, ms: u64) -> Instant {
        self.origin + Duration::from_millis(ms.saturating_sub(self.base_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn follows_tokio_time() {
        let clock = Clock::new();
        let start = clock.now_ms();

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(clock.now_ms(), start + 1500);

        let deadline = start + 4000;
        tokio::time::sleep_until(clock.instant_at(deadline)).await;
        assert_eq!(clock.now_ms(), deadline);
    }
}
