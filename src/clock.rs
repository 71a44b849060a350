//! Run-anchored monotonic time.
//!
//! Every scheduling decision in the engine — start offsets, stage
//! boundaries, governor ticks, duration caps — is made relative to a single
//! run-start instant. Building on [`tokio::time::Instant`] keeps the whole
//! engine driveable by the paused test clock.

use std::time::Duration;

use tokio::time::Instant;

/// Monotonic clock anchored at run start.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    start: Instant,
}

impl RunClock {
    /// Anchor a new clock at the current instant.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Time elapsed since run start.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// The absolute instant `offset` after run start, usable with
    /// `tokio::time::sleep_until`.
    pub fn at(&self, offset: Duration) -> Instant {
        self.start + offset
    }
}
