//! Wall-clock timestamps derived from the runtime's monotonic clock.
//!
//! Samples need UTC timestamps for display, but ordering must follow the
//! monotonic clock so a wall-clock step never produces an out-of-order
//! append. The clock is anchored once and then advanced by `tokio::time`.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct SampleClock {
    anchor: Instant,
    anchor_utc: DateTime<Utc>,
}

impl SampleClock {
    /// Anchor a clock at the current instant.
    pub fn new() -> Self {
        Self::anchored_at(Utc::now())
    }

    /// Anchor a clock so that "now" maps to `utc`.
    pub fn anchored_at(utc: DateTime<Utc>) -> Self {
        Self {
            anchor: Instant::now(),
            anchor_utc: utc,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.at(Instant::now())
    }

    /// Timestamp for a runtime instant. Instants before the anchor map to it.
    pub fn at(&self, instant: Instant) -> DateTime<Utc> {
        let elapsed = instant.saturating_duration_since(self.anchor);
        match chrono::Duration::from_std(elapsed) {
            Ok(delta) => self.anchor_utc + delta,
            Err(_) => self.anchor_utc,
        }
    }
}

impl Default for SampleClock {
    fn default() -> Self {
        Self::new()
    }
}
