//! Per-key sample retention.
//!
//! A [`SampleStore`] is a bounded, strictly time-ordered buffer. The sampling
//! task appends to it and the render path reads copies out of it; both go
//! through one lock, so a reader always sees a whole, already-evicted set.

use crate::sensors::Reading;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Hard upper bound on samples kept per key.
pub const MAX_CAPACITY: usize = 10_000;

/// Extra entries kept beyond `window / interval`.
pub const DEFAULT_SLACK: usize = 2;

/// One timestamped point of a key's time series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    /// False marks a gap (failed read, NaN, out-of-range value)
    pub valid: bool,
}

impl Sample {
    /// A valid sample. Non-finite values are stored as gaps.
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            timestamp,
            value,
            valid: value.is_finite(),
        }
    }

    /// A gap marker.
    pub fn gap(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            value: f64::NAN,
            valid: false,
        }
    }

    /// Sample for a registry reading, stamped with the scheduler's clock.
    pub fn from_reading(timestamp: DateTime<Utc>, reading: &Reading) -> Self {
        if reading.is_usable() {
            Self::new(timestamp, reading.value)
        } else {
            Self::gap(timestamp)
        }
    }
}

/// Why an append was refused.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AppendError {
    #[error("sample at {got} is not after the newest stored sample at {last}")]
    OutOfOrder {
        last: DateTime<Utc>,
        got: DateTime<Utc>,
    },
    #[error("sample belongs to sensor binding {got}, store is on binding {current}")]
    StaleBinding { current: u64, got: u64 },
}

/// Consistent copy of a store's contents.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSnapshot {
    pub version: u64,
    pub generation: u64,
    pub samples: Vec<Sample>,
}

/// Capacity for a window sampled every `interval`: `ceil(window / interval) + slack`.
pub fn capacity_for(window: Duration, interval: Duration, slack: usize) -> usize {
    let interval_ms = interval.as_millis().max(1);
    let slots = window.as_millis().div_ceil(interval_ms);
    let slots = usize::try_from(slots).unwrap_or(MAX_CAPACITY);
    slots.saturating_add(slack).clamp(2, MAX_CAPACITY)
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[derive(Debug)]
struct StoreInner {
    samples: VecDeque<Sample>,
    retention: chrono::Duration,
    capacity: usize,
    generation: u64,
    version: u64,
}

impl StoreInner {
    /// Drop entries older than the retention window or beyond capacity.
    /// Returns true if anything was removed.
    fn evict(&mut self) -> bool {
        let Some(latest) = self.samples.back().map(|s| s.timestamp) else {
            return false;
        };
        let before = self.samples.len();
        while let Some(front) = self.samples.front() {
            if latest - front.timestamp > self.retention {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        let evicted = self.samples.len() != before;
        if evicted {
            self.version += 1;
        }
        evicted
    }

    fn window(&self, duration: chrono::Duration) -> Vec<Sample> {
        let Some(latest) = self.samples.back().map(|s| s.timestamp) else {
            return Vec::new();
        };
        // Samples are ordered, so everything after the first in-window
        // entry is in the window too.
        let start = self
            .samples
            .iter()
            .position(|s| latest - s.timestamp <= duration)
            .unwrap_or(self.samples.len());
        self.samples.range(start..).copied().collect()
    }
}

/// Bounded, ordered sample buffer owned by one key.
#[derive(Debug)]
pub struct SampleStore {
    inner: Mutex<StoreInner>,
}

impl SampleStore {
    /// Create an empty store on binding generation 0.
    pub fn new(retention: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                samples: VecDeque::with_capacity(capacity.min(MAX_CAPACITY)),
                retention: to_chrono(retention),
                capacity: capacity.clamp(1, MAX_CAPACITY),
                generation: 0,
                version: 0,
            }),
        }
    }

    /// Append a sample taken under binding `generation`.
    ///
    /// Samples must arrive in strictly increasing timestamp order. A rejected
    /// sample leaves the store untouched.
    pub fn append(&self, generation: u64, sample: Sample) -> Result<(), AppendError> {
        let mut inner = self.inner.lock();
        if generation != inner.generation {
            return Err(AppendError::StaleBinding {
                current: inner.generation,
                got: generation,
            });
        }
        if let Some(last) = inner.samples.back() {
            if sample.timestamp <= last.timestamp {
                return Err(AppendError::OutOfOrder {
                    last: last.timestamp,
                    got: sample.timestamp,
                });
            }
        }
        inner.samples.push_back(sample);
        inner.version += 1;
        inner.evict();
        Ok(())
    }

    /// Samples no older than `duration` relative to the newest, oldest first.
    pub fn window(&self, duration: Duration) -> Vec<Sample> {
        self.snapshot(duration).samples
    }

    /// Like [`window`](Self::window), together with the version it was read at.
    pub fn snapshot(&self, duration: Duration) -> StoreSnapshot {
        let mut inner = self.inner.lock();
        inner.evict();
        StoreSnapshot {
            version: inner.version,
            generation: inner.generation,
            samples: inner.window(to_chrono(duration)),
        }
    }

    /// Clear all samples and switch to a new sensor binding.
    pub fn reset(&self, generation: u64) {
        let mut inner = self.inner.lock();
        inner.samples.clear();
        inner.generation = generation;
        inner.version += 1;
    }

    /// Apply new retention limits, keeping whatever still fits.
    pub fn reconfigure(&self, retention: Duration, capacity: usize) {
        let mut inner = self.inner.lock();
        inner.retention = to_chrono(retention);
        inner.capacity = capacity.clamp(1, MAX_CAPACITY);
        inner.evict();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().samples.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().version
    }

    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn store(window_secs: u64) -> SampleStore {
        let window = Duration::from_secs(window_secs);
        SampleStore::new(window, capacity_for(window, Duration::from_secs(1), DEFAULT_SLACK))
    }

    #[test]
    fn test_capacity_for() {
        let secs = Duration::from_secs;
        assert_eq!(capacity_for(secs(60), secs(1), 2), 62);
        assert_eq!(capacity_for(secs(10), Duration::from_millis(3000), 2), 6);
        assert_eq!(capacity_for(secs(3600), Duration::from_millis(50), 2), MAX_CAPACITY);
    }

    #[test]
    fn test_out_of_order_append_is_rejected() {
        let store = store(60);
        store.append(0, Sample::new(at(10), 1.0)).unwrap();
        let before = store.snapshot(Duration::from_secs(60));

        let err = store.append(0, Sample::new(at(10), 2.0)).unwrap_err();
        assert!(matches!(err, AppendError::OutOfOrder { .. }));
        assert!(store.append(0, Sample::new(at(5), 2.0)).is_err());

        assert_eq!(store.snapshot(Duration::from_secs(60)), before);
    }

    #[test]
    fn test_stale_binding_is_rejected() {
        let store = store(60);
        store.reset(3);
        let err = store.append(2, Sample::new(at(1), 1.0)).unwrap_err();
        assert_eq!(err, AppendError::StaleBinding { current: 3, got: 2 });
        assert!(store.is_empty());
    }

    #[test]
    fn test_retention_evicts_old_entries() {
        let store = store(60);
        for t in 0..=65 {
            store.append(0, Sample::new(at(t), t as f64)).unwrap();
        }
        let window = store.window(Duration::from_secs(60));
        assert_eq!(window.len(), 61);
        assert_eq!(window.first().unwrap().timestamp, at(5));
        assert_eq!(window.last().unwrap().timestamp, at(65));
    }

    #[test]
    fn test_window_narrower_than_retention() {
        let store = store(60);
        for t in 0..30 {
            store.append(0, Sample::new(at(t), 0.0)).unwrap();
        }
        let window = store.window(Duration::from_secs(10));
        assert_eq!(window.len(), 11);
        assert!(window.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(store.len(), 30);
    }

    #[test]
    fn test_capacity_cap_applies_first() {
        let store = SampleStore::new(Duration::from_secs(60), 5);
        for t in 0..10 {
            store.append(0, Sample::new(at(t), 0.0)).unwrap();
        }
        assert_eq!(store.len(), 5);
        assert_eq!(store.window(Duration::from_secs(60))[0].timestamp, at(5));
    }

    #[test]
    fn test_gaps_are_retained() {
        let store = store(60);
        store.append(0, Sample::new(at(0), 1.0)).unwrap();
        store.append(0, Sample::gap(at(1))).unwrap();
        store.append(0, Sample::new(at(2), f64::NAN)).unwrap();
        let window = store.window(Duration::from_secs(60));
        assert_eq!(window.iter().filter(|s| !s.valid).count(), 2);
    }

    #[test]
    fn test_reset_and_reconfigure_bump_version() {
        let store = store(60);
        for t in 0..20 {
            store.append(0, Sample::new(at(t), 0.0)).unwrap();
        }
        let v = store.version();
        store.reconfigure(Duration::from_secs(5), 100);
        assert_eq!(store.len(), 6);
        assert!(store.version() > v);

        let v = store.version();
        store.reset(1);
        assert!(store.is_empty());
        assert_eq!(store.generation(), 1);
        assert!(store.version() > v);
    }
}
