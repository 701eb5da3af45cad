//! Activity counters.
//!
//! Cheap atomic counters shared by every key, read by the CLI summary at
//! shutdown and by the `/health` endpoint. Nothing is persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for the current session.
#[derive(Debug)]
pub struct ActivityStats {
    /// Samples appended to any store
    samples_recorded: AtomicU64,
    /// Appended samples that were gaps
    samples_invalid: AtomicU64,
    /// Samples refused by a store (out of order or stale binding)
    samples_rejected: AtomicU64,
    /// Sampling ticks dropped because a read overran its interval
    ticks_skipped: AtomicU64,
    frames_rendered: AtomicU64,
    frames_pushed: AtomicU64,
    /// Render passes that produced nothing new to push
    frames_skipped: AtomicU64,
    render_failures: AtomicU64,
    push_failures: AtomicU64,
    unknown_key_events: AtomicU64,
    keys_created: AtomicU64,
    keys_destroyed: AtomicU64,
    session_start: DateTime<Utc>,
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl ActivityStats {
    pub fn new() -> Self {
        Self {
            samples_recorded: AtomicU64::new(0),
            samples_invalid: AtomicU64::new(0),
            samples_rejected: AtomicU64::new(0),
            ticks_skipped: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
            frames_pushed: AtomicU64::new(0),
            frames_skipped: AtomicU64::new(0),
            render_failures: AtomicU64::new(0),
            push_failures: AtomicU64::new(0),
            unknown_key_events: AtomicU64::new(0),
            keys_created: AtomicU64::new(0),
            keys_destroyed: AtomicU64::new(0),
            session_start: Utc::now(),
        }
    }

    /// Record an appended sample.
    pub fn record_sample(&self, valid: bool) {
        self.samples_recorded.fetch_add(1, Ordering::Relaxed);
        if !valid {
            self.samples_invalid.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_skipped_ticks(&self, count: u64) {
        self.ticks_skipped.fetch_add(count, Ordering::Relaxed);
    }

    counter!(record_rejected_sample, samples_rejected);
    counter!(record_frame_rendered, frames_rendered);
    counter!(record_frame_pushed, frames_pushed);
    counter!(record_frame_skipped, frames_skipped);
    counter!(record_render_failure, render_failures);
    counter!(record_push_failure, push_failures);
    counter!(record_unknown_key_event, unknown_key_events);
    counter!(record_key_created, keys_created);
    counter!(record_key_destroyed, keys_destroyed);

    /// Current values.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            samples_recorded: load(&self.samples_recorded),
            samples_invalid: load(&self.samples_invalid),
            samples_rejected: load(&self.samples_rejected),
            ticks_skipped: load(&self.ticks_skipped),
            frames_rendered: load(&self.frames_rendered),
            frames_pushed: load(&self.frames_pushed),
            frames_skipped: load(&self.frames_skipped),
            render_failures: load(&self.render_failures),
            push_failures: load(&self.push_failures),
            unknown_key_events: load(&self.unknown_key_events),
            keys_created: load(&self.keys_created),
            keys_destroyed: load(&self.keys_destroyed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Human-readable summary for the CLI.
    pub fn summary(&self) -> String {
        let s = self.snapshot();
        format!(
            "Session Statistics:\n\
             - Keys created / destroyed: {} / {}\n\
             - Samples recorded: {} ({} gaps, {} rejected)\n\
             - Sampling ticks skipped: {}\n\
             - Frames rendered: {}\n\
             - Frames pushed: {} ({} unchanged, {} push failures)\n\
             - Render failures: {}\n\
             - Events for unknown keys: {}\n\
             - Session duration: {} seconds",
            s.keys_created,
            s.keys_destroyed,
            s.samples_recorded,
            s.samples_invalid,
            s.samples_rejected,
            s.ticks_skipped,
            s.frames_rendered,
            s.frames_pushed,
            s.frames_skipped,
            s.push_failures,
            s.render_failures,
            s.unknown_key_events,
            s.session_duration_secs
        )
    }
}

impl Default for ActivityStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`ActivityStats`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub samples_recorded: u64,
    pub samples_invalid: u64,
    pub samples_rejected: u64,
    pub ticks_skipped: u64,
    pub frames_rendered: u64,
    pub frames_pushed: u64,
    pub frames_skipped: u64,
    pub render_failures: u64,
    pub push_failures: u64,
    pub unknown_key_events: u64,
    pub keys_created: u64,
    pub keys_destroyed: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

/// Stats shared between the coordinator, controllers and server.
pub type SharedStats = Arc<ActivityStats>;
