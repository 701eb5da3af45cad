//! Sampling scheduler.
//!
//! One task per active key polls the bound sensor and appends to the key's
//! store. Ticks are scheduled against absolute deadlines (`start + n *
//! interval`), so slow reads do not make the cadence drift. A read that
//! overruns its interval causes the missed ticks to be dropped rather than
//! replayed back to back. A restarted task (after a suspend) picks the
//! cadence up from the last tick of the previous one instead of sampling
//! immediately.

use crate::core::clock::SampleClock;
use crate::core::store::{AppendError, Sample, SampleStore};
use crate::sensors::{SensorError, SensorId, SensorRegistry};
use crate::stats::SharedStats;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// What to sample and how often. Published by the controller on every
/// configuration change.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingPlan {
    pub sensor_id: SensorId,
    pub interval: Duration,
    /// Store binding the samples belong to
    pub generation: u64,
}

/// Everything a sampling task needs. Cheap to clone.
#[derive(Clone)]
pub struct Sampler {
    pub key: String,
    pub registry: SensorRegistry,
    pub store: Arc<SampleStore>,
    pub plan: watch::Receiver<SamplingPlan>,
    pub clock: SampleClock,
    pub stats: SharedStats,
    /// Unit of the last usable reading, for the value label
    pub unit: Arc<Mutex<String>>,
    /// Deadline of the most recent tick, kept across task restarts
    pub last_tick: Arc<Mutex<Option<Instant>>>,
}

/// Next deadline after `previous`, skipping any that already passed.
/// Returns the deadline and how many ticks were skipped.
fn next_deadline(previous: Instant, interval: Duration, now: Instant) -> (Instant, u64) {
    let next = previous + interval;
    if next > now {
        return (next, 0);
    }
    let behind = now.duration_since(next).as_nanos();
    let skipped = behind / interval.as_nanos().max(1) + 1;
    let skipped = u32::try_from(skipped).unwrap_or(u32::MAX);
    (next + interval * skipped, u64::from(skipped))
}

impl Sampler {
    /// Start sampling until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// First deadline of a (re)started task: now, or one interval after the
    /// previous task's last tick if that is later.
    fn first_deadline(&self, now: Instant) -> Instant {
        match *self.last_tick.lock() {
            Some(last) => now.max(last + self.plan.borrow().interval),
            None => now,
        }
    }

    async fn run(self, cancel: CancellationToken) {
        let mut deadline = self.first_deadline(Instant::now());
        let mut missing_warned: Option<u64> = None;
        tracing::debug!(key = %self.key, "sampling started");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = sleep_until(deadline) => {}
        }

        loop {
            let plan = self.plan.borrow().clone();
            let timestamp = self.clock.at(deadline);
            *self.last_tick.lock() = Some(deadline);

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outcome = self.registry.resolve(&plan.sensor_id) => outcome,
            };

            let sample = match outcome {
                Ok(reading) => {
                    if reading.is_usable() && !reading.unit.is_empty() {
                        let mut unit = self.unit.lock();
                        if *unit != reading.unit {
                            *unit = reading.unit.clone();
                        }
                    }
                    Sample::from_reading(timestamp, &reading)
                }
                Err(SensorError::NotFound(id)) => {
                    if missing_warned != Some(plan.generation) {
                        tracing::warn!(key = %self.key, sensor = %id, "bound sensor is unavailable");
                        missing_warned = Some(plan.generation);
                    }
                    Sample::gap(timestamp)
                }
                Err(e) => {
                    tracing::debug!(key = %self.key, sensor = %plan.sensor_id, error = %e, "sensor read failed");
                    Sample::gap(timestamp)
                }
            };

            match self.store.append(plan.generation, sample) {
                Ok(()) => self.stats.record_sample(sample.valid),
                Err(e @ AppendError::StaleBinding { .. }) => {
                    tracing::debug!(key = %self.key, error = %e, "dropped sample for previous sensor");
                    self.stats.record_rejected_sample();
                }
                Err(e @ AppendError::OutOfOrder { .. }) => {
                    tracing::warn!(key = %self.key, error = %e, "dropped out-of-order sample");
                    self.stats.record_rejected_sample();
                }
            }

            // A new interval applies from the deadline after the one
            // already scheduled.
            let interval = self.plan.borrow().interval;
            let (next, skipped) = next_deadline(deadline, interval, Instant::now());
            if skipped > 0 {
                tracing::debug!(key = %self.key, skipped, "sensor read overran interval");
                self.stats.record_skipped_ticks(skipped);
            }
            deadline = next;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep_until(deadline) => {}
            }
        }

        tracing::debug!(key = %self.key, "sampling stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::{ScriptStep, ScriptedSource, Waveform};
    use crate::stats::ActivityStats;

    struct Harness {
        source: Arc<ScriptedSource>,
        store: Arc<SampleStore>,
        plan: watch::Sender<SamplingPlan>,
        sampler: Sampler,
        stats: SharedStats,
    }

    fn harness(interval_ms: u64) -> Harness {
        harness_with_timeout(interval_ms, Duration::from_millis(200))
    }

    fn harness_with_timeout(interval_ms: u64, timeout: Duration) -> Harness {
        let source = Arc::new(ScriptedSource::new());
        source.add_waveform_sensor("cpu.load", "CPU", "%", Waveform::Constant(50.0));
        source.add_waveform_sensor("gpu.load", "GPU", "%", Waveform::Constant(20.0));
        let store = Arc::new(SampleStore::new(Duration::from_secs(60), 1000));
        let (plan, rx) = watch::channel(SamplingPlan {
            sensor_id: SensorId::new("cpu.load"),
            interval: Duration::from_millis(interval_ms),
            generation: 0,
        });
        let stats: SharedStats = Arc::new(ActivityStats::new());
        let sampler = Sampler {
            key: "k1".into(),
            registry: SensorRegistry::with_timeout(source.clone(), timeout),
            store: store.clone(),
            plan: rx,
            clock: SampleClock::new(),
            stats: stats.clone(),
            unit: Arc::new(Mutex::new(String::new())),
            last_tick: Arc::new(Mutex::new(None)),
        };
        Harness {
            source,
            store,
            plan,
            sampler,
            stats,
        }
    }

    #[test]
    fn test_next_deadline_skips_missed_ticks() {
        let start = Instant::now();
        let second = Duration::from_secs(1);
        assert_eq!(next_deadline(start, second, start), (start + second, 0));
        let late = start + Duration::from_millis(3500);
        assert_eq!(next_deadline(start, second, late), (start + Duration::from_secs(4), 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_once_per_interval() {
        let h = harness(1000);
        let cancel = CancellationToken::new();
        let task = h.sampler.clone().spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        cancel.cancel();
        task.await.unwrap();

        // ticks at 0, 1, ..., 10 s
        assert_eq!(h.store.len(), 11);
        let samples = h.store.window(Duration::from_secs(60));
        let gaps: Vec<i64> = samples
            .windows(2)
            .map(|w| (w[1].timestamp - w[0].timestamp).num_milliseconds())
            .collect();
        assert!(gaps.iter().all(|g| *g == 1000), "{gaps:?}");
        assert_eq!(*h.sampler.unit.lock(), "%");
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrun_skips_ticks_without_backlog() {
        let h = harness_with_timeout(1000, Duration::from_secs(5));
        h.source.push_steps(
            "cpu.load",
            [ScriptStep::Value(1.0), ScriptStep::Hang(Duration::from_millis(2500))],
        );
        let cancel = CancellationToken::new();
        let task = h.sampler.clone().spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        cancel.cancel();
        task.await.unwrap();

        // ticks at 0, 1 (read takes 2.5 s), then 4, 5
        let samples = h.store.window(Duration::from_secs(60));
        assert_eq!(samples.len(), 4);
        assert!(!samples[1].valid);
        assert_eq!(h.stats.snapshot().ticks_skipped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_change_applies_on_next_tick() {
        let h = harness(1000);
        let cancel = CancellationToken::new();
        let task = h.sampler.clone().spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        h.plan.send_modify(|p| p.interval = Duration::from_millis(250));
        tokio::time::sleep(Duration::from_millis(900)).await;
        cancel.cancel();
        task.await.unwrap();

        // 0, 1, 2, 3 (already scheduled), then 3.25
        let samples = h.store.window(Duration::from_secs(60));
        assert_eq!(samples.len(), 5);
        let last = (samples[4].timestamp - samples[3].timestamp).num_milliseconds();
        assert_eq!(last, 250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_binding_samples_are_dropped() {
        let h = harness(1000);
        let cancel = CancellationToken::new();
        let task = h.sampler.clone().spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(500)).await;

        h.store.reset(1);
        h.plan.send_modify(|p| {
            p.sensor_id = SensorId::new("gpu.load");
            p.generation = 1;
        });
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        cancel.cancel();
        task.await.unwrap();

        let samples = h.store.window(Duration::from_secs(60));
        assert_eq!(samples.len(), 2);
        assert!(samples.iter().all(|s| s.value == 20.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_sensor_calls() {
        let h = harness(100);
        let cancel = CancellationToken::new();
        let task = h.sampler.clone().spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        cancel.cancel();
        task.await.unwrap();

        let calls = h.source.call_count();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.source.call_count(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_keeps_the_previous_cadence() {
        let h = harness(1000);
        let cancel = CancellationToken::new();
        let task = h.sampler.clone().spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(h.store.len(), 2);

        // Restarted half way between ticks: the next sample lands on 2 s,
        // not on 1.5 s.
        let cancel = CancellationToken::new();
        let task = h.sampler.clone().spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        cancel.cancel();
        task.await.unwrap();

        let samples = h.store.window(Duration::from_secs(60));
        assert_eq!(samples.len(), 3);
        let gaps: Vec<i64> = samples
            .windows(2)
            .map(|w| (w[1].timestamp - w[0].timestamp).num_milliseconds())
            .collect();
        assert_eq!(gaps, vec![1000, 1000]);
        assert_eq!(h.stats.snapshot().samples_rejected, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_long_pause_samples_immediately() {
        let h = harness(1000);
        *h.sampler.last_tick.lock() = Some(Instant::now() - Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let task = h.sampler.clone().spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(h.store.len(), 1);
    }
}
