//! Key controller.
//!
//! Owns everything that belongs to one key on the device: its settings, its
//! sample store, a sampling task and a render task. The controller is a
//! small state machine:
//!
//! ```text
//!  Uninitialized ──configure──▶ Active ◀──resume/suspend──▶ Suspended
//!        │                        │                            │
//!        └────────────destroy─────┴──────────destroy───────────┴──▶ Destroyed
//! ```
//!
//! Renders for a key are serialized through one pipeline lock, so a frame
//! from an earlier tick is always pushed before a frame from a later one.
//! [`KeyController::destroy`] cancels both tasks and waits for them, after
//! which the key never touches the sensor registry or the host again.

use crate::core::clock::SampleClock;
use crate::core::frame::{Dimensions, FrameStamp, RasterImage, RenderedFrame};
use crate::core::render::render;
use crate::core::scheduler::{Sampler, SamplingPlan};
use crate::core::settings::KeySettings;
use crate::core::store::{SampleStore, DEFAULT_SLACK};
use crate::plugin::host::HostSink;
use crate::sensors::SensorRegistry;
use crate::stats::SharedStats;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Default render cadence.
pub const DEFAULT_RENDER_INTERVAL: Duration = Duration::from_secs(1);

/// Host identifier of a key instance (the action context).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(String);

impl KeyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyState {
    Uninitialized,
    Active,
    Suspended,
    Destroyed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("key {0} has been destroyed")]
    Destroyed(KeyId),
}

/// Result of one render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The controller is destroyed
    Closed,
    /// Nothing new to show, or the key is not active
    Skipped,
    Pushed,
    PushFailed,
}

/// Dependencies every controller shares.
#[derive(Clone)]
pub struct KeyRuntime {
    pub registry: SensorRegistry,
    pub sink: Arc<dyn HostSink>,
    pub stats: SharedStats,
    pub dimensions: Dimensions,
    pub render_interval: Duration,
    pub retention_slack: usize,
    pub clock: SampleClock,
}

impl KeyRuntime {
    pub fn new(registry: SensorRegistry, sink: Arc<dyn HostSink>, stats: SharedStats) -> Self {
        Self {
            registry,
            sink,
            stats,
            dimensions: Dimensions::default(),
            render_interval: DEFAULT_RENDER_INTERVAL,
            retention_slack: DEFAULT_SLACK,
            clock: SampleClock::new(),
        }
    }
}

#[derive(Debug)]
struct VersionedSettings {
    version: u64,
    settings: KeySettings,
}

#[derive(Debug, Default)]
struct FramePipeline {
    closed: bool,
    last_stamp: Option<FrameStamp>,
    last_pushed: Option<Arc<RasterImage>>,
}

/// State shared between the controller and its render task.
struct Shared {
    key: KeyId,
    runtime: KeyRuntime,
    store: Arc<SampleStore>,
    settings: watch::Receiver<Option<Arc<VersionedSettings>>>,
    unit: Arc<parking_lot::Mutex<String>>,
    last_tick: Arc<parking_lot::Mutex<Option<Instant>>>,
    pipeline: Mutex<FramePipeline>,
    force_refresh: AtomicBool,
}

impl Shared {
    /// Render the current window and push it if anything changed.
    async fn render_pass(&self) -> TickOutcome {
        let mut pipeline = self.pipeline.lock().await;
        if pipeline.closed {
            return TickOutcome::Closed;
        }
        let Some(current) = self.settings.borrow().clone() else {
            return TickOutcome::Skipped;
        };
        let stats = &self.runtime.stats;

        let snapshot = self.store.snapshot(current.settings.window);
        let stamp = FrameStamp {
            settings_version: current.version,
            store_version: snapshot.version,
        };
        let forced = self.force_refresh.swap(false, Ordering::AcqRel);
        if !forced && pipeline.last_stamp == Some(stamp) {
            stats.record_frame_skipped();
            return TickOutcome::Skipped;
        }

        let unit = self.unit.lock().clone();
        let style = current.settings.graph_style(&unit);
        let dims = self.runtime.dimensions;
        let (image, fallback) = match render(&snapshot.samples, &style, dims) {
            Ok(image) => (image, false),
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "render failed, showing fallback frame");
                stats.record_render_failure();
                (RasterImage::solid(dims, style.background), true)
            }
        };
        stats.record_frame_rendered();
        pipeline.last_stamp = Some(stamp);

        if !forced && pipeline.last_pushed.as_deref() == Some(&image) {
            stats.record_frame_skipped();
            return TickOutcome::Skipped;
        }

        let frame = RenderedFrame {
            image: Arc::new(image),
            stamp,
            rendered_at: self.runtime.clock.now(),
            fallback,
        };
        match self.runtime.sink.set_image(&self.key, &frame).await {
            Ok(()) => {
                stats.record_frame_pushed();
                pipeline.last_pushed = Some(frame.image);
                TickOutcome::Pushed
            }
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "failed to push frame");
                stats.record_push_failure();
                // retry on the next tick even if nothing changes
                pipeline.last_stamp = None;
                if forced {
                    self.force_refresh.store(true, Ordering::Release);
                }
                TickOutcome::PushFailed
            }
        }
    }
}

async fn render_loop(shared: Arc<Shared>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if shared.render_pass().await == TickOutcome::Closed {
                    break;
                }
            }
        }
    }
}

struct Tasks {
    cancel: CancellationToken,
    sampler: JoinHandle<()>,
    renderer: JoinHandle<()>,
}

impl Tasks {
    async fn stop(self, key: &KeyId) {
        self.cancel.cancel();
        for (name, handle) in [("sampler", self.sampler), ("renderer", self.renderer)] {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(key = %key, task = name, "key task panicked");
                }
            }
        }
    }
}

/// Lifecycle owner of one key.
pub struct KeyController {
    key: KeyId,
    state: KeyState,
    visible: bool,
    shared: Arc<Shared>,
    settings_tx: watch::Sender<Option<Arc<VersionedSettings>>>,
    plan_tx: watch::Sender<SamplingPlan>,
    generation: u64,
    settings_version: u64,
    tasks: Option<Tasks>,
}

impl KeyController {
    /// A new, unconfigured controller. Nothing runs until [`configure`](Self::configure).
    pub fn new(key: KeyId, runtime: KeyRuntime) -> Self {
        let defaults = KeySettings::default();
        let store = Arc::new(SampleStore::new(
            defaults.window,
            defaults.capacity(runtime.retention_slack),
        ));
        let (settings_tx, settings_rx) = watch::channel(None);
        let (plan_tx, _) = watch::channel(SamplingPlan {
            sensor_id: defaults.sensor_id.clone(),
            interval: defaults.sampling_interval,
            generation: 0,
        });
        runtime.stats.record_key_created();

        Self {
            shared: Arc::new(Shared {
                key: key.clone(),
                runtime,
                store,
                settings: settings_rx,
                unit: Arc::new(parking_lot::Mutex::new(String::new())),
                last_tick: Arc::new(parking_lot::Mutex::new(None)),
                pipeline: Mutex::new(FramePipeline::default()),
                force_refresh: AtomicBool::new(false),
            }),
            key,
            state: KeyState::Uninitialized,
            visible: true,
            settings_tx,
            plan_tx,
            generation: 0,
            settings_version: 0,
            tasks: None,
        }
    }

    pub fn key(&self) -> &KeyId {
        &self.key
    }

    pub fn state(&self) -> KeyState {
        self.state
    }

    /// Settings currently in effect.
    pub fn settings(&self) -> Option<KeySettings> {
        self.settings_tx.borrow().as_ref().map(|v| v.settings.clone())
    }

    pub fn store(&self) -> &Arc<SampleStore> {
        &self.shared.store
    }

    /// Sensor binding generation; bumps whenever the sensor changes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replace the key's configuration as a whole.
    ///
    /// Samples are kept unless the sensor changed. The first configuration
    /// starts sampling and rendering (unless the key is currently hidden).
    pub fn configure(&mut self, settings: KeySettings) -> Result<(), KeyError> {
        if self.state == KeyState::Destroyed {
            return Err(KeyError::Destroyed(self.key.clone()));
        }
        let store = &self.shared.store;
        let previous_sensor = self.settings_tx.borrow().as_ref().map(|v| v.settings.sensor_id.clone());
        let rebind = previous_sensor.as_ref() != Some(&settings.sensor_id);

        if rebind {
            // Reset before publishing the plan so in-flight samples for the
            // old sensor are refused as stale.
            self.generation += 1;
            store.reset(self.generation);
            self.shared.unit.lock().clear();
        }
        store.reconfigure(settings.window, settings.capacity(self.shared.runtime.retention_slack));

        tracing::info!(
            key = %self.key,
            sensor = %settings.sensor_id,
            window_secs = settings.window.as_secs_f64(),
            interval_ms = settings.sampling_interval.as_millis() as u64,
            rebind,
            "key configured"
        );

        self.settings_version += 1;
        let plan = SamplingPlan {
            sensor_id: settings.sensor_id.clone(),
            interval: settings.sampling_interval,
            generation: self.generation,
        };
        self.settings_tx.send_replace(Some(Arc::new(VersionedSettings {
            version: self.settings_version,
            settings,
        })));
        self.plan_tx.send_replace(plan);

        if self.state == KeyState::Uninitialized {
            if self.visible {
                self.start_tasks();
                self.state = KeyState::Active;
            } else {
                self.state = KeyState::Suspended;
            }
        }
        Ok(())
    }

    /// Run one render pass now, in order with the periodic render task.
    pub async fn on_tick(&self) -> TickOutcome {
        match self.state {
            KeyState::Destroyed => TickOutcome::Closed,
            KeyState::Active => self.shared.render_pass().await,
            KeyState::Uninitialized | KeyState::Suspended => TickOutcome::Skipped,
        }
    }

    /// Stop sampling and rendering while the key is off screen.
    pub async fn suspend(&mut self) {
        self.visible = false;
        if self.state != KeyState::Active {
            return;
        }
        if let Some(tasks) = self.tasks.take() {
            tasks.stop(&self.key).await;
        }
        self.state = KeyState::Suspended;
        tracing::debug!(key = %self.key, "key suspended");
    }

    /// Restart sampling and rendering, forcing the next frame out.
    pub fn resume(&mut self) {
        self.visible = true;
        if self.state != KeyState::Suspended {
            return;
        }
        self.shared.force_refresh.store(true, Ordering::Release);
        self.start_tasks();
        self.state = KeyState::Active;
        tracing::debug!(key = %self.key, "key resumed");
    }

    /// Push a frame on the next render pass even if nothing changed.
    pub fn request_refresh(&self) {
        self.shared.force_refresh.store(true, Ordering::Release);
    }

    /// Cancel all work for this key and wait for it to finish.
    pub async fn destroy(&mut self) {
        if self.state == KeyState::Destroyed {
            return;
        }
        if let Some(tasks) = self.tasks.take() {
            tasks.stop(&self.key).await;
        }
        // Waits out an on_tick push that is already in flight.
        self.shared.pipeline.lock().await.closed = true;
        self.shared.store.reset(self.generation + 1);
        self.state = KeyState::Destroyed;
        self.shared.runtime.stats.record_key_destroyed();
        tracing::info!(key = %self.key, "key destroyed");
    }

    fn start_tasks(&mut self) {
        let runtime = &self.shared.runtime;
        let cancel = CancellationToken::new();
        let sampler = Sampler {
            key: self.key.to_string(),
            registry: runtime.registry.clone(),
            store: self.shared.store.clone(),
            plan: self.plan_tx.subscribe(),
            clock: runtime.clock,
            stats: runtime.stats.clone(),
            unit: self.shared.unit.clone(),
            last_tick: self.shared.last_tick.clone(),
        }
        .spawn(cancel.clone());
        let renderer = tokio::spawn(render_loop(
            self.shared.clone(),
            runtime.render_interval,
            cancel.clone(),
        ));
        self.tasks = Some(Tasks {
            cancel,
            sampler,
            renderer,
        });
    }
}

impl Drop for KeyController {
    fn drop(&mut self) {
        if let Some(tasks) = &self.tasks {
            tasks.cancel.cancel();
        }
    }
}

impl fmt::Debug for KeyController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyController")
            .field("key", &self.key)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::host::{FrameCache, HostError};
    use crate::sensors::{ScriptedSource, SensorInfo, Waveform};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use crate::stats::ActivityStats;
    use serde_json::json;

    struct Fixture {
        source: Arc<ScriptedSource>,
        cache: Arc<FrameCache>,
        stats: SharedStats,
        runtime: KeyRuntime,
    }

    fn fixture() -> Fixture {
        let source = Arc::new(ScriptedSource::new());
        source.add_waveform_sensor(
            "cpu.load",
            "CPU Load",
            "%",
            Waveform::Triangle { min: 10.0, max: 90.0, period: 20 },
        );
        source.add_waveform_sensor("gpu.load", "GPU Load", "%", Waveform::Constant(33.0));
        let cache = Arc::new(FrameCache::new());
        let stats: SharedStats = Arc::new(ActivityStats::new());
        let registry = SensorRegistry::with_timeout(source.clone(), Duration::from_millis(200));
        let runtime = KeyRuntime::new(registry, cache.clone(), stats.clone());
        Fixture {
            source,
            cache,
            stats,
            runtime,
        }
    }

    fn settings(raw: serde_json::Value) -> KeySettings {
        KeySettings::from_raw(&raw).0
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_states() {
        let f = fixture();
        let mut key = KeyController::new(KeyId::new("k1"), f.runtime.clone());
        assert_eq!(key.state(), KeyState::Uninitialized);
        assert_eq!(key.on_tick().await, TickOutcome::Skipped);

        key.configure(settings(json!({"sensorId": "cpu.load"}))).unwrap();
        assert_eq!(key.state(), KeyState::Active);

        key.suspend().await;
        assert_eq!(key.state(), KeyState::Suspended);
        key.resume();
        assert_eq!(key.state(), KeyState::Active);

        key.destroy().await;
        assert_eq!(key.state(), KeyState::Destroyed);
        assert_eq!(key.on_tick().await, TickOutcome::Closed);
        assert!(key.configure(KeySettings::default()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_are_pushed_only_on_change() {
        let f = fixture();
        let mut key = KeyController::new(KeyId::new("k1"), f.runtime.clone());
        key.configure(settings(json!({"sensorId": "cpu.load"}))).unwrap();
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert!(f.cache.push_count(key.key()) >= 2);

        key.suspend().await;
        let pushes = f.cache.push_count(key.key());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.cache.push_count(key.key()), pushes);

        // Suspended keys do not render on explicit ticks either.
        assert_eq!(key.on_tick().await, TickOutcome::Skipped);
        key.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_tick_dedupes_unchanged_frames() {
        let f = fixture();
        let runtime = KeyRuntime {
            render_interval: Duration::from_secs(3600),
            ..f.runtime.clone()
        };
        let mut key = KeyController::new(KeyId::new("k1"), runtime);
        key.configure(settings(json!({"sensorId": "gpu.load", "samplingIntervalMs": 60000}))).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The render task's first tick already pushed the current state.
        assert_eq!(key.on_tick().await, TickOutcome::Skipped);
        key.request_refresh();
        assert_eq!(key.on_tick().await, TickOutcome::Pushed);
        assert!(f.stats.snapshot().frames_skipped >= 1);
        key.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cosmetic_change_keeps_samples_sensor_change_resets() {
        let f = fixture();
        let mut key = KeyController::new(KeyId::new("k1"), f.runtime.clone());
        key.configure(settings(json!({"sensorId": "cpu.load"}))).unwrap();
        tokio::time::sleep(Duration::from_millis(5_500)).await;
        let kept = key.store().len();
        assert!(kept >= 5);

        key.configure(settings(json!({"sensorId": "cpu.load", "style": "area", "color": "#ff00ff"})))
            .unwrap();
        assert_eq!(key.store().len(), kept);
        assert_eq!(key.generation(), 1);

        key.configure(settings(json!({"sensorId": "gpu.load"}))).unwrap();
        assert_eq!(key.generation(), 2);
        assert!(key.store().len() <= 1);
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        let samples = key.store().window(Duration::from_secs(60));
        assert!(samples.iter().all(|s| s.value == 33.0));
        key.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_freezes_sensor_calls_and_pushes() {
        let f = fixture();
        let mut key = KeyController::new(KeyId::new("k1"), f.runtime.clone());
        key.configure(settings(json!({"sensorId": "cpu.load", "samplingIntervalMs": 100}))).unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        key.destroy().await;

        let calls = f.source.call_count();
        let pushes = f.cache.push_count(key.key());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.source.call_count(), calls);
        assert_eq!(f.cache.push_count(key.key()), pushes);
        assert!(key.store().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hidden_key_starts_suspended() {
        let f = fixture();
        let mut key = KeyController::new(KeyId::new("k1"), f.runtime.clone());
        key.suspend().await;
        key.configure(KeySettings::default()).unwrap();
        assert_eq!(key.state(), KeyState::Suspended);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(f.source.call_count(), 0);

        key.resume();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(f.source.call_count() > 0);
        assert_eq!(f.cache.push_count(key.key()), 1);
        key.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_render_failure_pushes_fallback_frame() {
        let f = fixture();
        let runtime = KeyRuntime {
            dimensions: Dimensions::new(4, 4),
            ..f.runtime.clone()
        };
        let mut key = KeyController::new(KeyId::new("k1"), runtime);
        key.configure(KeySettings::default()).unwrap();
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        let frame = f.cache.latest(key.key()).unwrap();
        assert!(frame.fallback);
        assert_eq!(frame.image.width(), 4);
        assert!(f.stats.snapshot().render_failures >= 1);
        assert_eq!(key.state(), KeyState::Active);
        key.destroy().await;
    }

    /// Fails the next `failures` pushes, then stores frames.
    #[derive(Default)]
    struct FlakySink {
        failures: AtomicU32,
        frames: FrameCache,
    }

    #[async_trait]
    impl HostSink for FlakySink {
        async fn set_image(&self, key: &KeyId, frame: &RenderedFrame) -> Result<(), HostError> {
            let failing = self
                .failures
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(HostError::Closed);
            }
            self.frames.set_image(key, frame).await
        }

        async fn sensor_list(&self, key: &KeyId, sensors: &[SensorInfo]) -> Result<(), HostError> {
            HostSink::sensor_list(&self.frames, key, sensors).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_frame_survives_a_failed_push() {
        let f = fixture();
        let sink = Arc::new(FlakySink::default());
        let runtime = KeyRuntime {
            render_interval: Duration::from_secs(3600),
            sink: sink.clone(),
            ..f.runtime.clone()
        };
        let mut key = KeyController::new(KeyId::new("k1"), runtime);
        key.configure(settings(json!({"sensorId": "gpu.load", "samplingIntervalMs": 60000}))).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        key.request_refresh();
        assert_eq!(key.on_tick().await, TickOutcome::Pushed);
        let pushes = sink.frames.push_count(key.key());

        sink.failures.store(1, Ordering::Release);
        key.request_refresh();
        assert_eq!(key.on_tick().await, TickOutcome::PushFailed);
        // Same image as the last delivered one, but the refresh is still owed.
        assert_eq!(key.on_tick().await, TickOutcome::Pushed);
        assert_eq!(sink.frames.push_count(key.key()), pushes + 1);
        assert_eq!(key.on_tick().await, TickOutcome::Skipped);
        key.destroy().await;
    }
}
