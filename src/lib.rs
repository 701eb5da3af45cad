//! Sensor Key Graphs - live hardware telemetry on programmable keypad keys.
//!
//! Each key on the device is bound to one hardware sensor. The plugin
//! samples that sensor on a fixed cadence, keeps a rolling time window of
//! samples, and renders it into a small line or area graph that is pushed to
//! the key as a PNG image.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Sensor Key Graphs                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  host events ──▶ ┌─────────────┐                             │
//! │   (stdin/HTTP)   │ Coordinator │── one per key ──┐           │
//! │                  └─────────────┘                 ▼           │
//! │  ┌──────────┐    ┌─────────────┐          ┌─────────────┐   │
//! │  │ Registry │◀───│  Scheduler  │─────────▶│ SampleStore │   │
//! │  │(sysinfo) │    │  (sampling) │          │  (window)   │   │
//! │  └──────────┘    └─────────────┘          └─────────────┘   │
//! │                                                  │           │
//! │                  ┌─────────────┐          ┌─────────────┐   │
//! │  key images ◀────│  HostSink   │◀─────────│  Renderer   │   │
//! │   (stdout/HTTP)  └─────────────┘          └─────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sensor_key_graphs::plugin::{FrameCache, HostEvent, PluginCoordinator};
//! use sensor_key_graphs::{ActivityStats, KeyId, PluginConfig, ScriptedSource};
//!
//! # async fn demo() {
//! let frames = Arc::new(FrameCache::new());
//! let runtime = PluginConfig::default().key_runtime(
//!     Arc::new(ScriptedSource::demo()),
//!     frames.clone(),
//!     Arc::new(ActivityStats::new()),
//! );
//! let coordinator = PluginCoordinator::new(runtime).spawn();
//! coordinator
//!     .send(HostEvent::KeyAdded {
//!         key: KeyId::new("key-1"),
//!         settings: Some(serde_json::json!({ "sensorId": "cpu.load" })),
//!     })
//!     .await
//!     .ok();
//! # }
//! ```

pub mod config;
pub mod core;
pub mod plugin;
pub mod sensors;
pub mod stats;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use config::{ConfigError, PluginConfig};
pub use crate::core::{
    Dimensions, KeyController, KeyId, KeyRuntime, KeySettings, KeyState, RasterImage, Sample,
    SampleStore,
};
pub use plugin::{CoordinatorHandle, HostEvent, HostOutput, HostSink, PluginCoordinator};
pub use sensors::{
    CombinedSource, Reading, ScriptedSource, SensorError, SensorId, SensorInfo, SensorRegistry,
    SensorSource, SystemSensors, WebSocketFeed, WebSocketSource,
};
pub use stats::{ActivityStats, SharedStats, StatsSnapshot};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
