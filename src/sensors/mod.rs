//! Sensor access for the graph pipeline.
//!
//! Key controllers never talk to a concrete provider. They go through a
//! [`SensorRegistry`], which wraps any [`SensorSource`] with a bounded
//! timeout and failure normalisation.

pub mod combined;
pub mod registry;
pub mod scripted;
pub(crate) mod sysfs;
pub mod system;
pub mod types;
pub mod websocket;

use async_trait::async_trait;

pub use combined::CombinedSource;
pub use registry::SensorRegistry;
pub use scripted::{ScriptStep, ScriptedSource, Waveform};
pub use system::SystemSensors;
pub use types::{Reading, SensorError, SensorId, SensorInfo};
pub use websocket::{WebSocketFeed, WebSocketSource};

/// A hardware-monitoring provider.
///
/// Implementations perform a fresh read (or return the provider's own
/// latest value) on every call; caching is not their job.
#[async_trait]
pub trait SensorSource: Send + Sync {
    /// Read the current value of `id`.
    async fn read(&self, id: &SensorId) -> Result<Reading, SensorError>;

    /// Enumerate every sensor this provider can currently read.
    async fn list(&self) -> Vec<SensorInfo>;
}
