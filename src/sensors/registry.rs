//! Bounded-time access to a sensor provider.

use crate::sensors::types::{Reading, SensorError, SensorId, SensorInfo};
use crate::sensors::SensorSource;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Default upper bound for a single sensor read.
pub const DEFAULT_SENSOR_TIMEOUT: Duration = Duration::from_millis(500);

/// Shared, read-only front of a [`SensorSource`].
///
/// Cloning is cheap; every key controller holds its own clone.
#[derive(Clone)]
pub struct SensorRegistry {
    source: Arc<dyn SensorSource>,
    timeout: Duration,
}

impl SensorRegistry {
    pub fn new(source: Arc<dyn SensorSource>) -> Self {
        Self::with_timeout(source, DEFAULT_SENSOR_TIMEOUT)
    }

    pub fn with_timeout(source: Arc<dyn SensorSource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve the current reading of `id`.
    ///
    /// Only an unknown identifier is an error. Provider failures and slow
    /// reads come back as a reading with `ok == false`.
    pub async fn resolve(&self, id: &SensorId) -> Result<Reading, SensorError> {
        match timeout(self.timeout, self.source.read(id)).await {
            Ok(Ok(mut reading)) => {
                if !reading.value.is_finite() {
                    reading.ok = false;
                }
                Ok(reading)
            }
            Ok(Err(SensorError::NotFound(id))) => Err(SensorError::NotFound(id)),
            Ok(Err(e)) => {
                tracing::debug!(sensor = %id, error = %e, "sensor read failed");
                Ok(Reading::failed(""))
            }
            Err(_) => {
                tracing::debug!(sensor = %id, timeout_ms = self.timeout.as_millis() as u64, "sensor read timed out");
                Ok(Reading::failed(""))
            }
        }
    }

    /// List every sensor the provider exposes, sorted by identifier.
    pub async fn list_available(&self) -> Vec<SensorInfo> {
        match timeout(self.timeout, self.source.list()).await {
            Ok(mut sensors) => {
                sensors.sort_by(|a, b| a.id.cmp(&b.id));
                sensors
            }
            Err(_) => {
                tracing::warn!("sensor enumeration timed out");
                Vec::new()
            }
        }
    }
}

impl std::fmt::Debug for SensorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorRegistry")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::scripted::{ScriptStep, ScriptedSource};

    fn registry(source: ScriptedSource) -> SensorRegistry {
        SensorRegistry::with_timeout(Arc::new(source), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_unknown_sensor_is_not_found() {
        let registry = registry(ScriptedSource::new());
        let result = registry.resolve(&SensorId::new("nope")).await;
        assert_eq!(result, Err(SensorError::NotFound(SensorId::new("nope"))));
    }

    #[tokio::test]
    async fn test_provider_failure_degrades_to_not_ok() {
        let source = ScriptedSource::new();
        source.add_sensor("cpu.load", "CPU Load", "%");
        source.push_steps("cpu.load", [ScriptStep::Fail]);
        let reading = registry(source).resolve(&SensorId::new("cpu.load")).await.unwrap();
        assert!(!reading.ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_read_times_out() {
        let source = ScriptedSource::new();
        source.add_sensor("cpu.load", "CPU Load", "%");
        source.push_steps("cpu.load", [ScriptStep::Hang(Duration::from_secs(30))]);
        let reading = registry(source).resolve(&SensorId::new("cpu.load")).await.unwrap();
        assert!(!reading.ok);
    }

    #[tokio::test]
    async fn test_nan_value_is_not_ok() {
        let source = ScriptedSource::new();
        source.add_sensor("cpu.load", "CPU Load", "%");
        source.push_steps("cpu.load", [ScriptStep::Value(f64::NAN)]);
        let reading = registry(source).resolve(&SensorId::new("cpu.load")).await.unwrap();
        assert!(!reading.ok);
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let source = ScriptedSource::new();
        source.add_sensor("ram.usage", "RAM", "%");
        source.add_sensor("cpu.load", "CPU", "%");
        let list = registry(source).list_available().await;
        let ids: Vec<_> = list.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["cpu.load", "ram.usage"]);
    }
}
