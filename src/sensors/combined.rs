//! Several providers behind one [`SensorSource`].

use crate::sensors::types::{Reading, SensorError, SensorId, SensorInfo};
use crate::sensors::SensorSource;
use async_trait::async_trait;
use std::sync::Arc;

/// Reads go to the first provider that knows the identifier; listings are
/// concatenated in provider order.
#[derive(Clone, Default)]
pub struct CombinedSource {
    sources: Vec<Arc<dyn SensorSource>>,
}

impl CombinedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: Arc<dyn SensorSource>) -> Self {
        self.sources.push(source);
        self
    }
}

#[async_trait]
impl SensorSource for CombinedSource {
    async fn read(&self, id: &SensorId) -> Result<Reading, SensorError> {
        for source in &self.sources {
            match source.read(id).await {
                Err(SensorError::NotFound(_)) => continue,
                other => return other,
            }
        }
        Err(SensorError::NotFound(id.clone()))
    }

    async fn list(&self) -> Vec<SensorInfo> {
        let mut sensors = Vec::new();
        for source in &self.sources {
            sensors.extend(source.list().await);
        }
        sensors
    }
}
