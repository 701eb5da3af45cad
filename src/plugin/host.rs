//! Outbound side of the host protocol.
//!
//! Controllers push frames through a [`HostSink`]. The stdio bridge uses a
//! [`ChannelSink`]; the HTTP surface and the tests read frames back out of a
//! [`FrameCache`].

use crate::core::frame::{FrameError, RenderedFrame};
use crate::core::KeyId;
use crate::plugin::events::HostOutput;
use crate::sensors::SensorInfo;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("host connection closed")]
    Closed,
    #[error(transparent)]
    Encode(#[from] FrameError),
}

/// Receiver of key images and sensor listings.
#[async_trait]
pub trait HostSink: Send + Sync {
    /// Replace the image shown on `key`.
    async fn set_image(&self, key: &KeyId, frame: &RenderedFrame) -> Result<(), HostError>;

    /// Answer a sensor-list request for `key`'s property inspector.
    async fn sensor_list(&self, key: &KeyId, sensors: &[SensorInfo]) -> Result<(), HostError>;
}

/// Encodes outputs and hands them to a writer task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<HostOutput>,
}

impl ChannelSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<HostOutput>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl HostSink for ChannelSink {
    async fn set_image(&self, key: &KeyId, frame: &RenderedFrame) -> Result<(), HostError> {
        let image = frame.image.to_data_uri()?;
        self.tx
            .send(HostOutput::SetImage {
                key: key.clone(),
                image,
            })
            .await
            .map_err(|_| HostError::Closed)
    }

    async fn sensor_list(&self, key: &KeyId, sensors: &[SensorInfo]) -> Result<(), HostError> {
        self.tx
            .send(HostOutput::SensorList {
                key: key.clone(),
                sensors: sensors.to_vec(),
            })
            .await
            .map_err(|_| HostError::Closed)
    }
}

#[derive(Debug, Default)]
struct CacheEntry {
    latest: Option<RenderedFrame>,
    pushes: u64,
    sensors: Option<Vec<SensorInfo>>,
}

/// Keeps the latest frame pushed to each key.
#[derive(Debug, Default)]
pub struct FrameCache {
    entries: RwLock<HashMap<KeyId, CacheEntry>>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest frame pushed to `key`.
    pub fn latest(&self, key: &KeyId) -> Option<RenderedFrame> {
        self.entries.read().get(key).and_then(|e| e.latest.clone())
    }

    /// Number of frames pushed to `key` so far.
    pub fn push_count(&self, key: &KeyId) -> u64 {
        self.entries.read().get(key).map(|e| e.pushes).unwrap_or(0)
    }

    /// Last sensor list sent to `key`.
    pub fn sensor_list(&self, key: &KeyId) -> Option<Vec<SensorInfo>> {
        self.entries.read().get(key).and_then(|e| e.sensors.clone())
    }

    /// Keys that have received at least one frame, sorted.
    pub fn keys(&self) -> Vec<KeyId> {
        let mut keys: Vec<KeyId> = self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| e.latest.is_some())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Drop the cached frame of a removed key.
    pub fn forget(&self, key: &KeyId) {
        self.entries.write().remove(key);
    }
}

#[async_trait]
impl HostSink for FrameCache {
    async fn set_image(&self, key: &KeyId, frame: &RenderedFrame) -> Result<(), HostError> {
        let mut entries = self.entries.write();
        let entry = entries.entry(key.clone()).or_default();
        entry.latest = Some(frame.clone());
        entry.pushes += 1;
        Ok(())
    }

    async fn sensor_list(&self, key: &KeyId, sensors: &[SensorInfo]) -> Result<(), HostError> {
        self.entries.write().entry(key.clone()).or_default().sensors = Some(sensors.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::{Dimensions, FrameStamp, RasterImage};
    use chrono::Utc;
    use embedded_graphics::pixelcolor::Rgb888;
    use embedded_graphics::prelude::RgbColor;
    use std::sync::Arc;

    fn frame() -> RenderedFrame {
        RenderedFrame {
            image: Arc::new(RasterImage::solid(Dimensions::new(16, 16), Rgb888::BLUE)),
            stamp: FrameStamp {
                settings_version: 1,
                store_version: 1,
            },
            rendered_at: Utc::now(),
            fallback: false,
        }
    }

    #[tokio::test]
    async fn test_channel_sink_encodes_data_uri() {
        let (sink, mut rx) = ChannelSink::new(4);
        sink.set_image(&KeyId::new("k1"), &frame()).await.unwrap();
        match rx.recv().await.unwrap() {
            HostOutput::SetImage { key, image } => {
                assert_eq!(key.as_str(), "k1");
                assert!(image.starts_with("data:image/png;base64,"));
            }
            other => panic!("unexpected output {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_channel_sink_reports_closed() {
        let (sink, rx) = ChannelSink::new(1);
        drop(rx);
        let result = sink.set_image(&KeyId::new("k1"), &frame()).await;
        assert!(matches!(result, Err(HostError::Closed)));
    }

    #[tokio::test]
    async fn test_frame_cache_tracks_keys_until_forgotten() {
        let cache = FrameCache::new();
        let key = KeyId::new("k1");
        HostSink::sensor_list(&cache, &KeyId::new("k2"), &[]).await.unwrap();
        cache.set_image(&key, &frame()).await.unwrap();
        cache.set_image(&key, &frame()).await.unwrap();
        assert_eq!(cache.push_count(&key), 2);
        // A sensor list alone does not make a key show up.
        assert_eq!(cache.keys(), vec![key.clone()]);

        cache.forget(&key);
        assert!(cache.latest(&key).is_none());
        assert_eq!(cache.push_count(&key), 0);
    }
}
