//! Configuration for the sensor graphs plugin.
//!
//! Per-key settings come from the host with every event; this file only
//! holds what applies to the whole plugin process.

use crate::core::frame::{Dimensions, DEFAULT_KEY_SIZE};
use crate::core::render::{MAX_DIMENSION, MIN_DIMENSION};
use crate::core::store::DEFAULT_SLACK;
use crate::core::KeyRuntime;
use crate::plugin::host::HostSink;
use crate::sensors::registry::DEFAULT_SENSOR_TIMEOUT;
use crate::sensors::{SensorRegistry, SensorSource, WebSocketFeed};
use std::collections::HashSet;
use crate::stats::SharedStats;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Main configuration for the plugin process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    /// How often each active key re-renders
    #[serde(rename = "render_interval_ms", with = "duration_ms")]
    pub render_interval: Duration,

    /// Upper bound on a single sensor read
    #[serde(rename = "sensor_timeout_ms", with = "duration_ms")]
    pub sensor_timeout: Duration,

    /// Key image size in pixels
    pub key_width: u32,
    pub key_height: u32,

    /// Extra samples kept beyond `window / interval`
    pub retention_slack: usize,

    /// Default tracing filter, overridden by `RUST_LOG`
    pub log_filter: String,

    /// Extra sensors read from WebSocket endpoints
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub websocket_feeds: Vec<WebSocketFeed>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            render_interval: Duration::from_secs(1),
            sensor_timeout: DEFAULT_SENSOR_TIMEOUT,
            key_width: DEFAULT_KEY_SIZE,
            key_height: DEFAULT_KEY_SIZE,
            retention_slack: DEFAULT_SLACK,
            log_filter: "info".to_string(),
            websocket_feeds: Vec::new(),
        }
    }
}

impl PluginConfig {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, or the defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: PluginConfig = serde_json::from_str(&content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sensor-key-graphs")
            .join("config.json")
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let range = MIN_DIMENSION..=MAX_DIMENSION;
        if !range.contains(&self.key_width) || !range.contains(&self.key_height) {
            return Err(ConfigError::Invalid(format!(
                "key size {}x{} outside {MIN_DIMENSION}..={MAX_DIMENSION}",
                self.key_width, self.key_height
            )));
        }
        if self.render_interval.is_zero() {
            return Err(ConfigError::Invalid("render_interval_ms must be positive".into()));
        }
        if self.sensor_timeout.is_zero() {
            return Err(ConfigError::Invalid("sensor_timeout_ms must be positive".into()));
        }
        let mut ids = HashSet::new();
        for feed in &self.websocket_feeds {
            if feed.id.trim().is_empty() {
                return Err(ConfigError::Invalid("websocket feed without an id".into()));
            }
            if !ids.insert(feed.id.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate websocket feed {}", feed.id)));
            }
            if !(feed.url.starts_with("ws://") || feed.url.starts_with("wss://")) {
                return Err(ConfigError::Invalid(format!(
                    "websocket feed {} needs a ws:// or wss:// url",
                    feed.id
                )));
            }
        }
        Ok(())
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.key_width, self.key_height)
    }

    /// Shared key dependencies built from this configuration.
    pub fn key_runtime(
        &self,
        source: Arc<dyn SensorSource>,
        sink: Arc<dyn HostSink>,
        stats: SharedStats,
    ) -> KeyRuntime {
        let registry = SensorRegistry::with_timeout(source, self.sensor_timeout);
        KeyRuntime {
            dimensions: self.dimensions(),
            render_interval: self.render_interval,
            retention_slack: self.retention_slack,
            ..KeyRuntime::new(registry, sink, stats)
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(serde_json::Error),
    #[error("Serialize error: {0}")]
    Serialize(serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde support for Duration as whole milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
