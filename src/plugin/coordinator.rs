//! Plugin coordinator.
//!
//! The only owner of key controllers. Host events are applied one at a time,
//! either directly through [`PluginCoordinator::handle`] or through the
//! actor started by [`PluginCoordinator::spawn`].

use crate::core::controller::{KeyController, KeyError, KeyId, KeyRuntime, KeyState};
use crate::core::settings::KeySettings;
use crate::plugin::events::HostEvent;
use crate::sensors::SensorId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("event for unknown key {0}")]
    UnknownKey(KeyId),
    #[error("coordinator has shut down")]
    ShutDown,
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Summary of one key, for status output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStatus {
    pub key: KeyId,
    pub state: KeyState,
    pub sensor_id: Option<SensorId>,
    pub samples: usize,
}

/// Registry of live keys.
pub struct PluginCoordinator {
    runtime: KeyRuntime,
    keys: HashMap<KeyId, KeyController>,
    shut_down: bool,
}

impl PluginCoordinator {
    pub fn new(runtime: KeyRuntime) -> Self {
        Self {
            runtime,
            keys: HashMap::new(),
            shut_down: false,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn controller(&self, key: &KeyId) -> Option<&KeyController> {
        self.keys.get(key)
    }

    /// Status of every key, sorted by id.
    pub fn status(&self) -> Vec<KeyStatus> {
        let mut status: Vec<KeyStatus> = self
            .keys
            .values()
            .map(|c| KeyStatus {
                key: c.key().clone(),
                state: c.state(),
                sensor_id: c.settings().map(|s| s.sensor_id),
                samples: c.store().len(),
            })
            .collect();
        status.sort_by(|a, b| a.key.cmp(&b.key));
        status
    }

    fn unknown(&self, key: KeyId, event: &'static str) -> CoordinatorError {
        tracing::warn!(key = %key, event, "event for unknown key ignored");
        self.runtime.stats.record_unknown_key_event();
        CoordinatorError::UnknownKey(key)
    }

    fn parse_settings(key: &KeyId, raw: &Value) -> KeySettings {
        let (settings, issues) = KeySettings::from_raw(raw);
        for issue in issues {
            tracing::warn!(key = %key, %issue, "invalid key setting");
        }
        settings
    }

    /// Apply one host event.
    ///
    /// Events for keys that do not exist are logged, counted and returned
    /// as [`CoordinatorError::UnknownKey`]; they never change any state.
    pub async fn handle(&mut self, event: HostEvent) -> Result<(), CoordinatorError> {
        if self.shut_down {
            return Err(CoordinatorError::ShutDown);
        }
        tracing::debug!(event = event.name(), key = ?event.key().map(KeyId::as_str), "host event");

        match event {
            HostEvent::KeyAdded { key, settings } => {
                let settings = settings.map(|raw| Self::parse_settings(&key, &raw));
                if let Some(controller) = self.keys.get_mut(&key) {
                    tracing::debug!(key = %key, "key added twice");
                    if let Some(settings) = settings {
                        controller.configure(settings)?;
                    }
                    return Ok(());
                }
                let mut controller = KeyController::new(key.clone(), self.runtime.clone());
                if let Some(settings) = settings {
                    controller.configure(settings)?;
                }
                tracing::info!(key = %key, keys = self.keys.len() + 1, "key added");
                self.keys.insert(key, controller);
            }
            HostEvent::KeyRemoved { key } => {
                let Some(mut controller) = self.keys.remove(&key) else {
                    return Err(self.unknown(key, "keyRemoved"));
                };
                controller.destroy().await;
            }
            HostEvent::KeyVisible { key, visible } => {
                let Some(controller) = self.keys.get_mut(&key) else {
                    return Err(self.unknown(key, "keyVisible"));
                };
                if visible {
                    controller.resume();
                } else {
                    controller.suspend().await;
                }
            }
            HostEvent::SettingsChanged { key, settings } => {
                let Some(controller) = self.keys.get_mut(&key) else {
                    return Err(self.unknown(key, "settingsChanged"));
                };
                controller.configure(Self::parse_settings(&key, &settings))?;
            }
            HostEvent::GetSensorList { key } => {
                let sensors = self.runtime.registry.list_available().await;
                tracing::debug!(key = %key, count = sensors.len(), "sending sensor list");
                if let Err(e) = self.runtime.sink.sensor_list(&key, &sensors).await {
                    tracing::warn!(key = %key, error = %e, "failed to send sensor list");
                }
            }
            HostEvent::Shutdown => self.shutdown().await,
        }
        Ok(())
    }

    /// Destroy every key. Later events are refused.
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        let count = self.keys.len();
        for (_, mut controller) in self.keys.drain() {
            controller.destroy().await;
        }
        self.shut_down = true;
        tracing::info!(keys = count, "coordinator shut down");
    }

    /// Run the coordinator as a task fed through the returned handle.
    pub fn spawn(self) -> CoordinatorHandle {
        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(run_actor(self, rx));
        CoordinatorHandle {
            tx,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }
}

enum Command {
    Event(HostEvent),
    Status(oneshot::Sender<Vec<KeyStatus>>),
    Shutdown(oneshot::Sender<()>),
}

async fn run_actor(mut coordinator: PluginCoordinator, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Event(event) => {
                let last = matches!(event, HostEvent::Shutdown);
                if let Err(e) = coordinator.handle(event).await {
                    tracing::debug!(error = %e, "host event not applied");
                }
                if last {
                    break;
                }
            }
            Command::Status(reply) => {
                let _ = reply.send(coordinator.status());
            }
            Command::Shutdown(ack) => {
                coordinator.shutdown().await;
                let _ = ack.send(());
                break;
            }
        }
    }
    // Also reached when every handle is dropped.
    coordinator.shutdown().await;
}

/// Cloneable front of a spawned coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl CoordinatorHandle {
    /// Queue a host event. Fails once the coordinator has shut down.
    pub async fn send(&self, event: HostEvent) -> Result<(), CoordinatorError> {
        self.tx
            .send(Command::Event(event))
            .await
            .map_err(|_| CoordinatorError::ShutDown)
    }

    pub async fn status(&self) -> Result<Vec<KeyStatus>, CoordinatorError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Status(reply))
            .await
            .map_err(|_| CoordinatorError::ShutDown)?;
        rx.await.map_err(|_| CoordinatorError::ShutDown)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Destroy every key and wait for the coordinator task to exit.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Shutdown(ack)).await.is_ok() {
            let _ = done.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "coordinator task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::host::FrameCache;
    use crate::sensors::{ScriptedSource, SensorRegistry};
    use crate::stats::{ActivityStats, SharedStats};
    use serde_json::json;
    use std::time::Duration;

    fn coordinator() -> (PluginCoordinator, Arc<FrameCache>, SharedStats) {
        let source = Arc::new(ScriptedSource::demo());
        let cache = Arc::new(FrameCache::new());
        let stats: SharedStats = Arc::new(ActivityStats::new());
        let runtime = KeyRuntime::new(SensorRegistry::new(source), cache.clone(), stats.clone());
        (PluginCoordinator::new(runtime), cache, stats)
    }

    fn key(id: &str) -> KeyId {
        KeyId::new(id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_configure_remove() {
        let (mut coord, _, stats) = coordinator();
        coord
            .handle(HostEvent::KeyAdded { key: key("k1"), settings: None })
            .await
            .unwrap();
        assert_eq!(coord.controller(&key("k1")).unwrap().state(), KeyState::Uninitialized);

        coord
            .handle(HostEvent::SettingsChanged {
                key: key("k1"),
                settings: json!({"sensorId": "cpu.temperature"}),
            })
            .await
            .unwrap();
        let status = coord.status();
        assert_eq!(status[0].state, KeyState::Active);
        assert_eq!(status[0].sensor_id, Some(SensorId::new("cpu.temperature")));

        coord.handle(HostEvent::KeyRemoved { key: key("k1") }).await.unwrap();
        assert!(coord.is_empty());
        let s = stats.snapshot();
        assert_eq!((s.keys_created, s.keys_destroyed), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_key_events_are_ignored() {
        let (mut coord, _, stats) = coordinator();
        let result = coord
            .handle(HostEvent::SettingsChanged {
                key: key("ghost"),
                settings: json!({}),
            })
            .await;
        assert_eq!(result, Err(CoordinatorError::UnknownKey(key("ghost"))));
        assert!(coord.handle(HostEvent::KeyRemoved { key: key("ghost") }).await.is_err());
        assert!(coord.is_empty());
        assert_eq!(stats.snapshot().unknown_key_events, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_add_with_settings_reconfigures() {
        let (mut coord, _, _) = coordinator();
        let added = |settings| HostEvent::KeyAdded { key: key("k1"), settings };
        coord.handle(added(Some(json!({"sensorId": "cpu.load"})))).await.unwrap();
        coord.handle(added(Some(json!({"sensorId": "memory.usage"})))).await.unwrap();
        assert_eq!(coord.len(), 1);
        let settings = coord.controller(&key("k1")).unwrap().settings().unwrap();
        assert_eq!(settings.sensor_id.as_str(), "memory.usage");
        coord.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_list_round_trip() {
        let (mut coord, cache, _) = coordinator();
        coord.handle(HostEvent::GetSensorList { key: key("pi") }).await.unwrap();
        let list = cache.sensor_list(&key("pi")).unwrap();
        assert!(list.iter().any(|s| s.id.as_str() == "cpu.load"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_shutdown_destroys_keys() {
        let (coord, cache, stats) = coordinator();
        let handle = coord.spawn();
        handle
            .send(HostEvent::KeyAdded {
                key: key("k1"),
                settings: Some(json!({"sensorId": "cpu.load"})),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(handle.status().await.unwrap().len(), 1);
        assert!(cache.push_count(&key("k1")) > 0);

        handle.shutdown().await;
        assert!(handle.is_closed());
        assert_eq!(stats.snapshot().keys_destroyed, 1);
        assert_eq!(
            handle.send(HostEvent::Shutdown).await,
            Err(CoordinatorError::ShutDown)
        );
    }
}
