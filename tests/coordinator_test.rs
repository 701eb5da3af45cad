//! Host event sequences driven through the coordinator actor.

use sensor_key_graphs::core::KeyState;
use sensor_key_graphs::plugin::{CoordinatorError, FrameCache, HostEvent, PluginCoordinator};
use sensor_key_graphs::sensors::ScriptedSource;
use sensor_key_graphs::{ActivityStats, CoordinatorHandle, KeyId, PluginConfig, SharedStats};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Host {
    source: Arc<ScriptedSource>,
    frames: Arc<FrameCache>,
    stats: SharedStats,
    coordinator: CoordinatorHandle,
}

fn host() -> Host {
    let source = Arc::new(ScriptedSource::demo());
    let frames = Arc::new(FrameCache::new());
    let stats: SharedStats = Arc::new(ActivityStats::new());
    let runtime = PluginConfig::default().key_runtime(source.clone(), frames.clone(), stats.clone());
    Host {
        source,
        frames,
        stats,
        coordinator: PluginCoordinator::new(runtime).spawn(),
    }
}

fn event(raw: serde_json::Value) -> HostEvent {
    serde_json::from_value(raw).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_two_keys_run_independently() {
    let h = host();
    h.coordinator
        .send(event(json!({
            "event": "keyAdded",
            "key": "a",
            "settings": {"sensorId": "cpu.load", "samplingIntervalMs": 500}
        })))
        .await
        .unwrap();
    h.coordinator
        .send(event(json!({
            "event": "keyAdded",
            "key": "b",
            "settings": {"sensorId": "cpu.load", "samplingIntervalMs": 2000}
        })))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10_100)).await;

    let status = h.coordinator.status().await.unwrap();
    assert_eq!(status.len(), 2);
    assert_eq!(status[0].key, KeyId::new("a"));
    assert_eq!(status[0].samples, 21);
    assert_eq!(status[1].samples, 6);
    assert!(status.iter().all(|s| s.state == KeyState::Active));

    h.coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_hidden_keys_stop_sampling() {
    let h = host();
    let key = KeyId::new("k1");
    h.coordinator
        .send(event(json!({"event": "keyAdded", "key": "k1", "settings": {"sensorId": "memory.usage"}})))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    h.coordinator
        .send(event(json!({"event": "keyVisible", "key": "k1", "visible": false})))
        .await
        .unwrap();
    let status = h.coordinator.status().await.unwrap();
    assert_eq!(status[0].state, KeyState::Suspended);

    let reads = h.source.reads_for("memory.usage");
    let pushes = h.frames.push_count(&key);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.source.reads_for("memory.usage"), reads);
    assert_eq!(h.frames.push_count(&key), pushes);

    h.coordinator
        .send(event(json!({"event": "keyVisible", "key": "k1", "visible": true})))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.source.reads_for("memory.usage") > reads);
    // Resuming forces a fresh frame out even if it looks the same.
    assert_eq!(h.frames.push_count(&key), pushes + 1);

    h.coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_remove_and_unknown_keys() {
    let h = host();
    h.coordinator
        .send(event(json!({"event": "keyAdded", "key": "k1", "settings": {"sensorId": "cpu.load"}})))
        .await
        .unwrap();
    h.coordinator
        .send(event(json!({"event": "settingsChanged", "key": "ghost", "settings": {"sensorId": "cpu.load"}})))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    h.coordinator
        .send(event(json!({"event": "keyRemoved", "key": "k1"})))
        .await
        .unwrap();
    assert!(h.coordinator.status().await.unwrap().is_empty());

    let reads = h.source.call_count();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.source.call_count(), reads);

    let s = h.stats.snapshot();
    assert_eq!(s.unknown_key_events, 1);
    assert_eq!((s.keys_created, s.keys_destroyed), (1, 1));
    h.coordinator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_host_shutdown_event_ends_the_actor() {
    let h = host();
    h.coordinator
        .send(event(json!({"event": "keyAdded", "key": "k1", "settings": {"sensorId": "cpu.load"}})))
        .await
        .unwrap();
    h.coordinator.send(event(json!({"event": "shutdown"}))).await.unwrap();
    h.coordinator.shutdown().await;

    assert_eq!(
        h.coordinator.status().await,
        Err(CoordinatorError::ShutDown)
    );
    assert_eq!(h.stats.snapshot().keys_destroyed, 1);
}
