//! Sensors fed by WebSocket endpoints.
//!
//! Each configured feed keeps one connection open and caches the latest
//! number found in the messages it receives. Reads never touch the network:
//! they return the cached value, or fail while the feed is disconnected or
//! has not delivered a value yet. Dropped connections are retried with
//! exponential backoff until the source is cancelled.

use crate::sensors::types::{Reading, SensorError, SensorId, SensorInfo};
use crate::sensors::SensorSource;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Object fields searched for a value before any other field.
const VALUE_FIELDS: &[&str] = &["value", "data", "result", "temperature", "temp", "load"];

/// One WebSocket endpoint exposed as a sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketFeed {
    /// Sensor identifier keys bind to
    pub id: String,
    /// Name shown in the sensor picker (defaults to the id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub unit: String,
    /// `ws://` or `wss://` endpoint
    pub url: String,
    /// Sent as a bearer token in the handshake
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Text messages sent right after connecting (subscriptions)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_messages: Vec<String>,
}

impl WebSocketFeed {
    pub fn info(&self) -> SensorInfo {
        let name = self.display_name.clone().unwrap_or_else(|| self.id.clone());
        SensorInfo::new(self.id.clone(), name, self.unit.clone())
    }
}

#[derive(Debug, thiserror::Error)]
enum FeedError {
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("api key is not a valid header value")]
    ApiKey,
}

#[derive(Debug, Default)]
struct FeedState {
    connected: bool,
    latest: Option<f64>,
}

#[derive(Debug)]
struct Feed {
    config: WebSocketFeed,
    state: RwLock<FeedState>,
}

impl Feed {
    fn disconnected(&self) {
        let mut state = self.state.write();
        state.connected = false;
        state.latest = None;
    }
}

/// First number in a feed message.
///
/// Bare numbers are taken as is. Objects are searched through the common
/// value fields first, then every other field; arrays use their first
/// element.
pub fn extract_value(json: &Value) -> Option<f64> {
    match json {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::Object(map) => VALUE_FIELDS
            .iter()
            .filter_map(|field| map.get(*field))
            .chain(map.values())
            .find_map(extract_value),
        Value::Array(items) => items.first().and_then(extract_value),
        _ => None,
    }
}

fn message_value(text: &str) -> Option<f64> {
    serde_json::from_str::<Value>(text).ok().as_ref().and_then(extract_value)
}

/// Connect once and stream values until the server closes the connection.
async fn stream_feed(feed: &Feed) -> Result<(), FeedError> {
    let config = &feed.config;
    let mut request = config.url.as_str().into_client_request()?;
    if let Some(key) = &config.api_key {
        let bearer = HeaderValue::from_str(&format!("Bearer {key}")).map_err(|_| FeedError::ApiKey)?;
        request.headers_mut().insert("Authorization", bearer);
    }

    let (mut ws, _) = connect_async(request).await?;
    for message in &config.init_messages {
        ws.send(Message::Text(message.clone().into())).await?;
    }
    feed.state.write().connected = true;
    tracing::info!(sensor = %config.id, url = %config.url, "websocket feed connected");

    while let Some(message) = ws.next().await {
        let value = match message? {
            Message::Text(text) => message_value(&text),
            Message::Binary(bytes) => std::str::from_utf8(&bytes).ok().and_then(message_value),
            Message::Close(_) => break,
            _ => None,
        };
        if let Some(value) = value {
            feed.state.write().latest = Some(value);
        }
    }
    Ok(())
}

async fn feed_loop(feed: Arc<Feed>, cancel: CancellationToken) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = stream_feed(&feed) => result,
        };
        feed.disconnected();
        match result {
            Ok(()) => {
                tracing::info!(sensor = %feed.config.id, "websocket feed closed by server");
                backoff = INITIAL_BACKOFF;
            }
            Err(e) => {
                tracing::warn!(
                    sensor = %feed.config.id,
                    error = %e,
                    retry_secs = backoff.as_secs(),
                    "websocket feed failed"
                );
            }
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
    feed.disconnected();
}

/// Sensor provider for configured WebSocket feeds.
#[derive(Debug, Default)]
pub struct WebSocketSource {
    feeds: BTreeMap<SensorId, Arc<Feed>>,
}

impl WebSocketSource {
    /// Feeds with a duplicate id replace the earlier one.
    pub fn new(feeds: impl IntoIterator<Item = WebSocketFeed>) -> Self {
        let feeds = feeds
            .into_iter()
            .map(|config| {
                let id = SensorId::new(config.id.clone());
                let feed = Feed {
                    config,
                    state: RwLock::new(FeedState::default()),
                };
                (id, Arc::new(feed))
            })
            .collect();
        Self { feeds }
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }

    /// Open every feed's connection; they stay up until `cancel` fires.
    pub fn spawn(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        self.feeds
            .values()
            .map(|feed| tokio::spawn(feed_loop(feed.clone(), cancel.clone())))
            .collect()
    }
}

#[async_trait]
impl SensorSource for WebSocketSource {
    async fn read(&self, id: &SensorId) -> Result<Reading, SensorError> {
        let feed = self
            .feeds
            .get(id)
            .ok_or_else(|| SensorError::NotFound(id.clone()))?;
        let state = feed.state.read();
        match (state.connected, state.latest) {
            (true, Some(value)) => Ok(Reading::new(value, feed.config.unit.clone())),
            (true, None) => Err(SensorError::Provider("feed has not sent a value yet".into())),
            (false, _) => Err(SensorError::Provider("feed is disconnected".into())),
        }
    }

    async fn list(&self) -> Vec<SensorInfo> {
        self.feeds.values().map(|feed| feed.config.info()).collect()
    }
}
