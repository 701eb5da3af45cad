//! HTTP surface for property inspectors and hosts that do not speak stdio.
//!
//! This module provides an HTTP server that:
//! - Accepts host events via POST /events and feeds them to the coordinator
//! - Lists the readable sensors via GET /sensors
//! - Serves the latest frame pushed to a key via GET /keys/:key/frame.png
//!
//! # Architecture
//!
//! ```text
//! host ──→ POST /events ──→ coordinator ──→ key controllers
//!                                                 ↓
//! host ←── GET /keys/:key/frame.png ←──────── FrameCache
//! ```

use crate::core::KeyId;
use crate::plugin::coordinator::{CoordinatorError, CoordinatorHandle, KeyStatus};
use crate::plugin::events::HostEvent;
use crate::plugin::host::FrameCache;
use crate::sensors::{SensorInfo, SensorRegistry};
use crate::stats::{SharedStats, StatsSnapshot};
use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind to (0 for random)
    pub port: u16,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

/// Shared server state
pub struct ServerState {
    coordinator: CoordinatorHandle,
    /// Frames pushed by the controllers; must be the coordinator's sink
    frames: Arc<FrameCache>,
    registry: SensorRegistry,
    stats: SharedStats,
}

impl ServerState {
    pub fn new(
        coordinator: CoordinatorHandle,
        frames: Arc<FrameCache>,
        registry: SensorRegistry,
        stats: SharedStats,
    ) -> Self {
        Self {
            coordinator,
            frames,
            registry,
            stats,
        }
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub stats: StatsSnapshot,
    pub keys: Vec<KeyStatus>,
}

/// Response from the events endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EventResponse {
    pub status: String,
    pub event: String,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
}

/// GET /health
async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    let (status, keys) = match state.coordinator.status().await {
        Ok(keys) => ("ok", keys),
        Err(_) => ("stopped", Vec::new()),
    };
    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        stats: state.stats.snapshot(),
        keys,
    })
}

/// GET /sensors
async fn sensors(State(state): State<Arc<ServerState>>) -> Json<Vec<SensorInfo>> {
    Json(state.registry.list_available().await)
}

/// POST /events
///
/// Queues one host event. Removal waits until the key is destroyed so its
/// cached frame can be dropped.
async fn events(
    State(state): State<Arc<ServerState>>,
    Json(event): Json<HostEvent>,
) -> Result<(StatusCode, Json<EventResponse>), ApiError> {
    let name = event.name();
    let removed = match &event {
        HostEvent::KeyRemoved { key } => Some(key.clone()),
        _ => None,
    };

    state.coordinator.send(event).await.map_err(|e| match e {
        CoordinatorError::ShutDown => api_error(StatusCode::SERVICE_UNAVAILABLE, "SHUT_DOWN", e),
        other => api_error(StatusCode::INTERNAL_SERVER_ERROR, "EVENT_ERROR", other),
    })?;

    if let Some(key) = removed {
        // Events are applied in order, so a reply means the removal is done.
        let _ = state.coordinator.status().await;
        state.frames.forget(&key);
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(EventResponse {
            status: "accepted".to_string(),
            event: name.to_string(),
        }),
    ))
}

/// GET /keys/:key/frame.png
async fn frame_png(
    State(state): State<Arc<ServerState>>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    let key = KeyId::new(key);
    let frame = state.frames.latest(&key).ok_or_else(|| {
        api_error(
            StatusCode::NOT_FOUND,
            "NO_FRAME",
            format!("no frame has been pushed to key {key}"),
        )
    })?;
    let png = frame.image.to_png().map_err(|e| {
        tracing::error!(key = %key, error = %e, "failed to encode frame");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "ENCODE_ERROR", e)
    })?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sensors", get(sensors))
        .route("/events", post(events))
        .route("/keys/:key/frame.png", get(frame_png))
        .layer(
            CorsLayer::new()
                .allow_origin([
                    HeaderValue::from_static("http://localhost"),
                    HeaderValue::from_static("http://127.0.0.1"),
                ])
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server
pub async fn run(
    config: ServerConfig,
    state: Arc<ServerState>,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let app = router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Sensor graphs server listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
