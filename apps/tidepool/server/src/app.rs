use std::sync::Arc;

use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use serde_json::json;
use tidepool_core::registry::{RoomDirectory, DEFAULT_ROOM};
use tidepool_core::{MediaEndpoint, MediaEngineFactory, Passthrough, RelayEndpoint};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{ServerConfig, ServerMode};
use crate::websocket;

const MEDIA_ROUTE: &str = "/ws/signaling_handler";
const MEDIA_ROUTE_SEGMENT: &str = "signaling_handler";

pub struct AppState {
    mode: ServerMode,
    relay: RelayEndpoint,
    media: Option<MediaEndpoint>,
    connection_buffer: usize,
    metrics: Option<PrometheusHandle>,
    shutdown: CancellationToken,
}

impl AppState {
    /// `media_factory` is required for the media route to be served; without
    /// it the server only relays.
    pub fn new(
        config: &ServerConfig,
        media_factory: Option<Arc<dyn MediaEngineFactory>>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let rooms = RoomDirectory::new(config.connection_buffer);
        let relay =
            RelayEndpoint::new(rooms, config.relay.clone()).with_shutdown(shutdown.clone());
        let media = media_factory
            .filter(|_| config.mode.serves_media())
            .map(|factory| {
                MediaEndpoint::new(factory, Arc::new(Passthrough), config.session.clone())
                    .with_shutdown(shutdown.clone())
            });
        Self {
            mode: config.mode,
            relay,
            media,
            connection_buffer: config.connection_buffer,
            metrics,
            shutdown,
        }
    }

    /// Cancelling the returned token closes every open WebSocket session.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn relay(&self) -> &RelayEndpoint {
        &self.relay
    }

    pub fn media(&self) -> Option<&MediaEndpoint> {
        self.media.as_ref()
    }

    fn stats(&self) -> StatsResponse {
        let rooms: Vec<RoomStatsEntry> = self
            .relay
            .rooms()
            .snapshot()
            .into_iter()
            .map(|entry| RoomStatsEntry {
                room: entry.room,
                connections: entry.connections,
            })
            .collect();
        StatsResponse {
            mode: self.mode.as_str(),
            active_rooms: rooms.len(),
            active_connections: rooms.iter().map(|room| room.connections).sum(),
            active_media_sessions: self
                .media
                .as_ref()
                .map_or(0, |media| media.active_sessions()),
            rooms,
        }
    }

    fn render_metrics(&self) -> String {
        self.metrics
            .as_ref()
            .map(|handle| handle.render())
            .unwrap_or_default()
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    mode: &'static str,
    active_rooms: usize,
    active_connections: usize,
    active_media_sessions: usize,
    rooms: Vec<RoomStatsEntry>,
}

#[derive(Debug, Serialize)]
struct RoomStatsEntry {
    room: String,
    connections: usize,
}

pub fn router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler));

    if state.mode.serves_relay() {
        router = router
            .route("/ws", get(relay_default_handler))
            .route("/ws/:room", get(relay_room_handler));
    }
    if state.media.is_some() {
        router = router.route(MEDIA_ROUTE, get(media_handler));
    }

    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.render_metrics();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn relay_default_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    upgrade_relay(state, ws, DEFAULT_ROOM.to_string())
}

async fn relay_room_handler(
    State(state): State<Arc<AppState>>,
    Path(room): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    // The media path is never a relay room, even when media is disabled.
    if room == MEDIA_ROUTE_SEGMENT {
        return StatusCode::NOT_FOUND.into_response();
    }
    upgrade_relay(state, ws, room)
}

fn upgrade_relay(state: Arc<AppState>, ws: WebSocketUpgrade, room: String) -> Response {
    let endpoint = state.relay.clone();
    ws.on_upgrade(move |socket| websocket::serve_relay(socket, endpoint, room))
        .into_response()
}

async fn media_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    let Some(endpoint) = state.media.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let buffer = state.connection_buffer;
    ws.on_upgrade(move |socket| websocket::serve_media(socket, endpoint, buffer))
        .into_response()
}
