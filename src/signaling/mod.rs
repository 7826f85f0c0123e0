#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod protocol;
pub mod connection;

use crate::metrics::ServerMetrics;
use crate::world::World;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Largest accepted WebSocket frame
const MAX_MESSAGE_SIZE: usize = 65_536;

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    world: Arc<World>,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
    metrics_token: Option<Arc<str>>,
}

impl SignalingServer {
    /// Creates a new signaling server
    pub fn new(world: Arc<World>, metrics: ServerMetrics, max_connections: usize, metrics_token: Option<String>) -> Self {
        info!("Max connections: {}", max_connections);
        if metrics_token.is_none() {
            info!("METRICS_TOKEN not set, /metrics is open");
        }
        Self {
            world,
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            metrics_token: metrics_token.map(Arc::from),
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(
    State(server): State<SignalingServer>,
) -> Json<serde_json::Value> {
    let (participants, producers, consumers) = server.world.counts();
    Json(serde_json::json!({
        "status": "ok",
        "participants": participants,
        "producers": producers,
        "consumers": consumers,
    }))
}

/// Metrics handler, Prometheus text exposition format.
/// Protected by optional METRICS_TOKEN (Bearer auth).
async fn metrics_handler(
    State(server): State<SignalingServer>,
    headers: HeaderMap,
) -> Response {
    if let Some(expected) = server.metrics_token.as_deref() {
        let provided = headers.get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {expected}") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let (participants, producers, consumers) = server.world.counts();
    let body = server.metrics.render_prometheus(participants, producers, consumers);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    ).into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<SignalingServer>,
) -> Response {
    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, server.world, server.metrics, permit)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::fake::FakeProvider;
    use crate::world::WorldConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn server(token: Option<&str>) -> SignalingServer {
        let (provider, _events) = FakeProvider::new();
        let metrics = ServerMetrics::new();
        let world = Arc::new(World::new(provider, WorldConfig::default(), metrics.clone()));
        SignalingServer::new(world, metrics, 4, token.map(String::from))
    }

    #[tokio::test]
    async fn test_health() {
        let response = server(None)
            .router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({"status": "ok", "participants": 0, "producers": 0, "consumers": 0}));
    }

    #[tokio::test]
    async fn test_metrics_requires_token_when_configured() {
        let app = server(Some("s3cret")).router();
        let denied = app
            .clone()
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let allowed = app
            .oneshot(
                Request::get("/metrics")
                    .header("authorization", "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }
}
