//! `HuddleServer`: axum HTTP surface around the connection hub.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum_extra::extract::cookie::CookieJar;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use huddle_push::{PushAck, PushHub};
use huddle_settings::HuddleSettings;

use crate::health::{self, HealthResponse};
use crate::metrics;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::{Collaborators, Hub, Transport};

/// Cookie carrying the session token for browser clients.
pub const AUTH_COOKIE: &str = "HUDDLEAUTHTOKEN";

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection hub.
    pub hub: Arc<Hub>,
    /// Push hub, when push is enabled.
    pub push: Option<Arc<PushHub>>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`.
    pub metrics: Option<PrometheusHandle>,
}

/// The huddle real-time server.
pub struct HuddleServer {
    settings: HuddleSettings,
    hub: Arc<Hub>,
    push: Option<Arc<PushHub>>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl HuddleServer {
    /// Create a server over the given collaborators.
    pub fn new(
        settings: HuddleSettings,
        collaborators: Collaborators,
        push: Option<Arc<PushHub>>,
    ) -> Self {
        let hub = Hub::new(
            settings.websocket.clone(),
            settings.server.server_version.clone(),
            collaborators,
            settings.server.is_tls(),
        );
        Self {
            settings,
            hub: Arc::new(hub),
            push,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: self.hub.clone(),
            push: self.push.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/api/v4/websocket", get(ws_handler))
            .route("/api/v4/notifications/ack", post(ack_handler))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Bind the configured address and serve until shutdown begins.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = tokio::net::TcpListener::bind(self.settings.server.bind_addr()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.shutdown.token();

        info!(%addr, mode = ?self.hub.strategy(), "huddle server listening");
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "http server failed");
            }
        });
        Ok((addr, handle))
    }

    /// Stop accepting, close connections, then drain the push hub.
    pub async fn stop(&self) -> bool {
        self.shutdown
            .graceful_shutdown(
                &self.hub,
                self.push.as_deref(),
                Some(self.settings.server.shutdown_timeout()),
            )
            .await
    }

    /// The connection hub.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// The push hub, when enabled.
    pub fn push(&self) -> Option<&Arc<PushHub>> {
        self.push.as_ref()
    }

    /// The shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Server settings.
    pub fn settings(&self) -> &HuddleSettings {
        &self.settings
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.hub.connection_count(),
        state.push.is_some(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// GET /api/v4/websocket
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let session = match request_token(&headers, query.token.as_deref(), &jar) {
        Some(token) => match state.hub.sessions().resolve_session(&token).await {
            Ok(session) => Some(session),
            Err(e) => {
                debug!(error = %e, "upgrade token rejected, connection starts anonymous");
                None
            }
        },
        None => None,
    };

    // Oversized messages get a protocol error; the transport only rejects
    // frames far beyond the configured limit.
    let ceiling = state.hub.settings().max_message_size.saturating_mul(4);
    let hub = state.hub.clone();
    ws.max_message_size(ceiling)
        .max_frame_size(ceiling)
        .on_upgrade(move |socket| async move {
            let _ = hub.accept(Transport::from_axum(socket), session);
        })
}

/// Token from `Authorization` (`Bearer` or `Token`), the `token` query
/// parameter, or the auth cookie, in that order.
fn request_token(headers: &HeaderMap, query: Option<&str>, jar: &CookieJar) -> Option<String> {
    let from_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|value| {
            ["bearer ", "token "].iter().find_map(|scheme| {
                value
                    .get(..scheme.len())
                    .filter(|prefix| prefix.eq_ignore_ascii_case(scheme))
                    .map(|_| value[scheme.len()..].trim())
            })
        });

    from_header
        .or(query)
        .or_else(|| jar.get(AUTH_COOKIE).map(|c| c.value()))
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
}

/// POST /api/v4/notifications/ack
async fn ack_handler(State(state): State<AppState>, Json(ack): Json<PushAck>) -> StatusCode {
    let Some(push) = &state.push else {
        return StatusCode::NOT_IMPLEMENTED;
    };
    push.sender().ack(&ack).await;
    StatusCode::OK
}
