//! HTTP and WebSocket handlers for the Air server.
//!
//! - `/ws` validates the room, identity and origin, then hands the upgraded
//!   socket to a [`Session`].
//! - `/emit` publishes a JSON object to the room bound to a bearer token.
//! - `/air.js` serves the client script to whitelisted origins.
//! - `/health` reports connection and dispatcher counters.
//! - Everything else is served from the public directory.

use crate::config::Config;
use crate::error::{ApiError, ConnectError};
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::store;
use air_core::{
    AccessStore, AccessValidator, Admission, AdmitError, ConnectParams, DispatchHandle,
    DispatchRequest, Dispatcher, Registry, Session,
};
use air_protocol::codec;
use air_transport::{websocket, FrameSource, Inbound, TransportError};
use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{ws::WebSocket, DefaultBodyLimit, Query, State, WebSocketUpgrade},
    http::{
        header::{
            ACCESS_CONTROL_ALLOW_ORIGIN, AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, ORIGIN,
            REFERER,
        },
        HeaderMap, HeaderName, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, error, info, warn};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Shared server state.
pub struct AppState {
    /// Live connections.
    pub registry: Arc<Registry>,
    /// Producer side of the dispatch queue.
    pub dispatch: DispatchHandle,
    /// Room, origin and token checks.
    pub validator: AccessValidator,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create app state and start the dispatcher.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn AccessStore>) -> Self {
        let registry = Arc::new(Registry::new());
        let (dispatch, _task) =
            Dispatcher::spawn(Arc::clone(&registry), config.dispatch.queue_capacity);

        Self {
            registry,
            dispatch,
            validator: AccessValidator::new(store),
            config,
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let public = ServeDir::new(&state.config.assets.public_dir);

    Router::new()
        .route("/ws", get(ws_handler))
        .route(
            "/emit",
            post(emit_handler)
                .fallback(method_not_allowed)
                .layer(DefaultBodyLimit::disable()),
        )
        .route("/air.js", get(air_js_handler))
        .route("/health", get(health_handler))
        .fallback_service(public)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the store, listener or server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let access_store = store::create_store(&config.store, &config.database).await?;
    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config, access_store));
    if state.config.metrics.enabled {
        spawn_stats_mirror(Arc::downgrade(&state));
    }

    let listener = TcpListener::bind(addr).await?;
    info!("Air server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}/ws", addr);

    serve(listener, state, shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the server fails.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Air server stopped");
    Ok(())
}

/// Copy dispatcher stats into metrics until the state is dropped.
fn spawn_stats_mirror(state: Weak<AppState>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        loop {
            interval.tick().await;
            let Some(state) = state.upgrade() else {
                break;
            };
            metrics::set_dispatch_stats(&state.dispatch.stats());
        }
    });
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C signal, initiating graceful shutdown..."),
        Err(e) => {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}

fn header_str(headers: &HeaderMap, name: HeaderName) -> Option<&str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let dispatch = state.dispatch.stats();
    metrics::set_dispatch_stats(&dispatch);

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.registry.stats(),
        "dispatch": dispatch,
    }))
}

fn rejection_reason(e: &AdmitError) -> &'static str {
    match e {
        AdmitError::MissingChannel | AdmitError::MissingIdentity => "params",
        AdmitError::OriginNotAllowed => "origin",
        AdmitError::Access(_) => "room",
    }
}

/// WebSocket upgrade handler.
///
/// Validation runs before the upgrade so rejections are plain HTTP errors.
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
    headers: HeaderMap,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let origin = header_str(&headers, ORIGIN).unwrap_or_default();

    let admission = match Session::admit(&state.validator, params, origin).await {
        Ok(admission) => admission,
        Err(e) => {
            debug!(error = %e, "Connection rejected");
            metrics::record_rejection(rejection_reason(&e));
            return ConnectError(e).into_response();
        }
    };

    let Some(ws) = ws else {
        return (StatusCode::BAD_REQUEST, "WebSocket upgrade required").into_response();
    };
    ws.on_upgrade(move |socket| handle_websocket(socket, admission, state))
}

/// Drive an upgraded WebSocket through its session.
async fn handle_websocket(socket: WebSocket, admission: Admission, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let (sink, source) = websocket::split(socket);

    let session = match Session::start(
        admission,
        Arc::new(sink),
        Arc::clone(&state.registry),
        state.dispatch.clone(),
    )
    .await
    {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, "Failed to register connection");
            return;
        }
    };

    session.run(MeteredSource(source)).await;
}

/// Counts inbound text frames.
struct MeteredSource<S>(S);

#[async_trait]
impl<S: FrameSource> FrameSource for MeteredSource<S> {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        let inbound = self.0.recv().await?;
        if matches!(inbound, Some(Inbound::Text(_))) {
            metrics::record_frame();
        }
        Ok(inbound)
    }
}

#[derive(Serialize)]
struct PublishResponse {
    success: bool,
    room: String,
}

/// Publish API handler.
///
/// The body is unbounded at the HTTP layer; the room limit applies after
/// re-serialization.
async fn emit_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<PublishResponse>, ApiError> {
    let result = publish(&state, &headers, &body).await;
    metrics::record_publish(if result.is_ok() { "ok" } else { "rejected" });
    result.map(Json)
}

async fn publish(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<PublishResponse, ApiError> {
    let token = header_str(headers, AUTHORIZATION).ok_or(ApiError::MissingToken)?;
    let token = token.strip_prefix("Bearer ").unwrap_or(token);

    let api_token = state.validator.validate_token(token).await?;

    let object: Map<String, Value> =
        serde_json::from_slice(body).map_err(|_| ApiError::InvalidJson)?;
    let payload = codec::encode_object(&object).map_err(|e| ApiError::Internal(e.to_string()))?;

    let room = state.validator.validate_room(&api_token.room_name).await?;
    codec::check_size(payload.len(), room.max_payload_size)
        .map_err(|e| ApiError::PayloadTooLarge(e.to_string()))?;

    let size = payload.len();
    state
        .dispatch
        .submit(DispatchRequest::Broadcast {
            room: room.name.clone(),
            payload,
            sender: None,
        })
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    debug!(room = %room.name, token_id = api_token.id, size, "Published");
    Ok(PublishResponse {
        success: true,
        room: api_token.room_name,
    })
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

/// Client script handler.
async fn air_js_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let origin = header_str(&headers, ORIGIN)
        .or_else(|| header_str(&headers, REFERER))
        .unwrap_or_default();

    match state.validator.validate_any_origin(origin).await {
        Ok(true) => {}
        Ok(false) => {
            debug!(origin = %origin, "Client script denied");
            return (StatusCode::FORBIDDEN, "Access denied").into_response();
        }
        Err(e) => {
            error!(error = %e, "Store unavailable during origin check");
            return (StatusCode::FORBIDDEN, "Access denied").into_response();
        }
    }

    let path = state.config.assets.client_script_path();
    let script = match tokio::fs::read(&path).await {
        Ok(script) => script,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Client script unavailable");
            return (StatusCode::NOT_FOUND, "Not found").into_response();
        }
    };

    (
        [
            (CONTENT_TYPE, "application/javascript".to_string()),
            (ACCESS_CONTROL_ALLOW_ORIGIN, origin.to_string()),
            (
                CACHE_CONTROL,
                format!("public, max-age={}", state.config.assets.cache_max_age),
            ),
        ],
        script,
    )
        .into_response()
}
