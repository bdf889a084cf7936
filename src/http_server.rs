//! HTTP server implementation using Axum.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{self, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures_util::{future, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::capture::{CaptureMetadata, CapturePipeline, CaptureRecord};
use crate::error::Error;
use crate::orchestrator::SandboxOrchestrator;
use crate::relay::StreamRelay;
use crate::state::Session;
use crate::storage::Artifact;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SandboxOrchestrator>,
    pub pipeline: Arc<CapturePipeline>,
    pub relay: StreamRelay,
    /// Base the client-facing stream URLs are built on, e.g. `ws://host:8080`
    pub public_ws_url: String,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<SandboxOrchestrator>,
        pipeline: Arc<CapturePipeline>,
        public_ws_url: impl Into<String>,
    ) -> Self {
        Self {
            relay: StreamRelay::new(orchestrator.clone()),
            orchestrator,
            pipeline,
            public_ws_url: public_ws_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn stream_url(&self, session_id: &str) -> String {
        format!("{}/sessions/{}/ws", self.public_ws_url, session_id)
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::SessionNotFound(_) | Error::CaptureNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            Error::NotReady(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::SandboxRequest { .. }
            | Error::RelayConnect(_)
            | Error::EventLog(_)
            | Error::Transport(_) => StatusCode::BAD_GATEWAY,
            Error::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            Error::Provision(_)
            | Error::Decode(_)
            | Error::Canonicalize(_)
            | Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// Request/Response types
#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: String,
    stream_url: String,
    expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct SessionInfo {
    session_id: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    ttl_secs: i64,
}

impl From<&Session> for SessionInfo {
    fn from(s: &Session) -> Self {
        Self {
            session_id: s.id.clone(),
            created_at: s.created_at,
            expires_at: s.expires_at,
            ttl_secs: (s.expires_at - Utc::now()).num_seconds().max(0),
        }
    }
}

#[derive(Deserialize)]
struct OpenUrlRequest {
    url: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Session management
        .route("/sessions", post(create_session).get(list_sessions))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/open", post(open_url))
        .route("/sessions/:id/capture", post(capture_session))
        .route("/sessions/:id/start-stream", post(start_stream))
        .route("/sessions/:id/stop-stream", post(stop_stream))
        .route("/sessions/:id/ws", get(proxy_stream))
        // Captures
        .route("/captures/:id", get(capture_metadata))
        .route("/captures/:id/screenshot", get(capture_screenshot))
        .route("/captures/:id/dom", get(capture_dom))
        .route("/captures/:id/manifest", get(capture_manifest))
        // Health check
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP server on the given port until `shutdown` fires.
pub async fn run_server(port: u16, state: AppState, shutdown: CancellationToken) -> std::io::Result<()> {
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn create_session(State(state): State<AppState>) -> Result<(StatusCode, Json<CreateSessionResponse>), Error> {
    let cancel = state.orchestrator.child_token();
    let session = state.orchestrator.create_session(&cancel).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            stream_url: state.stream_url(&session.id),
            session_id: session.id,
            expires_at: session.expires_at,
        }),
    ))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    let sessions = state.orchestrator.list_sessions().await;
    Json(sessions.iter().map(SessionInfo::from).collect())
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionInfo>, Error> {
    let session = state.orchestrator.live_session(&id).await?;
    Ok(Json(SessionInfo::from(&session)))
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    state.orchestrator.destroy_session(&id).await;
    StatusCode::NO_CONTENT
}

async fn open_url(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<OpenUrlRequest>,
) -> Result<Json<serde_json::Value>, Error> {
    let url = state.orchestrator.open_url(&id, &req.url).await?;
    Ok(Json(json!({ "status": "ok", "url": url })))
}

async fn start_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, Error> {
    state.orchestrator.start_stream(&id).await?;
    Ok(Json(json!({ "status": "streaming" })))
}

async fn stop_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, Error> {
    state.orchestrator.stop_stream(&id).await?;
    Ok(Json(json!({ "status": "stopped" })))
}

async fn capture_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<CaptureRecord>), Error> {
    let record = state.pipeline.record(&id).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn proxy_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, Error> {
    state.orchestrator.live_session(&id).await?;

    Ok(ws.on_upgrade(move |socket| async move {
        let cancel = state.orchestrator.child_token();
        let (client_tx, client_rx) = split_client(socket);
        if let Err(e) = state.relay.run(&id, client_tx, client_rx, cancel).await {
            warn!(session_id = %id, error = %e, "relay ended with error");
        }
    }))
}

/// Present an axum socket as a tungstenite sink/stream pair for the relay.
fn split_client(
    socket: WebSocket,
) -> (
    impl futures_util::Sink<Message, Error = axum::Error> + Unpin,
    impl futures_util::Stream<Item = Result<Message, axum::Error>> + Unpin,
) {
    let (sink, stream) = socket.split();
    let sink = sink.with(|msg: Message| future::ready(Ok::<_, axum::Error>(to_axum(msg))));
    let stream = stream.map(|res| res.map(from_axum));
    (sink, stream)
}

fn to_axum(msg: Message) -> ws::Message {
    match msg {
        Message::Text(text) => ws::Message::Text(text),
        Message::Binary(data) => ws::Message::Binary(data),
        Message::Ping(data) => ws::Message::Ping(data),
        Message::Pong(data) => ws::Message::Pong(data),
        Message::Close(frame) => ws::Message::Close(frame.map(|f| ws::CloseFrame {
            code: f.code.into(),
            reason: f.reason,
        })),
        Message::Frame(frame) => ws::Message::Binary(frame.into_data()),
    }
}

fn from_axum(msg: ws::Message) -> Message {
    match msg {
        ws::Message::Text(text) => Message::Text(text),
        ws::Message::Binary(data) => Message::Binary(data),
        ws::Message::Ping(data) => Message::Ping(data),
        ws::Message::Pong(data) => Message::Pong(data),
        ws::Message::Close(frame) => Message::Close(frame.map(|f| CloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason,
        })),
    }
}

async fn capture_metadata(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CaptureMetadata>, Error> {
    Ok(Json(state.pipeline.metadata(&id).await?))
}

async fn artifact_response(state: &AppState, id: &str, artifact: Artifact) -> Result<Response, Error> {
    let data = state.pipeline.artifact(id, artifact).await?;
    Ok(([(header::CONTENT_TYPE, artifact.content_type())], data).into_response())
}

async fn capture_screenshot(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, Error> {
    artifact_response(&state, &id, Artifact::Screenshot).await
}

async fn capture_dom(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, Error> {
    artifact_response(&state, &id, Artifact::Dom).await
}

async fn capture_manifest(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, Error> {
    artifact_response(&state, &id, Artifact::Manifest).await
}
