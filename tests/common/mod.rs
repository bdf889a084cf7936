//! Shared fixtures: an in-process fake browser agent and a provisioner that
//! points sessions at it instead of starting containers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{ws, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use capture_node::capture::{BrowserCapture, Viewport};
use capture_node::config::{OrchestratorConfig, PortSet};
use capture_node::error::{Error, Result};
use capture_node::sandbox::{ProvisionedSandbox, Provisioner};
use capture_node::state::{SandboxHandle, SessionRegistry};
use serde_json::Value;

pub const CHROME_UA: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.6099.109 Safari/537.36";
pub const SCREENSHOT: &[u8] = b"\x89PNG\r\n\x1a\nfake-image";
pub const DOM: &str = "<html><body><h1>hello</h1></body></html>";
pub const FINAL_URL: &str = "https://www.example.com/landing";

#[derive(Default)]
pub struct AgentState {
    pub healthy: AtomicBool,
    pub health_hits: AtomicU32,
    pub start_streams: AtomicU32,
    pub stop_streams: AtomicU32,
    pub ws_closed: AtomicBool,
    pub opened: Mutex<Vec<String>>,
    pub bad_screenshot: AtomicBool,
}

pub struct FakeAgent {
    pub port: u16,
    pub state: Arc<AgentState>,
}

impl FakeAgent {
    pub async fn start(healthy: bool) -> Self {
        let state = Arc::new(AgentState::default());
        state.healthy.store(healthy, Ordering::SeqCst);

        let app = Router::new()
            .route("/health", get(health))
            .route("/open", post(open))
            .route("/capture", post(capture))
            .route("/start-stream", post(start_stream))
            .route("/stop-stream", post(stop_stream))
            .route("/ws", get(stream))
            .with_state(state.clone());

        let port = serve(app).await;
        Self { port, state }
    }
}

async fn health(State(s): State<Arc<AgentState>>) -> StatusCode {
    s.health_hits.fetch_add(1, Ordering::SeqCst);
    if s.healthy.load(Ordering::SeqCst) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn open(State(s): State<Arc<AgentState>>, Json(body): Json<Value>) -> Response {
    let url = body["url"].as_str().unwrap_or_default().to_string();
    if url.contains("unreachable") {
        return (StatusCode::INTERNAL_SERVER_ERROR, "navigation failed: net::ERR_NAME_NOT_RESOLVED")
            .into_response();
    }
    s.opened.lock().unwrap().push(url);
    StatusCode::OK.into_response()
}

async fn capture(State(s): State<Arc<AgentState>>) -> Json<BrowserCapture> {
    let screenshot = if s.bad_screenshot.load(Ordering::SeqCst) {
        "%%%not-base64%%%".to_string()
    } else {
        STANDARD.encode(SCREENSHOT)
    };
    Json(BrowserCapture {
        screenshot,
        dom: DOM.to_string(),
        final_url: FINAL_URL.to_string(),
        viewport: Viewport {
            width: 1280,
            height: 720,
        },
        user_agent: CHROME_UA.to_string(),
    })
}

async fn start_stream(State(s): State<Arc<AgentState>>) -> StatusCode {
    s.start_streams.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

async fn stop_stream(State(s): State<Arc<AgentState>>) -> StatusCode {
    s.stop_streams.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

/// Text that makes the fake agent close the stream from its side.
pub const HANGUP: &str = "hangup";

/// Echoes every data message back.
async fn stream(State(s): State<Arc<AgentState>>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |mut socket| async move {
        while let Some(Ok(msg)) = socket.recv().await {
            match msg {
                ws::Message::Close(_) => break,
                ws::Message::Text(ref text) if text == HANGUP => {
                    let _ = socket
                        .send(ws::Message::Close(Some(ws::CloseFrame {
                            code: 1000,
                            reason: "agent stopping".into(),
                        })))
                        .await;
                    break;
                }
                ws::Message::Text(_) | ws::Message::Binary(_) => {
                    if socket.send(msg).await.is_err() {
                        break;
                    }
                }
                _ => {}
            }
        }
        s.ws_closed.store(true, Ordering::SeqCst);
    })
}

pub async fn serve(app: Router) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

/// A port nothing listens on.
pub async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Points every session at a fake agent and records handle lifecycles.
pub struct FakeProvisioner {
    control_port: u16,
    stream_port: u16,
    fail: bool,
    counter: AtomicU32,
    pub provisioned: Mutex<Vec<String>>,
    pub destroyed: Mutex<Vec<String>>,
}

impl FakeProvisioner {
    pub fn for_agent(agent: &FakeAgent) -> Self {
        Self::with_ports(agent.port, agent.port)
    }

    pub fn with_ports(control_port: u16, stream_port: u16) -> Self {
        Self {
            control_port,
            stream_port,
            fail: false,
            counter: AtomicU32::new(0),
            provisioned: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::with_ports(0, 0)
        }
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().unwrap().clone()
    }

    /// Provisioned handles not yet destroyed.
    pub fn live(&self) -> usize {
        let destroyed = self.destroyed.lock().unwrap();
        self.provisioned
            .lock()
            .unwrap()
            .iter()
            .filter(|h| !destroyed.contains(h))
            .count()
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn provision(&self, session_id: &str) -> Result<ProvisionedSandbox> {
        if self.fail {
            return Err(Error::Provision("create: image not found".to_string()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let handle = format!("fake-{}-{}", n, &session_id[..8]);
        self.provisioned.lock().unwrap().push(handle.clone());
        Ok(ProvisionedSandbox {
            handle: SandboxHandle::new(handle),
            address: "127.0.0.1".to_string(),
            ports: PortSet {
                control: self.control_port,
                vnc: 0,
                stream: self.stream_port,
            },
        })
    }

    async fn destroy(&self, handle: &SandboxHandle) {
        self.destroyed.lock().unwrap().push(handle.as_str().to_string());
    }
}

pub fn test_config() -> OrchestratorConfig {
    OrchestratorConfig {
        ready_timeout: Duration::from_secs(2),
        poll_interval: Duration::from_millis(20),
        control_timeout: Duration::from_secs(5),
        ..OrchestratorConfig::default()
    }
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually(within: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Id of the first registry entry, waiting for one to appear.
pub async fn first_registered(registry: &SessionRegistry) -> String {
    for _ in 0..200 {
        if let Some(id) = registry.ids().await.into_iter().next() {
            return id;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no session was registered");
}
