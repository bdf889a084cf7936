//! Session lifecycle: provision, register, wait for health, control, reclaim.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde_json::json;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::capture::BrowserCapture;
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::readiness::ReadinessCheck;
use crate::sandbox::{ProvisionedSandbox, Provisioner};
use crate::state::{SandboxHandle, Session, SessionRegistry};
use crate::validation::normalize_url;

pub const OPEN_PATH: &str = "/open";
pub const CAPTURE_PATH: &str = "/capture";
pub const START_STREAM_PATH: &str = "/start-stream";
pub const STOP_STREAM_PATH: &str = "/stop-stream";

/// Remove `id` from the registry and stop its sandbox. Returns whether this
/// call was the one that removed it.
async fn teardown(registry: &SessionRegistry, provisioner: &dyn Provisioner, id: &str) -> bool {
    match registry.remove(id).await {
        Some(session) => {
            provisioner.destroy(&session.sandbox).await;
            info!(session_id = %id, "session destroyed");
            true
        }
        None => false,
    }
}

/// Tears down a sandbox whose create call never completed, including when the
/// create future is dropped.
struct PendingSandbox {
    registry: SessionRegistry,
    provisioner: Arc<dyn Provisioner>,
    session_id: String,
    handle: SandboxHandle,
    armed: bool,
}

impl PendingSandbox {
    fn disarm(&mut self) {
        self.armed = false;
    }

    async fn discard(mut self) {
        self.armed = false;
        if !teardown(&self.registry, self.provisioner.as_ref(), &self.session_id).await {
            self.provisioner.destroy(&self.handle).await;
        }
    }
}

impl Drop for PendingSandbox {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let registry = self.registry.clone();
        let provisioner = self.provisioner.clone();
        let session_id = std::mem::take(&mut self.session_id);
        let handle = self.handle.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                warn!(session_id = %session_id, "create abandoned, tearing down sandbox");
                rt.spawn(async move {
                    if !teardown(&registry, provisioner.as_ref(), &session_id).await {
                        provisioner.destroy(&handle).await;
                    }
                });
            }
            Err(_) => warn!(session_id = %session_id, "no runtime to tear down abandoned sandbox"),
        }
    }
}

/// Periodic reclamation of expired sessions.
pub struct ExpirySweeper {
    registry: SessionRegistry,
    provisioner: Arc<dyn Provisioner>,
    period: Duration,
}

impl ExpirySweeper {
    pub fn new(registry: SessionRegistry, provisioner: Arc<dyn Provisioner>, period: Duration) -> Self {
        Self {
            registry,
            provisioner,
            period,
        }
    }

    /// Sweep once per period, first one period after start, until
    /// `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.sweep(Utc::now()).await;
                }
            }
        }
        debug!("expiry sweeper stopped");
    }

    /// Destroy every session expired at `now`, each independently and
    /// outside the registry lock. Returns how many this pass reclaimed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let expired = self.registry.list_expired(now).await;
        if expired.is_empty() {
            return 0;
        }
        info!(count = expired.len(), "sweeping expired sessions");
        let results = join_all(expired.iter().map(|id| {
            debug!(session_id = %id, "cleaning up expired session");
            teardown(&self.registry, self.provisioner.as_ref(), id)
        }))
        .await;
        results.into_iter().filter(|reclaimed| *reclaimed).count()
    }
}

pub struct SandboxOrchestrator {
    config: OrchestratorConfig,
    registry: SessionRegistry,
    provisioner: Arc<dyn Provisioner>,
    readiness: ReadinessCheck,
    http: reqwest::Client,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SandboxOrchestrator {
    /// Build the orchestrator and start its expiry sweeper. Must be called
    /// from within a tokio runtime.
    pub fn start(
        config: OrchestratorConfig,
        provisioner: Arc<dyn Provisioner>,
        registry: SessionRegistry,
    ) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(config.control_timeout)
            .build()?;
        let readiness = ReadinessCheck::new(http.clone(), config.poll_interval, config.ready_timeout);
        let shutdown = CancellationToken::new();

        let sweeper = ExpirySweeper::new(registry.clone(), provisioner.clone(), config.sweep_interval);
        let handle = tokio::spawn(sweeper.run(shutdown.clone()));

        Ok(Arc::new(Self {
            config,
            registry,
            provisioner,
            readiness,
            http,
            shutdown,
            sweeper: Mutex::new(Some(handle)),
        }))
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Token cancelled when the orchestrator shuts down.
    pub fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Provision a sandbox and wait for it to answer healthy. On any failure
    /// the sandbox is torn down and nothing stays registered.
    pub async fn create_session(&self, cancel: &CancellationToken) -> Result<Session> {
        let id = Uuid::new_v4().to_string();
        let provisioned = tokio::select! {
            res = self.provision_detached(&id) => {
                res.map_err(|_| Error::Provision("provisioning task ended early".to_string()))??
            }
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = self.shutdown.cancelled() => return Err(Error::Cancelled),
        };

        let mut pending = PendingSandbox {
            registry: self.registry.clone(),
            provisioner: self.provisioner.clone(),
            session_id: id.clone(),
            handle: provisioned.handle.clone(),
            armed: true,
        };

        let created_at = Utc::now();
        let ttl = chrono::Duration::milliseconds(self.config.session_ttl.as_millis() as i64);
        let session = Session {
            id: id.clone(),
            sandbox: provisioned.handle,
            address: provisioned.address,
            ports: provisioned.ports,
            created_at,
            expires_at: created_at + ttl,
            ready: false,
        };
        self.registry.put(session.clone()).await;

        let ready = tokio::select! {
            res = self.readiness.wait_ready(&session.address, session.ports.control, cancel) => res,
            _ = self.shutdown.cancelled() => Err(Error::Cancelled),
        };

        match ready {
            Ok(()) => {
                // whoever removed the entry while we waited also stopped its sandbox
                pending.disarm();
                match self.registry.mark_ready(&id).await {
                    Some(session) => {
                        info!(session_id = %id, address = %session.address, "session ready");
                        Ok(session)
                    }
                    None => {
                        warn!(session_id = %id, "session destroyed before it became ready");
                        Err(Error::SessionNotFound(id))
                    }
                }
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "sandbox never became ready");
                pending.discard().await;
                Err(e)
            }
        }
    }

    /// Run `provision` on its own task so it completes even if the caller
    /// goes away; a sandbox nobody is waiting for is destroyed.
    fn provision_detached(&self, id: &str) -> oneshot::Receiver<Result<ProvisionedSandbox>> {
        let (tx, rx) = oneshot::channel();
        let provisioner = self.provisioner.clone();
        let session_id = id.to_string();
        tokio::spawn(async move {
            let result = provisioner.provision(&session_id).await;
            if let Err(Ok(orphan)) = tx.send(result) {
                warn!(session_id = %session_id, "create abandoned during provisioning, tearing down sandbox");
                provisioner.destroy(&orphan.handle).await;
            }
        });
        rx
    }

    /// Idempotent. Returns whether a live session was torn down.
    pub async fn destroy_session(&self, id: &str) -> bool {
        teardown(&self.registry, self.provisioner.as_ref(), id).await
    }

    pub async fn get_session(&self, id: &str) -> Option<Session> {
        self.registry.get(id).await
    }

    /// Ready, unexpired sessions.
    pub async fn list_sessions(&self) -> Vec<Session> {
        self.registry.list_live(Utc::now()).await
    }

    /// Resolve `id` right before a sandbox call. Expired sessions and ones
    /// still starting up count as gone.
    pub async fn live_session(&self, id: &str) -> Result<Session> {
        match self.registry.get(id).await {
            Some(session) if session.ready && !session.is_expired(Utc::now()) => Ok(session),
            _ => Err(Error::SessionNotFound(id.to_string())),
        }
    }

    async fn control(
        &self,
        id: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let session = self.live_session(id).await?;
        let mut request = self.http.post(session.control_url(path));
        if let Some(body) = body {
            request = request.json(&body);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            debug!(session_id = %id, path, status, "sandbox rejected request");
            return Err(Error::SandboxRequest { status, body });
        }
        Ok(resp)
    }

    /// Navigate the session's browser. Returns the normalized URL.
    pub async fn open_url(&self, id: &str, url: &str) -> Result<String> {
        let url = normalize_url(url)?;
        self.control(id, OPEN_PATH, Some(json!({ "url": url }))).await?;
        info!(session_id = %id, url = %url, "opened url");
        Ok(url)
    }

    pub async fn start_stream(&self, id: &str) -> Result<()> {
        self.control(id, START_STREAM_PATH, None).await?;
        debug!(session_id = %id, "stream started");
        Ok(())
    }

    pub async fn stop_stream(&self, id: &str) -> Result<()> {
        self.control(id, STOP_STREAM_PATH, None).await?;
        debug!(session_id = %id, "stream stopped");
        Ok(())
    }

    /// Raw capture payload from the sandbox agent.
    pub async fn capture(&self, id: &str) -> Result<BrowserCapture> {
        let resp = self.control(id, CAPTURE_PATH, None).await?;
        Ok(resp.json::<BrowserCapture>().await?)
    }

    /// Stop the sweeper and destroy every remaining session.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.sweeper.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "expiry sweeper ended abnormally");
            }
        }

        let ids = self.registry.ids().await;
        if !ids.is_empty() {
            info!(count = ids.len(), "destroying remaining sessions");
        }
        join_all(ids.iter().map(|id| self.destroy_session(id))).await;
    }
}
