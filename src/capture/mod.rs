//! Page capture: fetch raw artifacts from a sandbox, hash them into a
//! manifest, and persist the result alongside its event-log record.

mod canonical;
mod hash;
mod manifest;

pub use canonical::{canonicalize, canonicalize_json};
pub use hash::sha256_hex;
pub use manifest::{
    browser_version, timestamp, ArtifactHashes, Browser, BuildInput, BuildOutput, Manifest, ManifestBuilder,
    Viewport, BROWSER_NAME, DEFAULT_VISIBILITY, UNKNOWN_VERSION,
};

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event_log::{EventHashes, EventLog, EventRequest, RecordedEvent};
use crate::orchestrator::SandboxOrchestrator;
use crate::storage::{Artifact, BlobStore};

/// Body of the sandbox agent's `POST /capture` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserCapture {
    /// Base64 PNG
    pub screenshot: String,
    pub dom: String,
    pub final_url: String,
    pub viewport: Viewport,
    pub user_agent: String,
}

/// Decoded artifacts plus the manifest built over them.
#[derive(Debug, Clone)]
pub struct CapturedPage {
    pub screenshot: Vec<u8>,
    pub dom: Vec<u8>,
    pub build: BuildOutput,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureRecord {
    pub capture_id: String,
    pub view_url: String,
    pub event_id: String,
    pub hashes: EventHashes,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureMetadata {
    pub capture_id: String,
    pub url: String,
    pub final_url: String,
    pub captured_at_utc: DateTime<Utc>,
    pub browser: Browser,
    pub viewport: Viewport,
    pub hashes: EventHashes,
    pub event_id: Option<String>,
}

pub struct CapturePipeline {
    orchestrator: Arc<SandboxOrchestrator>,
    builder: ManifestBuilder,
    store: Arc<dyn BlobStore>,
    event_log: Arc<dyn EventLog>,
    viewer_url: String,
}

impl CapturePipeline {
    pub fn new(
        orchestrator: Arc<SandboxOrchestrator>,
        store: Arc<dyn BlobStore>,
        event_log: Arc<dyn EventLog>,
        viewer_url: impl Into<String>,
    ) -> Self {
        Self {
            orchestrator,
            builder: ManifestBuilder::new(),
            store,
            event_log,
            viewer_url: viewer_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Capture the session's current page and build its manifest. Nothing is
    /// persisted.
    pub async fn capture(&self, session_id: &str) -> Result<CapturedPage> {
        let raw = self.orchestrator.capture(session_id).await?;
        let screenshot = STANDARD.decode(raw.screenshot.as_bytes())?;
        let dom = raw.dom.into_bytes();

        let build = self.builder.build(BuildInput {
            capture_id: Uuid::new_v4().to_string(),
            // the agent only reports where the page ended up
            url: raw.final_url.clone(),
            final_url: raw.final_url,
            captured_at_utc: Utc::now(),
            browser_name: BROWSER_NAME.to_string(),
            browser_version: browser_version(&raw.user_agent),
            viewport: raw.viewport,
            screenshot: &screenshot,
            dom: &dom,
        })?;

        Ok(CapturedPage {
            screenshot,
            dom,
            build,
        })
    }

    /// Capture, persist every artifact, and record the hashes in the event
    /// log. Either all objects for the capture id are written or none are.
    pub async fn record(&self, session_id: &str) -> Result<CaptureRecord> {
        let page = self.capture(session_id).await?;
        let capture_id = page.build.manifest.capture_id().to_string();

        let mut written = Vec::new();
        let mut appended = None;
        let event = match self.persist(&page, &mut written, &mut appended).await {
            Ok(event) => event,
            Err(e) => {
                warn!(capture_id = %capture_id, error = %e, "capture persistence failed, rolling back");
                self.rollback(&written).await;
                if let Some(event_id) = appended {
                    // the log is append-only; its record now names objects that do not exist
                    warn!(
                        capture_id = %capture_id,
                        event_id = %event_id,
                        "event recorded for a capture that was rolled back"
                    );
                }
                return Err(e);
            }
        };

        let hashes = EventHashes {
            manifest_sha256: page.build.manifest_hash.clone(),
            screenshot_sha256: page.build.screenshot_hash.clone(),
            dom_sha256: page.build.dom_hash.clone(),
        };
        let event_id = event.event_id().unwrap_or_default().to_string();
        info!(session_id, capture_id = %capture_id, event_id = %event_id, "capture recorded");

        Ok(CaptureRecord {
            view_url: format!("{}/capture.html?id={}", self.viewer_url, capture_id),
            capture_id,
            event_id,
            hashes,
        })
    }

    /// Sets `appended` once the event log has accepted a record, so a later
    /// failure can report it.
    async fn persist(
        &self,
        page: &CapturedPage,
        written: &mut Vec<String>,
        appended: &mut Option<String>,
    ) -> Result<RecordedEvent> {
        let manifest = &page.build.manifest;
        let capture_id = manifest.capture_id();

        self.put(capture_id, Artifact::Screenshot, page.screenshot.clone(), written)
            .await?;
        self.put(capture_id, Artifact::Dom, page.dom.clone(), written).await?;
        self.put(capture_id, Artifact::Manifest, page.build.canonical.clone(), written)
            .await?;

        let request = EventRequest {
            capture_id: capture_id.to_string(),
            url: manifest.url().to_string(),
            captured_at_utc: manifest.captured_at_utc(),
            hashes: EventHashes {
                manifest_sha256: page.build.manifest_hash.clone(),
                screenshot_sha256: page.build.screenshot_hash.clone(),
                dom_sha256: page.build.dom_hash.clone(),
            },
        };
        let event = self.event_log.submit(&request).await?;
        match event.event_id() {
            Some(event_id) => *appended = Some(event_id.to_string()),
            None => return Err(Error::EventLog("response has no event_id".to_string())),
        }
        if let Some(recorded) = event.manifest_sha256() {
            if recorded != page.build.manifest_hash {
                return Err(Error::EventLog(format!(
                    "event records manifest hash {} but capture has {}",
                    recorded, page.build.manifest_hash
                )));
            }
        }

        self.put(capture_id, Artifact::Event, event.to_json()?, written)
            .await?;
        Ok(event)
    }

    async fn put(
        &self,
        capture_id: &str,
        artifact: Artifact,
        data: Vec<u8>,
        written: &mut Vec<String>,
    ) -> Result<()> {
        let key = artifact.key(capture_id);
        self.store.put(&key, artifact.content_type(), data).await?;
        written.push(key);
        Ok(())
    }

    async fn rollback(&self, written: &[String]) {
        for key in written.iter().rev() {
            if let Err(e) = self.store.delete(key).await {
                warn!(key = %key, error = %e, "failed to remove partial capture object");
            }
        }
    }

    /// Stored bytes of one artifact.
    pub async fn artifact(&self, capture_id: &str, artifact: Artifact) -> Result<Vec<u8>> {
        let capture_id = parse_capture_id(capture_id)?;
        self.store
            .get(&artifact.key(&capture_id))
            .await?
            .ok_or(Error::CaptureNotFound(capture_id))
    }

    /// Manifest fields plus what the event log recorded, if anything.
    pub async fn metadata(&self, capture_id: &str) -> Result<CaptureMetadata> {
        let manifest_bytes = self.artifact(capture_id, Artifact::Manifest).await?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)?;

        let event = match self.artifact(capture_id, Artifact::Event).await {
            Ok(bytes) => Some(RecordedEvent::from_slice(&bytes)?),
            Err(Error::CaptureNotFound(_)) => None,
            Err(e) => return Err(e),
        };

        Ok(CaptureMetadata {
            capture_id: manifest.capture_id().to_string(),
            url: manifest.url().to_string(),
            final_url: manifest.final_url().to_string(),
            captured_at_utc: manifest.captured_at_utc(),
            browser: manifest.browser().clone(),
            viewport: manifest.viewport(),
            hashes: EventHashes {
                manifest_sha256: event
                    .as_ref()
                    .and_then(|e| e.manifest_sha256())
                    .unwrap_or_default()
                    .to_string(),
                screenshot_sha256: manifest.hashes().screenshot_sha256.clone(),
                dom_sha256: manifest.hashes().dom_sha256.clone(),
            },
            event_id: event.as_ref().and_then(|e| e.event_id()).map(str::to_string),
        })
    }
}

/// Capture ids are UUIDs; anything else cannot name a stored capture.
fn parse_capture_id(raw: &str) -> Result<String> {
    Uuid::parse_str(raw)
        .map(|id| id.to_string())
        .map_err(|_| Error::CaptureNotFound(raw.to_string()))
}
