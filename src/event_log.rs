//! Client for the append-only event log that signs capture records.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EventHashes {
    pub manifest_sha256: String,
    pub screenshot_sha256: String,
    pub dom_sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventRequest {
    pub capture_id: String,
    pub url: String,
    #[serde(serialize_with = "crate::capture::timestamp::serialize")]
    pub captured_at_utc: DateTime<Utc>,
    pub hashes: EventHashes,
}

/// Signed, chained record returned by the event log. Kept as received.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent(Value);

impl RecordedEvent {
    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        Ok(Self(serde_json::from_slice(data)?))
    }

    pub fn event_id(&self) -> Option<&str> {
        self.0.get("event_id").and_then(Value::as_str)
    }

    pub fn manifest_sha256(&self) -> Option<&str> {
        self.0
            .get("hashes")
            .and_then(|h| h.get("manifest_sha256"))
            .and_then(Value::as_str)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&self.0)?)
    }
}

#[async_trait]
pub trait EventLog: Send + Sync {
    async fn submit(&self, request: &EventRequest) -> Result<RecordedEvent>;
}

pub struct HttpEventLog {
    http: reqwest::Client,
    base_url: String,
}

impl HttpEventLog {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl EventLog for HttpEventLog {
    async fn submit(&self, request: &EventRequest) -> Result<RecordedEvent> {
        let url = format!("{}/events", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::EventLog(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::EventLog(format!("status {}: {}", status.as_u16(), body)));
        }

        let value: Value = resp.json().await.map_err(|e| Error::EventLog(e.to_string()))?;
        let event = RecordedEvent::from_value(value);
        debug!(capture_id = %request.capture_id, event_id = ?event.event_id(), "event recorded");
        Ok(event)
    }
}
