//! Error types shared by the orchestrator, relay and capture pipeline.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Sandbox creation, start or address inspection failed
    #[error("failed to provision sandbox: {0}")]
    Provision(String),

    /// Health check did not succeed before the deadline
    #[error("sandbox not ready after {0:?}")]
    NotReady(Duration),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Non-success response from a sandbox control call
    #[error("sandbox request failed with status {status}: {body}")]
    SandboxRequest { status: u16, body: String },

    #[error("upstream unavailable: {0}")]
    RelayConnect(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("sandbox transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to decode screenshot: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("failed to canonicalize manifest: {0}")]
    Canonicalize(#[from] serde_json::Error),

    #[error("blob store error: {0}")]
    Storage(String),

    #[error("event log error: {0}")]
    EventLog(String),

    #[error("capture not found: {0}")]
    CaptureNotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;
