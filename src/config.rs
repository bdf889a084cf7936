//! Fixed sandbox constants and the orchestrator configuration built from them.

use std::time::Duration;

pub const DEFAULT_SANDBOX_IMAGE: &str = "intraceai/remote-browser:latest";

/// Session lifetime (15 minutes)
pub const SESSION_TTL_SECS: u64 = 15 * 60;
pub const SWEEP_INTERVAL_SECS: u64 = 60;
pub const READY_TIMEOUT_SECS: u64 = 30;
pub const READY_POLL_INTERVAL_MS: u64 = 500;
pub const STOP_GRACE_SECS: i64 = 5;
pub const CONTROL_TIMEOUT_SECS: u64 = 30;

pub const SANDBOX_MEMORY_BYTES: i64 = 2 * 1024 * 1024 * 1024;
pub const SANDBOX_NANO_CPUS: i64 = 2 * 1_000_000_000;

pub const CONTROL_PORT: u16 = 8082;
pub const VNC_PORT: u16 = 5900;
pub const STREAM_PORT: u16 = 6080;

/// Ports a sandbox exposes, as seen from the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSet {
    pub control: u16,
    pub vnc: u16,
    pub stream: u16,
}

impl Default for PortSet {
    fn default() -> Self {
        Self {
            control: CONTROL_PORT,
            vnc: VNC_PORT,
            stream: STREAM_PORT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub image: String,
    /// Docker network sandboxes join, if any
    pub network: Option<String>,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
    pub control_timeout: Duration,
    pub stop_grace_secs: i64,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub ports: PortSet,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            image: DEFAULT_SANDBOX_IMAGE.to_string(),
            network: None,
            session_ttl: Duration::from_secs(SESSION_TTL_SECS),
            sweep_interval: Duration::from_secs(SWEEP_INTERVAL_SECS),
            ready_timeout: Duration::from_secs(READY_TIMEOUT_SECS),
            poll_interval: Duration::from_millis(READY_POLL_INTERVAL_MS),
            control_timeout: Duration::from_secs(CONTROL_TIMEOUT_SECS),
            stop_grace_secs: STOP_GRACE_SECS,
            memory_bytes: SANDBOX_MEMORY_BYTES,
            nano_cpus: SANDBOX_NANO_CPUS,
            ports: PortSet::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_network(mut self, network: Option<String>) -> Self {
        self.network = network.filter(|n| !n.is_empty());
        self
    }
}
