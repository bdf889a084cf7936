//! Readiness polling against a sandbox's control API.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};

pub const HEALTH_PATH: &str = "/health";

/// Upper bound for a single health request.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct ReadinessCheck {
    http: reqwest::Client,
    interval: Duration,
    timeout: Duration,
}

impl ReadinessCheck {
    pub fn new(http: reqwest::Client, interval: Duration, timeout: Duration) -> Self {
        Self {
            http,
            interval,
            timeout,
        }
    }

    /// Poll `GET /health` until it answers 2xx, the deadline passes, or
    /// `cancel` fires. Sleeps `interval` between attempts.
    pub async fn wait_ready(&self, address: &str, port: u16, cancel: &CancellationToken) -> Result<()> {
        let url = format!("http://{}:{}{}", address, port, HEALTH_PATH);
        let deadline = Instant::now() + self.timeout;
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(url = %url, attempts, "readiness deadline passed");
                return Err(Error::NotReady(self.timeout));
            }

            attempts += 1;
            let per_attempt = ATTEMPT_TIMEOUT.min(deadline - now);
            let attempt = self.http.get(&url).timeout(per_attempt).send();
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                res = attempt => match res {
                    Ok(resp) if resp.status().is_success() => {
                        debug!(url = %url, attempts, "sandbox ready");
                        return Ok(());
                    }
                    Ok(resp) => debug!(url = %url, status = %resp.status(), "sandbox not ready yet"),
                    Err(e) => debug!(url = %url, error = %e, "health request failed"),
                },
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = sleep(self.interval) => {}
            }
        }
    }
}
