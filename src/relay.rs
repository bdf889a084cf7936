//! Bidirectional message relay between a client and a sandbox's stream
//! endpoint.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::orchestrator::SandboxOrchestrator;

pub const STREAM_PATH: &str = "/ws";
pub const UPSTREAM_UNAVAILABLE: &str = "upstream unavailable";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Messages forwarded in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub to_sandbox: u64,
    pub to_client: u64,
}

#[derive(Clone)]
pub struct StreamRelay {
    orchestrator: Arc<SandboxOrchestrator>,
}

impl StreamRelay {
    pub fn new(orchestrator: Arc<SandboxOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Relay until either side closes or `cancel` fires. Both connections are
    /// closed and stream mode is stopped before this returns.
    pub async fn run<CTx, CRx, E>(
        &self,
        session_id: &str,
        mut client_tx: CTx,
        client_rx: CRx,
        cancel: CancellationToken,
    ) -> Result<RelayStats>
    where
        CTx: Sink<Message> + Unpin,
        CTx::Error: Display,
        CRx: Stream<Item = std::result::Result<Message, E>> + Unpin,
        E: Display,
    {
        let session = match self.orchestrator.live_session(session_id).await {
            Ok(session) => session,
            Err(e) => {
                close_with(&mut client_tx, CloseCode::Policy, "session not found").await;
                return Err(e);
            }
        };

        if let Err(e) = self.orchestrator.start_stream(session_id).await {
            warn!(session_id, error = %e, "failed to start stream mode");
        }

        let upstream_url = session.stream_url(STREAM_PATH);
        let upstream = match timeout(CONNECT_TIMEOUT, connect_async(upstream_url.as_str())).await {
            Ok(Ok((ws, _))) => ws,
            Ok(Err(e)) => return Err(self.abort(session_id, &mut client_tx, e.to_string()).await),
            Err(_) => return Err(self.abort(session_id, &mut client_tx, "connect timed out".to_string()).await),
        };
        info!(session_id, upstream = %upstream_url, "relay connected");

        let (upstream_tx, upstream_rx) = upstream.split();
        let done = cancel.child_token();
        let ((mut upstream_tx, to_sandbox), (mut client_tx, to_client)) = tokio::join!(
            pump("client->sandbox", client_rx, upstream_tx, done.clone()),
            pump("sandbox->client", upstream_rx, client_tx, done.clone()),
        );

        let _ = timeout(CLOSE_TIMEOUT, upstream_tx.close()).await;
        let _ = timeout(CLOSE_TIMEOUT, client_tx.close()).await;

        self.stop_stream(session_id).await;
        let stats = RelayStats {
            to_sandbox,
            to_client,
        };
        info!(session_id, to_sandbox, to_client, "relay closed");
        Ok(stats)
    }

    async fn abort<CTx>(&self, session_id: &str, client_tx: &mut CTx, reason: String) -> Error
    where
        CTx: Sink<Message> + Unpin,
    {
        warn!(session_id, reason = %reason, "sandbox stream endpoint unreachable");
        close_with(client_tx, CloseCode::Error, UPSTREAM_UNAVAILABLE).await;
        self.stop_stream(session_id).await;
        Error::RelayConnect(reason)
    }

    async fn stop_stream(&self, session_id: &str) {
        match self.orchestrator.stop_stream(session_id).await {
            Ok(()) => {}
            Err(Error::SessionNotFound(_)) => debug!(session_id, "session gone before stream stop"),
            Err(e) => warn!(session_id, error = %e, "failed to stop stream mode"),
        }
    }
}

/// Forward messages from `rx` to `tx` until a close, an error, or `done`.
/// Cancels `done` on the way out so the opposite direction stops too.
async fn pump<R, W, E>(direction: &'static str, mut rx: R, mut tx: W, done: CancellationToken) -> (W, u64)
where
    R: Stream<Item = std::result::Result<Message, E>> + Unpin,
    W: Sink<Message> + Unpin,
    W::Error: Display,
    E: Display,
{
    let mut forwarded = 0u64;
    loop {
        let next = tokio::select! {
            _ = done.cancelled() => break,
            next = rx.next() => next,
        };
        let msg = match next {
            Some(Ok(Message::Close(_))) | None => {
                debug!(direction, "peer closed");
                break;
            }
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                debug!(direction, error = %e, "read failed");
                break;
            }
        };
        let sent = tokio::select! {
            _ = done.cancelled() => break,
            sent = tx.send(msg) => sent,
        };
        if let Err(e) = sent {
            debug!(direction, error = %e, "write failed");
            break;
        }
        forwarded += 1;
    }
    done.cancel();
    (tx, forwarded)
}

async fn close_with<W>(tx: &mut W, code: CloseCode, reason: &'static str)
where
    W: Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = timeout(CLOSE_TIMEOUT, async {
        let _ = tx.send(Message::Close(Some(frame))).await;
        let _ = tx.close().await;
    })
    .await;
}
