//! Session records and the registry that owns them.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::config::PortSet;

/// Opaque handle to a running sandbox. Only the orchestrator holds these.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SandboxHandle(String);

impl SandboxHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A live sandbox binding.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub sandbox: SandboxHandle,
    pub address: String,
    pub ports: PortSet,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set once the sandbox has answered healthy. Until then the entry only
    /// exists so the sweeper and shutdown can see it.
    pub ready: bool,
}

impl Session {
    /// A session past its deadline is logically dead even before it is swept.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn control_url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.address, self.ports.control, path)
    }

    pub fn stream_url(&self, path: &str) -> String {
        format!("ws://{}:{}{}", self.address, self.ports.stream, path)
    }
}

/// Thread-safe session storage.
///
/// Every operation takes the map lock for its own duration only; callers
/// never hold it across sandbox I/O.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, session: Session) {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Removes and returns the entry. Of several concurrent callers for the
    /// same id, exactly one receives `Some`.
    pub async fn remove(&self, id: &str) -> Option<Session> {
        self.sessions.write().await.remove(id)
    }

    /// Flag `id` ready and return the updated entry, or `None` if it was
    /// removed in the meantime.
    pub async fn mark_ready(&self, id: &str) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(id)?;
        session.ready = true;
        Some(session.clone())
    }

    /// Snapshot of ids whose deadline has passed. Does not mutate.
    pub async fn list_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Every entry, including ones not yet ready.
    pub async fn list(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Ready sessions that have not expired at `now`.
    pub async fn list_live(&self, now: DateTime<Utc>) -> Vec<Session> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.ready && !s.is_expired(now))
            .cloned()
            .collect()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
