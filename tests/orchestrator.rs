//! Integration tests for the session lifecycle.
//!
//! These tests verify:
//! - Sessions are only handed out once their sandbox answers healthy
//! - Every failing create path leaves no sandbox and no registry entry
//! - Destroy is idempotent and races safely
//! - Expired sessions are swept and treated as gone before that
//! - Control calls surface sandbox failures with the upstream body

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use capture_node::config::PortSet;
use capture_node::error::Error;
use capture_node::orchestrator::{ExpirySweeper, SandboxOrchestrator};
use capture_node::state::{SandboxHandle, Session, SessionRegistry};
use chrono::Utc;
use common::{eventually, first_registered, test_config, FakeAgent, FakeProvisioner};
use tokio_util::sync::CancellationToken;

fn expired_session(id: &str) -> Session {
    let now = Utc::now();
    Session {
        id: id.to_string(),
        sandbox: SandboxHandle::new(format!("manual-{}", id)),
        address: "127.0.0.1".to_string(),
        ports: PortSet::default(),
        created_at: now - chrono::Duration::minutes(16),
        expires_at: now - chrono::Duration::seconds(1),
        ready: true,
    }
}

// =============================================================================
// Creation
// =============================================================================

#[tokio::test]
async fn test_create_session_registers_ready_session() {
    let agent = FakeAgent::start(true).await;
    let provisioner = Arc::new(FakeProvisioner::for_agent(&agent));
    let config = test_config();
    let ttl = config.session_ttl;
    let orch = SandboxOrchestrator::start(config, provisioner.clone(), SessionRegistry::new()).unwrap();

    let session = orch
        .create_session(&CancellationToken::new())
        .await
        .expect("session should be created");

    assert_eq!(
        session.expires_at,
        session.created_at + chrono::Duration::from_std(ttl).unwrap()
    );
    assert!(agent.state.health_hits.load(Ordering::SeqCst) >= 1);
    let stored = orch.get_session(&session.id).await.expect("registered");
    assert_eq!(stored.sandbox, session.sandbox);
    assert_eq!(provisioner.live(), 1);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_creates_get_distinct_sessions() {
    let agent = FakeAgent::start(true).await;
    let provisioner = Arc::new(FakeProvisioner::for_agent(&agent));
    let orch = SandboxOrchestrator::start(test_config(), provisioner.clone(), SessionRegistry::new()).unwrap();

    let handles: Vec<_> = (0..5)
        .map(|_| {
            let orch = orch.clone();
            tokio::spawn(async move { orch.create_session(&CancellationToken::new()).await })
        })
        .collect();

    let mut ids = Vec::new();
    let mut sandboxes = Vec::new();
    for handle in handles {
        let session = handle.await.unwrap().expect("create");
        ids.push(session.id);
        sandboxes.push(session.sandbox);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 5);
    sandboxes.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    sandboxes.dedup();
    assert_eq!(sandboxes.len(), 5);
    assert_eq!(orch.registry().len().await, 5);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_unready_sandbox_fails_and_is_torn_down() {
    let agent = FakeAgent::start(false).await;
    let provisioner = Arc::new(FakeProvisioner::for_agent(&agent));
    let mut config = test_config();
    config.ready_timeout = Duration::from_millis(300);
    let orch = SandboxOrchestrator::start(config, provisioner.clone(), SessionRegistry::new()).unwrap();

    let err = orch.create_session(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, Error::NotReady(_)), "got {:?}", err);
    assert!(orch.registry().is_empty().await);
    assert_eq!(provisioner.provisioned.lock().unwrap().len(), 1);
    assert_eq!(provisioner.live(), 0);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_provision_failure_leaves_nothing_registered() {
    let provisioner = Arc::new(FakeProvisioner::failing());
    let orch = SandboxOrchestrator::start(test_config(), provisioner, SessionRegistry::new()).unwrap();

    let err = orch.create_session(&CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, Error::Provision(_)));
    assert!(orch.registry().is_empty().await);
    orch.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_create_tears_down_sandbox() {
    let agent = FakeAgent::start(false).await;
    let provisioner = Arc::new(FakeProvisioner::for_agent(&agent));
    let mut config = test_config();
    config.ready_timeout = Duration::from_secs(30);
    let orch = SandboxOrchestrator::start(config, provisioner.clone(), SessionRegistry::new()).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = orch.create_session(&cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(orch.registry().is_empty().await);
    assert_eq!(provisioner.live(), 0);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_dropped_create_future_tears_down_sandbox() {
    let agent = FakeAgent::start(false).await;
    let provisioner = Arc::new(FakeProvisioner::for_agent(&agent));
    let mut config = test_config();
    config.ready_timeout = Duration::from_secs(30);
    let orch = SandboxOrchestrator::start(config, provisioner.clone(), SessionRegistry::new()).unwrap();

    let cancel = CancellationToken::new();
    let attempt = tokio::time::timeout(Duration::from_millis(150), orch.create_session(&cancel)).await;
    assert!(attempt.is_err(), "create should still be waiting for readiness");

    let p = provisioner.clone();
    assert!(eventually(Duration::from_secs(2), move || p.live() == 0 && !p.destroyed().is_empty()).await);
    assert!(orch.registry().is_empty().await);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_session_is_hidden_until_ready() {
    let agent = FakeAgent::start(false).await;
    let provisioner = Arc::new(FakeProvisioner::for_agent(&agent));
    let mut config = test_config();
    config.ready_timeout = Duration::from_secs(10);
    let orch = SandboxOrchestrator::start(config, provisioner, SessionRegistry::new()).unwrap();

    let creating = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.create_session(&CancellationToken::new()).await })
    };
    let id = first_registered(orch.registry()).await;

    assert!(orch.list_sessions().await.is_empty());
    assert!(matches!(orch.live_session(&id).await, Err(Error::SessionNotFound(_))));
    let err = orch.open_url(&id, "https://example.com").await.unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(_)));

    agent.state.healthy.store(true, Ordering::SeqCst);
    let session = creating.await.unwrap().expect("ready once healthy");

    assert_eq!(session.id, id);
    assert!(session.ready);
    let listed: Vec<String> = orch.list_sessions().await.into_iter().map(|s| s.id).collect();
    assert_eq!(listed, vec![id.clone()]);
    assert!(orch.live_session(&id).await.is_ok());

    orch.shutdown().await;
}

#[tokio::test]
async fn test_destroy_before_ready_fails_the_create() {
    let agent = FakeAgent::start(false).await;
    let provisioner = Arc::new(FakeProvisioner::for_agent(&agent));
    let mut config = test_config();
    config.ready_timeout = Duration::from_secs(10);
    let orch = SandboxOrchestrator::start(config, provisioner.clone(), SessionRegistry::new()).unwrap();

    let creating = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.create_session(&CancellationToken::new()).await })
    };
    let id = first_registered(orch.registry()).await;

    assert!(orch.destroy_session(&id).await);
    agent.state.healthy.store(true, Ordering::SeqCst);

    let err = creating.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(ref gone) if *gone == id));
    assert!(orch.registry().is_empty().await);
    assert_eq!(provisioner.destroyed().len(), 1);
    assert_eq!(provisioner.live(), 0);

    orch.shutdown().await;
}

// =============================================================================
// Destruction
// =============================================================================

#[tokio::test]
async fn test_destroy_session_is_idempotent() {
    let agent = FakeAgent::start(true).await;
    let provisioner = Arc::new(FakeProvisioner::for_agent(&agent));
    let orch = SandboxOrchestrator::start(test_config(), provisioner.clone(), SessionRegistry::new()).unwrap();
    let session = orch.create_session(&CancellationToken::new()).await.unwrap();

    assert!(orch.destroy_session(&session.id).await);
    assert!(!orch.destroy_session(&session.id).await);
    assert!(!orch.destroy_session("never-existed").await);

    assert!(orch.get_session(&session.id).await.is_none());
    assert_eq!(provisioner.destroyed(), vec![session.sandbox.as_str().to_string()]);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_destroys_stop_sandbox_once() {
    let agent = FakeAgent::start(true).await;
    let provisioner = Arc::new(FakeProvisioner::for_agent(&agent));
    let orch = SandboxOrchestrator::start(test_config(), provisioner.clone(), SessionRegistry::new()).unwrap();
    let session = orch.create_session(&CancellationToken::new()).await.unwrap();

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let orch = orch.clone();
            let id = session.id.clone();
            tokio::spawn(async move { orch.destroy_session(&id).await })
        })
        .collect();
    let mut torn_down = 0;
    for handle in handles {
        if handle.await.unwrap() {
            torn_down += 1;
        }
    }

    assert_eq!(torn_down, 1);
    assert_eq!(provisioner.destroyed().len(), 1);
    orch.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_destroys_remaining_sessions() {
    let agent = FakeAgent::start(true).await;
    let provisioner = Arc::new(FakeProvisioner::for_agent(&agent));
    let orch = SandboxOrchestrator::start(test_config(), provisioner.clone(), SessionRegistry::new()).unwrap();
    orch.create_session(&CancellationToken::new()).await.unwrap();
    orch.create_session(&CancellationToken::new()).await.unwrap();

    orch.shutdown().await;

    assert!(orch.registry().is_empty().await);
    assert_eq!(provisioner.live(), 0);
}

// =============================================================================
// Expiry
// =============================================================================

#[tokio::test]
async fn test_sweeper_reaps_expired_session_on_next_tick() {
    let provisioner = Arc::new(FakeProvisioner::with_ports(0, 0));
    let registry = SessionRegistry::new();
    let mut config = test_config();
    config.sweep_interval = Duration::from_millis(50);
    let orch = SandboxOrchestrator::start(config, provisioner.clone(), registry.clone()).unwrap();

    registry.put(expired_session("old")).await;
    assert!(orch.get_session("old").await.is_some());

    let p = provisioner.clone();
    assert!(eventually(Duration::from_secs(2), move || p.destroyed().contains(&"manual-old".to_string())).await);
    assert!(orch.get_session("old").await.is_none());

    orch.shutdown().await;
}

#[tokio::test]
async fn test_sweep_pass_only_touches_expired_sessions() {
    let provisioner = Arc::new(FakeProvisioner::with_ports(0, 0));
    let registry = SessionRegistry::new();
    let sweeper = ExpirySweeper::new(registry.clone(), provisioner.clone(), Duration::from_secs(60));

    let mut fresh = expired_session("fresh");
    fresh.expires_at = Utc::now() + chrono::Duration::minutes(10);
    registry.put(fresh).await;
    registry.put(expired_session("a")).await;
    registry.put(expired_session("b")).await;

    assert_eq!(sweeper.sweep(Utc::now()).await, 2);
    assert_eq!(registry.ids().await, vec!["fresh".to_string()]);
    assert_eq!(sweeper.sweep(Utc::now()).await, 0);
}

#[tokio::test]
async fn test_expired_but_unswept_session_is_not_found() {
    let agent = FakeAgent::start(true).await;
    let provisioner = Arc::new(FakeProvisioner::for_agent(&agent));
    let registry = SessionRegistry::new();
    let orch = SandboxOrchestrator::start(test_config(), provisioner, registry.clone()).unwrap();

    let mut stale = expired_session("stale");
    stale.ports = PortSet {
        control: agent.port,
        vnc: 0,
        stream: agent.port,
    };
    registry.put(stale).await;

    let err = orch.open_url("stale", "https://example.com").await.unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(_)));
    assert!(orch.list_sessions().await.is_empty());
    assert!(agent.state.opened.lock().unwrap().is_empty());
    // destroy still works against it
    assert!(orch.destroy_session("stale").await);

    orch.shutdown().await;
}

// =============================================================================
// Control calls
// =============================================================================

#[tokio::test]
async fn test_open_url_normalizes_and_forwards() {
    let agent = FakeAgent::start(true).await;
    let provisioner = Arc::new(FakeProvisioner::for_agent(&agent));
    let orch = SandboxOrchestrator::start(test_config(), provisioner, SessionRegistry::new()).unwrap();
    let session = orch.create_session(&CancellationToken::new()).await.unwrap();

    let url = orch.open_url(&session.id, "  example.com/path ").await.unwrap();

    assert_eq!(url, "https://example.com/path");
    assert_eq!(*agent.state.opened.lock().unwrap(), vec![url]);
    orch.shutdown().await;
}

#[tokio::test]
async fn test_open_url_errors() {
    let agent = FakeAgent::start(true).await;
    let provisioner = Arc::new(FakeProvisioner::for_agent(&agent));
    let orch = SandboxOrchestrator::start(test_config(), provisioner, SessionRegistry::new()).unwrap();
    let session = orch.create_session(&CancellationToken::new()).await.unwrap();

    let err = orch.open_url("missing", "https://example.com").await.unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(_)));

    let err = orch.open_url(&session.id, "ftp://example.com").await.unwrap_err();
    assert!(matches!(err, Error::InvalidUrl(_)));

    match orch.open_url(&session.id, "https://unreachable.test").await.unwrap_err() {
        Error::SandboxRequest { status, body } => {
            assert_eq!(status, 500);
            assert!(body.contains("ERR_NAME_NOT_RESOLVED"));
        }
        other => panic!("unexpected error: {:?}", other),
    }

    orch.shutdown().await;
}

#[tokio::test]
async fn test_stream_mode_control() {
    let agent = FakeAgent::start(true).await;
    let provisioner = Arc::new(FakeProvisioner::for_agent(&agent));
    let orch = SandboxOrchestrator::start(test_config(), provisioner, SessionRegistry::new()).unwrap();
    let session = orch.create_session(&CancellationToken::new()).await.unwrap();

    orch.start_stream(&session.id).await.unwrap();
    orch.stop_stream(&session.id).await.unwrap();
    assert_eq!(agent.state.start_streams.load(Ordering::SeqCst), 1);
    assert_eq!(agent.state.stop_streams.load(Ordering::SeqCst), 1);

    orch.destroy_session(&session.id).await;
    let err = orch.start_stream(&session.id).await.unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(_)));

    orch.shutdown().await;
}
