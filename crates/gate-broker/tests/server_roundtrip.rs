//! End-to-end: blocking client against a live broker over a real Unix
//! socket, exercising the full wire protocol.

use std::sync::Arc;
use std::time::Duration;

use gate_broker::broker::LockBroker;
use gate_broker::server::{self, Listener, Shutdown};
use gate_broker::store::Store;
use gate_core::client::{AcquireOutcome, AcquireRequest, BrokerClient, HeartbeatOutcome, ReleaseOutcome};
use gate_core::config::BrokerConfig;
use gate_core::protocol::{EntryState, LockMode, OwnerToken};
use gate_core::BrokerEndpoint;
use tempfile::TempDir;

fn test_config() -> BrokerConfig {
    BrokerConfig {
        lease_ms: 60_000,
        max_hold_ms: 600_000,
        acquire_timeout_ms: 10_000,
        ..BrokerConfig::default()
    }
}

struct TestServer {
    client: BrokerClient,
    shutdown: Arc<Shutdown>,
    task: tokio::task::JoinHandle<()>,
    _dir: TempDir,
}

async fn start_server() -> TestServer {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("broker.sock");

    let store = Store::open_in_memory().unwrap();
    let broker = Arc::new(LockBroker::from_store(store, &test_config()).unwrap());
    let listener = Listener::bind_unix(&socket).unwrap();
    let shutdown = Shutdown::new();

    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            server::run(listener, broker, shutdown).await.unwrap();
        })
    };

    TestServer {
        client: BrokerClient::new(BrokerEndpoint::Unix(socket)),
        shutdown,
        task,
        _dir: dir,
    }
}

impl TestServer {
    async fn stop(self) {
        self.shutdown.trigger();
        let _ = tokio::time::timeout(Duration::from_secs(2), self.task).await;
    }
}

#[tokio::test]
async fn acquire_status_release_over_socket() {
    let server = start_server().await;
    let client = server.client.clone();

    let owner = OwnerToken::mint();
    let outcome = {
        let client = client.clone();
        let owner = owner.clone();
        tokio::task::spawn_blocking(move || {
            client.acquire(&AcquireRequest::new("/repo/a.rs", LockMode::Write, &owner))
        })
        .await
        .unwrap()
        .unwrap()
    };
    assert_eq!(outcome, AcquireOutcome::Granted);

    let snapshot = {
        let client = client.clone();
        tokio::task::spawn_blocking(move || client.status(Some("/repo/a.rs")))
            .await
            .unwrap()
            .unwrap()
    };
    let entries = &snapshot.paths["/repo/a.rs"];
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].state, EntryState::Granted);
    assert_eq!(entries[0].owner, owner);

    let heartbeat = {
        let client = client.clone();
        let owner = owner.clone();
        tokio::task::spawn_blocking(move || client.heartbeat("/repo/a.rs", &owner))
            .await
            .unwrap()
            .unwrap()
    };
    assert_eq!(heartbeat, HeartbeatOutcome::Ok);

    let release = {
        let client = client.clone();
        let owner = owner.clone();
        tokio::task::spawn_blocking(move || client.release("/repo/a.rs", &owner))
            .await
            .unwrap()
            .unwrap()
    };
    assert_eq!(release, ReleaseOutcome::Released);

    let snapshot = {
        let client = client.clone();
        tokio::task::spawn_blocking(move || client.status(None))
            .await
            .unwrap()
            .unwrap()
    };
    assert!(snapshot.paths.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn contended_acquire_times_out_over_socket() {
    let server = start_server().await;
    let client = server.client.clone();

    let holder = OwnerToken::mint();
    {
        let client = client.clone();
        let holder = holder.clone();
        tokio::task::spawn_blocking(move || {
            client.acquire(&AcquireRequest::new("/f", LockMode::Write, &holder))
        })
        .await
        .unwrap()
        .unwrap();
    }

    let outcome = {
        let client = client.clone();
        let other = OwnerToken::mint();
        tokio::task::spawn_blocking(move || {
            client.acquire(&AcquireRequest::new("/f", LockMode::Read, &other).timeout_ms(300))
        })
        .await
        .unwrap()
        .unwrap()
    };
    assert_eq!(outcome, AcquireOutcome::Timeout);

    server.stop().await;
}

#[tokio::test]
async fn release_of_unheld_lock_reports_not_held() {
    let server = start_server().await;
    let client = server.client.clone();

    let outcome = {
        let client = client.clone();
        tokio::task::spawn_blocking(move || client.release("/nowhere", &OwnerToken::mint()))
            .await
            .unwrap()
            .unwrap()
    };
    assert_eq!(outcome, ReleaseOutcome::NotHeld);

    server.stop().await;
}
