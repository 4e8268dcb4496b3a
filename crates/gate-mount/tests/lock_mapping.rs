//! Lock-plan semantics against a live broker.
//!
//! The proxy turns every multi-path operation into an ordered key set via
//! `write_lock_keys`; these tests assert the shape of those plans and drive
//! the headline property end-to-end over a real Unix socket: two concurrent
//! cross-direction renames over the same directories complete without
//! deadlock because both acquire in the same total order.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gate_broker::broker::LockBroker;
use gate_broker::server::{self, Listener, Shutdown};
use gate_broker::store::Store;
use gate_core::client::{AcquireOutcome, AcquireRequest, BrokerClient};
use gate_core::config::BrokerConfig;
use gate_core::protocol::{LockMode, OwnerToken};
use gate_core::BrokerEndpoint;
use gate_mount::fs::{link_lock_paths, parent_child_lock_paths, rename_lock_paths, write_lock_keys};
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

#[test]
fn every_mutation_plan_covers_parent_and_node() {
    let root = Path::new("/repo");

    // mkdir/unlink style: the parent fences sibling-directory races.
    let keys = write_lock_keys(
        root,
        &parent_child_lock_paths(Path::new("src"), Path::new("src/new.rs")),
    );
    assert_eq!(
        keys,
        vec!["/repo/src".to_string(), "/repo/src/new.rs".to_string()]
    );

    // rename: both parents and both endpoints, lexicographic.
    let keys = write_lock_keys(
        root,
        &rename_lock_paths(
            Path::new("a"),
            Path::new("a/x"),
            Path::new("b"),
            Path::new("b/y"),
        ),
    );
    assert_eq!(
        keys,
        vec![
            "/repo/a".to_string(),
            "/repo/a/x".to_string(),
            "/repo/b".to_string(),
            "/repo/b/y".to_string()
        ]
    );

    // link carries the same four-path shape as rename, source parent
    // included.
    let keys = write_lock_keys(
        root,
        &link_lock_paths(Path::new("a/x"), Path::new("b"), Path::new("b/y")),
    );
    assert_eq!(
        keys,
        vec![
            "/repo/a".to_string(),
            "/repo/a/x".to_string(),
            "/repo/b".to_string(),
            "/repo/b/y".to_string()
        ]
    );
}

#[tokio::test]
async fn cross_renames_through_key_order_do_not_deadlock() {
    // d1/a -> d2/a racing d2/b -> d1/b touches the same two directories in
    // opposite directions. Unordered acquisition interleaves AB/BA and one
    // side would time out; the shared total order lets both complete.
    let server = start_server().await;
    let root = Path::new("/repo");

    let plan_forward = write_lock_keys(
        root,
        &rename_lock_paths(
            Path::new("d1"),
            Path::new("d1/a"),
            Path::new("d2"),
            Path::new("d2/a"),
        ),
    );
    let plan_backward = write_lock_keys(
        root,
        &rename_lock_paths(
            Path::new("d2"),
            Path::new("d2/b"),
            Path::new("d1"),
            Path::new("d1/b"),
        ),
    );

    let mut tasks = Vec::new();
    for plan in [plan_forward, plan_backward] {
        let client = server.client.clone();
        tasks.push(tokio::task::spawn_blocking(move || {
            let owner = OwnerToken::mint();
            for key in &plan {
                let outcome = client
                    .acquire(
                        &AcquireRequest::new(key.clone(), LockMode::Write, &owner)
                            .timeout_ms(5_000),
                    )
                    .unwrap();
                assert_eq!(outcome, AcquireOutcome::Granted, "timed out on {key}");
            }
            for key in plan.iter().rev() {
                client.release(key, &owner).unwrap();
            }
        }));
    }
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(10), task)
            .await
            .expect("rename task wedged")
            .unwrap();
    }

    let snapshot = {
        let client = server.client.clone();
        tokio::task::spawn_blocking(move || client.status(None))
            .await
            .unwrap()
            .unwrap()
    };
    assert!(snapshot.paths.is_empty());

    server.stop().await;
}
