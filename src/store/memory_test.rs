use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::error::{StoreError, StoreResult};
use crate::record::Record;
use crate::store::{EventKind, MemoryStore, MetaStore, Session, SessionId, SessionState, Store, StoreEvent};

fn store() -> Store {
    Store::new(Arc::new(MemoryStore::new()))
}

/// A backend which fails reads with `Unavailable` a fixed number of times before
/// recovering, for exercising the handle's retry policy.
struct FlakyStore {
    inner: MemoryStore,
    failures: AtomicUsize,
}

impl MetaStore for FlakyStore {
    fn connect(&self) -> StoreResult<Session> {
        self.inner.connect()
    }

    fn disconnect(&self, session: SessionId) -> StoreResult<()> {
        self.inner.disconnect(session)
    }

    fn expire_session(&self, session: SessionId) -> StoreResult<()> {
        self.inner.expire_session(session)
    }

    fn create(&self, path: &str, record: Record) -> StoreResult<()> {
        self.inner.create(path, record)
    }

    fn create_ephemeral(&self, session: SessionId, path: &str, record: Record) -> StoreResult<()> {
        self.inner.create_ephemeral(session, path, record)
    }

    fn set(&self, path: &str, record: Record, expected_version: Option<i64>) -> StoreResult<i64> {
        self.inner.set(path, record, expected_version)
    }

    fn update(&self, path: &str, apply: &mut dyn FnMut(&mut Record)) -> StoreResult<i64> {
        self.inner.update(path, apply)
    }

    fn remove(&self, path: &str) -> StoreResult<()> {
        self.inner.remove(path)
    }

    fn get(&self, path: &str) -> StoreResult<Option<Record>> {
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("backend restarting".to_string()));
        }
        self.inner.get(path)
    }

    fn get_children(&self, path: &str) -> StoreResult<Vec<String>> {
        self.inner.get_children(path)
    }

    fn subscribe(&self, prefix: &str) -> mpsc::UnboundedReceiver<StoreEvent> {
        self.inner.subscribe(prefix)
    }
}

#[tokio::test]
async fn create_then_get_round_trips() -> Result<()> {
    let store = store();
    let mut record = Record::new("node_a");
    record.set_simple("HOST", "localhost");

    store.create("/CLUSTER/CONFIGS/PARTICIPANT/node_a", record).await?;
    let fetched = store.get("/CLUSTER/CONFIGS/PARTICIPANT/node_a").await?.expect("record should exist after create");

    assert_eq!(fetched.simple("HOST"), Some("localhost"), "stored field should round trip");
    assert_eq!(fetched.version, 0, "freshly created record should be at version 0");
    Ok(())
}

#[tokio::test]
async fn create_fails_when_node_exists() -> Result<()> {
    let store = store();
    store.create("/CLUSTER/CONTROLLER/LEADER", Record::new("a")).await?;

    let err = store.create("/CLUSTER/CONTROLLER/LEADER", Record::new("b")).await.expect_err("second create should fail");
    assert!(matches!(err, StoreError::NodeExists(_)), "expected NodeExists, got {:?}", err);
    Ok(())
}

#[tokio::test]
async fn versioned_set_detects_conflicts() -> Result<()> {
    let store = store();
    store.create("/CLUSTER/IDEALSTATES/TestDB", Record::new("TestDB")).await?;

    let v1 = store.set("/CLUSTER/IDEALSTATES/TestDB", Record::new("TestDB"), Some(0)).await?;
    assert_eq!(v1, 1, "expected version to increment on write, got {}", v1);

    let err = store
        .set("/CLUSTER/IDEALSTATES/TestDB", Record::new("TestDB"), Some(0))
        .await
        .expect_err("stale expected version should be rejected");
    match err {
        StoreError::VersionConflict { expected, actual, .. } => {
            assert_eq!(expected, 0, "unexpected expected version, got {}", expected);
            assert_eq!(actual, 1, "unexpected actual version, got {}", actual);
        }
        other => panic!("expected VersionConflict, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn get_children_lists_direct_children_only() -> Result<()> {
    let store = store();
    store.create("/CLUSTER/INSTANCES/node_a/MESSAGES/m1", Record::new("m1")).await?;
    store.create("/CLUSTER/INSTANCES/node_a/MESSAGES/m2", Record::new("m2")).await?;
    store.create("/CLUSTER/INSTANCES/node_b/MESSAGES/m3", Record::new("m3")).await?;

    let children = store.get_children("/CLUSTER/INSTANCES/node_a/MESSAGES").await?;
    assert_eq!(children, vec!["m1".to_string(), "m2".to_string()], "unexpected children, got {:?}", children);

    let instances = store.get_children("/CLUSTER/INSTANCES").await?;
    assert_eq!(instances, vec!["node_a".to_string(), "node_b".to_string()], "unexpected instances, got {:?}", instances);
    Ok(())
}

#[tokio::test]
async fn subscription_observes_writes_in_order() -> Result<()> {
    let store = store();
    let mut events = store.subscribe("/CLUSTER/LIVEINSTANCES");

    store.create("/CLUSTER/LIVEINSTANCES/node_a", Record::new("node_a")).await?;
    store.set("/CLUSTER/LIVEINSTANCES/node_a", Record::new("node_a"), None).await?;
    store.remove("/CLUSTER/LIVEINSTANCES/node_a").await?;
    store.create("/CLUSTER/IDEALSTATES/TestDB", Record::new("TestDB")).await?;

    let first = events.recv().await.expect("expected created event");
    assert_eq!(first.kind, EventKind::Created, "unexpected event kind {:?}", first.kind);
    let second = events.recv().await.expect("expected updated event");
    assert_eq!(second.kind, EventKind::Updated, "unexpected event kind {:?}", second.kind);
    let third = events.recv().await.expect("expected removed event");
    assert_eq!(third.kind, EventKind::Removed, "unexpected event kind {:?}", third.kind);
    assert!(events.try_recv().is_err(), "event outside the subscribed subtree should not be delivered");
    Ok(())
}

#[tokio::test]
async fn session_expiry_removes_ephemerals_and_signals_owner() -> Result<()> {
    let store = store();
    let session = store.connect().await?;
    let mut events = store.subscribe("/CLUSTER/LIVEINSTANCES");
    store.create_ephemeral(session.id, "/CLUSTER/LIVEINSTANCES/node_a", Record::new("node_a")).await?;
    let _ = events.recv().await;

    store.expire_session(session.id)?;

    let event = events.recv().await.expect("expected removal event for ephemeral");
    assert_eq!(event.kind, EventKind::Removed, "unexpected event kind {:?}", event.kind);
    assert!(store.get("/CLUSTER/LIVEINSTANCES/node_a").await?.is_none(), "ephemeral should be gone after expiry");
    assert_eq!(*session.state.borrow(), SessionState::Expired, "session owner should observe expiry");

    let err = store
        .create_ephemeral(session.id, "/CLUSTER/LIVEINSTANCES/node_a", Record::new("node_a"))
        .await
        .expect_err("ephemeral create on expired session should fail");
    assert!(matches!(err, StoreError::SessionExpired), "expected SessionExpired, got {:?}", err);
    Ok(())
}

#[tokio::test]
async fn disconnect_is_idempotent() -> Result<()> {
    let store = store();
    let session = store.connect().await?;
    store.create_ephemeral(session.id, "/CLUSTER/LIVEINSTANCES/node_a", Record::new("node_a")).await?;

    store.disconnect(session.id).await?;
    store.disconnect(session.id).await?;

    assert!(store.get("/CLUSTER/LIVEINSTANCES/node_a").await?.is_none(), "ephemeral should be gone after disconnect");
    Ok(())
}

#[tokio::test]
async fn closed_sessions_are_pruned() -> Result<()> {
    let backend = Arc::new(MemoryStore::new());
    let store = Store::new(backend.clone());
    let first = store.connect().await?;
    let second = store.connect().await?;
    assert_eq!(backend.session_count(), 2, "both sessions should be tracked while open");

    store.disconnect(first.id).await?;
    store.expire_session(second.id)?;
    store.disconnect(first.id).await?;

    assert_eq!(backend.session_count(), 0, "closed sessions must not accumulate");
    Ok(())
}

#[tokio::test]
async fn update_creates_missing_node_and_increments_version() -> Result<()> {
    let store = store();

    let v0 = store
        .update("/CLUSTER/EXTERNALVIEW/TestDB", |record| {
            record.map_mut("TestDB_0").insert("node_a".into(), "MASTER".into());
        })
        .await?;
    let v1 = store
        .update("/CLUSTER/EXTERNALVIEW/TestDB", |record| {
            record.map_mut("TestDB_0").insert("node_b".into(), "SLAVE".into());
        })
        .await?;

    assert_eq!(v0, 0, "first update should create at version 0, got {}", v0);
    assert_eq!(v1, 1, "second update should increment version, got {}", v1);
    let record = store.get("/CLUSTER/EXTERNALVIEW/TestDB").await?.expect("record should exist");
    assert_eq!(record.map("TestDB_0").map(|map| map.len()), Some(2), "both updates should be visible");
    Ok(())
}

#[tokio::test]
async fn unavailable_reads_are_retried_until_the_backend_recovers() -> Result<()> {
    let backend = Arc::new(FlakyStore {
        inner: MemoryStore::new(),
        failures: AtomicUsize::new(2),
    });
    let store = Store::new(backend.clone());
    store.create("/CLUSTER/CONFIGS/PARTICIPANT/node_a", Record::new("node_a")).await?;

    let fetched = store.get("/CLUSTER/CONFIGS/PARTICIPANT/node_a").await?;

    assert!(fetched.is_some(), "read should succeed once the backend recovers");
    assert_eq!(backend.failures.load(Ordering::SeqCst), 0, "every transient failure should have been retried through");
    Ok(())
}
