//! The coordination store abstraction.
//!
//! A versioned, hierarchical key-value store with subtree watch semantics and
//! ephemeral nodes tied to client sessions. This is the only shared mutable
//! resource in the system: participants write their own current states through
//! it, the controller writes messages and external views, and everything else
//! observes those writes through subscriptions.

mod memory;
#[cfg(test)]
mod memory_test;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::record::Record;

pub use memory::MemoryStore;

/// Max attempts for operations failing with `StoreError::Unavailable`.
const RETRY_ATTEMPTS: u32 = 5;
/// Base delay for the retry backoff.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(20);

/// The identity of a client session.
pub type SessionId = Uuid;

/// The lifecycle state of a client session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Expired,
}

/// A handle to an established client session.
///
/// Ephemeral nodes created under this session live exactly as long as the session
/// does; expiry is surfaced on the `state` watch so the owning component can react.
#[derive(Clone, Debug)]
pub struct Session {
    pub id: SessionId,
    pub state: watch::Receiver<SessionState>,
}

/// The kind of change observed at a watched path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Removed,
}

/// A change notification delivered to a subtree subscriber.
#[derive(Clone, Debug)]
pub struct StoreEvent {
    pub path: String,
    pub kind: EventKind,
    /// The record as committed, absent for removals.
    pub record: Option<Record>,
}

/// The contract every coordination store backend implements.
///
/// Backend calls are expected to be short; the async `Store` handle owns the
/// retry/backoff policy for transient failures. Subscriptions are persistent:
/// after any committed write, a subscriber of a covering prefix observes it, in
/// the store's write order per path.
pub trait MetaStore: Send + Sync + 'static {
    /// Establish a new client session.
    fn connect(&self) -> StoreResult<Session>;

    /// Close the given session, removing all ephemerals it owns. Idempotent.
    fn disconnect(&self, session: SessionId) -> StoreResult<()>;

    /// Forcibly expire the given session, as a lost backend connection would.
    fn expire_session(&self, session: SessionId) -> StoreResult<()>;

    /// Create a node at `path`; fails with `NodeExists` if the path is taken.
    fn create(&self, path: &str, record: Record) -> StoreResult<()>;

    /// Create an ephemeral node owned by `session`.
    fn create_ephemeral(&self, session: SessionId, path: &str, record: Record) -> StoreResult<()>;

    /// Write the record at `path`, creating it if absent.
    ///
    /// When `expected_version` is given the write only commits if the current
    /// version matches, failing with `VersionConflict` otherwise. Returns the
    /// committed version.
    fn set(&self, path: &str, record: Record, expected_version: Option<i64>) -> StoreResult<i64>;

    /// Atomically read-modify-write the record at `path`.
    fn update(&self, path: &str, apply: &mut dyn FnMut(&mut Record)) -> StoreResult<i64>;

    /// Remove the node at `path`; removing an absent node is a no-op.
    fn remove(&self, path: &str) -> StoreResult<()>;

    /// Fetch the record at `path`.
    fn get(&self, path: &str) -> StoreResult<Option<Record>>;

    /// List the child ids directly under `path`.
    fn get_children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Subscribe to all changes at or under `prefix`.
    fn subscribe(&self, prefix: &str) -> mpsc::UnboundedReceiver<StoreEvent>;
}

/// A cloneable handle over a store backend.
///
/// The handle owns the retry policy for transient backend failures: operations
/// failing with `Unavailable` are retried with jittered exponential backoff so
/// that a write the caller believes succeeded is never silently dropped. The
/// backoff yields to the runtime, so a flaky backend never stalls the caller's
/// sibling tasks.
#[derive(Clone)]
pub struct Store {
    inner: Arc<dyn MetaStore>,
}

impl Store {
    /// Create a new handle over the given backend.
    pub fn new(inner: Arc<dyn MetaStore>) -> Self {
        Self { inner }
    }

    pub async fn connect(&self) -> StoreResult<Session> {
        self.with_retry(|store| store.connect()).await
    }

    pub async fn disconnect(&self, session: SessionId) -> StoreResult<()> {
        self.with_retry(|store| store.disconnect(session)).await
    }

    pub fn expire_session(&self, session: SessionId) -> StoreResult<()> {
        self.inner.expire_session(session)
    }

    pub async fn create(&self, path: &str, record: Record) -> StoreResult<()> {
        self.with_retry(|store| store.create(path, record.clone())).await
    }

    pub async fn create_ephemeral(&self, session: SessionId, path: &str, record: Record) -> StoreResult<()> {
        self.with_retry(|store| store.create_ephemeral(session, path, record.clone())).await
    }

    pub async fn set(&self, path: &str, record: Record, expected_version: Option<i64>) -> StoreResult<i64> {
        self.with_retry(|store| store.set(path, record.clone(), expected_version)).await
    }

    pub async fn update(&self, path: &str, mut apply: impl FnMut(&mut Record)) -> StoreResult<i64> {
        self.with_retry(|store| store.update(path, &mut apply)).await
    }

    pub async fn remove(&self, path: &str) -> StoreResult<()> {
        self.with_retry(|store| store.remove(path)).await
    }

    pub async fn get(&self, path: &str) -> StoreResult<Option<Record>> {
        self.with_retry(|store| store.get(path)).await
    }

    pub async fn get_children(&self, path: &str) -> StoreResult<Vec<String>> {
        self.with_retry(|store| store.get_children(path)).await
    }

    pub fn subscribe(&self, prefix: &str) -> mpsc::UnboundedReceiver<StoreEvent> {
        self.inner.subscribe(prefix)
    }

    async fn with_retry<T>(&self, mut op: impl FnMut(&dyn MetaStore) -> StoreResult<T>) -> StoreResult<T> {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 0;
        loop {
            match op(self.inner.as_ref()) {
                Err(StoreError::Unavailable(reason)) if attempt + 1 < RETRY_ATTEMPTS => {
                    attempt += 1;
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..20));
                    tracing::warn!(%reason, attempt, "store unavailable, backing off before retry");
                    tokio::time::sleep(delay + jitter).await;
                    delay *= 2;
                }
                res => return res,
            }
        }
    }
}
