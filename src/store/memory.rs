//! The in-process store backend.
//!
//! A complete implementation of the store contract — versioned writes, subtree
//! subscriptions, sessions and ephemerals — backed by process memory. Selected at
//! configuration time for embedded clusters and tests; a networked backend plugs in
//! behind the same trait.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::record::Record;
use crate::store::{EventKind, MetaStore, Session, SessionId, SessionState, StoreEvent};

/// An in-memory coordination store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    nodes: BTreeMap<String, NodeEntry>,
    sessions: HashMap<SessionId, SessionEntry>,
    subscribers: Vec<Subscriber>,
}

struct NodeEntry {
    record: Record,
    /// The owning session for ephemeral nodes.
    owner: Option<SessionId>,
}

struct SessionEntry {
    state_tx: watch::Sender<SessionState>,
}

struct Subscriber {
    prefix: String,
    tx: mpsc::UnboundedSender<StoreEvent>,
}

impl MemoryStore {
    /// Create a new instance.
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn session_count(&self) -> usize {
        self.state.lock().expect("store mutex poisoned").sessions.len()
    }
}

impl State {
    /// Deliver an event to every subscriber covering the path, pruning closed channels.
    ///
    /// Called with the state lock held, which is what guarantees that delivery order
    /// matches commit order per path.
    fn notify(&mut self, path: &str, kind: EventKind, record: Option<&Record>) {
        let event = StoreEvent {
            path: path.to_string(),
            kind,
            record: record.cloned(),
        };
        self.subscribers.retain(|sub| {
            if !covers(&sub.prefix, path) {
                return true;
            }
            sub.tx.send(event.clone()).is_ok()
        });
    }

    /// Drop every ephemeral node owned by the given session, emitting removal events.
    fn drop_ephemerals(&mut self, session: SessionId) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, entry)| entry.owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            self.nodes.remove(&path);
            self.notify(&path, EventKind::Removed, None);
        }
    }

    /// Tear down a session, removing its ephemerals and pruning its entry.
    /// Returns false if it was already gone.
    fn close_session(&mut self, session: SessionId) -> bool {
        let entry = match self.sessions.remove(&session) {
            Some(entry) => entry,
            None => return false,
        };
        let _ = entry.state_tx.send(SessionState::Expired);
        self.drop_ephemerals(session);
        true
    }
}

impl MetaStore for MemoryStore {
    fn connect(&self) -> StoreResult<Session> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        let id = Uuid::new_v4();
        let (state_tx, state_rx) = watch::channel(SessionState::Connected);
        state.sessions.insert(id, SessionEntry { state_tx });
        tracing::debug!(session = %id, "store session established");
        Ok(Session { id, state: state_rx })
    }

    fn disconnect(&self, session: SessionId) -> StoreResult<()> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        if state.close_session(session) {
            tracing::debug!(session = %session, "store session disconnected");
        }
        Ok(())
    }

    fn expire_session(&self, session: SessionId) -> StoreResult<()> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        if state.close_session(session) {
            tracing::debug!(session = %session, "store session expired");
        }
        Ok(())
    }

    fn create(&self, path: &str, mut record: Record) -> StoreResult<()> {
        let path = normalize(path);
        let mut state = self.state.lock().expect("store mutex poisoned");
        if state.nodes.contains_key(&path) {
            return Err(StoreError::NodeExists(path));
        }
        record.version = 0;
        state.nodes.insert(path.clone(), NodeEntry { record: record.clone(), owner: None });
        state.notify(&path, EventKind::Created, Some(&record));
        Ok(())
    }

    fn create_ephemeral(&self, session: SessionId, path: &str, mut record: Record) -> StoreResult<()> {
        let path = normalize(path);
        let mut state = self.state.lock().expect("store mutex poisoned");
        if !state.sessions.contains_key(&session) {
            return Err(StoreError::SessionExpired);
        }
        if state.nodes.contains_key(&path) {
            return Err(StoreError::NodeExists(path));
        }
        record.version = 0;
        state.nodes.insert(path.clone(), NodeEntry { record: record.clone(), owner: Some(session) });
        state.notify(&path, EventKind::Created, Some(&record));
        Ok(())
    }

    fn set(&self, path: &str, mut record: Record, expected_version: Option<i64>) -> StoreResult<i64> {
        let path = normalize(path);
        let mut state = self.state.lock().expect("store mutex poisoned");
        let current_version = state.nodes.get(&path).map(|entry| entry.record.version);
        if let Some(expected) = expected_version {
            let actual = current_version.unwrap_or(-1);
            if actual != expected {
                return Err(StoreError::VersionConflict { path, expected, actual });
            }
        }
        let (version, kind) = match current_version {
            Some(version) => (version + 1, EventKind::Updated),
            None => (0, EventKind::Created),
        };
        record.version = version;
        let owner = state.nodes.get(&path).and_then(|entry| entry.owner);
        state.nodes.insert(path.clone(), NodeEntry { record: record.clone(), owner });
        state.notify(&path, kind, Some(&record));
        Ok(version)
    }

    fn update(&self, path: &str, apply: &mut dyn FnMut(&mut Record)) -> StoreResult<i64> {
        let path = normalize(path);
        let mut state = self.state.lock().expect("store mutex poisoned");
        let (mut record, owner, kind) = match state.nodes.get(&path) {
            Some(entry) => (entry.record.clone(), entry.owner, EventKind::Updated),
            None => {
                let id = path.rsplit('/').next().unwrap_or(&path).to_string();
                (Record::new(id), None, EventKind::Created)
            }
        };
        let prior_version = record.version;
        apply(&mut record);
        // The store owns the version regardless of what the closure wrote.
        record.version = prior_version + 1;
        let version = record.version;
        state.nodes.insert(path.clone(), NodeEntry { record: record.clone(), owner });
        state.notify(&path, kind, Some(&record));
        Ok(version)
    }

    fn remove(&self, path: &str) -> StoreResult<()> {
        let path = normalize(path);
        let mut state = self.state.lock().expect("store mutex poisoned");
        if state.nodes.remove(&path).is_some() {
            state.notify(&path, EventKind::Removed, None);
        }
        Ok(())
    }

    fn get(&self, path: &str) -> StoreResult<Option<Record>> {
        let path = normalize(path);
        let state = self.state.lock().expect("store mutex poisoned");
        Ok(state.nodes.get(&path).map(|entry| entry.record.clone()))
    }

    fn get_children(&self, path: &str) -> StoreResult<Vec<String>> {
        let prefix = format!("{}/", normalize(path));
        let state = self.state.lock().expect("store mutex poisoned");
        let mut children = BTreeSet::new();
        for key in state.nodes.range(prefix.clone()..).map(|(key, _)| key) {
            let rest = match key.strip_prefix(&prefix) {
                Some(rest) => rest,
                None => break,
            };
            let child = rest.split('/').next().unwrap_or(rest);
            if !child.is_empty() {
                children.insert(child.to_string());
            }
        }
        Ok(children.into_iter().collect())
    }

    fn subscribe(&self, prefix: &str) -> mpsc::UnboundedReceiver<StoreEvent> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push(Subscriber { prefix: normalize(prefix), tx });
        rx
    }
}

/// Normalize a path to a leading-slash, no-trailing-slash form.
fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Whether a subscription prefix covers the given path.
fn covers(prefix: &str, path: &str) -> bool {
    path == prefix || path.strip_prefix(prefix).map(|rest| rest.starts_with('/')).unwrap_or(false)
}
