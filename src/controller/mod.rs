//! The controller reconciler.
//!
//! Runs on every controller process but only acts while its leader elector holds
//! leadership. The reconciler keeps in-memory caches of live instances, ideal
//! states and current states, refreshed by store watches, and on any relevant
//! change runs one serialized reconcile pass: compute the best possible state per
//! partition over the live node set, emit one-hop transition messages along the
//! state model's legal paths, and publish the resulting external views.

pub mod leader;

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::metadata::{paths, ClusterData};
use crate::model::{CurrentState, ExternalView, IdealState, LiveInstance, Message, MessageStatus, StateModelDef};
use crate::store::{EventKind, StoreEvent};

pub use leader::{LeaderElector, LeaderState};

const METRIC_RECONCILE_PASSES: &str = "stator_reconcile_passes";
const METRIC_MESSAGES_EMITTED: &str = "stator_messages_emitted";

/// Transition messages outstanding per (instance, resource, partition), mapped to
/// the state they are driving toward.
type Outstanding = HashMap<(String, String, String), String>;

/// The cluster reconciler.
pub struct Reconciler {
    /// The typed metadata layer over the coordination store.
    data: ClusterData,
    /// The election state of this controller's leader elector.
    leader_rx: watch::Receiver<LeaderState>,
    /// Store subscriptions, held only while leading.
    watches: Option<Watches>,

    /// Live instances by id.
    live: BTreeMap<String, LiveInstance>,
    /// Ideal states by resource.
    ideal: BTreeMap<String, IdealState>,
    /// Current states by (instance, resource).
    current: BTreeMap<(String, String), CurrentState>,
    /// State model definitions by name, loaded lazily per leadership term.
    models: HashMap<String, StateModelDef>,

    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

struct Watches {
    live_rx: mpsc::UnboundedReceiver<StoreEvent>,
    ideal_rx: mpsc::UnboundedReceiver<StoreEvent>,
    instances_rx: mpsc::UnboundedReceiver<StoreEvent>,
}

enum Input {
    LeaderChange,
    Event(StoreEvent),
    Shutdown,
}

impl Reconciler {
    /// Create a new instance.
    pub fn new(data: ClusterData, leader_rx: watch::Receiver<LeaderState>, shutdown_tx: broadcast::Sender<()>) -> Self {
        metrics::register_counter!(METRIC_RECONCILE_PASSES, metrics::Unit::Count, "reconcile passes executed by this controller");
        metrics::register_counter!(METRIC_MESSAGES_EMITTED, metrics::Unit::Count, "transition messages emitted by this controller");
        Self {
            data,
            leader_rx,
            watches: None,
            live: Default::default(),
            ideal: Default::default(),
            current: Default::default(),
            models: Default::default(),
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!(cluster = %self.data.cluster(), "reconciler started");
        loop {
            let input = if let Some(watches) = self.watches.as_mut() {
                tokio::select! {
                    _ = self.leader_rx.changed() => Input::LeaderChange,
                    Some(event) = watches.live_rx.recv() => Input::Event(event),
                    Some(event) = watches.ideal_rx.recv() => Input::Event(event),
                    Some(event) = watches.instances_rx.recv() => Input::Event(event),
                    _ = self.shutdown_rx.next() => Input::Shutdown,
                }
            } else {
                tokio::select! {
                    _ = self.leader_rx.changed() => Input::LeaderChange,
                    _ = self.shutdown_rx.next() => Input::Shutdown,
                }
            };
            match input {
                Input::LeaderChange => self.handle_leader_change().await?,
                Input::Event(event) => {
                    self.apply_event(event);
                    self.drain_events();
                    self.reconcile().await?;
                }
                Input::Shutdown => break,
            }
        }
        tracing::debug!(cluster = %self.data.cluster(), "reconciler shutdown");
        Ok(())
    }

    /// React to an election state change, arming or dropping watches.
    async fn handle_leader_change(&mut self) -> Result<()> {
        let leading = *self.leader_rx.borrow() == LeaderState::Leading;
        match (leading, self.watches.is_some()) {
            (true, false) => {
                tracing::info!(cluster = %self.data.cluster(), "assuming control of cluster");
                self.arm_watches().await?;
                self.reconcile().await?;
            }
            (false, true) => {
                tracing::info!(cluster = %self.data.cluster(), "ceding control of cluster");
                self.watches = None;
                self.live.clear();
                self.ideal.clear();
                self.current.clear();
                self.models.clear();
            }
            _ => {}
        }
        Ok(())
    }

    /// Subscribe to the cluster's metadata subtrees and rebuild all caches from a
    /// fresh full read.
    ///
    /// No continuity is assumed across leadership changes: subscriptions are
    /// created before the read so nothing committed afterwards can be missed.
    async fn arm_watches(&mut self) -> Result<()> {
        let cluster = self.data.cluster().to_string();
        let store = self.data.store();
        let watches = Watches {
            live_rx: store.subscribe(&paths::live_instances(&cluster)),
            ideal_rx: store.subscribe(&paths::ideal_states(&cluster)),
            instances_rx: store.subscribe(&paths::instances(&cluster)),
        };
        self.watches = Some(watches);
        self.models.clear();
        self.live = self.data.live_instances().await?.into_iter().map(|live| (live.id.clone(), live)).collect();
        self.ideal = self.data.ideal_states().await?.into_iter().map(|ideal| (ideal.resource.clone(), ideal)).collect();
        self.current = Default::default();
        for instance in self.data.instances().await? {
            for current in self.data.current_states_of(&instance).await? {
                self.current.insert((instance.clone(), current.resource.clone()), current);
            }
        }
        self.drain_events();
        Ok(())
    }

    /// Apply all already-queued events so rapid triggers coalesce into one pass.
    fn drain_events(&mut self) {
        let mut pending = Vec::new();
        if let Some(watches) = self.watches.as_mut() {
            while let Ok(event) = watches.live_rx.try_recv() {
                pending.push(event);
            }
            while let Ok(event) = watches.ideal_rx.try_recv() {
                pending.push(event);
            }
            while let Ok(event) = watches.instances_rx.try_recv() {
                pending.push(event);
            }
        }
        for event in pending {
            self.apply_event(event);
        }
    }

    /// Fold one store event into the caches.
    fn apply_event(&mut self, event: StoreEvent) {
        let cluster = self.data.cluster().to_string();
        if let Some(id) = paths::child_of(&paths::live_instances(&cluster), &event.path) {
            match (&event.kind, &event.record) {
                (EventKind::Removed, _) => {
                    tracing::info!(instance = %id, "live instance lost");
                    self.live.remove(id);
                }
                (_, Some(record)) => {
                    self.live.insert(id.to_string(), LiveInstance::from_record(record));
                }
                _ => {}
            }
            return;
        }
        if let Some(resource) = paths::child_of(&paths::ideal_states(&cluster), &event.path) {
            match (&event.kind, &event.record) {
                (EventKind::Removed, _) => {
                    self.ideal.remove(resource);
                }
                (_, Some(record)) => match IdealState::from_record(record) {
                    Ok(ideal) => {
                        self.ideal.insert(resource.to_string(), ideal);
                    }
                    Err(err) => tracing::error!(error = ?err, %resource, "malformed ideal state record"),
                },
                _ => {}
            }
            return;
        }
        if let Some((instance, kind, child)) = paths::parse_instance_path(&cluster, &event.path) {
            if kind == "CURRENTSTATE" {
                match (&event.kind, &event.record) {
                    (EventKind::Removed, _) => {
                        self.current.remove(&(instance.to_string(), child.to_string()));
                    }
                    (_, Some(record)) => {
                        self.current.insert((instance.to_string(), child.to_string()), CurrentState::from_record(instance, record));
                    }
                    _ => {}
                }
            }
            // Message queue changes carry no cache state but still trigger a pass.
        }
    }

    /// One reconcile pass over every resource.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn reconcile(&mut self) -> Result<()> {
        metrics::increment_counter!(METRIC_RECONCILE_PASSES);
        let mut outstanding = self.load_outstanding_messages().await?;
        let resources: Vec<String> = self.ideal.keys().cloned().collect();
        for resource in resources {
            self.reconcile_resource(&resource, &mut outstanding).await?;
        }
        self.retire_orphaned_states(&mut outstanding).await?;
        self.publish_external_views().await?;
        Ok(())
    }

    /// Read all pending messages, abandoning those addressed to dead instances and
    /// sweeping completed ones, and index the remainder.
    async fn load_outstanding_messages(&mut self) -> Result<Outstanding> {
        let mut outstanding = Outstanding::new();
        for instance in self.data.instances().await? {
            for message in self.data.messages_for(&instance).await? {
                if !self.live.contains_key(&instance) {
                    tracing::warn!(%instance, message = %message.id, "abandoning message addressed to dead instance");
                    self.data.remove_message(&instance, &message.id).await?;
                    continue;
                }
                if message.status == MessageStatus::Completed {
                    self.data.remove_message(&instance, &message.id).await?;
                    continue;
                }
                // NEW, READ and ERROR all block the (instance, partition) slot;
                // errored messages stall convergence visibly until cleared.
                outstanding.insert((instance.clone(), message.resource.clone(), message.partition.clone()), message.to_state.clone());
            }
        }
        Ok(outstanding)
    }

    async fn reconcile_resource(&mut self, resource: &str, outstanding: &mut Outstanding) -> Result<()> {
        let ideal = match self.ideal.get(resource) {
            Some(ideal) => ideal.clone(),
            None => return Ok(()),
        };
        let model = match self.model(&ideal.state_model).await? {
            Some(model) => model,
            None => {
                tracing::error!(%resource, model = %ideal.state_model, "resource names an unknown state model");
                return Ok(());
            }
        };
        let retire_target = model.terminal_state().unwrap_or_else(|| model.initial_state()).to_string();
        for (partition, assigned) in &ideal.assignment {
            // Best possible state: the assignment's role sequence re-ranked over
            // the live members of the preference list, so a dead primary's role
            // falls to the next live replica.
            let roles: Vec<&str> = assigned.iter().map(|(_, role)| role.as_str()).collect();
            let live_members: Vec<&str> = assigned.iter().map(|(node, _)| node.as_str()).filter(|node| self.live.contains_key(*node)).collect();
            let desired: BTreeMap<&str, &str> = live_members.into_iter().zip(roles).collect();

            for (node, role) in &desired {
                self.drive(resource, partition, node, role, &model, outstanding).await?;
            }

            // Live nodes holding this partition without an assignment are retired.
            let strays: Vec<String> = self
                .current
                .iter()
                .filter(|((instance, res), current)| {
                    res == resource && self.live.contains_key(instance) && !desired.contains_key(instance.as_str()) && current.partitions.contains_key(partition)
                })
                .map(|((instance, _), _)| instance.clone())
                .collect();
            for node in strays {
                self.drive(resource, partition, &node, &retire_target, &model, outstanding).await?;
            }
        }
        Ok(())
    }

    /// Drive resources which no longer have an ideal state out of existence.
    async fn retire_orphaned_states(&mut self, outstanding: &mut Outstanding) -> Result<()> {
        let orphans: Vec<CurrentState> = self
            .current
            .iter()
            .filter(|((instance, resource), _)| !self.ideal.contains_key(resource) && self.live.contains_key(instance))
            .map(|(_, current)| current.clone())
            .collect();
        for current in orphans {
            let model = match self.model(&current.state_model).await? {
                Some(model) => model,
                None => continue,
            };
            let target = model.terminal_state().unwrap_or_else(|| model.initial_state()).to_string();
            for partition in current.partitions.keys().cloned().collect::<Vec<_>>() {
                self.drive(&current.resource, &partition, &current.instance, &target, &model, outstanding).await?;
            }
        }
        Ok(())
    }

    /// Emit at most one transition message moving `node` one legal hop toward
    /// `target` on `partition`, honoring role caps and the one-outstanding-message
    /// rule.
    async fn drive(&self, resource: &str, partition: &str, node: &str, target: &str, model: &StateModelDef, outstanding: &mut Outstanding) -> Result<()> {
        let current = self.current_role(node, resource, partition, model);
        if current == target {
            return Ok(());
        }
        let key = (node.to_string(), resource.to_string(), partition.to_string());
        if outstanding.contains_key(&key) {
            return Ok(());
        }
        let next = match model.next_state_on_path(&current, target) {
            Some(next) => next,
            None => {
                tracing::warn!(%node, %partition, from = %current, to = %target, "no legal transition path");
                return Ok(());
            }
        };
        if let Some(bound) = model.hard_bound(&next) {
            let holders = self
                .live
                .keys()
                .filter(|live| self.current_role(live, resource, partition, model) == next)
                .count();
            let pending = outstanding
                .iter()
                .filter(|((pending_node, res, part), to_state)| {
                    res == resource && part == partition && **to_state == next && self.current_role(pending_node, resource, partition, model) != next
                })
                .count();
            if holders + pending >= bound as usize {
                // Demote-before-promote: wait for the current holder to move down.
                tracing::debug!(%node, %partition, state = %next, holders, pending, "holding promotion until capped role frees up");
                return Ok(());
            }
        }
        let message = Message::new(resource, partition, node, &current, &next, model.name());
        tracing::debug!(%node, %partition, from = %current, to = %next, "emitting transition message");
        self.data.send_message(&message).await?;
        metrics::increment_counter!(METRIC_MESSAGES_EMITTED);
        outstanding.insert(key, next);
        Ok(())
    }

    /// The node's recorded role for a partition, defaulting to the initial state.
    fn current_role(&self, node: &str, resource: &str, partition: &str, model: &StateModelDef) -> String {
        self.current
            .get(&(node.to_string(), resource.to_string()))
            .and_then(|current| current.partitions.get(partition).cloned())
            .unwrap_or_else(|| model.initial_state().to_string())
    }

    /// Rebuild the external view of every resource from live nodes' current states,
    /// writing only on change, and retire views for deleted resources.
    async fn publish_external_views(&self) -> Result<()> {
        for resource in self.ideal.keys() {
            let mut view = ExternalView::new(resource);
            for ((instance, res), current) in &self.current {
                if res != resource || !self.live.contains_key(instance) {
                    continue;
                }
                for (partition, state) in &current.partitions {
                    view.partitions.entry(partition.clone()).or_default().insert(instance.clone(), state.clone());
                }
            }
            let existing = self.data.external_view(resource).await?;
            if existing.as_ref() != Some(&view) {
                self.data.set_external_view(&view).await?;
            }
        }
        let views = self
            .data
            .store()
            .get_children(&paths::external_views(self.data.cluster()))
            .await
            .context("error listing external views")?;
        for resource in views {
            if !self.ideal.contains_key(&resource) {
                self.data.remove_external_view(&resource).await?;
            }
        }
        Ok(())
    }

    /// Fetch a state model definition, caching per leadership term.
    async fn model(&mut self, name: &str) -> Result<Option<StateModelDef>> {
        if let Some(model) = self.models.get(name) {
            return Ok(Some(model.clone()));
        }
        match self.data.state_model_def(name).await? {
            Some(model) => {
                self.models.insert(name.to_string(), model.clone());
                Ok(Some(model))
            }
            None => Ok(None),
        }
    }
}
