//! The participant state-machine executor.
//!
//! One executor runs per worker node. It holds the node's ephemeral liveness
//! record, consumes transition messages addressed to the node, validates them
//! against the resource's state model, runs the bound task on a blocking thread,
//! and publishes the node's current state back to the store.

#[cfg(test)]
mod mod_test;
pub mod task;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::StoreError;
use crate::metadata::{paths, ClusterData};
use crate::model::{CurrentState, LiveInstance, Message, MessageStatus};
use crate::store::{EventKind, Session, SessionState, StoreEvent};

pub use task::{NoopTask, NoopTaskFactory, Task, TaskFactory, TaskOutcome, TaskRegistry};

const METRIC_TRANSITIONS_COMPLETED: &str = "stator_transitions_completed";
const METRIC_TRANSITIONS_FAILED: &str = "stator_transitions_failed";
const METRIC_MESSAGES_REJECTED: &str = "stator_messages_rejected";

/// A participant executor for one worker node.
pub struct Participant {
    /// The typed metadata layer over the coordination store.
    data: ClusterData,
    /// The canonical id of the node this executor acts for.
    instance_id: String,
    /// Task factories keyed by state model name.
    tasks: TaskRegistry,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

/// Per-session executor state, discarded wholesale when the session expires.
struct SessionContext {
    session: Session,
    /// Change events under this node's message queue.
    events_rx: mpsc::UnboundedReceiver<StoreEvent>,
    done_tx: mpsc::UnboundedSender<TaskDone>,
    done_rx: mpsc::UnboundedReceiver<TaskDone>,
    /// The executing transition per (resource, partition).
    inflight: HashMap<(String, String), Inflight>,
    /// Messages waiting on an in-flight transition for the same partition.
    queued: HashMap<(String, String), VecDeque<Message>>,
}

struct Inflight {
    message_id: String,
    task: Arc<dyn Task>,
}

struct TaskDone {
    message: Message,
    outcome: TaskOutcome,
}

enum SessionEnd {
    Shutdown,
    Expired,
}

impl Participant {
    /// Create a new instance.
    pub fn new(data: ClusterData, instance_id: impl Into<String>, tasks: TaskRegistry, shutdown_tx: broadcast::Sender<()>) -> Self {
        metrics::register_counter!(METRIC_TRANSITIONS_COMPLETED, metrics::Unit::Count, "state transitions applied by this participant");
        metrics::register_counter!(METRIC_TRANSITIONS_FAILED, metrics::Unit::Count, "transition tasks which returned failure");
        metrics::register_counter!(METRIC_MESSAGES_REJECTED, metrics::Unit::Count, "transition messages rejected as illegal");
        Self {
            data,
            instance_id: instance_id.into(),
            tasks,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!(instance = %self.instance_id, "participant executor started");
        loop {
            let ctx = self.establish_session().await?;
            match self.drive_session(ctx).await? {
                SessionEnd::Shutdown => break,
                SessionEnd::Expired => {
                    tracing::warn!(instance = %self.instance_id, "store session expired, re-registering");
                    continue;
                }
            }
        }
        tracing::debug!(instance = %self.instance_id, "participant executor shutdown");
        Ok(())
    }

    /// Establish a store session and register this node's liveness record.
    ///
    /// The message subscription is created before the liveness record so that no
    /// message emitted in response to the registration can be missed.
    async fn establish_session(&self) -> Result<SessionContext> {
        let store = self.data.store();
        let session = store.connect().await.context("error establishing store session")?;
        let events_rx = store.subscribe(&paths::messages(self.data.cluster(), &self.instance_id));
        let live = LiveInstance {
            id: self.instance_id.clone(),
            session_id: session.id.to_string(),
        };
        let path = paths::live_instance(self.data.cluster(), &self.instance_id);
        match store.create_ephemeral(session.id, &path, live.to_record()).await {
            Ok(()) => {}
            Err(StoreError::NodeExists(_)) => {
                // A record from a prior session of this node may linger briefly.
                store.remove(&path).await.context("error clearing stale liveness record")?;
                store.create_ephemeral(session.id, &path, live.to_record()).await.context("error registering live instance")?;
            }
            Err(err) => return Err(err).context("error registering live instance"),
        }
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Ok(SessionContext {
            session,
            events_rx,
            done_tx,
            done_rx,
            inflight: Default::default(),
            queued: Default::default(),
        })
    }

    async fn drive_session(&mut self, mut ctx: SessionContext) -> Result<SessionEnd> {
        self.process_pending(&mut ctx).await?;
        loop {
            tokio::select! {
                Some(event) = ctx.events_rx.recv() => self.handle_store_event(&mut ctx, event).await?,
                Some(done) = ctx.done_rx.recv() => self.handle_task_done(&mut ctx, done).await?,
                _ = ctx.session.state.changed() => {
                    if *ctx.session.state.borrow() == SessionState::Expired {
                        self.abandon_session(&mut ctx);
                        return Ok(SessionEnd::Expired);
                    }
                }
                _ = self.shutdown_rx.next() => {
                    self.abandon_session(&mut ctx);
                    let _ = self.data.store().disconnect(ctx.session.id).await;
                    return Ok(SessionEnd::Shutdown);
                }
            }
        }
    }

    /// Cancel all in-flight work and drop queued messages for a dead session.
    fn abandon_session(&self, ctx: &mut SessionContext) {
        for (_, inflight) in ctx.inflight.drain() {
            inflight.task.cancel();
        }
        ctx.queued.clear();
    }

    /// Process every message already queued for this node, oldest first.
    async fn process_pending(&mut self, ctx: &mut SessionContext) -> Result<()> {
        let mut messages = self.data.messages_for(&self.instance_id).await?;
        messages.sort_by_key(|message| (message.created_at, message.sequence));
        for message in messages {
            self.process_message(ctx, message).await?;
        }
        Ok(())
    }

    async fn handle_store_event(&mut self, ctx: &mut SessionContext, event: StoreEvent) -> Result<()> {
        match event.kind {
            EventKind::Created => {
                if let Some(record) = &event.record {
                    match Message::from_record(record) {
                        Ok(message) => self.process_message(ctx, message).await?,
                        Err(err) => tracing::error!(error = ?err, path = %event.path, "malformed transition message"),
                    }
                }
            }
            EventKind::Removed => {
                let parent = paths::messages(self.data.cluster(), &self.instance_id);
                if let Some(id) = paths::child_of(&parent, &event.path) {
                    self.handle_message_removed(ctx, id);
                }
            }
            // Status updates written by this executor itself.
            EventKind::Updated => {}
        }
        Ok(())
    }

    /// A message was deleted out from under us, canceling its work if in flight.
    fn handle_message_removed(&self, ctx: &mut SessionContext, id: &str) {
        for inflight in ctx.inflight.values() {
            if inflight.message_id == id {
                tracing::debug!(instance = %self.instance_id, message = %id, "canceling superseded in-flight transition");
                inflight.task.cancel();
            }
        }
        for queue in ctx.queued.values_mut() {
            queue.retain(|message| message.id != id);
        }
    }

    #[tracing::instrument(level = "debug", skip(self, ctx, message), fields(message = %message.id, partition = %message.partition))]
    async fn process_message(&mut self, ctx: &mut SessionContext, message: Message) -> Result<()> {
        let key = (message.resource.clone(), message.partition.clone());
        let already_tracked = ctx.inflight.get(&key).map(|inflight| inflight.message_id == message.id).unwrap_or(false)
            || ctx.queued.get(&key).map(|queue| queue.iter().any(|queued| queued.id == message.id)).unwrap_or(false);
        if already_tracked {
            return Ok(());
        }
        match message.status {
            // Resubmissions of finished work and errored messages are inert.
            MessageStatus::Completed | MessageStatus::Error => return Ok(()),
            MessageStatus::New | MessageStatus::Read => {}
        }
        if ctx.inflight.contains_key(&key) {
            ctx.queued.entry(key).or_default().push_back(message);
            return Ok(());
        }
        self.start_transition(ctx, message).await
    }

    /// Validate a message against the state model and launch its task.
    async fn start_transition(&mut self, ctx: &mut SessionContext, message: Message) -> Result<()> {
        let model = match self.data.state_model_def(&message.state_model).await? {
            Some(model) => model,
            None => {
                tracing::error!(instance = %self.instance_id, model = %message.state_model, "transition message names an unknown state model");
                return self.reject_message(&message).await;
            }
        };
        let current = self
            .data
            .current_state(&self.instance_id, &message.resource)
            .await?
            .and_then(|state| state.partitions.get(&message.partition).cloned())
            .unwrap_or_else(|| model.initial_state().to_string());
        if current == message.to_state {
            tracing::debug!(instance = %self.instance_id, partition = %message.partition, state = %current, "discarding stale transition message");
            return self.data.remove_message(&self.instance_id, &message.id).await;
        }
        if message.from_state != current || !model.is_legal(&message.from_state, &message.to_state) {
            tracing::warn!(
                instance = %self.instance_id, partition = %message.partition,
                from = %message.from_state, to = %message.to_state, %current,
                "rejecting illegal transition message",
            );
            return self.reject_message(&message).await;
        }
        let factory = match self.tasks.get(&message.state_model) {
            Some(factory) => factory,
            None => {
                tracing::error!(instance = %self.instance_id, model = %message.state_model, "no task factory registered for state model");
                return self.reject_message(&message).await;
            }
        };
        self.data.update_message_status(&self.instance_id, &message.id, MessageStatus::Read).await?;
        let task = factory.create(&message);
        let key = (message.resource.clone(), message.partition.clone());
        ctx.inflight.insert(key, Inflight {
            message_id: message.id.clone(),
            task: task.clone(),
        });
        let done_tx = ctx.done_tx.clone();
        tokio::spawn(async move {
            let outcome = match tokio::task::spawn_blocking(move || task.run()).await {
                Ok(outcome) => outcome,
                Err(err) => TaskOutcome::Failed(format!("transition task panicked: {}", err)),
            };
            let _ = done_tx.send(TaskDone { message, outcome });
        });
        Ok(())
    }

    async fn reject_message(&self, message: &Message) -> Result<()> {
        metrics::increment_counter!(METRIC_MESSAGES_REJECTED);
        self.data.update_message_status(&self.instance_id, &message.id, MessageStatus::Error).await
    }

    async fn handle_task_done(&mut self, ctx: &mut SessionContext, done: TaskDone) -> Result<()> {
        let key = (done.message.resource.clone(), done.message.partition.clone());
        match ctx.inflight.get(&key) {
            Some(inflight) if inflight.message_id == done.message.id => {
                ctx.inflight.remove(&key);
            }
            // A completion from an abandoned session or a superseded slot.
            _ => return Ok(()),
        }
        match done.outcome {
            TaskOutcome::Completed => self.commit_transition(ctx, &done.message).await?,
            TaskOutcome::Canceled => {
                tracing::debug!(instance = %self.instance_id, message = %done.message.id, "transition canceled before completion");
            }
            TaskOutcome::Failed(reason) => {
                metrics::increment_counter!(METRIC_TRANSITIONS_FAILED);
                tracing::error!(instance = %self.instance_id, message = %done.message.id, %reason, "transition task failed");
                self.data.update_message_status(&self.instance_id, &done.message.id, MessageStatus::Error).await?;
            }
        }
        if let Some(next) = ctx.queued.get_mut(&key).and_then(|queue| queue.pop_front()) {
            self.process_message(ctx, next).await?;
        }
        Ok(())
    }

    /// Record the completed transition in this node's current state and retire the message.
    async fn commit_transition(&self, ctx: &SessionContext, message: &Message) -> Result<()> {
        let model = self.data.state_model_def(&message.state_model).await?;
        let mut current = self
            .data
            .current_state(&self.instance_id, &message.resource)
            .await?
            .unwrap_or_else(|| CurrentState::new(&self.instance_id, &message.resource, ctx.session.id.to_string(), &message.state_model));
        current.session_id = ctx.session.id.to_string();
        let terminal = model.map(|model| model.is_terminal(&message.to_state)).unwrap_or(false);
        if terminal {
            current.partitions.remove(&message.partition);
        } else {
            current.partitions.insert(message.partition.clone(), message.to_state.clone());
        }
        self.data.save_current_state(&current).await?;
        self.data.update_message_status(&self.instance_id, &message.id, MessageStatus::Completed).await?;
        self.data.remove_message(&self.instance_id, &message.id).await?;
        metrics::increment_counter!(METRIC_TRANSITIONS_COMPLETED);
        tracing::info!(
            instance = %self.instance_id, resource = %message.resource,
            partition = %message.partition, from = %message.from_state, to = %message.to_state,
            "state transition applied",
        );
        Ok(())
    }
}
