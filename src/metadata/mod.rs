//! Typed accessors over the coordination store.
//!
//! `ClusterData` is the single place that knows how metadata types map onto store
//! paths and records. Ownership is by convention, single writer per field: a
//! participant writes only its own current state, the controller writes messages
//! and external views, admin/controller write ideal states.

pub mod paths;

use anyhow::{Context, Result};

use crate::error::StoreError;
use crate::model::{CurrentState, ExternalView, IdealState, InstanceConfig, LiveInstance, Message, MessageStatus, StateModelDef};
use crate::store::{Session, Store};

/// A typed, cluster-scoped view over the store.
#[derive(Clone)]
pub struct ClusterData {
    store: Store,
    cluster: String,
}

impl ClusterData {
    /// Create a new accessor scoped to the given cluster.
    pub fn new(store: Store, cluster: impl Into<String>) -> Self {
        Self { store, cluster: cluster.into() }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn instance_configs(&self) -> Result<Vec<InstanceConfig>> {
        let parent = paths::participant_configs(&self.cluster);
        let mut configs = Vec::new();
        for id in self.store.get_children(&parent).await.context("error listing instance configs")? {
            if let Some(record) = self.store.get(&paths::participant_config(&self.cluster, &id)).await.context("error fetching instance config")? {
                configs.push(InstanceConfig::from_record(&record)?);
            }
        }
        Ok(configs)
    }

    pub async fn add_instance_config(&self, config: &InstanceConfig) -> Result<()> {
        self.store
            .create(&paths::participant_config(&self.cluster, &config.id), config.to_record())
            .await
            .context("error creating instance config")
    }

    pub async fn live_instances(&self) -> Result<Vec<LiveInstance>> {
        let parent = paths::live_instances(&self.cluster);
        let mut live = Vec::new();
        for id in self.store.get_children(&parent).await.context("error listing live instances")? {
            if let Some(record) = self.store.get(&paths::live_instance(&self.cluster, &id)).await.context("error fetching live instance")? {
                live.push(LiveInstance::from_record(&record));
            }
        }
        Ok(live)
    }

    /// Register the node's ephemeral liveness record under the given session.
    pub async fn register_live_instance(&self, session: &Session, live: &LiveInstance) -> Result<()> {
        self.store
            .create_ephemeral(session.id, &paths::live_instance(&self.cluster, &live.id), live.to_record())
            .await
            .context("error registering live instance")
    }

    pub async fn ideal_state(&self, resource: &str) -> Result<Option<IdealState>> {
        self.store
            .get(&paths::ideal_state(&self.cluster, resource))
            .await
            .context("error fetching ideal state")?
            .map(|record| IdealState::from_record(&record))
            .transpose()
    }

    pub async fn ideal_states(&self) -> Result<Vec<IdealState>> {
        let parent = paths::ideal_states(&self.cluster);
        let mut states = Vec::new();
        for resource in self.store.get_children(&parent).await.context("error listing ideal states")? {
            if let Some(ideal) = self.ideal_state(&resource).await? {
                states.push(ideal);
            }
        }
        Ok(states)
    }

    /// Replace the ideal state for a resource wholesale.
    pub async fn set_ideal_state(&self, ideal: &IdealState) -> Result<()> {
        self.store
            .set(&paths::ideal_state(&self.cluster, &ideal.resource), ideal.to_record(), None)
            .await
            .context("error writing ideal state")?;
        Ok(())
    }

    pub async fn state_model_def(&self, name: &str) -> Result<Option<StateModelDef>> {
        self.store
            .get(&paths::state_model_def(&self.cluster, name))
            .await
            .context("error fetching state model def")?
            .map(|record| StateModelDef::from_record(&record))
            .transpose()
    }

    pub async fn add_state_model_def(&self, def: &StateModelDef) -> Result<()> {
        match self.store.create(&paths::state_model_def(&self.cluster, def.name()), def.to_record()).await {
            Ok(()) | Err(StoreError::NodeExists(_)) => Ok(()),
            Err(err) => Err(err).context("error writing state model def"),
        }
    }

    /// All instance ids which have ever had per-instance structures created.
    pub async fn instances(&self) -> Result<Vec<String>> {
        self.store.get_children(&paths::instances(&self.cluster)).await.context("error listing instances")
    }

    pub async fn current_state(&self, instance: &str, resource: &str) -> Result<Option<CurrentState>> {
        Ok(self
            .store
            .get(&paths::current_state(&self.cluster, instance, resource))
            .await
            .context("error fetching current state")?
            .map(|record| CurrentState::from_record(instance, &record)))
    }

    pub async fn current_states_of(&self, instance: &str) -> Result<Vec<CurrentState>> {
        let parent = paths::current_states(&self.cluster, instance);
        let mut states = Vec::new();
        for resource in self.store.get_children(&parent).await.context("error listing current states")? {
            if let Some(current) = self.current_state(instance, &resource).await? {
                states.push(current);
            }
        }
        Ok(states)
    }

    /// Persist a node's current state; only the owning node calls this.
    pub async fn save_current_state(&self, current: &CurrentState) -> Result<()> {
        let path = paths::current_state(&self.cluster, &current.instance, &current.resource);
        let record = current.to_record();
        self.store
            .update(&path, |stored| {
                *stored = record.clone();
            })
            .await
            .context("error writing current state")?;
        Ok(())
    }

    pub async fn messages_for(&self, instance: &str) -> Result<Vec<Message>> {
        let parent = paths::messages(&self.cluster, instance);
        let mut messages = Vec::new();
        for id in self.store.get_children(&parent).await.context("error listing messages")? {
            if let Some(record) = self.store.get(&paths::message(&self.cluster, instance, &id)).await.context("error fetching message")? {
                messages.push(Message::from_record(&record)?);
            }
        }
        Ok(messages)
    }

    /// Enqueue a transition message for its target instance; only the controller calls this.
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        self.store
            .create(&paths::message(&self.cluster, &message.target_instance, &message.id), message.to_record())
            .await
            .context("error sending message")
    }

    pub async fn update_message_status(&self, instance: &str, id: &str, status: MessageStatus) -> Result<()> {
        let path = paths::message(&self.cluster, instance, id);
        if self.store.get(&path).await.context("error fetching message for status update")?.is_none() {
            // Message was removed underneath us; nothing to update.
            return Ok(());
        }
        self.store
            .update(&path, |record| {
                record.set_simple("MSG_STATE", status.as_str());
            })
            .await
            .context("error updating message status")?;
        Ok(())
    }

    pub async fn remove_message(&self, instance: &str, id: &str) -> Result<()> {
        self.store.remove(&paths::message(&self.cluster, instance, id)).await.context("error removing message")
    }

    pub async fn external_view(&self, resource: &str) -> Result<Option<ExternalView>> {
        Ok(self
            .store
            .get(&paths::external_view(&self.cluster, resource))
            .await
            .context("error fetching external view")?
            .map(|record| ExternalView::from_record(&record)))
    }

    /// Publish the external view for a resource; only the controller calls this.
    pub async fn set_external_view(&self, view: &ExternalView) -> Result<()> {
        let record = view.to_record();
        self.store
            .update(&paths::external_view(&self.cluster, &view.resource), |stored| {
                *stored = record.clone();
            })
            .await
            .context("error writing external view")?;
        Ok(())
    }

    pub async fn remove_external_view(&self, resource: &str) -> Result<()> {
        self.store
            .remove(&paths::external_view(&self.cluster, resource))
            .await
            .context("error removing external view")
    }
}
