//! Cluster administration operations.
//!
//! Thin write-side helpers over the metadata layer. The controller and the
//! participants never call these; they react to their effects through the
//! normal watch path.

use anyhow::{bail, Context, Result};

use crate::metadata::ClusterData;
use crate::model::{self, IdealState, InstanceConfig, StateModelDef};
use crate::placement;

/// Administrative operations on one cluster.
pub struct Admin {
    data: ClusterData,
}

impl Admin {
    pub fn new(data: ClusterData) -> Self {
        Self { data }
    }

    /// Seed the cluster with the built-in state models. Idempotent.
    pub async fn add_cluster(&self) -> Result<()> {
        self.data.add_state_model_def(&StateModelDef::master_slave()).await
    }

    /// Register a worker node with the cluster.
    pub async fn add_instance(&self, config: &InstanceConfig) -> Result<()> {
        self.data.add_instance_config(config).await
    }

    /// Create a resource split into a fixed number of partitions.
    ///
    /// The partition count is immutable once created; the resource carries no
    /// assignment until the first rebalance.
    pub async fn add_resource(&self, resource: &str, partitions: u32, state_model: &str) -> Result<()> {
        if self.data.state_model_def(state_model).await?.is_none() {
            bail!("unknown state model '{}'", state_model);
        }
        if self.data.ideal_state(resource).await?.is_some() {
            bail!("resource '{}' already exists", resource);
        }
        let ideal = IdealState {
            resource: resource.to_string(),
            partitions,
            replicas: 0,
            state_model: state_model.to_string(),
            assignment: Default::default(),
        };
        self.data.set_ideal_state(&ideal).await
    }

    /// Recompute the resource's target assignment over the currently registered,
    /// enabled instances and replace the ideal state wholesale.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn rebalance(&self, resource: &str, replicas: u32) -> Result<()> {
        let mut ideal = self.data.ideal_state(resource).await?.with_context(|| format!("unknown resource '{}'", resource))?;
        let model = self
            .data
            .state_model_def(&ideal.state_model).await?
            .with_context(|| format!("unknown state model '{}' on resource '{}'", ideal.state_model, resource))?;
        let nodes: Vec<String> = self.data.instance_configs().await?.into_iter().filter(|config| config.enabled).map(|config| config.id).collect();
        let roles = model.roles();
        let assignment = placement::assign(&nodes, ideal.partitions, replicas, &roles);
        ideal.replicas = replicas;
        ideal.assignment = assignment
            .into_iter()
            .enumerate()
            .map(|(index, assigned)| (model::partition_name(resource, index as u32), assigned))
            .collect();
        self.data.set_ideal_state(&ideal).await
    }

    /// Drop a resource, removing its target assignment.
    ///
    /// The controller observes the removal and retires the external view.
    pub async fn drop_resource(&self, resource: &str) -> Result<()> {
        self.data
            .store()
            .remove(&crate::metadata::paths::ideal_state(self.data.cluster(), resource))
            .await
            .context("error removing ideal state")
    }
}
