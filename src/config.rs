//! Runtime configuration.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The node's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The name of the cluster this node belongs to.
    pub cluster_name: String,
    /// The role this process plays within the cluster.
    pub role: Role,

    /// The host on which this node is reachable.
    pub instance_host: String,
    /// The port on which this node is reachable.
    pub instance_port: u16,
    /// The canonical instance id of this node.
    ///
    /// This value is derived from `instance_host` and `instance_port`.
    #[serde(skip, default)]
    pub instance_id: String,

    /// The coordination store backend to use.
    #[serde(default)]
    pub store_backend: StoreBackend,
}

/// The role a process plays within the cluster.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Contend for cluster leadership and reconcile while leading.
    Controller,
    /// Host partition replicas and execute state transitions.
    Participant,
    /// Run both roles in one process.
    Combined,
}

/// The coordination store backend selection.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// The in-process store, for embedded clusters and tests.
    Memory,
}

impl Default for StoreBackend {
    fn default() -> Self {
        Self::Memory
    }
}

impl Config {
    /// Create a new config instance.
    ///
    /// Currently this routine just parses the runtime environment and builds the
    /// application config from that. In the future, this may take into account an
    /// optional config file as well.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let mut config: Config = envy::from_env().context("error building config from env")?;
        config.instance_id = format!("{}_{}", config.instance_host, config.instance_port);
        Ok(config)
    }
}
