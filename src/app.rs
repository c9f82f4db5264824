//! Application wiring and lifecycle.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::admin::Admin;
use crate::config::{Config, Role, StoreBackend};
use crate::controller::{LeaderElector, Reconciler};
use crate::metadata::ClusterData;
use crate::participant::{NoopTaskFactory, Participant, TaskRegistry};
use crate::store::{MemoryStore, Store};

/// The application object for when stator is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// Join handles of the role components spawned for this process.
    handles: Vec<(&'static str, JoinHandle<Result<()>>)>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let store = match config.store_backend {
            StoreBackend::Memory => Store::new(Arc::new(MemoryStore::new())),
        };
        let data = ClusterData::new(store, &config.cluster_name);
        Admin::new(data.clone()).add_cluster().await.context("error seeding cluster state models")?;

        let (shutdown_tx, _) = broadcast::channel(100);
        let mut handles = Vec::new();
        if matches!(config.role, Role::Controller | Role::Combined) {
            let (elector, leader_rx) = LeaderElector::new(data.clone(), config.instance_id.clone(), shutdown_tx.clone());
            handles.push(("leader elector", elector.spawn()));
            handles.push(("reconciler", Reconciler::new(data.clone(), leader_rx, shutdown_tx.clone()).spawn()));
        }
        if matches!(config.role, Role::Participant | Role::Combined) {
            let tasks = TaskRegistry::new();
            tasks.register("MasterSlave", Arc::new(NoopTaskFactory));
            handles.push(("participant executor", Participant::new(data, config.instance_id.clone(), tasks, shutdown_tx.clone()).spawn()));
        }

        Ok(Self {
            _config: config,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            handles,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("stator is shutting down");
        for (name, handle) in self.handles {
            if let Err(err) = handle.await.with_context(|| format!("error joining {} handle", name)).and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down {}", name);
            }
        }

        tracing::debug!("stator shutdown complete");
        Ok(())
    }
}
