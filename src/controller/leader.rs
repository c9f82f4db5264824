//! Controller leader election.
//!
//! Leadership is a first-writer-wins ephemeral record at the cluster's
//! `/CONTROLLER/LEADER` path, bound to the winning controller's store session.
//! When the holder's session expires the store removes the record and every
//! standby observes the removal and contends again.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::StoreError;
use crate::metadata::{paths, ClusterData};
use crate::model::LeaderRecord;
use crate::store::{EventKind, Session, SessionState};

/// Pause before rejoining the election after a session expiry, so standbys
/// observing the vacancy contend first.
const REJOIN_BACKOFF: Duration = Duration::from_millis(50);

const METRIC_IS_LEADER: &str = "stator_is_leader";
const METRIC_LEADERSHIP_CHANGES: &str = "stator_num_leadership_changes";

/// Different states which a leader elector may be in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaderState {
    /// This controller instance is the leader.
    Leading,
    /// A different controller is currently the leader, identified by the
    /// encapsulated string.
    Following(String),
    /// The leader is unknown, or the elector is starting or stopping.
    Standby,
}

/// A leader elector contending for control of one cluster.
pub struct LeaderElector {
    data: ClusterData,
    /// The identity written into the leader record when this elector wins.
    controller_id: String,
    state_tx: watch::Sender<LeaderState>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

enum ElectionEnd {
    Shutdown,
    SessionExpired,
}

impl LeaderElector {
    /// Create a new instance along with a watch of its election state.
    pub fn new(data: ClusterData, controller_id: impl Into<String>, shutdown_tx: broadcast::Sender<()>) -> (Self, watch::Receiver<LeaderState>) {
        metrics::register_gauge!(METRIC_IS_LEADER, metrics::Unit::Count, "1 while this controller holds cluster leadership, else 0");
        metrics::register_counter!(METRIC_LEADERSHIP_CHANGES, metrics::Unit::Count, "number of times this elector has acquired leadership");
        let (state_tx, state_rx) = watch::channel(LeaderState::Standby);
        let this = Self {
            data,
            controller_id: controller_id.into(),
            state_tx,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        };
        (this, state_rx)
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        tracing::info!(controller = %self.controller_id, "leader elector started");
        loop {
            let session = self.data.store().connect().await.context("error establishing store session")?;
            match self.contend(session).await? {
                ElectionEnd::Shutdown => break,
                ElectionEnd::SessionExpired => {
                    self.publish(LeaderState::Standby);
                    tracing::warn!(controller = %self.controller_id, "leader elector session expired, rejoining election");
                    tokio::time::sleep(REJOIN_BACKOFF).await;
                    continue;
                }
            }
        }
        self.publish(LeaderState::Standby);
        tracing::debug!(controller = %self.controller_id, "leader elector shutdown");
        Ok(())
    }

    /// Contend for leadership until shutdown or session loss.
    async fn contend(&mut self, mut session: Session) -> Result<ElectionEnd> {
        let path = paths::controller_leader(self.data.cluster());
        let mut events_rx = self.data.store().subscribe(&path);
        loop {
            let record = LeaderRecord {
                leader_id: self.controller_id.clone(),
                session_id: session.id.to_string(),
            };
            match self.data.store().create_ephemeral(session.id, &path, record.to_record()).await {
                Ok(()) => {
                    metrics::increment_counter!(METRIC_LEADERSHIP_CHANGES);
                    metrics::gauge!(METRIC_IS_LEADER, 1.0);
                    tracing::info!(controller = %self.controller_id, "acquired cluster leadership");
                    self.publish(LeaderState::Leading);
                }
                Err(StoreError::NodeExists(_)) => {
                    let holder = self
                        .data
                        .store()
                        .get(&path)
                        .await
                        .context("error reading leader record")?
                        .map(|found| LeaderRecord::from_record(&found).leader_id)
                        .unwrap_or_default();
                    tracing::debug!(controller = %self.controller_id, leader = %holder, "following current leader");
                    self.publish(LeaderState::Following(holder));
                }
                Err(StoreError::SessionExpired) => return Ok(ElectionEnd::SessionExpired),
                Err(err) => return Err(err).context("error contending for leadership"),
            }

            // Hold the current state until the record changes hands or the session dies.
            loop {
                tokio::select! {
                    event = events_rx.recv() => match event {
                        Some(event) if event.kind == EventKind::Removed => {
                            if *self.state_tx.borrow() == LeaderState::Leading {
                                // Our own record was removed out from under us.
                                metrics::gauge!(METRIC_IS_LEADER, 0.0);
                                self.publish(LeaderState::Standby);
                            }
                            break;
                        }
                        Some(event) => {
                            if *self.state_tx.borrow() != LeaderState::Leading {
                                let holder = event.record.as_ref().map(|record| LeaderRecord::from_record(record).leader_id).unwrap_or_default();
                                self.publish(LeaderState::Following(holder));
                            }
                        }
                        None => return Ok(ElectionEnd::SessionExpired),
                    },
                    _ = session.state.changed() => {
                        if *session.state.borrow() == SessionState::Expired {
                            metrics::gauge!(METRIC_IS_LEADER, 0.0);
                            return Ok(ElectionEnd::SessionExpired);
                        }
                    }
                    _ = self.shutdown_rx.next() => {
                        metrics::gauge!(METRIC_IS_LEADER, 0.0);
                        let _ = self.data.store().disconnect(session.id).await;
                        return Ok(ElectionEnd::Shutdown);
                    }
                }
            }
        }
    }

    fn publish(&self, state: LeaderState) {
        let _ = self.state_tx.send(state);
    }
}
