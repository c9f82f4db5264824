//! Stator: a cluster reconciliation engine for partitioned, replicated stateful services.
//!
//! Given a set of logical resources split into partitions and a dynamic set of worker
//! nodes, Stator computes a target partition placement (the ideal state), drives each
//! node through a declared state machine to reach that placement, and continuously
//! reconciles actual placement with target placement as nodes join, leave, or fail.
//!
//! All cross-node coordination goes through a versioned, watchable metadata store
//! (see [`store`]); there is no direct node-to-node RPC.

pub mod admin;
pub mod app;
pub mod config;
#[cfg(test)]
mod config_test;
pub mod controller;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod metadata;
pub mod model;
pub mod participant;
pub mod placement;
pub mod record;
pub mod store;
pub mod verify;
