//! Test fixtures and utilities.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::admin::Admin;
use crate::metadata::ClusterData;
use crate::store::{MemoryStore, Store};

pub const CLUSTER: &str = "ESPRESSO_STORAGE";

pub fn store() -> Store {
    Store::new(Arc::new(MemoryStore::new()))
}

pub fn cluster_data(store: &Store) -> ClusterData {
    ClusterData::new(store.clone(), CLUSTER)
}

/// A fresh cluster seeded with the built-in state models.
pub async fn seeded_cluster() -> Result<ClusterData> {
    let data = cluster_data(&store());
    Admin::new(data.clone()).add_cluster().await?;
    Ok(data)
}

/// Poll `check` until it returns true or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
