//! Convergence verification.
//!
//! Read-only helpers for operators and tests: poll the external views against
//! the best possible state derivable from the ideal states and the live node
//! set. Never part of the write path.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use anyhow::{bail, Result};

use crate::metadata::ClusterData;

/// Whether every resource's external view matches its best possible state.
pub async fn converged(data: &ClusterData) -> Result<bool> {
    let live: BTreeSet<String> = data.live_instances().await?.into_iter().map(|live| live.id).collect();
    for ideal in data.ideal_states().await? {
        let mut expected: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (partition, assigned) in &ideal.assignment {
            let roles: Vec<&str> = assigned.iter().map(|(_, role)| role.as_str()).collect();
            let members: Vec<&str> = assigned.iter().map(|(node, _)| node.as_str()).filter(|node| live.contains(*node)).collect();
            let entry: BTreeMap<String, String> = members.into_iter().zip(roles).map(|(node, role)| (node.to_string(), role.to_string())).collect();
            if !entry.is_empty() {
                expected.insert(partition.clone(), entry);
            }
        }
        let view = data.external_view(&ideal.resource).await?.map(|view| view.partitions).unwrap_or_default();
        let actual: BTreeMap<String, BTreeMap<String, String>> = view.into_iter().filter(|(_, states)| !states.is_empty()).collect();
        if actual != expected {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Poll until the cluster converges or the timeout elapses.
pub async fn wait_for_convergence(data: &ClusterData, timeout: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if converged(data).await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("cluster did not converge within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
