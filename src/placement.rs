//! The ideal state calculator.
//!
//! A pure, deterministic function from a topology snapshot to a target assignment.
//! The construction walks a global slot ring: slot `k` lands on node `k mod N`, and
//! partition `p` takes the consecutive window of `replication_factor` slots starting
//! at `p * replication_factor`. Pure round robin over the ring keeps every node's
//! total slot count within one of every other's, and a window never repeats a node
//! as long as the replication factor is clamped to the node count. The primary of
//! each partition is the window member with the fewest primaries so far, which keeps
//! the primary role balanced within one as well.
//!
//! Recalculation after a topology change is a full re-run; minimizing partition
//! movement is a quality goal of the construction, not a guarantee.

/// Compute the target assignment for a resource.
///
/// `nodes` is the ordered candidate node list, `replicas` the number of copies in
/// addition to the primary, and `roles` the role names in priority order (first is
/// primary). Returns one ordered `(node, role)` list per partition, primary first.
pub fn assign(nodes: &[String], partitions: u32, replicas: u32, roles: &[String]) -> Vec<Vec<(String, String)>> {
    let node_count = nodes.len();
    if node_count == 0 || roles.is_empty() {
        return (0..partitions).map(|_| Vec::new()).collect();
    }
    let replication_factor = ((replicas as usize) + 1).min(node_count);
    let mut primary_counts = vec![0usize; node_count];
    let mut assignment = Vec::with_capacity(partitions as usize);

    for partition in 0..partitions as usize {
        let start = (partition * replication_factor) % node_count;
        let window: Vec<usize> = (0..replication_factor).map(|slot| (start + slot) % node_count).collect();

        let primary_pos = window
            .iter()
            .enumerate()
            .min_by_key(|(pos, &node)| (primary_counts[node], *pos))
            .map(|(pos, _)| pos)
            .unwrap_or(0);
        primary_counts[window[primary_pos]] += 1;

        let mut assigned = Vec::with_capacity(replication_factor);
        assigned.push((nodes[window[primary_pos]].clone(), roles[0].clone()));
        let mut replica_index = 0;
        for (pos, &node) in window.iter().enumerate() {
            if pos == primary_pos {
                continue;
            }
            replica_index += 1;
            let role = roles.get(replica_index.min(roles.len() - 1)).unwrap_or(&roles[0]);
            assigned.push((nodes[node].clone(), role.clone()));
        }
        assignment.push(assigned);
    }
    assignment
}
