//! The store record layout, namespaced per cluster.

pub fn participant_configs(cluster: &str) -> String {
    format!("/{}/CONFIGS/PARTICIPANT", cluster)
}

pub fn participant_config(cluster: &str, instance: &str) -> String {
    format!("/{}/CONFIGS/PARTICIPANT/{}", cluster, instance)
}

pub fn live_instances(cluster: &str) -> String {
    format!("/{}/LIVEINSTANCES", cluster)
}

pub fn live_instance(cluster: &str, instance: &str) -> String {
    format!("/{}/LIVEINSTANCES/{}", cluster, instance)
}

pub fn ideal_states(cluster: &str) -> String {
    format!("/{}/IDEALSTATES", cluster)
}

pub fn ideal_state(cluster: &str, resource: &str) -> String {
    format!("/{}/IDEALSTATES/{}", cluster, resource)
}

pub fn state_model_defs(cluster: &str) -> String {
    format!("/{}/STATEMODELDEFS", cluster)
}

pub fn state_model_def(cluster: &str, name: &str) -> String {
    format!("/{}/STATEMODELDEFS/{}", cluster, name)
}

pub fn instances(cluster: &str) -> String {
    format!("/{}/INSTANCES", cluster)
}

pub fn current_states(cluster: &str, instance: &str) -> String {
    format!("/{}/INSTANCES/{}/CURRENTSTATE", cluster, instance)
}

pub fn current_state(cluster: &str, instance: &str, resource: &str) -> String {
    format!("/{}/INSTANCES/{}/CURRENTSTATE/{}", cluster, instance, resource)
}

pub fn messages(cluster: &str, instance: &str) -> String {
    format!("/{}/INSTANCES/{}/MESSAGES", cluster, instance)
}

pub fn message(cluster: &str, instance: &str, id: &str) -> String {
    format!("/{}/INSTANCES/{}/MESSAGES/{}", cluster, instance, id)
}

pub fn external_views(cluster: &str) -> String {
    format!("/{}/EXTERNALVIEW", cluster)
}

pub fn external_view(cluster: &str, resource: &str) -> String {
    format!("/{}/EXTERNALVIEW/{}", cluster, resource)
}

pub fn controller_leader(cluster: &str) -> String {
    format!("/{}/CONTROLLER/LEADER", cluster)
}

/// Split an `/INSTANCES/{id}/{kind}/{child}` path into its instance, kind and child parts.
pub fn parse_instance_path<'a>(cluster: &str, path: &'a str) -> Option<(&'a str, &'a str, &'a str)> {
    let rest = path.strip_prefix(&format!("/{}/INSTANCES/", cluster))?;
    let mut parts = rest.splitn(3, '/');
    let instance = parts.next()?;
    let kind = parts.next()?;
    let child = parts.next()?;
    if child.is_empty() || child.contains('/') {
        return None;
    }
    Some((instance, kind, child))
}

/// The direct child id of `parent` named by `path`, if any.
pub fn child_of<'a>(parent: &str, path: &'a str) -> Option<&'a str> {
    let rest = path.strip_prefix(parent)?.strip_prefix('/')?;
    if rest.is_empty() || rest.contains('/') {
        None
    } else {
        Some(rest)
    }
}
