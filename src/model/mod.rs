//! Typed metadata models layered over the generic store record.

mod statemachine;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};

use crate::record::Record;

pub use statemachine::{StateCount, StateModelDef};

// Record field names.
const FIELD_HOST: &str = "HOST";
const FIELD_PORT: &str = "PORT";
const FIELD_ENABLED: &str = "ENABLED";
const FIELD_SESSION_ID: &str = "SESSION_ID";
const FIELD_NUM_PARTITIONS: &str = "NUM_PARTITIONS";
const FIELD_REPLICAS: &str = "REPLICAS";
const FIELD_STATE_MODEL_DEF: &str = "STATE_MODEL_DEF";
const FIELD_RESOURCE_NAME: &str = "RESOURCE_NAME";
const FIELD_PARTITION_NAME: &str = "PARTITION_NAME";
const FIELD_TGT_NAME: &str = "TGT_NAME";
const FIELD_FROM_STATE: &str = "FROM_STATE";
const FIELD_TO_STATE: &str = "TO_STATE";
const FIELD_MSG_STATE: &str = "MSG_STATE";
const FIELD_CREATE_TIMESTAMP: &str = "CREATE_TIMESTAMP";
const FIELD_SEQUENCE: &str = "SEQUENCE";
const FIELD_CURRENT_STATE: &str = "CURRENT_STATE";
const FIELD_LEADER: &str = "LEADER";

/// The canonical name of a resource partition.
pub fn partition_name(resource: &str, index: u32) -> String {
    format!("{}_{}", resource, index)
}

/// Configuration of one worker node, created by admin action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceConfig {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub enabled: bool,
}

impl InstanceConfig {
    /// Create a config for a node at host:port, deriving the canonical instance id.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            id: format!("{}_{}", host, port),
            host,
            port,
            enabled: true,
        }
    }

    pub fn from_record(record: &Record) -> Result<Self> {
        Ok(Self {
            id: record.id().to_string(),
            host: record.simple(FIELD_HOST).unwrap_or_default().to_string(),
            port: record
                .simple(FIELD_PORT)
                .unwrap_or_default()
                .parse()
                .with_context(|| format!("invalid PORT field on instance config {}", record.id()))?,
            enabled: record.simple(FIELD_ENABLED).map(|val| val == "true").unwrap_or(true),
        })
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new(&self.id);
        record.set_simple(FIELD_HOST, &self.host);
        record.set_simple(FIELD_PORT, self.port.to_string());
        record.set_simple(FIELD_ENABLED, self.enabled.to_string());
        record
    }
}

/// The ephemeral liveness record a node holds while its session is alive.
///
/// Presence is the sole liveness signal; absence is the failure signal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveInstance {
    pub id: String,
    pub session_id: String,
}

impl LiveInstance {
    pub fn from_record(record: &Record) -> Self {
        Self {
            id: record.id().to_string(),
            session_id: record.simple(FIELD_SESSION_ID).unwrap_or_default().to_string(),
        }
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new(&self.id);
        record.set_simple(FIELD_SESSION_ID, &self.session_id);
        record
    }
}

/// The target assignment for a resource: partition → ordered (node, role) list,
/// primary first. Replaced wholesale on rebalance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdealState {
    pub resource: String,
    pub partitions: u32,
    pub replicas: u32,
    pub state_model: String,
    pub assignment: BTreeMap<String, Vec<(String, String)>>,
}

impl IdealState {
    pub fn from_record(record: &Record) -> Result<Self> {
        let partitions = record
            .simple(FIELD_NUM_PARTITIONS)
            .unwrap_or_default()
            .parse()
            .with_context(|| format!("invalid NUM_PARTITIONS field on ideal state {}", record.id()))?;
        let replicas = record.simple(FIELD_REPLICAS).unwrap_or("0").parse().unwrap_or(0);
        let mut assignment = BTreeMap::new();
        for (partition, nodes) in &record.list_fields {
            let roles = record.map(partition);
            let assigned = nodes
                .iter()
                .map(|node| {
                    let role = roles.and_then(|map| map.get(node)).cloned().unwrap_or_default();
                    (node.clone(), role)
                })
                .collect();
            assignment.insert(partition.clone(), assigned);
        }
        Ok(Self {
            resource: record.id().to_string(),
            partitions,
            replicas,
            state_model: record.simple(FIELD_STATE_MODEL_DEF).unwrap_or_default().to_string(),
            assignment,
        })
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new(&self.resource);
        record.set_simple(FIELD_NUM_PARTITIONS, self.partitions.to_string());
        record.set_simple(FIELD_REPLICAS, self.replicas.to_string());
        record.set_simple(FIELD_STATE_MODEL_DEF, &self.state_model);
        for (partition, assigned) in &self.assignment {
            record.set_list(partition, assigned.iter().map(|(node, _)| node.clone()).collect());
            let roles: BTreeMap<String, String> = assigned.iter().cloned().collect();
            record.set_map(partition, roles);
        }
        record
    }

    /// The target role for a node on a partition, if any.
    pub fn role_of(&self, partition: &str, node: &str) -> Option<&str> {
        self.assignment
            .get(partition)
            .and_then(|assigned| assigned.iter().find(|(candidate, _)| candidate == node))
            .map(|(_, role)| role.as_str())
    }
}

/// A node's self-reported actual role per partition for one resource.
///
/// Owned and written only by that node's executor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CurrentState {
    pub instance: String,
    pub resource: String,
    pub session_id: String,
    pub state_model: String,
    /// Partition name → current state.
    pub partitions: BTreeMap<String, String>,
}

impl CurrentState {
    pub fn new(instance: impl Into<String>, resource: impl Into<String>, session_id: impl Into<String>, state_model: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            resource: resource.into(),
            session_id: session_id.into(),
            state_model: state_model.into(),
            partitions: Default::default(),
        }
    }

    pub fn from_record(instance: &str, record: &Record) -> Self {
        let partitions = record
            .map_fields
            .iter()
            .filter_map(|(partition, map)| map.get(FIELD_CURRENT_STATE).map(|state| (partition.clone(), state.clone())))
            .collect();
        Self {
            instance: instance.to_string(),
            resource: record.id().to_string(),
            session_id: record.simple(FIELD_SESSION_ID).unwrap_or_default().to_string(),
            state_model: record.simple(FIELD_STATE_MODEL_DEF).unwrap_or_default().to_string(),
            partitions,
        }
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new(&self.resource);
        record.set_simple(FIELD_SESSION_ID, &self.session_id);
        record.set_simple(FIELD_STATE_MODEL_DEF, &self.state_model);
        for (partition, state) in &self.partitions {
            record.map_mut(partition.clone()).insert(FIELD_CURRENT_STATE.into(), state.clone());
        }
        record
    }
}

/// The cluster-wide derived aggregate of all current states for a resource.
///
/// Rebuilt by the controller; never written by participants.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExternalView {
    pub resource: String,
    /// Partition name → node → state.
    pub partitions: BTreeMap<String, BTreeMap<String, String>>,
}

impl ExternalView {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            partitions: Default::default(),
        }
    }

    pub fn from_record(record: &Record) -> Self {
        Self {
            resource: record.id().to_string(),
            partitions: record.map_fields.clone(),
        }
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new(&self.resource);
        for (partition, states) in &self.partitions {
            record.set_map(partition.clone(), states.clone());
        }
        record
    }
}

/// The execution status of a transition message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageStatus {
    New,
    Read,
    Completed,
    Error,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Read => "READ",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(val: &str) -> Result<Self> {
        match val {
            "NEW" => Ok(Self::New),
            "READ" => Ok(Self::Read),
            "COMPLETED" => Ok(Self::Completed),
            "ERROR" => Ok(Self::Error),
            other => bail!("unknown message status '{}'", other),
        }
    }
}

/// A one-hop state-transition instruction from the controller to a participant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub resource: String,
    pub partition: String,
    pub target_instance: String,
    pub from_state: String,
    pub to_state: String,
    pub state_model: String,
    pub status: MessageStatus,
    /// Unix timestamp of message creation, second resolution.
    pub created_at: i64,
    /// Process-local creation sequence, the ordering tiebreaker for messages
    /// created within the same second.
    pub sequence: u64,
}

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

impl Message {
    /// Create a new pending transition message.
    pub fn new(
        resource: impl Into<String>, partition: impl Into<String>, target_instance: impl Into<String>, from_state: impl Into<String>, to_state: impl Into<String>,
        state_model: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            resource: resource.into(),
            partition: partition.into(),
            target_instance: target_instance.into(),
            from_state: from_state.into(),
            to_state: to_state.into(),
            state_model: state_model.into(),
            status: MessageStatus::New,
            created_at: time::OffsetDateTime::now_utc().unix_timestamp(),
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn from_record(record: &Record) -> Result<Self> {
        let status = MessageStatus::parse(record.simple(FIELD_MSG_STATE).unwrap_or("NEW")).with_context(|| format!("invalid status on message {}", record.id()))?;
        Ok(Self {
            id: record.id().to_string(),
            resource: record.simple(FIELD_RESOURCE_NAME).unwrap_or_default().to_string(),
            partition: record.simple(FIELD_PARTITION_NAME).unwrap_or_default().to_string(),
            target_instance: record.simple(FIELD_TGT_NAME).unwrap_or_default().to_string(),
            from_state: record.simple(FIELD_FROM_STATE).unwrap_or_default().to_string(),
            to_state: record.simple(FIELD_TO_STATE).unwrap_or_default().to_string(),
            state_model: record.simple(FIELD_STATE_MODEL_DEF).unwrap_or_default().to_string(),
            status,
            created_at: record.simple(FIELD_CREATE_TIMESTAMP).unwrap_or("0").parse().unwrap_or(0),
            sequence: record.simple(FIELD_SEQUENCE).unwrap_or("0").parse().unwrap_or(0),
        })
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new(&self.id);
        record.set_simple(FIELD_RESOURCE_NAME, &self.resource);
        record.set_simple(FIELD_PARTITION_NAME, &self.partition);
        record.set_simple(FIELD_TGT_NAME, &self.target_instance);
        record.set_simple(FIELD_FROM_STATE, &self.from_state);
        record.set_simple(FIELD_TO_STATE, &self.to_state);
        record.set_simple(FIELD_STATE_MODEL_DEF, &self.state_model);
        record.set_simple(FIELD_MSG_STATE, self.status.as_str());
        record.set_simple(FIELD_CREATE_TIMESTAMP, self.created_at.to_string());
        record.set_simple(FIELD_SEQUENCE, self.sequence.to_string());
        record
    }
}

/// The controller leader record held at `/CONTROLLER/LEADER`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderRecord {
    pub leader_id: String,
    pub session_id: String,
}

impl LeaderRecord {
    pub fn from_record(record: &Record) -> Self {
        Self {
            leader_id: record.simple(FIELD_LEADER).unwrap_or_default().to_string(),
            session_id: record.simple(FIELD_SESSION_ID).unwrap_or_default().to_string(),
        }
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new("LEADER");
        record.set_simple(FIELD_LEADER, &self.leader_id);
        record.set_simple(FIELD_SESSION_ID, &self.session_id);
        record
    }
}
