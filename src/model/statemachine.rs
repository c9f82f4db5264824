//! State model definitions: named states, legal transitions, concurrency caps.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use petgraph::algo::astar;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::record::Record;

const FIELD_INITIAL_STATE: &str = "INITIAL_STATE";
const LIST_STATE_PRIORITY: &str = "STATE_PRIORITY_LIST";
const LIST_TRANSITIONS: &str = "TRANSITIONS";
const MAP_COUNTS: &str = "COUNTS";
const TRANSITION_SEP: char = '>';

/// The upper bound on concurrent holders of a state across the cluster, per partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateCount {
    /// At most this many holders (e.g. one MASTER).
    UpperBound(u32),
    /// As many holders as the resource has replicas.
    PerReplica,
    /// No bound.
    Unbounded,
}

impl StateCount {
    fn parse(val: &str) -> Result<Self> {
        match val {
            "R" => Ok(Self::PerReplica),
            "-1" => Ok(Self::Unbounded),
            n => Ok(Self::UpperBound(n.parse().with_context(|| format!("invalid state count '{}'", n))?)),
        }
    }

    fn encode(&self) -> String {
        match self {
            Self::UpperBound(n) => n.to_string(),
            Self::PerReplica => "R".to_string(),
            Self::Unbounded => "-1".to_string(),
        }
    }
}

/// A state model: an ordered set of named states, the legal transition table, and
/// per-state concurrency caps.
///
/// Every transition message must name a `(from, to)` pair present in the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateModelDef {
    name: String,
    initial_state: String,
    /// States in priority order, highest first.
    states: Vec<String>,
    transitions: Vec<(String, String)>,
    counts: BTreeMap<String, StateCount>,
}

impl StateModelDef {
    pub fn new(name: impl Into<String>, initial_state: impl Into<String>, states: Vec<String>, transitions: Vec<(String, String)>, counts: BTreeMap<String, StateCount>) -> Result<Self> {
        let initial_state = initial_state.into();
        let def = Self {
            name: name.into(),
            initial_state,
            states,
            transitions,
            counts,
        };
        if !def.states.iter().any(|state| state == &def.initial_state) {
            bail!("initial state '{}' is not part of the state model '{}'", def.initial_state, def.name);
        }
        for (from, to) in &def.transitions {
            if !def.states.iter().any(|state| state == from) || !def.states.iter().any(|state| state == to) {
                bail!("transition {}{}{} references a state unknown to model '{}'", from, TRANSITION_SEP, to, def.name);
            }
        }
        Ok(def)
    }

    /// The canonical MasterSlave model: one MASTER per partition, R SLAVEs,
    /// OFFLINE initial, DROPPED terminal.
    pub fn master_slave() -> Self {
        let states = vec!["MASTER".to_string(), "SLAVE".to_string(), "OFFLINE".to_string(), "DROPPED".to_string()];
        let transitions = vec![
            ("OFFLINE".to_string(), "SLAVE".to_string()),
            ("SLAVE".to_string(), "OFFLINE".to_string()),
            ("SLAVE".to_string(), "MASTER".to_string()),
            ("MASTER".to_string(), "SLAVE".to_string()),
            ("OFFLINE".to_string(), "DROPPED".to_string()),
        ];
        let counts: BTreeMap<String, StateCount> = vec![
            ("MASTER".to_string(), StateCount::UpperBound(1)),
            ("SLAVE".to_string(), StateCount::PerReplica),
            ("OFFLINE".to_string(), StateCount::Unbounded),
            ("DROPPED".to_string(), StateCount::Unbounded),
        ]
        .into_iter()
        .collect();
        Self::new("MasterSlave", "OFFLINE", states, transitions, counts).expect("MasterSlave model is statically valid")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn initial_state(&self) -> &str {
        &self.initial_state
    }

    /// Whether `(from, to)` is a single legal hop.
    pub fn is_legal(&self, from: &str, to: &str) -> bool {
        self.transitions.iter().any(|(f, t)| f == from && t == to)
    }

    /// The cap on concurrent holders of `state` for a resource with the given
    /// replica count, or `None` when unbounded.
    pub fn bound(&self, state: &str, replicas: u32) -> Option<u32> {
        match self.counts.get(state) {
            Some(StateCount::UpperBound(n)) => Some(*n),
            Some(StateCount::PerReplica) => Some(replicas),
            Some(StateCount::Unbounded) | None => None,
        }
    }

    /// The next hop on the shortest legal path from `from` to `to`.
    ///
    /// Returns `None` when already there or when no legal path exists.
    pub fn next_state_on_path(&self, from: &str, to: &str) -> Option<String> {
        if from == to {
            return None;
        }
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut indices: BTreeMap<&str, NodeIndex> = BTreeMap::new();
        for state in &self.states {
            indices.insert(state.as_str(), graph.add_node(state.as_str()));
        }
        for (f, t) in &self.transitions {
            if let (Some(&a), Some(&b)) = (indices.get(f.as_str()), indices.get(t.as_str())) {
                graph.add_edge(a, b, ());
            }
        }
        let (start, goal) = (*indices.get(from)?, *indices.get(to)?);
        let (_cost, path) = astar(&graph, start, |node| node == goal, |_| 1, |_| 0)?;
        path.get(1).map(|&idx| graph[idx].to_string())
    }

    /// The static cap on concurrent holders of `state`, independent of replica count.
    ///
    /// Only statically capped states (e.g. one MASTER) are enforced during
    /// reconciliation; per-replica counts are satisfied by the assignment itself.
    pub fn hard_bound(&self, state: &str) -> Option<u32> {
        match self.counts.get(state) {
            Some(StateCount::UpperBound(n)) => Some(*n),
            _ => None,
        }
    }

    /// The model's terminal state, if it declares one.
    pub fn terminal_state(&self) -> Option<&str> {
        self.states.iter().map(String::as_str).find(|state| self.is_terminal(state))
    }

    /// Whether `state` is a dead end with no legal way out, such as DROPPED.
    pub fn is_terminal(&self, state: &str) -> bool {
        self.states.iter().any(|candidate| candidate == state) && !self.transitions.iter().any(|(from, _)| from == state)
    }

    /// The placement roles of this model: states in priority order, excluding the
    /// initial state and dead-end states such as DROPPED.
    pub fn roles(&self) -> Vec<String> {
        self.states
            .iter()
            .filter(|state| {
                state.as_str() != self.initial_state && self.transitions.iter().any(|(from, _)| from == *state)
            })
            .cloned()
            .collect()
    }

    pub fn from_record(record: &Record) -> Result<Self> {
        let initial_state = record.simple(FIELD_INITIAL_STATE).context("state model record is missing INITIAL_STATE")?.to_string();
        let states = record.list(LIST_STATE_PRIORITY).cloned().unwrap_or_default();
        let transitions = record
            .list(LIST_TRANSITIONS)
            .cloned()
            .unwrap_or_default()
            .iter()
            .map(|entry| {
                let (from, to) = entry
                    .split_once(TRANSITION_SEP)
                    .with_context(|| format!("malformed transition entry '{}' on state model {}", entry, record.id()))?;
                Ok((from.to_string(), to.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;
        let counts = record
            .map(MAP_COUNTS)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .map(|(state, count)| Ok((state, StateCount::parse(&count)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Self::new(record.id(), initial_state, states, transitions, counts)
    }

    pub fn to_record(&self) -> Record {
        let mut record = Record::new(&self.name);
        record.set_simple(FIELD_INITIAL_STATE, &self.initial_state);
        record.set_list(LIST_STATE_PRIORITY, self.states.clone());
        record.set_list(
            LIST_TRANSITIONS,
            self.transitions.iter().map(|(from, to)| format!("{}{}{}", from, TRANSITION_SEP, to)).collect(),
        );
        let counts: BTreeMap<String, String> = self.counts.iter().map(|(state, count)| (state.clone(), count.encode())).collect();
        record.set_map(MAP_COUNTS, counts);
        record
    }
}
