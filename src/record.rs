//! The generic versioned record stored at every path of the coordination store.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A versioned document holding simple, list and map fields.
///
/// Every metadata type in the cluster (instance configs, ideal states, current states,
/// messages, ...) is persisted as one of these. The id is fixed at creation; the version
/// is owned by the store and incremented on every committed write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    id: String,
    /// The store-assigned version of this record; `-1` until first committed.
    #[serde(default)]
    pub version: i64,
    /// Scalar fields.
    #[serde(default)]
    pub simple_fields: BTreeMap<String, String>,
    /// Ordered sequence fields.
    #[serde(default)]
    pub list_fields: BTreeMap<String, Vec<String>>,
    /// Nested map fields.
    #[serde(default)]
    pub map_fields: BTreeMap<String, BTreeMap<String, String>>,
}

impl Record {
    /// Create a new record with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: -1,
            simple_fields: Default::default(),
            list_fields: Default::default(),
            map_fields: Default::default(),
        }
    }

    /// The immutable identity of this record.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_simple(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.simple_fields.insert(key.into(), val.into());
    }

    pub fn simple(&self, key: &str) -> Option<&str> {
        self.simple_fields.get(key).map(String::as_str)
    }

    pub fn set_list(&mut self, key: impl Into<String>, val: Vec<String>) {
        self.list_fields.insert(key.into(), val);
    }

    pub fn list(&self, key: &str) -> Option<&Vec<String>> {
        self.list_fields.get(key)
    }

    pub fn set_map(&mut self, key: impl Into<String>, val: BTreeMap<String, String>) {
        self.map_fields.insert(key.into(), val);
    }

    pub fn map(&self, key: &str) -> Option<&BTreeMap<String, String>> {
        self.map_fields.get(key)
    }

    pub fn map_mut(&mut self, key: impl Into<String>) -> &mut BTreeMap<String, String> {
        self.map_fields.entry(key.into()).or_default()
    }

    /// Merge the fields of `other` into this record.
    ///
    /// Simple fields overwrite; list and map fields merge by key with entries
    /// from `other` taking precedence. Identity and version are untouched.
    pub fn merge(&mut self, other: &Record) {
        for (key, val) in &other.simple_fields {
            self.simple_fields.insert(key.clone(), val.clone());
        }
        for (key, val) in &other.list_fields {
            self.list_fields.insert(key.clone(), val.clone());
        }
        for (key, val) in &other.map_fields {
            let target = self.map_fields.entry(key.clone()).or_default();
            for (k, v) in val {
                target.insert(k.clone(), v.clone());
            }
        }
    }
}
