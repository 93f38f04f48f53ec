//! Sync snapshot: the three-way merge base.
//!
//! One entry per task id, holding field values as they stood right after the
//! previous successful run. Losing it degrades reconciliation to a two-way
//! merge.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::change::FieldValues;
use super::ids::{IssueNumber, TaskId};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    #[serde(flatten)]
    pub fields: FieldValues,
    /// Board column as last observed (or set) on the remote.
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub remote_ref: Option<IssueNumber>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    #[serde(default)]
    pub entries: BTreeMap<TaskId, SnapshotEntry>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

impl Snapshot {
    pub fn get(&self, id: &TaskId) -> Option<&SnapshotEntry> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn insert(&mut self, id: TaskId, entry: SnapshotEntry) {
        self.entries.insert(id, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
