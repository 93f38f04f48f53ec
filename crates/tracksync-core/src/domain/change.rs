//! Change model: per-field deltas against the last synced state.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::record::{LabelSet, Status, TaskRecord};

/// A field that takes part in reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Title,
    Status,
    Labels,
    /// Local section, mirrored by the board column.
    Section,
    Milestone,
    /// `type:` metadata. Local-only.
    Type,
    /// Local-only.
    Priority,
}

impl Field {
    pub const ALL: [Field; 7] = [
        Field::Title,
        Field::Status,
        Field::Labels,
        Field::Section,
        Field::Milestone,
        Field::Type,
        Field::Priority,
    ];
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Field::Title => "title",
            Field::Status => "status",
            Field::Labels => "labels",
            Field::Section => "section",
            Field::Milestone => "milestone",
            Field::Type => "type",
            Field::Priority => "priority",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Local,
    Remote,
}

/// Outcome of the change detector for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    NewLocal,
    NewRemote,
    LocalChanged,
    RemoteChanged,
    BothChanged,
    Unchanged,
    /// Linked or previously synced, but no issue was found on the remote.
    RemoteMissing,
}

/// Comparable field values, normalized so both sides can be diffed.
///
/// The remote projection fills fields the tracker cannot express (type,
/// priority, an unmapped column) from the merge base, so they never show up as
/// remote changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValues {
    pub title: String,
    pub status: Status,
    #[serde(default)]
    pub labels: LabelSet,
    pub section: String,
    #[serde(default)]
    pub milestone: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
}

impl FieldValues {
    pub fn from_record(record: &TaskRecord) -> Self {
        Self {
            title: record.title.clone(),
            status: record.status,
            labels: record.labels.clone(),
            section: record.section.clone(),
            milestone: record.milestone.clone(),
            kind: record.kind.clone(),
            priority: record.priority.clone(),
        }
    }

    pub fn differs(&self, other: &FieldValues, field: Field) -> bool {
        match field {
            Field::Title => self.title != other.title,
            Field::Status => self.status != other.status,
            Field::Labels => self.labels != other.labels,
            Field::Section => self.section != other.section,
            Field::Milestone => self.milestone != other.milestone,
            Field::Type => self.kind != other.kind,
            Field::Priority => self.priority != other.priority,
        }
    }

    /// Fields whose values differ between `self` and `other`.
    pub fn diff(&self, other: &FieldValues) -> BTreeSet<Field> {
        Field::ALL
            .into_iter()
            .filter(|f| self.differs(other, *f))
            .collect()
    }

    /// Copy one field's value from `source`.
    pub fn take(&mut self, source: &FieldValues, field: Field) {
        match field {
            Field::Title => self.title = source.title.clone(),
            Field::Status => self.status = source.status,
            Field::Labels => self.labels = source.labels.clone(),
            Field::Section => self.section = source.section.clone(),
            Field::Milestone => self.milestone = source.milestone.clone(),
            Field::Type => self.kind = source.kind.clone(),
            Field::Priority => self.priority = source.priority.clone(),
        }
    }
}

/// Per-entity delta produced by the detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityChange {
    pub id: TaskId,
    pub classification: Classification,
    pub local_changed: BTreeSet<Field>,
    pub remote_changed: BTreeSet<Field>,
}

impl EntityChange {
    pub fn new(id: TaskId, classification: Classification) -> Self {
        Self {
            id,
            classification,
            local_changed: BTreeSet::new(),
            remote_changed: BTreeSet::new(),
        }
    }

    /// Fields changed on both sides: the resolver's input.
    pub fn overlapping(&self) -> BTreeSet<Field> {
        self.local_changed
            .intersection(&self.remote_changed)
            .copied()
            .collect()
    }
}
