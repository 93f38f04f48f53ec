//! Plan: the ordered list of operations for one run.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use super::ids::{IssueNumber, TaskId};
use super::record::{LabelSet, Status, TaskRecord};
use super::snapshot::SnapshotEntry;

/// Issue targeted by a remote operation.
///
/// `Created` refers to the issue made by the `CreateRemote` earlier in the same
/// id's operation list; the executor resolves it to the assigned number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueRef {
    Known(IssueNumber),
    Created,
}

impl fmt::Display for IssueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueRef::Known(n) => fmt::Display::fmt(n, f),
            IssueRef::Created => f.write_str("#<new>"),
        }
    }
}

/// Payload for `create_issue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssueDraft {
    pub title: String,
    pub labels: LabelSet,
    pub milestone: Option<String>,
    /// Carries the back-reference.
    pub body: String,
}

/// Fields to change on an existing issue. `None` leaves the field alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IssuePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<LabelSet>,
    /// `Some(None)` clears the milestone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub milestone: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl IssuePatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.labels.is_none() && self.milestone.is_none() && self.body.is_none()
    }
}

/// Fields to change on a local record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<LabelSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub milestone: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_ref: Option<IssueNumber>,
}

impl RecordPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.status.is_none()
            && self.labels.is_none()
            && self.section.is_none()
            && self.milestone.is_none()
            && self.remote_ref.is_none()
    }

    pub fn apply(&self, record: &mut TaskRecord) {
        if let Some(title) = &self.title {
            record.title = title.clone();
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(labels) = &self.labels {
            record.labels = labels.clone();
        }
        if let Some(section) = &self.section {
            record.section = section.clone();
        }
        if let Some(milestone) = &self.milestone {
            record.milestone = milestone.clone();
        }
        if let Some(remote_ref) = self.remote_ref {
            record.remote_ref = Some(remote_ref);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    CreateRemote {
        id: TaskId,
        draft: IssueDraft,
    },
    UpdateRemote {
        id: TaskId,
        issue: IssueRef,
        patch: IssuePatch,
    },
    CloseRemote {
        id: TaskId,
        issue: IssueRef,
    },
    ReopenRemote {
        id: TaskId,
        issue: IssueRef,
    },
    AddToBoard {
        id: TaskId,
        issue: IssueRef,
    },
    MoveColumn {
        id: TaskId,
        issue: IssueRef,
        column: String,
    },
    UpdateLocal {
        id: TaskId,
        patch: RecordPatch,
    },
    /// Pull an orphan issue into the local store.
    CreateLocal {
        record: TaskRecord,
        issue: IssueNumber,
    },
    CloseRemoteOrphan {
        issue: IssueNumber,
    },
}

/// Operations sharing a key must run in plan order; different keys are independent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKey {
    Task(TaskId),
    Orphan(IssueNumber),
}

impl fmt::Display for OpKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKey::Task(id) => fmt::Display::fmt(id, f),
            OpKey::Orphan(n) => write!(f, "orphan {n}"),
        }
    }
}

impl Operation {
    pub fn key(&self) -> OpKey {
        match self {
            Operation::CreateRemote { id, .. }
            | Operation::UpdateRemote { id, .. }
            | Operation::CloseRemote { id, .. }
            | Operation::ReopenRemote { id, .. }
            | Operation::AddToBoard { id, .. }
            | Operation::MoveColumn { id, .. }
            | Operation::UpdateLocal { id, .. } => OpKey::Task(id.clone()),
            Operation::CreateLocal { record, .. } => OpKey::Task(record.id.clone()),
            Operation::CloseRemoteOrphan { issue } => OpKey::Orphan(*issue),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Operation::UpdateLocal { .. } | Operation::CreateLocal { .. })
    }

    /// Short label for logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::CreateRemote { .. } => "CREATE_REMOTE",
            Operation::UpdateRemote { .. } => "UPDATE_REMOTE",
            Operation::CloseRemote { .. } => "CLOSE_REMOTE",
            Operation::ReopenRemote { .. } => "REOPEN_REMOTE",
            Operation::AddToBoard { .. } => "ADD_TO_BOARD",
            Operation::MoveColumn { .. } => "MOVE_COLUMN",
            Operation::UpdateLocal { .. } => "UPDATE_LOCAL",
            Operation::CreateLocal { .. } => "CREATE_LOCAL",
            Operation::CloseRemoteOrphan { .. } => "CLOSE_REMOTE_ORPHAN",
        }
    }
}

/// Ordered operations plus the snapshot entry each id reaches once all of its
/// operations succeed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub operations: Vec<Operation>,
    /// For ids created remotely in this run `remote_ref` is filled in by the executor.
    pub targets: BTreeMap<TaskId, SnapshotEntry>,
    /// Back-references already present on the remote when the plan was made.
    /// `CreateRemote` for any of these ids is refused.
    #[serde(skip)]
    pub claimed: BTreeMap<TaskId, IssueNumber>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn push(&mut self, op: Operation) {
        self.operations.push(op);
    }

    /// Group operations by key, keeping plan order inside each group.
    pub fn groups(&self) -> Vec<(OpKey, Vec<Operation>)> {
        let mut order: Vec<OpKey> = Vec::new();
        let mut groups: BTreeMap<OpKey, Vec<Operation>> = BTreeMap::new();
        for op in &self.operations {
            let key = op.key();
            if !groups.contains_key(&key) {
                order.push(key.clone());
            }
            groups.entry(key).or_default().push(op.clone());
        }
        order
            .into_iter()
            .filter_map(|key| groups.remove(&key).map(|ops| (key, ops)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_keep_first_seen_order_and_per_key_order() {
        let a = TaskId::new("A");
        let b = TaskId::new("B");
        let mut plan = Plan::default();
        plan.push(Operation::CloseRemote { id: b.clone(), issue: IssueRef::Known(IssueNumber::new(2)) });
        plan.push(Operation::CreateRemote {
            id: a.clone(),
            draft: IssueDraft { title: "a".into(), labels: LabelSet::new(), milestone: None, body: String::new() },
        });
        plan.push(Operation::CloseRemoteOrphan { issue: IssueNumber::new(9) });
        plan.push(Operation::MoveColumn { id: a.clone(), issue: IssueRef::Created, column: "Todo".into() });

        let groups = plan.groups();
        let keys: Vec<_> = groups.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(
            keys,
            vec![OpKey::Task(b), OpKey::Task(a), OpKey::Orphan(IssueNumber::new(9))]
        );
        let names: Vec<_> = groups[1].1.iter().map(Operation::name).collect();
        assert_eq!(names, vec!["CREATE_REMOTE", "MOVE_COLUMN"]);
    }

    #[test]
    fn record_patch_applies_only_set_fields() {
        let mut record = TaskRecord::new(TaskId::new("T-1"), "old", "TODO").with_labels(["x"]);
        let patch = RecordPatch {
            status: Some(Status::Closed),
            remote_ref: Some(IssueNumber::new(5)),
            ..RecordPatch::default()
        };
        patch.apply(&mut record);
        assert_eq!(record.title, "old");
        assert_eq!(record.status, Status::Closed);
        assert_eq!(record.remote_ref, Some(IssueNumber::new(5)));
        assert_eq!(record.labels.len(), 1);
    }
}
