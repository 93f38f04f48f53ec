//! Detector - 変更検出
//!
//! Joins local records to remote issues by back-reference (falling back to the
//! cached `remote_ref`) and classifies each entity against its snapshot entry.
//! Pure: no I/O, no locking.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::config::{Config, SectionColumns};
use crate::domain::{
    Classification, EntityChange, FieldValues, IssueNumber, RemoteIssue, Snapshot, SnapshotEntry,
    TaskId, TaskRecord,
};

/// One local record joined with its remote issue and merge base.
#[derive(Debug, Clone)]
pub struct EntityState {
    pub record: TaskRecord,
    pub issue: Option<RemoteIssue>,
    pub base: Option<SnapshotEntry>,
    pub local: FieldValues,
    /// Remote values projected onto local fields. `None` when no issue was found.
    pub remote: Option<FieldValues>,
    pub change: EntityChange,
}

impl EntityState {
    pub fn id(&self) -> &TaskId {
        &self.record.id
    }

    pub fn classification(&self) -> Classification {
        self.change.classification
    }
}

/// A remote issue with no corresponding local record.
#[derive(Debug, Clone)]
pub struct Orphan {
    pub issue: RemoteIssue,
}

#[derive(Debug, Clone, Default)]
pub struct Detection {
    pub entities: Vec<EntityState>,
    pub orphans: Vec<Orphan>,
    /// Every back-reference seen on the remote, first (lowest) issue number wins.
    pub claimed: BTreeMap<TaskId, IssueNumber>,
}

impl Detection {
    pub fn counts(&self) -> BTreeMap<Classification, usize> {
        let mut counts = BTreeMap::new();
        for entity in &self.entities {
            *counts.entry(entity.classification()).or_insert(0) += 1;
        }
        if !self.orphans.is_empty() {
            counts.insert(Classification::NewRemote, self.orphans.len());
        }
        counts
    }

    pub fn get(&self, id: &TaskId) -> Option<&EntityState> {
        self.entities.iter().find(|e| e.id() == id)
    }
}

pub struct Detector<'a> {
    config: &'a Config,
    columns: SectionColumns,
}

impl<'a> Detector<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self {
            config,
            columns: config.columns(),
        }
    }

    pub fn detect(
        &self,
        records: &[TaskRecord],
        issues: &[RemoteIssue],
        snapshot: &Snapshot,
    ) -> Detection {
        let mut sorted: Vec<&RemoteIssue> = issues.iter().collect();
        sorted.sort_by_key(|issue| issue.number);

        let mut claimed: BTreeMap<TaskId, IssueNumber> = BTreeMap::new();
        let mut by_back_ref: BTreeMap<TaskId, &RemoteIssue> = BTreeMap::new();
        let mut duplicates: BTreeSet<IssueNumber> = BTreeSet::new();
        for issue in &sorted {
            let Some(id) = issue.back_reference() else {
                continue;
            };
            if let Some(first) = by_back_ref.get(&id) {
                warn!(
                    "issue {} duplicates back-reference {id} of {}; ignoring it",
                    issue.number, first.number
                );
                duplicates.insert(issue.number);
                continue;
            }
            claimed.insert(id.clone(), issue.number);
            by_back_ref.insert(id, issue);
        }
        let by_number: BTreeMap<IssueNumber, &RemoteIssue> =
            sorted.iter().map(|issue| (issue.number, *issue)).collect();

        let local_ids: BTreeSet<&TaskId> = records.iter().map(|r| &r.id).collect();
        let referenced: BTreeSet<IssueNumber> =
            records.iter().filter_map(|r| r.remote_ref).collect();

        let mut matched: BTreeSet<IssueNumber> = BTreeSet::new();
        let mut entities = Vec::new();
        for record in records {
            if self.config.is_local_only(&record.section) {
                debug!("{}: section {} is local-only, skipping", record.id, record.section);
                continue;
            }
            let issue = by_back_ref
                .get(&record.id)
                .copied()
                .or_else(|| self.linked_without_back_ref(record, &by_number, &matched));
            if let Some(issue) = issue {
                matched.insert(issue.number);
            }
            entities.push(self.classify(record, issue, snapshot.get(&record.id)));
        }

        let mut orphans = Vec::new();
        for issue in sorted {
            if matched.contains(&issue.number)
                || duplicates.contains(&issue.number)
                || referenced.contains(&issue.number)
            {
                continue;
            }
            if let Some(id) = issue.back_reference() {
                if local_ids.contains(&id) {
                    continue;
                }
                if snapshot.contains(&id) {
                    debug!("issue {}: {id} was removed locally, not an orphan", issue.number);
                    continue;
                }
            }
            orphans.push(Orphan {
                issue: issue.clone(),
            });
        }

        Detection {
            entities,
            orphans,
            claimed,
        }
    }

    /// Follow a cached `remote_ref` to an issue that has no back-reference yet.
    fn linked_without_back_ref<'i>(
        &self,
        record: &TaskRecord,
        by_number: &BTreeMap<IssueNumber, &'i RemoteIssue>,
        matched: &BTreeSet<IssueNumber>,
    ) -> Option<&'i RemoteIssue> {
        let number = record.remote_ref?;
        let issue = *by_number.get(&number)?;
        match issue.back_reference() {
            None if !matched.contains(&number) => Some(issue),
            None => {
                warn!("{}: issue {number} is already linked to another task", record.id);
                None
            }
            Some(other) => {
                warn!(
                    "{}: remote_ref {number} points at an issue owned by {other}; ignoring the link",
                    record.id
                );
                None
            }
        }
    }

    /// Classify one entity from its three versions.
    pub fn classify(
        &self,
        record: &TaskRecord,
        issue: Option<&RemoteIssue>,
        base: Option<&SnapshotEntry>,
    ) -> EntityState {
        let local = FieldValues::from_record(record);
        let Some(issue) = issue else {
            let classification = if base.is_none() && record.remote_ref.is_none() {
                Classification::NewLocal
            } else {
                warn!(
                    "{}: linked issue {} not found on the remote",
                    record.id,
                    record
                        .remote_ref
                        .map(|n| n.to_string())
                        .unwrap_or_else(|| "(unknown)".to_string())
                );
                Classification::RemoteMissing
            };
            return EntityState {
                record: record.clone(),
                issue: None,
                base: base.cloned(),
                change: EntityChange::new(record.id.clone(), classification),
                local,
                remote: None,
            };
        };

        let remote = self.remote_view(&record.id, issue, base, &local);
        let mut change = EntityChange::new(record.id.clone(), Classification::Unchanged);
        match base {
            Some(base) => {
                change.local_changed = local.diff(&base.fields);
                change.remote_changed = remote.diff(&base.fields);
            }
            None => {
                // Two-way fallback: every difference is a conflict for the resolver.
                let diff = local.diff(&remote);
                change.local_changed = diff.clone();
                change.remote_changed = diff;
            }
        }
        change.classification = match (
            change.local_changed.is_empty(),
            change.remote_changed.is_empty(),
        ) {
            (true, true) => Classification::Unchanged,
            (false, true) => Classification::LocalChanged,
            (true, false) => Classification::RemoteChanged,
            (false, false) => Classification::BothChanged,
        };

        EntityState {
            record: record.clone(),
            issue: Some(issue.clone()),
            base: base.cloned(),
            local,
            remote: Some(remote),
            change,
        }
    }

    /// Project an issue onto local fields.
    ///
    /// Fields the tracker cannot express come from the merge base (or the local
    /// record without one), so they never register as remote edits. A column
    /// only counts as a section change when it moved since the last sync and
    /// maps back to a section.
    pub fn remote_view(
        &self,
        id: &TaskId,
        issue: &RemoteIssue,
        base: Option<&SnapshotEntry>,
        local: &FieldValues,
    ) -> FieldValues {
        let fallback = base.map(|b| &b.fields).unwrap_or(local);
        let section = match (&issue.board_column, base) {
            (Some(column), Some(base)) if base.column.as_deref() == Some(column.as_str()) => {
                base.fields.section.clone()
            }
            (Some(column), _) => match self.columns.section_for(column) {
                Some(section) => section.to_string(),
                None => {
                    warn!(
                        "{id}: issue {} moved to unmapped column `{column}`; keeping section {}",
                        issue.number, fallback.section
                    );
                    fallback.section.clone()
                }
            },
            (None, _) => fallback.section.clone(),
        };

        FieldValues {
            title: issue.title.clone(),
            status: issue.status,
            labels: issue.labels.clone(),
            section,
            milestone: issue.milestone.clone(),
            kind: fallback.kind.clone(),
            priority: fallback.priority.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Field, Status, record::back_reference_marker};
    use std::collections::BTreeMap;

    fn config() -> Config {
        let mut config = Config::new("octo", "tracker", &["TODO", "DOING", "DONE"]);
        config.section_columns = BTreeMap::from([
            ("TODO".to_string(), "Todo".to_string()),
            ("DOING".to_string(), "In Progress".to_string()),
            ("DONE".to_string(), "Done".to_string()),
        ]);
        config
    }

    fn record(id: &str, title: &str) -> TaskRecord {
        TaskRecord::new(TaskId::new(id), title, "TODO")
    }

    fn issue_for(record: &TaskRecord, number: u64) -> RemoteIssue {
        let mut issue = RemoteIssue::new(IssueNumber::new(number), record.title.clone());
        issue.status = record.status;
        issue.labels = record.labels.clone();
        issue.body = back_reference_marker(&record.id);
        issue.on_board = true;
        issue.board_column = Some("Todo".into());
        issue
    }

    fn base_for(record: &TaskRecord, number: u64) -> SnapshotEntry {
        SnapshotEntry {
            fields: FieldValues::from_record(record),
            column: Some("Todo".into()),
            remote_ref: Some(IssueNumber::new(number)),
        }
    }

    #[test]
    fn record_without_remote_or_snapshot_is_new_local() {
        let config = config();
        let detection = Detector::new(&config).detect(&[record("T-1", "a")], &[], &Snapshot::default());
        assert_eq!(detection.entities[0].classification(), Classification::NewLocal);
    }

    #[test]
    fn converged_entity_is_unchanged() {
        let config = config();
        let r = record("T-1", "a").with_remote_ref(IssueNumber::new(1));
        let mut snapshot = Snapshot::default();
        snapshot.insert(r.id.clone(), base_for(&r, 1));
        let detection = Detector::new(&config).detect(&[r.clone()], &[issue_for(&r, 1)], &snapshot);
        assert_eq!(detection.entities[0].classification(), Classification::Unchanged);
        assert!(detection.orphans.is_empty());
    }

    #[test]
    fn local_label_edit_and_remote_close_do_not_collide() {
        let config = config();
        let synced = record("T-1", "a").with_remote_ref(IssueNumber::new(1));
        let mut snapshot = Snapshot::default();
        snapshot.insert(synced.id.clone(), base_for(&synced, 1));

        let local = synced.clone().with_labels(["ui"]);
        let mut issue = issue_for(&synced, 1);
        issue.status = Status::Closed;

        let detection = Detector::new(&config).detect(&[local], &[issue], &snapshot);
        let entity = &detection.entities[0];
        assert_eq!(entity.classification(), Classification::BothChanged);
        assert_eq!(entity.change.local_changed, BTreeSet::from([Field::Labels]));
        assert_eq!(entity.change.remote_changed, BTreeSet::from([Field::Status]));
        assert!(entity.change.overlapping().is_empty());
    }

    #[test]
    fn column_move_maps_back_to_section() {
        let config = config();
        let r = record("T-1", "a").with_remote_ref(IssueNumber::new(1));
        let mut snapshot = Snapshot::default();
        snapshot.insert(r.id.clone(), base_for(&r, 1));
        let mut issue = issue_for(&r, 1);
        issue.board_column = Some("In Progress".into());

        let detection = Detector::new(&config).detect(&[r], &[issue], &snapshot);
        let entity = &detection.entities[0];
        assert_eq!(entity.classification(), Classification::RemoteChanged);
        assert_eq!(entity.remote.as_ref().unwrap().section, "DOING");
    }

    #[test]
    fn unmapped_column_is_not_a_section_change() {
        let config = config();
        let r = record("T-1", "a").with_remote_ref(IssueNumber::new(1));
        let mut snapshot = Snapshot::default();
        snapshot.insert(r.id.clone(), base_for(&r, 1));
        let mut issue = issue_for(&r, 1);
        issue.board_column = Some("Blocked".into());

        let detection = Detector::new(&config).detect(&[r], &[issue], &snapshot);
        assert_eq!(detection.entities[0].classification(), Classification::Unchanged);
    }

    #[test]
    fn lost_snapshot_relinks_by_back_reference() {
        let config = config();
        let r = record("T-1", "a");
        let mut issue = issue_for(&r, 4);
        issue.title = "renamed remotely".into();

        let detection = Detector::new(&config).detect(&[r], &[issue], &Snapshot::default());
        let entity = &detection.entities[0];
        assert_eq!(entity.issue.as_ref().unwrap().number, IssueNumber::new(4));
        assert_eq!(entity.classification(), Classification::BothChanged);
        assert_eq!(entity.change.overlapping(), BTreeSet::from([Field::Title]));
    }

    #[test]
    fn issue_without_match_is_an_orphan() {
        let config = config();
        let stranger = record("T-9", "from elsewhere");
        let mut no_ref = RemoteIssue::new(IssueNumber::new(8), "filed in the web ui");
        no_ref.body = "plain body".into();

        let detection = Detector::new(&config).detect(
            &[],
            &[issue_for(&stranger, 7), no_ref],
            &Snapshot::default(),
        );
        let numbers: Vec<_> = detection.orphans.iter().map(|o| o.issue.number.get()).collect();
        assert_eq!(numbers, vec![7, 8]);
        assert_eq!(detection.counts()[&Classification::NewRemote], 2);
    }

    #[test]
    fn locally_removed_task_is_not_an_orphan() {
        let config = config();
        let gone = record("T-3", "deleted locally");
        let mut snapshot = Snapshot::default();
        snapshot.insert(gone.id.clone(), base_for(&gone, 3));

        let detection = Detector::new(&config).detect(&[], &[issue_for(&gone, 3)], &snapshot);
        assert!(detection.orphans.is_empty());
    }

    #[test]
    fn duplicate_back_references_keep_the_lowest_number() {
        let config = config();
        let r = record("T-1", "a");
        let detection = Detector::new(&config).detect(
            &[r.clone()],
            &[issue_for(&r, 12), issue_for(&r, 5)],
            &Snapshot::default(),
        );
        assert_eq!(
            detection.entities[0].issue.as_ref().unwrap().number,
            IssueNumber::new(5)
        );
        assert!(detection.orphans.is_empty());
        assert_eq!(detection.claimed[&r.id], IssueNumber::new(5));
    }

    #[test]
    fn local_only_sections_are_skipped() {
        let config = config();
        let mut idea = record("T-5", "someday");
        idea.section = "IDEAS".into();
        let detection = Detector::new(&config).detect(&[idea], &[], &Snapshot::default());
        assert!(detection.entities.is_empty());
    }

    #[test]
    fn missing_linked_issue_is_reported() {
        let config = config();
        let r = record("T-1", "a").with_remote_ref(IssueNumber::new(40));
        let detection = Detector::new(&config).detect(&[r], &[], &Snapshot::default());
        assert_eq!(detection.entities[0].classification(), Classification::RemoteMissing);
    }
}
