//! Planner - 操作列の生成
//!
//! Turns the detection and the per-entity resolutions into an ordered
//! [`Plan`]. Pure: the only side effect is id generation for pulled orphans
//! that carry no back-reference.
//!
//! # 順序
//! - 1 つの id について `CREATE_REMOTE` が常に先頭。後続の remote 操作は
//!   `IssueRef::Created` で新しい issue を指す
//! - `UPDATE_LOCAL` は remote 操作の後。remote が失敗した id は local も変わらない
//! - id をまたぐ順序は意味を持たない

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::config::{Config, OrphanBehavior, SectionColumns};
use crate::domain::record::with_back_reference;
use crate::domain::{
    Classification, Field, FieldValues, IssueDraft, IssueNumber, IssuePatch, IssueRef, Operation,
    Plan, RecordPatch, RemoteIssue, SnapshotEntry, TaskId, TaskRecord,
};
use crate::ports::IdGenerator;

use super::detector::{Detection, EntityState};
use super::resolver::Resolution;

/// Board state of one issue as the planner sees it.
struct BoardView<'a> {
    on_board: bool,
    column: Option<&'a str>,
    /// The section differs from what was last synced (or nothing was synced).
    section_moved: bool,
}

pub struct Planner<'a> {
    config: &'a Config,
    columns: SectionColumns,
    ids: &'a dyn IdGenerator,
}

impl<'a> Planner<'a> {
    pub fn new(config: &'a Config, ids: &'a dyn IdGenerator) -> Self {
        Self {
            config,
            columns: config.columns(),
            ids,
        }
    }

    pub fn plan(&self, detection: &Detection, resolutions: &BTreeMap<TaskId, Resolution>) -> Plan {
        let mut plan = Plan {
            claimed: detection.claimed.clone(),
            ..Plan::default()
        };

        for entity in &detection.entities {
            match (entity.classification(), &entity.issue) {
                (Classification::NewLocal, _) => self.plan_create(&entity.record, &mut plan),
                (_, Some(issue)) => {
                    let merged = resolutions
                        .get(entity.id())
                        .map(|r| &r.merged)
                        .unwrap_or(&entity.local);
                    self.plan_existing(entity, issue, merged, &mut plan);
                }
                (classification, None) => {
                    debug!("{}: {classification:?}, nothing to plan", entity.id());
                }
            }
        }

        for orphan in &detection.orphans {
            self.plan_orphan(&orphan.issue, &mut plan);
        }

        debug!("planned {} operations", plan.len());
        plan
    }

    fn plan_create(&self, record: &TaskRecord, plan: &mut Plan) {
        let id = &record.id;
        plan.push(Operation::CreateRemote {
            id: id.clone(),
            draft: IssueDraft {
                title: record.title.clone(),
                labels: record.labels.clone(),
                milestone: record.milestone.clone(),
                body: record.render_issue_body(),
            },
        });
        if record.status.is_closed() {
            plan.push(Operation::CloseRemote {
                id: id.clone(),
                issue: IssueRef::Created,
            });
        }
        let view = BoardView {
            on_board: false,
            column: None,
            section_moved: true,
        };
        let column = self.plan_board(id, IssueRef::Created, &record.section, &view, plan);

        plan.targets.insert(
            id.clone(),
            SnapshotEntry {
                fields: FieldValues::from_record(record),
                column,
                remote_ref: None,
            },
        );
    }

    fn plan_existing(
        &self,
        entity: &EntityState,
        issue: &RemoteIssue,
        merged: &FieldValues,
        plan: &mut Plan,
    ) {
        let id = entity.id();
        let record = &entity.record;
        let issue_ref = IssueRef::Known(issue.number);

        let mut patch = IssuePatch::default();
        if merged.title != issue.title {
            patch.title = Some(merged.title.clone());
        }
        if merged.labels != issue.labels {
            patch.labels = Some(merged.labels.clone());
        }
        if merged.milestone != issue.milestone {
            patch.milestone = Some(merged.milestone.clone());
        }
        let metadata_changed = entity.change.local_changed.contains(&Field::Type)
            || entity.change.local_changed.contains(&Field::Priority);
        if metadata_changed {
            let mut projected = record.clone();
            merged_patch(record, merged, None).apply(&mut projected);
            patch.body = Some(projected.render_issue_body());
        } else if issue.back_reference().as_ref() != Some(id) {
            patch.body = Some(with_back_reference(&issue.body, id));
        }
        if !patch.is_empty() {
            plan.push(Operation::UpdateRemote {
                id: id.clone(),
                issue: issue_ref,
                patch,
            });
        }

        if merged.status != issue.status {
            let op = if merged.status.is_closed() {
                Operation::CloseRemote { id: id.clone(), issue: issue_ref }
            } else {
                Operation::ReopenRemote { id: id.clone(), issue: issue_ref }
            };
            plan.push(op);
        }

        let view = BoardView {
            on_board: issue.on_board,
            column: issue.board_column.as_deref(),
            section_moved: entity
                .base
                .as_ref()
                .is_none_or(|base| base.fields.section != merged.section),
        };
        let column = self.plan_board(id, issue_ref, &merged.section, &view, plan);

        let local_patch = merged_patch(record, merged, Some(issue.number));
        if !local_patch.is_empty() {
            plan.push(Operation::UpdateLocal {
                id: id.clone(),
                patch: local_patch,
            });
        }

        plan.targets.insert(
            id.clone(),
            SnapshotEntry {
                fields: merged.clone(),
                column,
                remote_ref: Some(issue.number),
            },
        );
    }

    fn plan_orphan(&self, issue: &RemoteIssue, plan: &mut Plan) {
        if issue.status.is_closed() {
            debug!("orphan {} is closed, leaving it alone", issue.number);
            return;
        }
        match self.config.orphan_behavior {
            OrphanBehavior::Ignore => {
                debug!("orphan {} ignored", issue.number);
            }
            OrphanBehavior::Close => plan.push(Operation::CloseRemoteOrphan {
                issue: issue.number,
            }),
            OrphanBehavior::Pull => self.plan_pull(issue, plan),
        }
    }

    fn plan_pull(&self, issue: &RemoteIssue, plan: &mut Plan) {
        let issue_ref = IssueRef::Known(issue.number);
        let id = match issue.back_reference() {
            Some(id) => id,
            None => {
                let id = self.ids.generate_task_id();
                plan.push(Operation::UpdateRemote {
                    id: id.clone(),
                    issue: issue_ref,
                    patch: IssuePatch {
                        body: Some(with_back_reference(&issue.body, &id)),
                        ..IssuePatch::default()
                    },
                });
                id
            }
        };

        let mut record = TaskRecord::new(id.clone(), issue.title.clone(), self.config.default_section())
            .with_status(issue.status)
            .with_remote_ref(issue.number);
        record.labels = issue.labels.clone();
        record.milestone = issue.milestone.clone();

        let view = BoardView {
            on_board: issue.on_board,
            column: issue.board_column.as_deref(),
            section_moved: false,
        };
        let column = self.plan_board(&id, issue_ref, &record.section, &view, plan);

        plan.targets.insert(
            id,
            SnapshotEntry {
                fields: FieldValues::from_record(&record),
                column,
                remote_ref: Some(issue.number),
            },
        );
        plan.push(Operation::CreateLocal {
            record,
            issue: issue.number,
        });
    }

    /// Plan board membership and column placement; returns the column the
    /// issue ends up in.
    ///
    /// The column is only moved when the issue has none yet or the section
    /// moved since the last sync. A column the user picked on the board for
    /// an unchanged section is left where it is.
    fn plan_board(
        &self,
        id: &TaskId,
        issue: IssueRef,
        section: &str,
        view: &BoardView<'_>,
        plan: &mut Plan,
    ) -> Option<String> {
        let current = view.column.map(str::to_string);
        if !self.config.board_enabled() {
            return current;
        }
        if !view.on_board {
            plan.push(Operation::AddToBoard {
                id: id.clone(),
                issue,
            });
        }
        let Some(target) = self.columns.column_for(section) else {
            if view.section_moved {
                warn!("{id}: section {section} has no board column, not moving");
            }
            return current;
        };
        if view.column == Some(target) || !(view.section_moved || view.column.is_none()) {
            return current;
        }
        plan.push(Operation::MoveColumn {
            id: id.clone(),
            issue,
            column: target.to_string(),
        });
        Some(target.to_string())
    }
}

/// Local patch bringing `record` to `merged`, optionally linking `remote_ref`.
fn merged_patch(record: &TaskRecord, merged: &FieldValues, link: Option<IssueNumber>) -> RecordPatch {
    let mut patch = RecordPatch::default();
    if merged.title != record.title {
        patch.title = Some(merged.title.clone());
    }
    if merged.status != record.status {
        patch.status = Some(merged.status);
    }
    if merged.labels != record.labels {
        patch.labels = Some(merged.labels.clone());
    }
    if merged.section != record.section {
        patch.section = Some(merged.section.clone());
    }
    if merged.milestone != record.milestone {
        patch.milestone = Some(merged.milestone.clone());
    }
    if let Some(number) = link
        && record.remote_ref != Some(number)
    {
        patch.remote_ref = Some(number);
    }
    patch
}
