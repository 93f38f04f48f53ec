//! Executor - 計画の実行
//!
//! # フロー
//! 1. `Plan::groups()` で id ごとに操作をまとめる
//! 2. グループ単位で JoinSet に spawn（Semaphore で同時実行数を制限）
//! 3. グループ内は計画順に逐次実行。remote 呼び出しは RetryPolicy 経由
//! 4. 最初の失敗でそのグループは打ち切り、失敗として記録
//! 5. 全操作が成功した id だけスナップショットを進める
//!
//! ローカルの RecordSet はメモリ上で更新するだけで、書き出しは engine の
//! flush が一度だけ行います。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::domain::{
    IssueDraft, IssueNumber, IssueRef, OpKey, Operation, Plan, RecordSet, Snapshot, SyncError,
    TaskId,
};
use crate::ports::RemoteGateway;

use super::report::{CreatedIssue, SyncFailure};
use super::retry::RetryPolicy;

/// Everything the executor produced, ready for the flush.
#[derive(Debug, Clone, Default)]
pub struct Execution {
    pub records: RecordSet,
    pub snapshot: Snapshot,
    pub applied: usize,
    pub created: Vec<CreatedIssue>,
    pub pulled: Vec<TaskId>,
    pub failures: Vec<SyncFailure>,
}

impl Execution {
    pub fn failed_keys(&self) -> BTreeSet<&str> {
        self.failures.iter().map(|f| f.key.as_str()).collect()
    }
}

/// Result of one key's operation group.
#[derive(Debug)]
struct GroupOutcome {
    key: OpKey,
    applied: usize,
    created: Option<IssueNumber>,
    pulled: Option<TaskId>,
    failure: Option<SyncFailure>,
}

/// State shared by every spawned group.
struct Worker {
    gateway: Arc<dyn RemoteGateway>,
    retry: RetryPolicy,
    records: Mutex<RecordSet>,
    claimed: BTreeMap<TaskId, IssueNumber>,
}

pub struct Executor {
    gateway: Arc<dyn RemoteGateway>,
    retry: RetryPolicy,
    concurrency: usize,
}

impl Executor {
    pub fn new(gateway: Arc<dyn RemoteGateway>, retry: RetryPolicy, concurrency: usize) -> Self {
        Self {
            gateway,
            retry,
            concurrency: concurrency.max(1),
        }
    }

    /// Apply `plan` on top of `records`. `previous` is the snapshot loaded at
    /// the start of the run; entries of failed ids are carried over unchanged.
    pub async fn execute(&self, plan: Plan, records: RecordSet, previous: &Snapshot) -> Execution {
        let groups = plan.groups();
        let planned_keys: BTreeSet<OpKey> = groups.iter().map(|(key, _)| key.clone()).collect();
        let worker = Arc::new(Worker {
            gateway: Arc::clone(&self.gateway),
            retry: self.retry.clone(),
            records: Mutex::new(records),
            claimed: plan.claimed.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        let mut join_set: JoinSet<GroupOutcome> = JoinSet::new();
        for (key, ops) in groups {
            let worker = Arc::clone(&worker);
            let semaphore = Arc::clone(&semaphore);
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                worker.run_group(key, ops).await
            });
        }

        let mut outcomes = Vec::new();
        let mut failures = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    error!("operation group aborted: {err}");
                    failures.push(SyncFailure {
                        key: "(unknown)".to_string(),
                        operation: "(task)".to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }
        outcomes.sort_by(|a, b| a.key.cmp(&b.key));

        let mut execution = Execution {
            snapshot: previous.clone(),
            ..Execution::default()
        };
        let mut finished: BTreeMap<TaskId, Option<IssueNumber>> = BTreeMap::new();
        for outcome in outcomes {
            execution.applied += outcome.applied;
            if let (OpKey::Task(id), Some(number)) = (&outcome.key, outcome.created) {
                execution.created.push(CreatedIssue {
                    id: id.clone(),
                    number,
                });
            }
            execution.pulled.extend(outcome.pulled);
            match outcome.failure {
                Some(failure) => failures.push(failure),
                None => {
                    if let OpKey::Task(id) = outcome.key {
                        finished.insert(id, outcome.created);
                    }
                }
            }
        }

        for (id, target) in &plan.targets {
            let created = match finished.get(id) {
                Some(created) => *created,
                // Ids without operations are already converged.
                None if !planned_keys.contains(&OpKey::Task(id.clone())) => None,
                None => continue,
            };
            let mut entry = target.clone();
            if entry.remote_ref.is_none() {
                entry.remote_ref = created;
            }
            execution.snapshot.insert(id.clone(), entry);
        }

        execution.records = match Arc::try_unwrap(worker) {
            Ok(worker) => worker.records.into_inner(),
            Err(shared) => shared.records.lock().await.clone(),
        };
        execution.failures = failures;
        execution
    }
}

impl Worker {
    async fn run_group(&self, key: OpKey, ops: Vec<Operation>) -> GroupOutcome {
        let mut outcome = GroupOutcome {
            key,
            applied: 0,
            created: None,
            pulled: None,
            failure: None,
        };
        for op in ops {
            debug!("{}: {}", outcome.key, op.name());
            match self.apply(&op, &mut outcome).await {
                Ok(()) => outcome.applied += 1,
                Err(err) => {
                    warn!("{}: {} failed: {err}", outcome.key, op.name());
                    outcome.failure = Some(SyncFailure {
                        key: outcome.key.to_string(),
                        operation: op.name().to_string(),
                        error: err.to_string(),
                    });
                    break;
                }
            }
        }
        outcome
    }

    async fn apply(&self, op: &Operation, outcome: &mut GroupOutcome) -> Result<(), SyncError> {
        let gateway = self.gateway.as_ref();
        let label = format!("{} {}", outcome.key, op.name());
        match op {
            Operation::CreateRemote { id, draft } => {
                if let Some(existing) = self.claimed.get(id) {
                    return Err(SyncError::Duplicate {
                        id: id.clone(),
                        existing: *existing,
                    });
                }
                let number = self.create_once(id, draft).await?;
                info!("{id}: created issue {number}");
                outcome.created = Some(number);
                if let Some(record) = self.records.lock().await.get_mut(id) {
                    record.remote_ref = Some(number);
                }
            }
            Operation::UpdateRemote { id, issue, patch } => {
                let number = resolve(id, *issue, outcome.created)?;
                self.retry
                    .run(&label, || gateway.update_issue(number, patch))
                    .await?;
            }
            Operation::CloseRemote { id, issue } => {
                let number = resolve(id, *issue, outcome.created)?;
                self.retry.run(&label, || gateway.close_issue(number)).await?;
            }
            Operation::ReopenRemote { id, issue } => {
                let number = resolve(id, *issue, outcome.created)?;
                self.retry.run(&label, || gateway.reopen_issue(number)).await?;
            }
            Operation::AddToBoard { id, issue } => {
                let number = resolve(id, *issue, outcome.created)?;
                self.retry.run(&label, || gateway.add_to_board(number)).await?;
            }
            Operation::MoveColumn { id, issue, column } => {
                let number = resolve(id, *issue, outcome.created)?;
                self.retry
                    .run(&label, || gateway.move_column(number, column))
                    .await?;
            }
            Operation::UpdateLocal { id, patch } => {
                let mut records = self.records.lock().await;
                let record = records
                    .get_mut(id)
                    .ok_or_else(|| SyncError::UnknownTask(id.clone()))?;
                patch.apply(record);
            }
            Operation::CreateLocal { record, issue } => {
                self.records.lock().await.insert(record.clone())?;
                info!("pulled issue {issue} as {}", record.id);
                outcome.pulled = Some(record.id.clone());
            }
            Operation::CloseRemoteOrphan { issue } => {
                let number = *issue;
                self.retry.run(&label, || gateway.close_issue(number)).await?;
            }
        }
        Ok(())
    }

    /// Create the issue, never twice.
    ///
    /// A transient failure may still have created the issue, so every retry
    /// first looks for an issue already carrying the back-reference and adopts it.
    async fn create_once(
        &self,
        id: &TaskId,
        draft: &IssueDraft,
    ) -> Result<IssueNumber, SyncError> {
        let gateway = self.gateway.as_ref();
        let attempted = AtomicBool::new(false);
        let attempted = &attempted;
        let label = format!("{id} CREATE_REMOTE");
        self.retry
            .run(&label, || async move {
                if attempted.swap(true, Ordering::SeqCst) {
                    let issues = gateway.list_issues().await?;
                    if let Some(existing) = issues
                        .iter()
                        .filter(|issue| issue.back_reference().as_ref() == Some(id))
                        .map(|issue| issue.number)
                        .min()
                    {
                        warn!("{id}: adopting issue {existing} left by an earlier attempt");
                        return Ok(existing);
                    }
                }
                gateway.create_issue(draft).await
            })
            .await
    }
}

fn resolve(id: &TaskId, issue: IssueRef, created: Option<IssueNumber>) -> Result<IssueNumber, SyncError> {
    match issue {
        IssueRef::Known(number) => Ok(number),
        IssueRef::Created => created.ok_or_else(|| {
            SyncError::Permanent(format!("{id}: operation refers to an issue that was never created"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        FieldValues, IssuePatch, LabelSet, RecordPatch, RemoteIssue, SnapshotEntry, Status,
        TaskRecord,
    };
    use crate::domain::record::back_reference_marker;
    use crate::impls::InMemoryGateway;

    fn draft(id: &TaskId, title: &str) -> IssueDraft {
        IssueDraft {
            title: title.into(),
            labels: LabelSet::new(),
            milestone: None,
            body: back_reference_marker(id),
        }
    }

    fn target(record: &TaskRecord) -> SnapshotEntry {
        SnapshotEntry {
            fields: FieldValues::from_record(record),
            column: None,
            remote_ref: None,
        }
    }

    fn executor(gateway: &Arc<InMemoryGateway>) -> Executor {
        Executor::new(gateway.clone(), RetryPolicy::immediate(3), 2)
    }

    #[tokio::test]
    async fn created_number_flows_into_later_operations() {
        let gateway = Arc::new(InMemoryGateway::with_board());
        let record = TaskRecord::new(TaskId::new("T-1"), "a", "TODO");
        let id = record.id.clone();
        let mut plan = Plan::default();
        plan.push(Operation::CreateRemote { id: id.clone(), draft: draft(&id, "a") });
        plan.push(Operation::CloseRemote { id: id.clone(), issue: IssueRef::Created });
        plan.push(Operation::AddToBoard { id: id.clone(), issue: IssueRef::Created });
        plan.push(Operation::MoveColumn { id: id.clone(), issue: IssueRef::Created, column: "Done".into() });
        plan.targets.insert(id.clone(), target(&record));

        let records = RecordSet::from_records(vec![record]).unwrap();
        let execution = executor(&gateway).execute(plan, records, &Snapshot::default()).await;

        assert!(execution.failures.is_empty());
        assert_eq!(execution.applied, 4);
        let number = execution.created[0].number;
        assert_eq!(execution.records.get(&id).unwrap().remote_ref, Some(number));
        assert_eq!(execution.snapshot.get(&id).unwrap().remote_ref, Some(number));

        let issue = gateway.issue(number).unwrap();
        assert_eq!(issue.status, Status::Closed);
        assert_eq!(issue.board_column.as_deref(), Some("Done"));
    }

    #[tokio::test]
    async fn failure_keeps_the_old_snapshot_entry_and_spares_other_ids() {
        let gateway = Arc::new(InMemoryGateway::new());
        let a = gateway.seed(RemoteIssue::new(IssueNumber::new(1), "a"));
        let b = gateway.seed(RemoteIssue::new(IssueNumber::new(2), "b"));
        gateway.fail_mutations_of(b);

        let ra = TaskRecord::new(TaskId::new("A"), "a2", "TODO").with_remote_ref(a);
        let rb = TaskRecord::new(TaskId::new("B"), "b2", "TODO").with_remote_ref(b);
        let old_b = SnapshotEntry {
            fields: FieldValues::from_record(&TaskRecord::new(TaskId::new("B"), "b", "TODO")),
            column: None,
            remote_ref: Some(b),
        };
        let mut previous = Snapshot::default();
        previous.insert(rb.id.clone(), old_b.clone());

        let mut plan = Plan::default();
        for (record, number) in [(&ra, a), (&rb, b)] {
            plan.push(Operation::UpdateRemote {
                id: record.id.clone(),
                issue: IssueRef::Known(number),
                patch: IssuePatch { title: Some(record.title.clone()), ..IssuePatch::default() },
            });
            plan.push(Operation::UpdateLocal {
                id: record.id.clone(),
                patch: RecordPatch { status: Some(Status::Closed), ..RecordPatch::default() },
            });
            plan.targets.insert(record.id.clone(), target(record));
        }

        let records = RecordSet::from_records(vec![ra.clone(), rb.clone()]).unwrap();
        let execution = executor(&gateway).execute(plan, records, &previous).await;

        assert_eq!(execution.failed_keys(), BTreeSet::from(["B"]));
        assert_eq!(execution.failures[0].operation, "UPDATE_REMOTE");
        assert_eq!(execution.snapshot.get(&rb.id), Some(&old_b));
        assert!(execution.snapshot.get(&ra.id).is_some());
        assert_eq!(gateway.issue(a).unwrap().title, "a2");
        // The failed group stopped before its local update.
        assert_eq!(execution.records.get(&rb.id).unwrap().status, Status::Open);
        assert_eq!(execution.records.get(&ra.id).unwrap().status, Status::Closed);
    }

    #[tokio::test]
    async fn claimed_ids_are_never_created_again() {
        let gateway = Arc::new(InMemoryGateway::new());
        let id = TaskId::new("T-1");
        let mut plan = Plan::default();
        plan.push(Operation::CreateRemote { id: id.clone(), draft: draft(&id, "a") });
        plan.claimed.insert(id.clone(), IssueNumber::new(3));

        let execution = executor(&gateway).execute(plan, RecordSet::default(), &Snapshot::default()).await;
        assert!(execution.failures[0].error.contains("second issue"));
        assert!(gateway.issues().is_empty());
    }

    #[tokio::test]
    async fn transient_create_failure_adopts_the_created_issue() {
        let gateway = Arc::new(InMemoryGateway::new());
        gateway.lose_create_responses(1);
        let id = TaskId::new("T-1");
        let mut plan = Plan::default();
        plan.push(Operation::CreateRemote { id: id.clone(), draft: draft(&id, "a") });

        let execution = executor(&gateway).execute(plan, RecordSet::default(), &Snapshot::default()).await;
        assert!(execution.failures.is_empty());
        assert_eq!(gateway.issues().len(), 1);
        assert_eq!(execution.created[0].number, gateway.issues()[0].number);
    }

    #[tokio::test]
    async fn pulled_records_join_the_store() {
        let gateway = Arc::new(InMemoryGateway::new());
        let number = gateway.seed(RemoteIssue::new(IssueNumber::new(5), "orphan"));
        let record = TaskRecord::new(TaskId::new("P-1"), "orphan", "TODO").with_remote_ref(number);
        let mut plan = Plan::default();
        plan.push(Operation::CreateLocal { record: record.clone(), issue: number });
        plan.targets.insert(record.id.clone(), target(&record));

        let execution = executor(&gateway).execute(plan, RecordSet::default(), &Snapshot::default()).await;
        assert_eq!(execution.pulled, vec![record.id.clone()]);
        assert_eq!(execution.records.get(&record.id), Some(&record));
    }
}
