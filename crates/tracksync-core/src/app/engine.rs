//! SyncEngine - 1 回の同期 run
//!
//! # フロー
//! 1. ローカルのレコードを読み込み、検証（id 重複・未設定セクション）
//! 2. スナップショットを読み込み
//! 3. リモートの issue を一覧（ここで初めてリモートに触れる）
//! 4. Detector → Resolver → Planner（純粋・同期）
//! 5. Executor で計画を実行
//! 6. レコードとスナップショットを stage してから commit（flush）
//!
//! 1〜4 のどこで失敗しても、ローカルにもリモートにも変更は一切残りません。

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::domain::{Plan, RecordSet, Snapshot, SyncError};
use crate::ports::{IdGenerator, RecordStore, RemoteGateway, SnapshotStore};

use super::builder::SyncEngineBuilder;
use super::detector::{Detection, Detector};
use super::executor::{Execution, Executor};
use super::planner::Planner;
use super::report::SyncReport;
use super::resolver::{PolicyTable, Resolver};
use super::retry::RetryPolicy;

pub struct SyncEngine {
    pub(super) config: Config,
    pub(super) records: Arc<dyn RecordStore>,
    pub(super) snapshots: Arc<dyn SnapshotStore>,
    pub(super) gateway: Arc<dyn RemoteGateway>,
    pub(super) ids: Arc<dyn IdGenerator>,
    pub(super) policy: PolicyTable,
    pub(super) retry: RetryPolicy,
}

/// Everything computed before the first mutation.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub records: RecordSet,
    pub snapshot: Snapshot,
    pub detection: Detection,
    pub plan: Plan,
}

impl SyncEngine {
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::new()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Load both sides and compute the plan without mutating anything.
    pub async fn prepare(&self) -> Result<Prepared, SyncError> {
        let records = RecordSet::from_records(self.records.load()?)?;
        self.validate_records(&records)?;
        let snapshot = self.snapshots.load()?;
        info!(
            "loaded {} local records, {} snapshot entries",
            records.len(),
            snapshot.len()
        );

        let gateway = self.gateway.as_ref();
        let issues = self.retry.run("list issues", || gateway.list_issues()).await?;
        info!("listed {} remote issues", issues.len());

        let detection = Detector::new(&self.config).detect(records.as_slice(), &issues, &snapshot);
        let resolver = Resolver::new(self.policy.clone());
        let mut resolutions = BTreeMap::new();
        for entity in &detection.entities {
            resolutions.insert(entity.id().clone(), resolver.resolve(entity)?);
        }
        let plan = Planner::new(&self.config, self.ids.as_ref()).plan(&detection, &resolutions);
        info!(
            "{} entities, {} orphans, {} planned operations",
            detection.entities.len(),
            detection.orphans.len(),
            plan.len()
        );

        Ok(Prepared {
            records,
            snapshot,
            detection,
            plan,
        })
    }

    pub async fn plan(&self) -> Result<Plan, SyncError> {
        Ok(self.prepare().await?.plan)
    }

    /// Classification counts and plan size; nothing is changed.
    pub async fn status(&self) -> Result<SyncReport, SyncError> {
        self.run(true).await
    }

    /// One reconciliation run. Per-id failures are reported, not returned as
    /// errors; an `Err` means nothing was applied (or, for a flush error,
    /// that neither file was replaced).
    pub async fn run(&self, dry_run: bool) -> Result<SyncReport, SyncError> {
        let prepared = self.prepare().await?;
        let mut report = SyncReport {
            dry_run,
            classifications: prepared.detection.counts(),
            planned: prepared.plan.len(),
            ..SyncReport::default()
        };
        if dry_run {
            return Ok(report);
        }

        let executor = Executor::new(
            Arc::clone(&self.gateway),
            self.retry.clone(),
            self.config.concurrency,
        );
        let execution = executor
            .execute(prepared.plan, prepared.records, &prepared.snapshot)
            .await;
        self.flush(&execution, &prepared.snapshot)?;

        if !execution.failures.is_empty() {
            warn!(
                "{} ids failed and will be retried next run",
                execution.failures.len()
            );
        }
        report.applied = execution.applied;
        report.created = execution.created;
        report.pulled = execution.pulled;
        report.failures = execution.failures;
        info!("applied {}/{} operations", report.applied, report.planned);
        Ok(report)
    }

    fn validate_records(&self, records: &RecordSet) -> Result<(), SyncError> {
        for record in records.iter() {
            if !self.config.is_known_section(&record.section) {
                return Err(SyncError::config(
                    "sections",
                    format!(
                        "task {} is in section `{}`, which is not configured",
                        record.id, record.section
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Stage both files, then commit both. A staging failure leaves both untouched.
    fn flush(&self, execution: &Execution, previous: &Snapshot) -> Result<(), SyncError> {
        let records = self.records.stage(execution.records.as_slice())?;
        let snapshot = if execution.snapshot != *previous {
            Some(self.snapshots.stage(&execution.snapshot)?)
        } else {
            None
        };
        records.commit()?;
        if let Some(snapshot) = snapshot {
            snapshot.commit()?;
        }
        Ok(())
    }
}
