//! SyncReport - run の結果
//!
//! CLI はこれを JSON かテキストで出力します。`failures` が空でなければ
//! 終了コードは非ゼロ。

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::domain::{Classification, IssueNumber, TaskId};

/// One key whose operations did not all succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    /// Task id, or `orphan #N`.
    pub key: String,
    pub operation: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedIssue {
    pub id: TaskId,
    pub number: IssueNumber,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub dry_run: bool,
    pub classifications: BTreeMap<Classification, usize>,
    pub planned: usize,
    pub applied: usize,
    pub created: Vec<CreatedIssue>,
    pub pulled: Vec<TaskId>,
    pub failures: Vec<SyncFailure>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn count(&self, classification: Classification) -> usize {
        self.classifications.get(&classification).copied().unwrap_or(0)
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: Vec<String> = self
            .classifications
            .iter()
            .map(|(c, n)| format!("{c:?}={n}"))
            .collect();
        writeln!(f, "entities: {}", counts.join(" "))?;
        if self.dry_run {
            writeln!(f, "planned {} operations (dry run)", self.planned)?;
        } else {
            writeln!(f, "applied {}/{} operations", self.applied, self.planned)?;
        }
        for created in &self.created {
            writeln!(f, "created {} for {}", created.number, created.id)?;
        }
        for id in &self.pulled {
            writeln!(f, "pulled {id}")?;
        }
        for failure in &self.failures {
            writeln!(f, "FAILED {} ({}): {}", failure.key, failure.operation, failure.error)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_serializes_classifications_as_names() {
        let mut report = SyncReport::default();
        report.classifications.insert(Classification::NewLocal, 2);
        report.failures.push(SyncFailure {
            key: "T-1".into(),
            operation: "UPDATE_REMOTE".into(),
            error: "remote rejected request: 422".into(),
        });

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["classifications"]["NEW_LOCAL"], 2);
        assert!(!report.is_clean());
        assert_eq!(report.count(Classification::Unchanged), 0);
        assert!(report.to_string().contains("FAILED T-1"));
    }
}
