//! Domain identifiers (strongly-typed IDs).
//!
//! - `TaskId`: ローカルのタスク ID（tracker.md の `id:`）。一度割り当てたら変えない。
//! - `IssueNumber`: リモート側が採番する issue 番号。作成後は不変。
//!
//! 2 つは別の型なので混同できません（`TaskId` を issue 番号として渡すとコンパイルエラー）。

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable local identifier of a task record.
///
/// This is the sole join key between the local store and the remote tracker.
/// It is never derived from title text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Number assigned to an issue by the remote tracker.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IssueNumber(u64);

impl IssueNumber {
    pub fn new(n: u64) -> Self {
        Self(n)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for IssueNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
