//! Errors - エラー型と分類
//!
//! `ErrorKind` は運用上の分類です。executor は kind を見て
//! 「リトライする / この id だけ失敗扱い / run 全体を止める」を決めます。

use std::path::PathBuf;

use thiserror::Error;

use super::change::Field;
use super::ids::{IssueNumber, TaskId};

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（backoff 付きでリトライ、尽きたら id 単位の失敗）
/// - Permanent: リモートが拒否（リトライ無意味、id 単位の失敗）
/// - Configuration: 設定不備（リモート呼び出し前に run を中止）
/// - Conflict: 解決ルールのないフィールド（fail closed）
/// - Local: ローカルストア・スナップショットの I/O
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Configuration,
    Conflict,
    Local,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("transient remote failure: {0}")]
    Transient(String),

    #[error("remote rejected request: {0}")]
    Permanent(String),

    #[error("configuration error in `{field}`: {reason}")]
    Configuration { field: String, reason: String },

    #[error("no resolution rule for field `{0}`")]
    ConflictUnresolvable(Field),

    #[error("refusing to create a second issue for {id}: {existing} already carries it")]
    Duplicate { id: TaskId, existing: IssueNumber },

    #[error("unknown task id {0}")]
    UnknownTask(TaskId),

    #[error("local store: {0}")]
    Store(String),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    pub fn config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Transient(_) => ErrorKind::Transient,
            SyncError::Permanent(_) | SyncError::Duplicate { .. } | SyncError::UnknownTask(_) => {
                ErrorKind::Permanent
            }
            SyncError::Configuration { .. } => ErrorKind::Configuration,
            SyncError::ConflictUnresolvable(_) => ErrorKind::Conflict,
            SyncError::Store(_) | SyncError::Io { .. } => ErrorKind::Local,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}
