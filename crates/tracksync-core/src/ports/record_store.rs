//! RecordStore port - ローカルの正本（tracker.md）
//!
//! load / save 以外の意味は要求しません。パースや整形は実装側の責務です。

use crate::domain::{SyncError, TaskRecord};

/// A prepared write that becomes visible only on `commit`.
///
/// Stores stage to a temp file and commit by rename, so a crash between stage
/// and commit leaves the previous contents intact.
pub trait StagedWrite: Send {
    fn commit(self: Box<Self>) -> Result<(), SyncError>;
}

/// RecordStore はタスクレコードの keyed collection
pub trait RecordStore: Send + Sync {
    /// Records in file order.
    fn load(&self) -> Result<Vec<TaskRecord>, SyncError>;

    /// Prepare `records` for writing without touching the live copy.
    fn stage(&self, records: &[TaskRecord]) -> Result<Box<dyn StagedWrite>, SyncError>;

    fn save(&self, records: &[TaskRecord]) -> Result<(), SyncError> {
        self.stage(records)?.commit()
    }
}
