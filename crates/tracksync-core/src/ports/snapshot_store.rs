//! SnapshotStore port - 三者マージのベースの永続化
//!
//! スナップショットはプロセス再起動をまたいで残る必要があります。
//! 失うと two-way マージに劣化します（重複検出は back-reference で維持）。

use crate::domain::{Snapshot, SyncError};
use crate::ports::StagedWrite;

pub trait SnapshotStore: Send + Sync {
    /// Missing snapshot yields an empty one.
    fn load(&self) -> Result<Snapshot, SyncError>;

    fn stage(&self, snapshot: &Snapshot) -> Result<Box<dyn StagedWrite>, SyncError>;
}
