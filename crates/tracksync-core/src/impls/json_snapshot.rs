//! JsonSnapshotStore - スナップショットの JSON ファイル

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::domain::snapshot::SNAPSHOT_VERSION;
use crate::domain::{Snapshot, SyncError};
use crate::ports::{SnapshotStore, StagedWrite};

use super::atomic::FileStage;

pub struct JsonSnapshotStore {
    path: PathBuf,
}

impl JsonSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for JsonSnapshotStore {
    fn load(&self) -> Result<Snapshot, SyncError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "no snapshot at {}, falling back to two-way comparison",
                    self.path.display()
                );
                return Ok(Snapshot::default());
            }
            Err(e) => return Err(SyncError::io(&self.path, e)),
        };
        let snapshot: Snapshot = serde_json::from_str(&text)
            .map_err(|e| SyncError::Store(format!("{}: {e}", self.path.display())))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SyncError::Store(format!(
                "{}: snapshot version {} is not supported (expected {SNAPSHOT_VERSION})",
                self.path.display(),
                snapshot.version
            )));
        }
        Ok(snapshot)
    }

    fn stage(&self, snapshot: &Snapshot) -> Result<Box<dyn StagedWrite>, SyncError> {
        let mut data = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| SyncError::Store(format!("snapshot encoding: {e}")))?;
        data.push(b'\n');
        Ok(Box::new(FileStage::prepare(&self.path, &data)?))
    }
}
