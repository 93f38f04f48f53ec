//! Temp-file-and-rename writes shared by the file-backed stores.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::domain::SyncError;
use crate::ports::StagedWrite;

/// Contents written to a temp file next to `target`, renamed over it on commit.
#[derive(Debug)]
pub struct FileStage {
    temp: NamedTempFile,
    target: PathBuf,
}

impl FileStage {
    pub fn prepare(target: &Path, data: &[u8]) -> Result<Self, SyncError> {
        let dir = match target.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).map_err(|e| SyncError::io(dir, e))?;
        let mut temp = NamedTempFile::new_in(dir).map_err(|e| SyncError::io(dir, e))?;
        temp.write_all(data)
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|e| SyncError::io(temp.path(), e))?;
        Ok(Self {
            temp,
            target: target.to_path_buf(),
        })
    }
}

impl StagedWrite for FileStage {
    fn commit(self: Box<Self>) -> Result<(), SyncError> {
        let FileStage { temp, target } = *self;
        temp.persist(&target)
            .map_err(|e| SyncError::io(&target, e.error))?;
        Ok(())
    }
}

/// Nothing to write; the live copy is already current.
#[derive(Debug, Default)]
pub struct Unchanged;

impl StagedWrite for Unchanged {
    fn commit(self: Box<Self>) -> Result<(), SyncError> {
        Ok(())
    }
}
