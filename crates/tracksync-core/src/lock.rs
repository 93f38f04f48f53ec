//! Run-level lock file.
//!
//! Two sync runs must never overlap: both would plan against the same
//! snapshot and race on the flush. The lock is a file created with
//! `create_new`, holding the owner's pid and start time, removed on release
//! or drop.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMeta {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another sync run holds {path:?} (pid {pid:?})", pid = .meta.as_ref().map(|m| m.pid))]
    Held {
        path: PathBuf,
        meta: Option<LockMeta>,
    },
    #[error("lock file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    meta: LockMeta,
    released: bool,
}

impl RunLock {
    pub fn acquire(path: &Path, now: DateTime<Utc>) -> Result<Self, LockError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| LockError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(LockError::Held {
                    path: path.to_path_buf(),
                    meta: read_meta(path),
                });
            }
            Err(source) => {
                return Err(LockError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let meta = LockMeta {
            pid: std::process::id(),
            started_at: now,
        };
        write_meta(&mut file, &meta).map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            meta,
            released: false,
        })
    }

    pub fn meta(&self) -> &LockMeta {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> Result<(), LockError> {
        if !self.released {
            self.released = true;
            fs::remove_file(&self.path).map_err(|source| LockError::Io {
                path: self.path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn write_meta(file: &mut File, meta: &LockMeta) -> io::Result<()> {
    let data = serde_json::to_vec(meta).map_err(io::Error::other)?;
    file.write_all(&data)?;
    file.sync_all()
}

fn read_meta(path: &Path) -> Option<LockMeta> {
    let text = fs::read_to_string(path).ok()?;
    serde_json::from_str(&text).ok()
}
