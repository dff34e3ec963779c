//! File-backed persistence under `<workspace>/.patchwarden/`.
//!
//! - `locks/rollback.lock`: the rollout lock. Existence of the path is the
//!   lock; the JSON body is informational.
//! - `circuit.json`: circuit breaker snapshot.

use crate::util::{ensure_state_dir, state_dir, write_atomic};
use patchwarden_core::{BreakerSnapshot, ExistingLock, LockStore, RolloutLock, SnapshotStore, StoreError};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const LOCKS_DIR: &str = "locks";
const ROLLBACK_LOCK_FILE: &str = "rollback.lock";
const CIRCUIT_FILE: &str = "circuit.json";

pub fn rollback_lock_path(workspace: &Path) -> PathBuf {
    state_dir(workspace).join(LOCKS_DIR).join(ROLLBACK_LOCK_FILE)
}

pub fn circuit_snapshot_path(workspace: &Path) -> PathBuf {
    state_dir(workspace).join(CIRCUIT_FILE)
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn prepare(workspace: &Path, path: &Path) -> Result<(), StoreError> {
    ensure_state_dir(workspace).map_err(|e| {
        io_error(
            path,
            std::io::Error::new(ErrorKind::Other, format!("{:#}", e)),
        )
    })?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct FileLockStore {
    workspace: PathBuf,
    path: PathBuf,
}

impl FileLockStore {
    pub fn new(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            path: rollback_lock_path(workspace),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LockStore for FileLockStore {
    fn current(&self) -> Result<Option<ExistingLock>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                // A directory or unreadable entry at the path still locks.
                if self.path.exists() {
                    return Ok(Some(ExistingLock {
                        path: self.path.clone(),
                        record: None,
                    }));
                }
                return Ok(None);
            }
            Err(_) if self.path.exists() => {
                return Ok(Some(ExistingLock {
                    path: self.path.clone(),
                    record: None,
                }));
            }
            Err(err) => return Err(io_error(&self.path, err)),
        };

        let record = match serde_json::from_str::<RolloutLock>(&content) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "rollback lock is unreadable; treating workspace as locked");
                None
            }
        };
        Ok(Some(ExistingLock {
            path: self.path.clone(),
            record,
        }))
    }

    fn write(&self, lock: &RolloutLock) -> Result<PathBuf, StoreError> {
        prepare(&self.workspace, &self.path)?;
        let content = serde_json::to_string_pretty(lock).map_err(|source| StoreError::Encode {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &content).map_err(|e| io_error(&self.path, e))?;
        info!(path = %self.path.display(), head_before = %lock.head_before.short(), "rollback lock written");
        Ok(self.path.clone())
    }

    fn clear(&self) -> Result<Option<ExistingLock>, StoreError> {
        let existing = self.current()?;
        if existing.is_none() {
            return Ok(None);
        }
        let removed = if self.path.is_dir() {
            fs::remove_dir_all(&self.path)
        } else {
            fs::remove_file(&self.path)
        };
        match removed {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(io_error(&self.path, err)),
        }
        info!(path = %self.path.display(), "rollback lock cleared");
        Ok(existing)
    }
}

#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    workspace: PathBuf,
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
            path: circuit_snapshot_path(workspace),
        }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> Result<Option<BreakerSnapshot>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&self.path, err)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                path: self.path.clone(),
                detail: e.to_string(),
            })
    }

    fn save(&self, snapshot: &BreakerSnapshot) -> Result<(), StoreError> {
        prepare(&self.workspace, &self.path)?;
        let content = serde_json::to_string(snapshot).map_err(|source| StoreError::Encode {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &content).map_err(|e| io_error(&self.path, e))
    }
}
