use crate::util::{ensure_state_dir, state_dir};
use fs2::FileExt;
use patchwarden_core::{StoreError, WorkspaceLease};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

pub const APPLY_LOCK_TIMEOUT_SECS: u64 = 5;
const APPLY_LOCK_RETRY_MS: u64 = 50;
const APPLY_LOCK_FILE: &str = "apply.lock";

/// Advisory file lock serializing apply runs across processes.
///
/// Released when dropped. This is separate from the rollback lock: the
/// lease only lives for one run, the rollback lock persists until an
/// operator clears it.
#[derive(Debug)]
pub struct FileLease {
    file: File,
    path: PathBuf,
}

impl FileLease {
    pub fn acquire(workspace: &Path) -> Result<Self, StoreError> {
        Self::acquire_with_timeout(workspace, Duration::from_secs(APPLY_LOCK_TIMEOUT_SECS))
    }

    pub fn acquire_with_timeout(workspace: &Path, timeout: Duration) -> Result<Self, StoreError> {
        let path = state_dir(workspace).join(APPLY_LOCK_FILE);
        ensure_state_dir(workspace).map_err(|e| StoreError::Io {
            path: path.clone(),
            source: std::io::Error::new(ErrorKind::Other, format!("{:#}", e)),
        })?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(StoreError::Io { path, source: err });
                    }
                    if start.elapsed() >= timeout {
                        return Err(StoreError::Busy {
                            path,
                            waited_secs: timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(APPLY_LOCK_RETRY_MS));
                }
            }
        }

        debug!(path = %path.display(), "apply lease acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl WorkspaceLease for FileLease {}

impl Drop for FileLease {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
