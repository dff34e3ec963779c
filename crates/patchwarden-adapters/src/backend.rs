use crate::git_ops::GitWorkspace;
use crate::lease::{FileLease, APPLY_LOCK_TIMEOUT_SECS};
use crate::store::{FileLockStore, FileSnapshotStore};
use patchwarden_core::{
    LockStore, SnapshotStore, StoreError, VcsError, WorkspaceBackend, WorkspaceLease,
    WorkspacePorts,
};
use std::path::Path;
use std::time::Duration;

/// Local git repositories with state kept under `.patchwarden/`.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    lease_timeout: Duration,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(APPLY_LOCK_TIMEOUT_SECS),
        }
    }
}

impl LocalBackend {
    pub fn with_lease_timeout(lease_timeout: Duration) -> Self {
        Self { lease_timeout }
    }
}

impl WorkspaceBackend for LocalBackend {
    fn open(&self, workspace: &Path) -> Result<WorkspacePorts, VcsError> {
        let git = GitWorkspace::open(workspace).map_err(|e| VcsError::Backend(format!("{:#}", e)))?;
        Ok(WorkspacePorts {
            vcs: Box::new(git),
            locks: self.locks(workspace),
            snapshots: self.snapshots(workspace),
        })
    }

    fn lease(&self, workspace: &Path) -> Result<Box<dyn WorkspaceLease>, StoreError> {
        let lease = FileLease::acquire_with_timeout(workspace, self.lease_timeout)?;
        Ok(Box::new(lease))
    }

    fn snapshots(&self, workspace: &Path) -> Box<dyn SnapshotStore> {
        Box::new(FileSnapshotStore::new(workspace))
    }

    fn locks(&self, workspace: &Path) -> Box<dyn LockStore> {
        Box::new(FileLockStore::new(workspace))
    }
}
