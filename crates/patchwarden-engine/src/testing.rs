//! In-memory ports for exercising the rollout and warden without a repository.

use patchwarden_core::{
    BreakerSnapshot, CommitId, ExistingLock, ExitStatus, LockStore, RolloutLock, SandboxError,
    SandboxOutput, SandboxRequest, SandboxRunner, SnapshotStore, StoreError, VcsError,
    VersionControl, WorkspaceBackend, WorkspaceLease, WorkspacePorts,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct RepoState {
    /// Commit ids, oldest first. The last one is HEAD.
    pub commits: Vec<String>,
    pub reject_check: bool,
    pub reject_apply: bool,
    pub fail_revert: bool,
    pub calls: Vec<String>,
    /// Patch text of every successful apply.
    pub applied: Vec<String>,
}

impl RepoState {
    pub fn head(&self) -> String {
        self.commits.last().cloned().unwrap_or_default()
    }
}

/// Records the same transitions a git repository would go through.
#[derive(Debug, Clone)]
pub struct FakeVcs {
    pub state: Arc<Mutex<RepoState>>,
}

impl FakeVcs {
    pub fn new() -> Self {
        let state = RepoState {
            commits: vec!["base000000".to_string()],
            ..RepoState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn head(&self) -> String {
        self.state.lock().unwrap().head()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn applied(&self) -> Vec<String> {
        self.state.lock().unwrap().applied.clone()
    }
}

impl VersionControl for FakeVcs {
    fn current_head(&self) -> Result<CommitId, VcsError> {
        Ok(CommitId::new(self.head()))
    }

    fn check_apply(&self, _patch: &str) -> Result<(), VcsError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("check".to_string());
        if state.reject_check {
            return Err(VcsError::PatchRejected("error: patch failed: src/app.ts:1".to_string()));
        }
        Ok(())
    }

    fn apply(&mut self, patch: &str) -> Result<(), VcsError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("apply".to_string());
        if state.reject_apply {
            return Err(VcsError::PatchRejected("index mismatch".to_string()));
        }
        state.applied.push(patch.to_string());
        Ok(())
    }

    fn commit(&mut self, _message: &str) -> Result<CommitId, VcsError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push("commit".to_string());
        let id = format!("commit{:04}", state.commits.len());
        state.commits.push(id.clone());
        Ok(CommitId::new(id))
    }

    fn revert(&mut self, commit: &CommitId, _message: &str) -> Result<CommitId, VcsError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("revert {}", commit));
        if state.fail_revert {
            return Err(VcsError::RevertConflict {
                commit: commit.clone(),
            });
        }
        let id = format!("revert{:04}", state.commits.len());
        state.commits.push(id.clone());
        Ok(CommitId::new(id))
    }
}

#[derive(Debug, Clone)]
pub enum Script {
    Exit { code: i32, stdout: String },
    TimedOut(u64),
    LaunchError,
}

impl Script {
    pub fn ok() -> Self {
        Script::Exit {
            code: 0,
            stdout: String::new(),
        }
    }

    pub fn exit(code: i32, stdout: &str) -> Self {
        Script::Exit {
            code,
            stdout: stdout.to_string(),
        }
    }
}

/// Answers each command by its display string; unknown commands succeed.
#[derive(Debug, Default)]
pub struct ScriptedSandbox {
    scripts: HashMap<String, Script>,
    pub invocations: Mutex<Vec<SandboxRequest>>,
}

impl ScriptedSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, command: &str, script: Script) -> Self {
        self.scripts.insert(command.to_string(), script);
        self
    }

    pub fn invoked(&self) -> Vec<String> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.command.to_string())
            .collect()
    }
}

impl SandboxRunner for ScriptedSandbox {
    fn run(&self, request: &SandboxRequest) -> Result<SandboxOutput, SandboxError> {
        self.invocations.lock().unwrap().push(request.clone());
        let script = self
            .scripts
            .get(&request.command.to_string())
            .cloned()
            .unwrap_or_else(Script::ok);
        let (status, stdout_tail) = match script {
            Script::Exit { code, stdout } => (ExitStatus::Exited { code }, stdout),
            Script::TimedOut(after_secs) => (ExitStatus::TimedOut { after_secs }, String::new()),
            Script::LaunchError => {
                return Err(SandboxError::Launch {
                    program: request.command.to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                })
            }
        };
        Ok(SandboxOutput {
            status,
            stdout_tail,
            stderr_tail: String::new(),
            duration: Duration::from_millis(5),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLockStore {
    pub lock: Arc<Mutex<Option<RolloutLock>>>,
    pub fail_writes: bool,
}

pub const MEMORY_LOCK_PATH: &str = "/mem/.patchwarden/locks/rollback.lock";

impl LockStore for MemoryLockStore {
    fn current(&self) -> Result<Option<ExistingLock>, StoreError> {
        Ok(self.lock.lock().unwrap().clone().map(|record| ExistingLock {
            path: PathBuf::from(MEMORY_LOCK_PATH),
            record: Some(record),
        }))
    }

    fn write(&self, lock: &RolloutLock) -> Result<PathBuf, StoreError> {
        if self.fail_writes {
            return Err(StoreError::Io {
                path: PathBuf::from(MEMORY_LOCK_PATH),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            });
        }
        *self.lock.lock().unwrap() = Some(lock.clone());
        Ok(PathBuf::from(MEMORY_LOCK_PATH))
    }

    fn clear(&self) -> Result<Option<ExistingLock>, StoreError> {
        let previous = self.current()?;
        *self.lock.lock().unwrap() = None;
        Ok(previous)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemorySnapshotStore {
    pub snapshot: Arc<Mutex<Option<BreakerSnapshot>>>,
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Result<Option<BreakerSnapshot>, StoreError> {
        Ok(self.snapshot.lock().unwrap().clone())
    }

    fn save(&self, snapshot: &BreakerSnapshot) -> Result<(), StoreError> {
        *self.snapshot.lock().unwrap() = Some(snapshot.clone());
        Ok(())
    }
}

struct NoopLease;

impl WorkspaceLease for NoopLease {}

/// One fake workspace; every `open` shares its state.
#[derive(Debug, Clone)]
pub struct FakeBackend {
    pub vcs: FakeVcs,
    pub locks: MemoryLockStore,
    pub snapshots: MemorySnapshotStore,
    pub opens: Arc<Mutex<usize>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self {
            vcs: FakeVcs::new(),
            locks: MemoryLockStore::default(),
            snapshots: MemorySnapshotStore::default(),
            opens: Arc::new(Mutex::new(0)),
        }
    }

    pub fn open_count(&self) -> usize {
        *self.opens.lock().unwrap()
    }
}

impl WorkspaceBackend for FakeBackend {
    fn open(&self, _workspace: &Path) -> Result<WorkspacePorts, VcsError> {
        *self.opens.lock().unwrap() += 1;
        Ok(WorkspacePorts {
            vcs: Box::new(self.vcs.clone()),
            locks: Box::new(self.locks.clone()),
            snapshots: Box::new(self.snapshots.clone()),
        })
    }

    fn lease(&self, _workspace: &Path) -> Result<Box<dyn WorkspaceLease>, StoreError> {
        Ok(Box::new(NoopLease))
    }

    fn snapshots(&self, _workspace: &Path) -> Box<dyn SnapshotStore> {
        Box::new(self.snapshots.clone())
    }

    fn locks(&self, _workspace: &Path) -> Box<dyn LockStore> {
        Box::new(self.locks.clone())
    }
}

pub const APP_PATCH: &str = "\
diff --git a/src/app.ts b/src/app.ts
--- a/src/app.ts
+++ b/src/app.ts
@@ -1,2 +1,2 @@
-const a = 1;
+const a = 42;
 const b = 2;
";

/// Content of `src/big.txt` before any change: `line 1` to `line 600`.
pub fn big_file() -> String {
    (1..=600).map(|i| format!("line {}\n", i)).collect()
}

/// Three hunks over `src/big.txt` at lines 51, 251 and 451, each replacing
/// 100 lines with three lines of context on both sides. 624 lines in all.
pub fn oversized_patch() -> String {
    let mut patch = String::from(
        "diff --git a/src/big.txt b/src/big.txt\n--- a/src/big.txt\n+++ b/src/big.txt\n",
    );
    for start in [51usize, 251, 451] {
        patch.push_str(&format!("@@ -{0},106 +{0},106 @@\n", start - 3));
        for i in start - 3..start {
            patch.push_str(&format!(" line {}\n", i));
        }
        for i in start..start + 100 {
            patch.push_str(&format!("-line {}\n", i));
        }
        for i in start..start + 100 {
            patch.push_str(&format!("+new {}\n", i));
        }
        for i in start + 100..start + 103 {
            patch.push_str(&format!(" line {}\n", i));
        }
    }
    patch
}

pub fn oversized_candidate_text() -> String {
    format!("Rewrote the three blocks:\n\n```diff\n{}```\n", oversized_patch())
}

pub fn candidate_text() -> String {
    format!(
        "Here is the fix for the counter:\n\n```diff\n{}```\n\nThis keeps b unchanged.\n",
        APP_PATCH
    )
}
