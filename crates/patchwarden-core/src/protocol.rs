use crate::circuit::BreakerSnapshot;
use crate::error::{SandboxError, StoreError, VcsError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(String);

impl CommitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        self.0.get(..7).unwrap_or(&self.0)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resource bounds for one sandboxed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quotas {
    pub cpu_seconds: u64,
    pub memory_bytes: u64,
    pub max_processes: u64,
    pub max_open_files: u64,
    pub timeout_seconds: u64,
}

impl Default for Quotas {
    fn default() -> Self {
        Self {
            cpu_seconds: 20,
            memory_bytes: 2 * 1024 * 1024 * 1024,
            max_processes: 512,
            max_open_files: 1024,
            timeout_seconds: 120,
        }
    }
}

impl Quotas {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn with_overrides(&self, overrides: &QuotaOverrides) -> Quotas {
        Quotas {
            cpu_seconds: overrides.cpu_seconds.unwrap_or(self.cpu_seconds),
            memory_bytes: overrides
                .memory_mb
                .map(|mb| mb.saturating_mul(1024 * 1024))
                .unwrap_or(self.memory_bytes),
            max_processes: overrides.max_processes.unwrap_or(self.max_processes),
            max_open_files: overrides.max_open_files.unwrap_or(self.max_open_files),
            timeout_seconds: overrides.timeout_seconds.unwrap_or(self.timeout_seconds),
        }
    }
}

/// Per-gate quota settings; unset fields inherit the workspace defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaOverrides {
    pub cpu_seconds: Option<u64>,
    pub memory_mb: Option<u64>,
    pub max_processes: Option<u64>,
    pub max_open_files: Option<u64>,
    pub timeout_seconds: Option<u64>,
}

/// A gate command, either a shell line (run through `sh -c`) or an argv list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Argv(Vec<String>),
    Shell(String),
}

impl CommandLine {
    pub fn argv<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandLine::Argv(parts.into_iter().map(Into::into).collect())
    }

    pub fn shell(line: impl Into<String>) -> Self {
        CommandLine::Shell(line.into())
    }

    /// Program plus arguments, or `None` for an empty command.
    pub fn program_and_args(&self) -> Option<(String, Vec<String>)> {
        match self {
            CommandLine::Argv(parts) => {
                let (program, args) = parts.split_first()?;
                if program.trim().is_empty() {
                    return None;
                }
                Some((program.clone(), args.to_vec()))
            }
            CommandLine::Shell(line) => {
                if line.trim().is_empty() {
                    return None;
                }
                Some(("sh".to_string(), vec!["-c".to_string(), line.clone()]))
            }
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandLine::Argv(parts) => f.write_str(&parts.join(" ")),
            CommandLine::Shell(line) => f.write_str(line),
        }
    }
}

/// One configured gate, with quotas already resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSpec {
    pub name: String,
    pub command: CommandLine,
    #[serde(default)]
    pub critical: bool,
    /// Regexes matched against output; a match fails the gate even on exit 0.
    #[serde(default)]
    pub failure_markers: Vec<String>,
    #[serde(default)]
    pub quotas: Quotas,
}

impl GateSpec {
    pub fn new(name: impl Into<String>, command: CommandLine) -> Self {
        Self {
            name: name.into(),
            command,
            critical: false,
            failure_markers: Vec::new(),
            quotas: Quotas::default(),
        }
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_quotas(mut self, quotas: Quotas) -> Self {
        self.quotas = quotas;
        self
    }

    pub fn with_failure_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failure_markers = markers.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitStatus {
    Exited { code: i32 },
    Signaled { signal: i32 },
    TimedOut { after_secs: u64 },
    /// A network shim was invoked and refused to run.
    NetworkDenied,
    LaunchFailed { reason: String },
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Exited { code: 0 })
    }

    pub fn label(&self) -> String {
        match self {
            ExitStatus::Exited { code } => format!("exit {}", code),
            ExitStatus::Signaled { signal } => format!("signal {}", signal),
            ExitStatus::TimedOut { after_secs } => format!("timed out after {}s", after_secs),
            ExitStatus::NetworkDenied => "network denied".to_string(),
            ExitStatus::LaunchFailed { reason } => format!("launch failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxRequest {
    pub command: CommandLine,
    pub working_dir: PathBuf,
    pub quotas: Quotas,
    pub deny_network: bool,
}

#[derive(Debug, Clone)]
pub struct SandboxOutput {
    pub status: ExitStatus,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub critical: bool,
    pub status: ExitStatus,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_marker: Option<String>,
    pub stdout_tail: String,
    pub stderr_tail: String,
    pub duration_ms: u64,
}

/// Persisted record of a rollback. Its presence blocks further applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloutLock {
    pub created_at: DateTime<Utc>,
    pub head_before: CommitId,
    pub head_applied: CommitId,
    /// `None` when the revert itself failed and the tree needs an operator.
    pub head_reverted_to: Option<CommitId>,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
}

/// A lock found on disk. The record is `None` when the file exists but
/// cannot be parsed; the workspace is locked either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingLock {
    pub path: PathBuf,
    pub record: Option<RolloutLock>,
}

pub trait VersionControl: Send {
    fn current_head(&self) -> Result<CommitId, VcsError>;

    /// Verify the patch applies to the current tree without touching it.
    fn check_apply(&self, patch: &str) -> Result<(), VcsError>;

    /// Apply the patch to the working tree and index.
    fn apply(&mut self, patch: &str) -> Result<(), VcsError>;

    fn commit(&mut self, message: &str) -> Result<CommitId, VcsError>;

    /// Undo `commit` with a new commit on top of HEAD.
    fn revert(&mut self, commit: &CommitId, message: &str) -> Result<CommitId, VcsError>;
}

pub trait SandboxRunner: Send + Sync {
    fn run(&self, request: &SandboxRequest) -> Result<SandboxOutput, SandboxError>;
}

pub trait LockStore: Send {
    fn current(&self) -> Result<Option<ExistingLock>, StoreError>;

    fn write(&self, lock: &RolloutLock) -> Result<PathBuf, StoreError>;

    /// Remove the lock, returning what was there.
    fn clear(&self) -> Result<Option<ExistingLock>, StoreError>;
}

pub trait SnapshotStore: Send {
    fn load(&self) -> Result<Option<BreakerSnapshot>, StoreError>;

    fn save(&self, snapshot: &BreakerSnapshot) -> Result<(), StoreError>;
}

/// Held for the duration of one rollout. Dropping it releases the workspace.
pub trait WorkspaceLease: Send {}

/// Per-workspace collaborators handed to a rollout.
pub struct WorkspacePorts {
    pub vcs: Box<dyn VersionControl>,
    pub locks: Box<dyn LockStore>,
    pub snapshots: Box<dyn SnapshotStore>,
}

/// Resolves a workspace path into the ports that operate on it.
pub trait WorkspaceBackend: Send + Sync {
    fn open(&self, workspace: &Path) -> Result<WorkspacePorts, VcsError>;

    /// Cross-process exclusion for apply runs on one workspace.
    fn lease(&self, workspace: &Path) -> Result<Box<dyn WorkspaceLease>, StoreError>;

    fn snapshots(&self, workspace: &Path) -> Box<dyn SnapshotStore>;

    fn locks(&self, workspace: &Path) -> Box<dyn LockStore>;
}
