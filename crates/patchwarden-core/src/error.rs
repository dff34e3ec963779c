//! Error taxonomy for the apply pipeline.
//!
//! Candidate problems (extraction, sanitization) are reported as data, not
//! errors, once they reach the engine. The types here cover what the engine
//! surfaces to its caller plus the failures each port may return.

use crate::protocol::{CommitId, ExistingLock, RolloutLock};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Why no patch could be pulled out of candidate text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractionError {
    #[error("candidate text is empty")]
    Empty,
    #[error("candidate text is {size} bytes, above the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("no patch-shaped content found")]
    NoPatch,
    #[error(
        "patch-shaped content is incomplete ({file_headers} file headers, {content_lines} content lines)"
    )]
    Incomplete {
        file_headers: usize,
        content_lines: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VcsError {
    #[error("patch does not apply: {0}")]
    PatchRejected(String),
    #[error("revert of {commit} produced conflicts")]
    RevertConflict { commit: CommitId },
    #[error("{0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("gate command is empty")]
    EmptyCommand,
    #[error("failed to launch '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to prepare sandbox: {0}")]
    Setup(String),
    #[error("failed waiting for '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not encode record for {}: {source}", path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unreadable record at {}: {detail}", path.display())]
    Corrupt { path: PathBuf, detail: String },
    #[error("timed out after {waited_secs}s waiting for {}", path.display())]
    Busy { path: PathBuf, waited_secs: u64 },
}

/// Where in a rollout a version-control failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutStage {
    LockCheck,
    DryRun,
    Apply,
    Commit,
    Revert,
}

impl fmt::Display for RolloutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RolloutStage::LockCheck => "lock check",
            RolloutStage::DryRun => "dry-run check",
            RolloutStage::Apply => "apply",
            RolloutStage::Commit => "commit",
            RolloutStage::Revert => "revert",
        };
        f.write_str(label)
    }
}

/// Failures that end a rollout without a Success/Rollback outcome.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("workspace is locked by an earlier rollback ({})", lock.path.display())]
    WorkspaceLocked { lock: ExistingLock },
    #[error("patch failed the dry-run apply check at {head}: {detail}")]
    ApplyCheckFailed { head: CommitId, detail: String },
    #[error("patch passed the dry run but failed to apply at {head}: {detail}")]
    ApplyFailed { head: CommitId, detail: String },
    #[error("revert of {} failed, workspace locked: {detail}", lock.head_applied)]
    RevertFailed { lock: Box<RolloutLock>, detail: String },
    #[error("version control failed during {stage}: {source}")]
    Vcs {
        stage: RolloutStage,
        #[source]
        source: VcsError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Environment-level failures surfaced by the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("circuit open for {}: rollouts blocked until {reopens_at}", workspace.display())]
    CircuitOpen {
        workspace: PathBuf,
        reopens_at: DateTime<Utc>,
    },
    #[error(transparent)]
    Rollout(#[from] RolloutError),
    #[error("workspace {} unavailable: {detail}", workspace.display())]
    Backend { workspace: PathBuf, detail: String },
}

impl PipelineError {
    pub fn is_workspace_locked(&self) -> bool {
        matches!(
            self,
            PipelineError::Rollout(RolloutError::WorkspaceLocked { .. })
        )
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, PipelineError::CircuitOpen { .. })
    }
}
