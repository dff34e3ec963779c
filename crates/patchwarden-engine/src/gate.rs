//! One rollout attempt: lock check, dry run, apply, gates, keep or revert.

use chrono::Utc;
use patchwarden_core::{
    CommitId, ExitStatus, GateResult, GateSpec, LockStore, RolloutError, RolloutLock,
    RolloutStage, SandboxRequest, SandboxRunner, VcsError, VersionControl,
};
use regex::{Regex, RegexBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Markers checked in every gate's output in addition to its own.
pub const DEFAULT_FAILURE_MARKERS: [&str; 2] = [r"^(FAIL|FAILED)\b", r"npm ERR!"];

/// How a rollout that got past the dry run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RolloutOutcome {
    Success {
        head_before: CommitId,
        head_after: CommitId,
        gate_results: Vec<GateResult>,
    },
    Rollback {
        head_reverted_to: CommitId,
        lock: RolloutLock,
        lock_path: PathBuf,
        failed_gate: String,
        gate_results: Vec<GateResult>,
    },
}

impl RolloutOutcome {
    pub fn gate_results(&self) -> &[GateResult] {
        match self {
            RolloutOutcome::Success { gate_results, .. }
            | RolloutOutcome::Rollback { gate_results, .. } => gate_results,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RolloutOutcome::Success { .. })
    }
}

/// The workspace a rollout operates on.
pub struct RolloutTarget<'a> {
    pub workspace: &'a Path,
    pub vcs: &'a mut dyn VersionControl,
    pub locks: &'a dyn LockStore,
}

pub struct RolloutGate<'a> {
    sandbox: &'a dyn SandboxRunner,
    deny_network: bool,
}

impl<'a> RolloutGate<'a> {
    pub fn new(sandbox: &'a dyn SandboxRunner) -> Self {
        Self {
            sandbox,
            deny_network: true,
        }
    }

    pub fn deny_network(mut self, deny: bool) -> Self {
        self.deny_network = deny;
        self
    }

    /// Apply `patch`, run `gates` in order, and keep or revert the commit.
    ///
    /// Returns `Err` only for problems with the workspace itself: an existing
    /// lock, a patch that does not apply, or a version-control failure.
    /// Failing gates are an `Ok(Rollback)`.
    pub fn run(
        &self,
        target: RolloutTarget<'_>,
        patch: &str,
        gates: &[GateSpec],
        run_id: Uuid,
    ) -> Result<RolloutOutcome, RolloutError> {
        let RolloutTarget {
            workspace,
            vcs,
            locks,
        } = target;

        if let Some(lock) = locks.current()? {
            warn!(workspace = %workspace.display(), lock = %lock.path.display(), "rollout refused: workspace locked");
            return Err(RolloutError::WorkspaceLocked { lock });
        }

        let head_before = vcs.current_head().map_err(|source| RolloutError::Vcs {
            stage: RolloutStage::LockCheck,
            source,
        })?;

        match vcs.check_apply(patch) {
            Ok(()) => {}
            Err(VcsError::PatchRejected(detail)) => {
                return Err(RolloutError::ApplyCheckFailed {
                    head: head_before,
                    detail,
                })
            }
            Err(source) => {
                return Err(RolloutError::Vcs {
                    stage: RolloutStage::DryRun,
                    source,
                })
            }
        }

        match vcs.apply(patch) {
            Ok(()) => {}
            Err(VcsError::PatchRejected(detail)) => {
                return Err(RolloutError::ApplyFailed {
                    head: head_before,
                    detail,
                })
            }
            Err(source) => {
                return Err(RolloutError::Vcs {
                    stage: RolloutStage::Apply,
                    source,
                })
            }
        }
        let head_applied = vcs
            .commit(&format!("patchwarden: apply candidate {}", run_id))
            .map_err(|source| RolloutError::Vcs {
                stage: RolloutStage::Commit,
                source,
            })?;
        info!(
            workspace = %workspace.display(),
            head_before = %head_before.short(),
            head_applied = %head_applied.short(),
            "patch committed, running gates"
        );

        let gate_results = self.run_gates(workspace, gates);
        let Some(failed) = gate_results.iter().find(|g| !g.passed) else {
            info!(workspace = %workspace.display(), head = %head_applied.short(), gates = gate_results.len(), "rollout applied");
            return Ok(RolloutOutcome::Success {
                head_before,
                head_after: head_applied,
                gate_results,
            });
        };

        let failed_gate = failed.name.clone();
        let reason = format!("gate '{}' failed: {}", failed.name, failure_detail(failed));
        let message = format!(
            "patchwarden: revert {} ({})",
            head_applied.short(),
            reason
        );

        match vcs.revert(&head_applied, &message) {
            Ok(reverted) => {
                let lock = RolloutLock {
                    created_at: Utc::now(),
                    head_before,
                    head_applied,
                    head_reverted_to: Some(reverted.clone()),
                    reason,
                    run_id: Some(run_id),
                };
                let lock_path = locks.write(&lock)?;
                warn!(
                    workspace = %workspace.display(),
                    gate = %failed_gate,
                    lock = %lock_path.display(),
                    "rollout rolled back"
                );
                Ok(RolloutOutcome::Rollback {
                    head_reverted_to: reverted,
                    lock,
                    lock_path,
                    failed_gate,
                    gate_results,
                })
            }
            Err(revert_err) => {
                let lock = RolloutLock {
                    created_at: Utc::now(),
                    head_before,
                    head_applied,
                    head_reverted_to: None,
                    reason: format!("{}; revert failed: {}", reason, revert_err),
                    run_id: Some(run_id),
                };
                let mut detail = revert_err.to_string();
                if let Err(store_err) = locks.write(&lock) {
                    detail = format!("{}; lock could not be written: {}", detail, store_err);
                }
                error!(workspace = %workspace.display(), error = %detail, "revert failed, workspace needs manual repair");
                Err(RolloutError::RevertFailed {
                    lock: Box::new(lock),
                    detail,
                })
            }
        }
    }

    /// Gates run strictly in order; a failing critical gate stops the loop.
    fn run_gates(&self, workspace: &Path, gates: &[GateSpec]) -> Vec<GateResult> {
        let mut results = Vec::with_capacity(gates.len());
        for gate in gates {
            let result = self.run_gate(workspace, gate);
            let stop = !result.passed && gate.critical;
            results.push(result);
            if stop {
                debug!(gate = %gate.name, "critical gate failed, skipping remaining gates");
                break;
            }
        }
        results
    }

    pub fn run_gate(&self, workspace: &Path, gate: &GateSpec) -> GateResult {
        let request = SandboxRequest {
            command: gate.command.clone(),
            working_dir: workspace.to_path_buf(),
            quotas: gate.quotas,
            deny_network: self.deny_network,
        };

        let result = match self.sandbox.run(&request) {
            Ok(output) => {
                let markers = compile_markers(&gate.failure_markers);
                let failure_marker = markers
                    .iter()
                    .find(|m| m.is_match(&output.stdout_tail) || m.is_match(&output.stderr_tail))
                    .map(|m| m.as_str().to_string());
                let passed = output.status.is_success() && failure_marker.is_none();
                GateResult {
                    name: gate.name.clone(),
                    critical: gate.critical,
                    status: output.status,
                    passed,
                    failure_marker,
                    stdout_tail: output.stdout_tail,
                    stderr_tail: output.stderr_tail,
                    duration_ms: output.duration.as_millis().min(u128::from(u64::MAX)) as u64,
                }
            }
            Err(err) => GateResult {
                name: gate.name.clone(),
                critical: gate.critical,
                status: ExitStatus::LaunchFailed {
                    reason: err.to_string(),
                },
                passed: false,
                failure_marker: None,
                stdout_tail: String::new(),
                stderr_tail: String::new(),
                duration_ms: 0,
            },
        };

        if result.passed {
            debug!(gate = %result.name, duration_ms = result.duration_ms, "gate passed");
        } else {
            warn!(
                gate = %result.name,
                status = %result.status.label(),
                marker = result.failure_marker.as_deref().unwrap_or(""),
                duration_ms = result.duration_ms,
                "gate failed"
            );
        }
        result
    }
}

fn failure_detail(result: &GateResult) -> String {
    match &result.failure_marker {
        Some(marker) if result.status.is_success() => format!("output matched '{}'", marker),
        Some(marker) => format!("{}, output matched '{}'", result.status.label(), marker),
        None => result.status.label(),
    }
}

/// Default markers plus the gate's own. A marker that is not a valid regex
/// is matched literally.
fn compile_markers(extra: &[String]) -> Vec<Regex> {
    DEFAULT_FAILURE_MARKERS
        .iter()
        .copied()
        .chain(extra.iter().map(String::as_str))
        .filter(|m| !m.is_empty())
        .filter_map(|pattern| {
            RegexBuilder::new(pattern)
                .multi_line(true)
                .build()
                .or_else(|_| Regex::new(&regex::escape(pattern)))
                .ok()
        })
        .collect()
}
