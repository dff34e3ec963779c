//! The caller-facing service: circuit check, extraction, sanitization,
//! rollout, and outcome recording for any number of workspaces.

use crate::gate::{RolloutGate, RolloutOutcome, RolloutTarget};
use chrono::{DateTime, Utc};
use patchwarden_adapters::{Config, ConfigError, LocalBackend, ProcessSandbox};
use patchwarden_core::candidate::MAX_CANDIDATE_BYTES;
use patchwarden_core::{
    BreakerConfig, BreakerMetrics, CandidateExtractor, CircuitBreaker, CircuitState,
    ExistingLock, GateSpec, PipelineError, PipelineReport, Rejection, Resolution, RolloutError,
    Sanitizer, SanitizerPolicy, SandboxRunner, ValidationOutcome, WorkspaceBackend,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WardenSettings {
    pub breaker: BreakerConfig,
    pub policy: SanitizerPolicy,
    pub deny_network: bool,
    pub max_candidate_bytes: usize,
}

impl Default for WardenSettings {
    fn default() -> Self {
        Self {
            breaker: BreakerConfig::default(),
            policy: SanitizerPolicy::builtin(),
            deny_network: true,
            max_candidate_bytes: MAX_CANDIDATE_BYTES,
        }
    }
}

impl WardenSettings {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            breaker: config.breaker,
            policy: config.sanitizer.policy()?,
            deny_network: config.sandbox.deny_network,
            max_candidate_bytes: MAX_CANDIDATE_BYTES,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub workspace: PathBuf,
    pub candidate_text: String,
    /// Paths the caller believes the change should touch.
    pub context_files: Vec<String>,
    pub gates: Vec<GateSpec>,
    /// When false, stop after sanitization and leave the workspace alone.
    pub enable_apply: bool,
}

/// Lock and breaker state of one workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceStatus {
    pub workspace: PathBuf,
    pub lock: Option<ExistingLock>,
    pub circuit: BreakerMetrics,
}

struct WorkspaceSlot {
    breaker: Mutex<CircuitBreaker>,
    /// Held from the lock check until the outcome is recorded.
    apply: Mutex<()>,
}

pub struct Warden {
    backend: Arc<dyn WorkspaceBackend>,
    sandbox: Arc<dyn SandboxRunner>,
    settings: WardenSettings,
    extractor: CandidateExtractor,
    sanitizer: Sanitizer,
    slots: Mutex<HashMap<PathBuf, Arc<WorkspaceSlot>>>,
}

impl Warden {
    pub fn new(
        backend: Arc<dyn WorkspaceBackend>,
        sandbox: Arc<dyn SandboxRunner>,
        settings: WardenSettings,
    ) -> Self {
        Self {
            backend,
            sandbox,
            extractor: CandidateExtractor::with_max_bytes(settings.max_candidate_bytes),
            sanitizer: Sanitizer::new(settings.policy.clone()),
            settings,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Local git workspaces and the process sandbox, configured from `config`.
    pub fn local(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self::new(
            Arc::new(LocalBackend::default()),
            Arc::new(ProcessSandbox::new(config.sandbox.settings())),
            WardenSettings::from_config(config)?,
        ))
    }

    pub fn settings(&self) -> &WardenSettings {
        &self.settings
    }

    /// Run the whole pipeline for one candidate.
    ///
    /// Problems with the candidate come back as a report; problems with the
    /// workspace (open circuit, existing lock, patch that does not apply)
    /// come back as `Err`.
    pub fn run(&self, request: &ApplyRequest) -> Result<PipelineReport, PipelineError> {
        self.evaluate(request, true)
    }

    /// Extraction and sanitization only, under the workspace's current
    /// profile. Nothing is recorded and the workspace is not touched.
    pub fn check(
        &self,
        workspace: &Path,
        candidate_text: &str,
        context_files: &[String],
    ) -> Result<PipelineReport, PipelineError> {
        let request = ApplyRequest {
            workspace: workspace.to_path_buf(),
            candidate_text: candidate_text.to_string(),
            context_files: context_files.to_vec(),
            gates: Vec::new(),
            enable_apply: false,
        };
        self.evaluate(&request, false)
    }

    fn evaluate(&self, request: &ApplyRequest, record: bool) -> Result<PipelineReport, PipelineError> {
        let workspace = workspace_key(&request.workspace);
        let slot = self.slot(&workspace);
        let run_id = Uuid::new_v4();
        let now = Utc::now();

        // A locked workspace is reported as such even while the circuit is
        // open, since unlocking is the action the caller has to take.
        if request.enable_apply {
            self.ensure_unlocked(&workspace)?;
        }

        let profile = {
            let mut breaker = lock_or_recover(&slot.breaker);
            if !breaker.should_allow_request(now) {
                let reopens_at = breaker.reopens_at().unwrap_or(now);
                warn!(workspace = %workspace.display(), %reopens_at, "request rejected: circuit open");
                return Err(PipelineError::CircuitOpen {
                    workspace,
                    reopens_at,
                });
            }
            breaker.current_profile(now)
        };

        let mut report = PipelineReport {
            run_id,
            workspace: workspace.clone(),
            resolution: Resolution::AdvisoryOnly,
            patch_text: String::new(),
            confidence: 0.0,
            validation: None,
            gate_results: Vec::new(),
            circuit_state: CircuitState::Closed,
        };

        let candidate = match self
            .extractor
            .extract(&request.candidate_text, &request.context_files)
        {
            Ok(candidate) => candidate,
            Err(err) => {
                debug!(workspace = %workspace.display(), error = %err, "no usable patch in candidate");
                report.resolution = Resolution::ExtractionFailed {
                    reason: err.to_string(),
                };
                return Ok(self.finish(&slot, &workspace, report, record.then_some(false)));
            }
        };

        let validation = self.sanitizer.sanitize(&candidate, &profile);
        report.confidence = candidate.confidence();
        report.patch_text = validation.patch().to_string();
        report.validation = Some(validation.clone());

        if let Some(rejection) = Rejection::from_verdict(validation.verdict()) {
            info!(
                workspace = %workspace.display(),
                verdict = %rejection,
                violations = validation.violations().len(),
                "candidate rejected"
            );
            report.resolution = Resolution::Rejected { verdict: rejection };
            return Ok(self.finish(&slot, &workspace, report, record.then_some(false)));
        }

        if !request.enable_apply {
            return Ok(self.finish(&slot, &workspace, report, record.then_some(true)));
        }

        let _apply_guard = lock_or_recover(&slot.apply);
        let outcome = self.rollout(&workspace, &validation, &request.gates, run_id);
        match outcome {
            Ok(RolloutOutcome::Success {
                head_before,
                head_after,
                gate_results,
            }) => {
                report.resolution = Resolution::Applied {
                    head_before,
                    head_after,
                };
                report.gate_results = gate_results;
                Ok(self.finish(&slot, &workspace, report, Some(true)))
            }
            Ok(RolloutOutcome::Rollback {
                head_reverted_to,
                lock,
                lock_path,
                failed_gate,
                gate_results,
            }) => {
                report.resolution = Resolution::RolledBack {
                    head_before: lock.head_before,
                    head_applied: lock.head_applied,
                    head_reverted_to,
                    failed_gate,
                    lock_path,
                };
                report.gate_results = gate_results;
                Ok(self.finish(&slot, &workspace, report, Some(false)))
            }
            Err(err) => {
                if counts_as_failure(&err) {
                    self.record(&slot, &workspace, false);
                }
                Err(err)
            }
        }
    }

    fn ensure_unlocked(&self, workspace: &Path) -> Result<(), PipelineError> {
        let current = self
            .backend
            .locks(workspace)
            .current()
            .map_err(|e| PipelineError::Backend {
                workspace: workspace.to_path_buf(),
                detail: e.to_string(),
            })?;
        match current {
            Some(lock) => {
                warn!(workspace = %workspace.display(), lock = %lock.path.display(), "request refused: workspace locked");
                Err(PipelineError::Rollout(RolloutError::WorkspaceLocked { lock }))
            }
            None => Ok(()),
        }
    }

    fn rollout(
        &self,
        workspace: &Path,
        validation: &ValidationOutcome,
        gates: &[GateSpec],
        run_id: Uuid,
    ) -> Result<RolloutOutcome, PipelineError> {
        let backend_error = |detail: String| PipelineError::Backend {
            workspace: workspace.to_path_buf(),
            detail,
        };
        let _lease = self
            .backend
            .lease(workspace)
            .map_err(|e| backend_error(e.to_string()))?;
        let mut ports = self
            .backend
            .open(workspace)
            .map_err(|e| backend_error(e.to_string()))?;

        let gate = RolloutGate::new(self.sandbox.as_ref()).deny_network(self.settings.deny_network);
        let outcome = gate.run(
            RolloutTarget {
                workspace,
                vcs: ports.vcs.as_mut(),
                locks: ports.locks.as_ref(),
            },
            validation.patch(),
            gates,
            run_id,
        )?;
        Ok(outcome)
    }

    fn finish(
        &self,
        slot: &WorkspaceSlot,
        workspace: &Path,
        mut report: PipelineReport,
        outcome: Option<bool>,
    ) -> PipelineReport {
        report.circuit_state = match outcome {
            Some(success) => self.record(slot, workspace, success),
            None => lock_or_recover(&slot.breaker).state(Utc::now()),
        };
        report
    }

    fn record(&self, slot: &WorkspaceSlot, workspace: &Path, success: bool) -> CircuitState {
        let (state, snapshot) = {
            let mut breaker = lock_or_recover(&slot.breaker);
            let state = breaker.record_outcome(success, Utc::now());
            (state, breaker.snapshot())
        };
        if let Err(err) = self.backend.snapshots(workspace).save(&snapshot) {
            warn!(workspace = %workspace.display(), error = %err, "failed to persist circuit snapshot");
        }
        state
    }

    fn slot(&self, workspace: &Path) -> Arc<WorkspaceSlot> {
        let mut slots = lock_or_recover(&self.slots);
        if let Some(slot) = slots.get(workspace) {
            return Arc::clone(slot);
        }
        let breaker = self.load_breaker(workspace);
        let slot = Arc::new(WorkspaceSlot {
            breaker: Mutex::new(breaker),
            apply: Mutex::new(()),
        });
        slots.insert(workspace.to_path_buf(), Arc::clone(&slot));
        slot
    }

    fn load_breaker(&self, workspace: &Path) -> CircuitBreaker {
        match self.backend.snapshots(workspace).load() {
            Ok(Some(snapshot)) => CircuitBreaker::from_snapshot(snapshot, self.settings.breaker),
            Ok(None) => CircuitBreaker::new(self.settings.breaker),
            Err(err) => {
                warn!(workspace = %workspace.display(), error = %err, "ignoring unreadable circuit snapshot");
                CircuitBreaker::new(self.settings.breaker)
            }
        }
    }

    pub fn status(&self, workspace: &Path) -> Result<WorkspaceStatus, PipelineError> {
        let workspace = workspace_key(workspace);
        let slot = self.slot(&workspace);
        let lock = self
            .backend
            .locks(&workspace)
            .current()
            .map_err(|e| PipelineError::Backend {
                workspace: workspace.clone(),
                detail: e.to_string(),
            })?;
        let circuit = lock_or_recover(&slot.breaker).metrics(Utc::now());
        Ok(WorkspaceStatus {
            workspace,
            lock,
            circuit,
        })
    }

    /// Remove the rollback lock, returning what was there.
    pub fn unlock(&self, workspace: &Path) -> Result<Option<ExistingLock>, PipelineError> {
        let workspace = workspace_key(workspace);
        let slot = self.slot(&workspace);
        let _apply_guard = lock_or_recover(&slot.apply);
        let cleared = self
            .backend
            .locks(&workspace)
            .clear()
            .map_err(|e| PipelineError::Backend {
                workspace: workspace.clone(),
                detail: e.to_string(),
            })?;
        if cleared.is_some() {
            info!(workspace = %workspace.display(), "workspace unlocked");
        }
        Ok(cleared)
    }

    /// Close the circuit and clear its window, then persist.
    pub fn reset_breaker(&self, workspace: &Path) -> Result<BreakerMetrics, PipelineError> {
        let workspace = workspace_key(workspace);
        let slot = self.slot(&workspace);
        let (metrics, snapshot) = {
            let mut breaker = lock_or_recover(&slot.breaker);
            breaker.reset();
            (breaker.metrics(Utc::now()), breaker.snapshot())
        };
        self.backend
            .snapshots(&workspace)
            .save(&snapshot)
            .map_err(|e| PipelineError::Backend {
                workspace: workspace.clone(),
                detail: e.to_string(),
            })?;
        Ok(metrics)
    }

    /// Breaker state for a workspace at `now`, without recording anything.
    pub fn circuit_state(&self, workspace: &Path, now: DateTime<Utc>) -> CircuitState {
        let workspace = workspace_key(workspace);
        let slot = self.slot(&workspace);
        let state = lock_or_recover(&slot.breaker).state(now);
        state
    }
}

/// Whether a surfaced rollout error says something about the candidate.
/// Lock contention and backend trouble do not.
fn counts_as_failure(err: &PipelineError) -> bool {
    matches!(
        err,
        PipelineError::Rollout(
            RolloutError::ApplyCheckFailed { .. }
                | RolloutError::ApplyFailed { .. }
                | RolloutError::RevertFailed { .. }
        )
    )
}

fn workspace_key(workspace: &Path) -> PathBuf {
    std::fs::canonicalize(workspace).unwrap_or_else(|_| workspace.to_path_buf())
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests;
