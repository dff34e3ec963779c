use super::*;
use crate::testing::{
    big_file, candidate_text, oversized_candidate_text, FakeBackend, Script, ScriptedSandbox,
};
use chrono::Duration;
use patchwarden_core::sanitize::TRUNCATION_MARKER_PREFIX;
use patchwarden_core::{CommandLine, Mode, SnapshotStore, Verdict, Violation};

const WS: &str = "/tmp/patchwarden-warden-ws";

fn build_warden(backend: &FakeBackend, sandbox: ScriptedSandbox) -> (Warden, Arc<ScriptedSandbox>) {
    let sandbox = Arc::new(sandbox);
    let warden = Warden::new(
        Arc::new(backend.clone()),
        sandbox.clone(),
        WardenSettings::default(),
    );
    (warden, sandbox)
}

fn request(text: String, enable_apply: bool) -> ApplyRequest {
    ApplyRequest {
        workspace: PathBuf::from(WS),
        candidate_text: text,
        context_files: vec!["src/app.ts".to_string()],
        gates: vec![GateSpec::new("build", CommandLine::shell("npm run build")).critical()],
        enable_apply,
    }
}

#[test]
fn scenario_passing_build_applies() {
    let backend = FakeBackend::new();
    let (warden, _) = build_warden(&backend, ScriptedSandbox::new());

    let report = warden.run(&request(candidate_text(), true)).unwrap();

    assert_eq!(report.mode(), Mode::Apply);
    assert_eq!(report.gate_results.len(), 1);
    assert_eq!(report.gate_results[0].name, "build");
    assert!(report.gate_results[0].passed);
    assert!(report.patch_text.contains("+const a = 42;"));
    assert!(report.confidence > 0.6);
    assert_eq!(report.circuit_state, CircuitState::Closed);
    match &report.resolution {
        Resolution::Applied {
            head_before,
            head_after,
        } => {
            assert_eq!(head_before.as_str(), "base000000");
            assert_eq!(head_after.as_str(), backend.vcs.head());
        }
        other => panic!("expected applied, got {:?}", other),
    }
}

#[test]
fn scenario_failing_build_rolls_back_and_locks() {
    let backend = FakeBackend::new();
    let sandbox = ScriptedSandbox::new().script("npm run build", Script::exit(1, ""));
    let (warden, sandbox) = build_warden(&backend, sandbox);

    let report = warden.run(&request(candidate_text(), true)).unwrap();
    assert_eq!(report.mode(), Mode::Blocked);
    let Resolution::RolledBack {
        head_before,
        head_reverted_to,
        failed_gate,
        ..
    } = &report.resolution
    else {
        panic!("expected rollback, got {:?}", report.resolution);
    };
    assert_eq!(head_before.as_str(), "base000000");
    assert_eq!(head_reverted_to.as_str(), backend.vcs.head());
    assert_eq!(failed_gate, "build");
    assert!(backend.locks.lock.lock().unwrap().is_some());
    let head_after_rollback = backend.vcs.head();

    // The rollback also opened the circuit; the lock is still what surfaces.
    assert!(report.circuit_state.is_open());
    let err = warden.run(&request(candidate_text(), true)).unwrap_err();
    assert!(err.is_workspace_locked());
    assert_eq!(sandbox.invoked().len(), 1);
    assert_eq!(backend.vcs.head(), head_after_rollback);
}

#[test]
fn advisory_request_never_opens_the_workspace() {
    let backend = FakeBackend::new();
    let (warden, sandbox) = build_warden(&backend, ScriptedSandbox::new());

    let report = warden.run(&request(candidate_text(), false)).unwrap();
    assert_eq!(report.mode(), Mode::Advisory);
    assert_eq!(report.resolution, Resolution::AdvisoryOnly);
    assert_eq!(report.validation.as_ref().map(|v| v.verdict()), Some(Verdict::Valid));
    assert_eq!(backend.open_count(), 0);
    assert!(sandbox.invoked().is_empty());

    let status = warden.status(Path::new(WS)).unwrap();
    assert_eq!(status.circuit.successes, 1);
}

#[test]
fn extraction_failure_is_advisory_with_zero_confidence() {
    let backend = FakeBackend::new();
    let (warden, sandbox) = build_warden(&backend, ScriptedSandbox::new());

    let report = warden
        .run(&request("I could not find a fix for this.".to_string(), true))
        .unwrap();
    assert_eq!(report.mode(), Mode::Advisory);
    assert!(matches!(report.resolution, Resolution::ExtractionFailed { .. }));
    assert_eq!(report.confidence, 0.0);
    assert!(report.patch_text.is_empty());
    assert!(report.validation.is_none());
    assert_eq!(backend.open_count(), 0);
    assert!(sandbox.invoked().is_empty());
}

#[test]
fn sensitive_path_is_blocked_without_touching_workspace() {
    let backend = FakeBackend::new();
    let (warden, _) = build_warden(&backend, ScriptedSandbox::new());
    let text = "```diff\n--- a/.env\n+++ b/.env\n@@ -1 +1 @@\n-DEBUG=0\n+DEBUG=1\n```\n";

    let mut req = request(text.to_string(), true);
    req.context_files = vec![".env".to_string()];
    let report = warden.run(&req).unwrap();

    assert_eq!(report.mode(), Mode::Blocked);
    assert_eq!(
        report.resolution,
        Resolution::Rejected {
            verdict: Rejection::Blocked
        }
    );
    assert_eq!(backend.open_count(), 0);
}

#[test]
fn oversized_candidate_is_truncated_and_applied() {
    let backend = FakeBackend::new();
    let (warden, sandbox) = build_warden(&backend, ScriptedSandbox::new());
    let mut req = request(oversized_candidate_text(), true);
    req.context_files = vec!["src/big.txt".to_string()];

    let report = warden.run(&req).unwrap();

    let validation = report.validation.as_ref().unwrap();
    assert_eq!(validation.verdict(), Verdict::Truncated);
    assert_eq!(
        validation.violations(),
        [Violation::SizeLimitExceeded {
            lines: 624,
            limit: 500
        }]
    );
    assert_eq!(report.mode(), Mode::Apply);
    assert_eq!(sandbox.invoked().len(), 1);

    // The truncated text is what reached version control.
    let applied = backend.vcs.applied();
    assert_eq!(applied, vec![report.patch_text.clone()]);
    assert!(applied[0].lines().count() <= 500);
    assert_eq!(
        applied[0]
            .lines()
            .filter(|l| l.starts_with(TRUNCATION_MARKER_PREFIX))
            .count(),
        1
    );
    assert_eq!(warden.status(Path::new(WS)).unwrap().circuit.successes, 1);
}

#[test]
fn open_circuit_rejects_before_extraction() {
    let backend = FakeBackend::new();
    let (warden, _) = build_warden(&backend, ScriptedSandbox::new());

    // A single failure in an empty window trips the default 10% threshold.
    let first = warden
        .run(&request("no patch here".to_string(), true))
        .unwrap();
    assert!(first.circuit_state.is_open());

    let err = warden.run(&request(candidate_text(), true)).unwrap_err();
    assert!(err.is_circuit_open());
    match err {
        PipelineError::CircuitOpen { reopens_at, .. } => {
            assert!(reopens_at > Utc::now() + Duration::seconds(200));
        }
        other => panic!("expected circuit open, got {:?}", other),
    }
    assert_eq!(backend.open_count(), 0);
}

#[test]
fn outcome_is_persisted_and_restored_by_a_new_warden() {
    let backend = FakeBackend::new();
    let (first, _) = build_warden(&backend, ScriptedSandbox::new());
    first.run(&request("nothing".to_string(), true)).unwrap();

    let stored = backend.snapshots.load().unwrap().unwrap();
    assert!(stored.state.is_open());
    assert_eq!(stored.counters.total_failures, 1);

    let (second, _) = build_warden(&backend, ScriptedSandbox::new());
    let err = second.run(&request(candidate_text(), true)).unwrap_err();
    assert!(err.is_circuit_open());
}

#[test]
fn check_does_not_record_outcomes() {
    let backend = FakeBackend::new();
    let (warden, _) = build_warden(&backend, ScriptedSandbox::new());

    let report = warden
        .check(Path::new(WS), "no patch", &[])
        .unwrap();
    assert!(matches!(report.resolution, Resolution::ExtractionFailed { .. }));
    assert_eq!(report.circuit_state, CircuitState::Closed);
    assert!(backend.snapshots.load().unwrap().is_none());
    assert_eq!(warden.status(Path::new(WS)).unwrap().circuit.window_len, 0);
}

#[test]
fn dry_run_failure_surfaces_and_counts_as_failure() {
    let backend = FakeBackend::new();
    backend.vcs.state.lock().unwrap().reject_check = true;
    let (warden, sandbox) = build_warden(&backend, ScriptedSandbox::new());

    let err = warden.run(&request(candidate_text(), true)).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Rollout(RolloutError::ApplyCheckFailed { .. })
    ));
    assert!(sandbox.invoked().is_empty());
    assert_eq!(backend.vcs.head(), "base000000");
    assert_eq!(warden.status(Path::new(WS)).unwrap().circuit.failures, 1);
}

#[test]
fn locked_workspace_does_not_count_against_the_circuit() {
    let backend = FakeBackend::new();
    let (warden, _) = build_warden(&backend, ScriptedSandbox::new());
    *backend.locks.lock.lock().unwrap() = Some(patchwarden_core::RolloutLock {
        created_at: Utc::now(),
        head_before: patchwarden_core::CommitId::new("base000000"),
        head_applied: patchwarden_core::CommitId::new("commit0001"),
        head_reverted_to: Some(patchwarden_core::CommitId::new("revert0002")),
        reason: "gate 'build' failed: exit 1".to_string(),
        run_id: None,
    });

    let err = warden.run(&request(candidate_text(), true)).unwrap_err();
    assert!(err.is_workspace_locked());
    let status = warden.status(Path::new(WS)).unwrap();
    assert_eq!(status.circuit.window_len, 0);
    assert!(status.lock.is_some());

    let cleared = warden.unlock(Path::new(WS)).unwrap();
    assert!(cleared.is_some());
    assert!(warden.status(Path::new(WS)).unwrap().lock.is_none());
    assert_eq!(warden.run(&request(candidate_text(), true)).unwrap().mode(), Mode::Apply);
}

#[test]
fn breaker_state_is_tracked_per_workspace() {
    let backend = FakeBackend::new();
    let (warden, _) = build_warden(&backend, ScriptedSandbox::new());
    let other = Path::new("/tmp/patchwarden-other-ws");

    // Create the other slot before the shared fake store holds an open snapshot.
    assert_eq!(warden.circuit_state(other, Utc::now()), CircuitState::Closed);
    warden.run(&request("nothing".to_string(), true)).unwrap();

    assert!(warden.circuit_state(Path::new(WS), Utc::now()).is_open());
    assert_eq!(warden.circuit_state(other, Utc::now()), CircuitState::Closed);
}

#[test]
fn reset_breaker_closes_and_persists() {
    let backend = FakeBackend::new();
    let (warden, _) = build_warden(&backend, ScriptedSandbox::new());
    warden.run(&request("nothing".to_string(), true)).unwrap();

    let metrics = warden.reset_breaker(Path::new(WS)).unwrap();
    assert_eq!(metrics.state, CircuitState::Closed);
    assert_eq!(metrics.window_len, 0);
    assert_eq!(metrics.counters.times_opened, 1);
    assert_eq!(
        backend.snapshots.load().unwrap().map(|s| s.state),
        Some(CircuitState::Closed)
    );
}

#[cfg(unix)]
mod local_workspace {
    use super::*;
    use git2::{Repository, Signature};
    use patchwarden_adapters::store::rollback_lock_path;
    use patchwarden_core::Quotas;
    use tempfile::TempDir;

    const ORIGINAL: &str = "const a = 1;\nconst b = 2;\n";

    fn repo() -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().canonicalize().unwrap();
        let repo = Repository::init(&path).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "Test User").unwrap();
        config.set_str("user.email", "test@example.com").unwrap();

        std::fs::create_dir_all(path.join("src")).unwrap();
        std::fs::write(path.join("src/app.ts"), ORIGINAL).unwrap();
        std::fs::write(path.join("src/big.txt"), big_file()).unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("src/app.ts")).unwrap();
        index.add_path(Path::new("src/big.txt")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("Test User", "test@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .unwrap();
        (dir, path)
    }

    fn shell_gate(line: &str) -> GateSpec {
        GateSpec::new("build", CommandLine::shell(line))
            .critical()
            .with_quotas(Quotas {
                max_processes: 4096,
                timeout_seconds: 30,
                ..Quotas::default()
            })
    }

    fn local_request(workspace: &Path, gate: &str) -> ApplyRequest {
        ApplyRequest {
            workspace: workspace.to_path_buf(),
            candidate_text: candidate_text(),
            context_files: vec!["src/app.ts".to_string()],
            gates: vec![shell_gate(gate)],
            enable_apply: true,
        }
    }

    #[test]
    fn passing_gate_keeps_the_commit() {
        let (_dir, path) = repo();
        let warden = Warden::local(&Config::default()).unwrap();

        let report = warden.run(&local_request(&path, "exit 0")).unwrap();

        assert_eq!(report.mode(), Mode::Apply);
        let content = std::fs::read_to_string(path.join("src/app.ts")).unwrap();
        assert!(content.contains("const a = 42;"));
        assert!(!rollback_lock_path(&path).exists());
    }

    #[test]
    fn failing_gate_restores_the_tree_and_locks() {
        let (_dir, path) = repo();
        let warden = Warden::local(&Config::default()).unwrap();

        let report = warden.run(&local_request(&path, "exit 1")).unwrap();

        assert_eq!(report.mode(), Mode::Blocked);
        assert!(matches!(report.resolution, Resolution::RolledBack { .. }));
        assert_eq!(
            std::fs::read_to_string(path.join("src/app.ts")).unwrap(),
            ORIGINAL
        );
        assert!(rollback_lock_path(&path).exists());
        assert!(report.circuit_state.is_open());

        let err = warden.run(&local_request(&path, "exit 0")).unwrap_err();
        assert!(err.is_workspace_locked());
        assert_eq!(
            std::fs::read_to_string(path.join("src/app.ts")).unwrap(),
            ORIGINAL
        );
    }

    #[test]
    fn truncated_patch_applies_to_a_real_repository() {
        let (_dir, path) = repo();
        let warden = Warden::local(&Config::default()).unwrap();
        let mut req = local_request(&path, "exit 0");
        req.candidate_text = oversized_candidate_text();
        req.context_files = vec!["src/big.txt".to_string()];

        let report = warden.run(&req).unwrap();

        assert_eq!(
            report.validation.as_ref().map(|v| v.verdict()),
            Some(Verdict::Truncated)
        );
        assert_eq!(report.mode(), Mode::Apply);
        let content = std::fs::read_to_string(path.join("src/big.txt")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        // The first and last hunks landed whole.
        for line in ["new 51", "new 150", "new 451", "new 550"] {
            assert!(lines.contains(&line), "{}", line);
        }
        // The middle hunk applied only the ends kept on either side of the cut.
        assert!(!lines.contains(&"line 251"));
        assert!(lines.contains(&"line 284"));
        assert!(lines.contains(&"new 350"));
        assert!(!lines.contains(&"new 251"));
        assert!(!rollback_lock_path(&path).exists());
    }
}
