//! Plain-text rendering of pipeline results and workspace status.

use crate::warden::WorkspaceStatus;
use patchwarden_core::{
    BreakerMetrics, CircuitState, ExistingLock, GateResult, PipelineReport, Resolution,
};
use std::fmt::Write;

pub fn render_report(report: &PipelineReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "mode: {} (profile {}, circuit {})",
        report.mode(),
        report.profile(),
        report.circuit_state.label()
    );
    let _ = writeln!(out, "run: {}", report.run_id);
    let _ = writeln!(out, "workspace: {}", report.workspace.display());

    match &report.resolution {
        Resolution::ExtractionFailed { reason } => {
            let _ = writeln!(out, "no patch extracted: {}", reason);
        }
        _ => {
            let _ = writeln!(out, "confidence: {:.2}", report.confidence);
        }
    }

    if let Some(validation) = &report.validation {
        let _ = writeln!(out, "verdict: {}", validation.verdict());
        for violation in validation.violations() {
            let _ = writeln!(out, "  - {}", violation.describe());
        }
    }

    if !report.gate_results.is_empty() {
        let _ = writeln!(out, "gates:");
        for gate in &report.gate_results {
            let _ = writeln!(out, "  {}", render_gate(gate));
        }
    }

    match &report.resolution {
        Resolution::Applied {
            head_before,
            head_after,
        } => {
            let _ = writeln!(out, "applied: {} -> {}", head_before.short(), head_after.short());
        }
        Resolution::RolledBack {
            head_before,
            head_applied,
            head_reverted_to,
            failed_gate,
            lock_path,
        } => {
            let _ = writeln!(
                out,
                "rolled back: gate '{}' failed; {} applied on {}, reverted by {}",
                failed_gate,
                head_applied.short(),
                head_before.short(),
                head_reverted_to.short()
            );
            let _ = writeln!(out, "workspace locked: {}", lock_path.display());
        }
        Resolution::AdvisoryOnly => {
            let _ = writeln!(out, "advisory only: workspace not modified");
        }
        Resolution::Rejected { verdict } => {
            let _ = writeln!(out, "rejected: {}", verdict);
        }
        Resolution::ExtractionFailed { .. } => {}
    }
    out
}

fn render_gate(gate: &GateResult) -> String {
    let mut line = format!(
        "[{}] {}{} ({}, {} ms)",
        if gate.passed { "pass" } else { "FAIL" },
        gate.name,
        if gate.critical { " *" } else { "" },
        gate.status.label(),
        gate.duration_ms
    );
    if let Some(marker) = &gate.failure_marker {
        let _ = write!(line, " matched '{}'", marker);
    }
    if !gate.passed {
        if let Some(last) = last_output_line(gate) {
            let _ = write!(line, "\n      {}", last);
        }
    }
    line
}

fn last_output_line(gate: &GateResult) -> Option<&str> {
    [&gate.stderr_tail, &gate.stdout_tail]
        .into_iter()
        .flat_map(|tail| tail.lines().rev())
        .map(str::trim)
        .find(|l| !l.is_empty())
}

pub fn render_lock(lock: &ExistingLock) -> String {
    let mut out = format!("lock: {}\n", lock.path.display());
    match &lock.record {
        Some(record) => {
            let _ = writeln!(out, "  created: {}", record.created_at.to_rfc3339());
            let _ = writeln!(out, "  head before: {}", record.head_before);
            let _ = writeln!(out, "  head applied: {}", record.head_applied);
            match &record.head_reverted_to {
                Some(head) => {
                    let _ = writeln!(out, "  reverted to: {}", head);
                }
                None => {
                    let _ = writeln!(out, "  reverted to: (revert failed, repair manually)");
                }
            }
            let _ = writeln!(out, "  reason: {}", record.reason);
        }
        None => {
            let _ = writeln!(out, "  (record unreadable)");
        }
    }
    out
}

pub fn render_circuit(metrics: &BreakerMetrics) -> String {
    let mut out = String::new();
    let _ = write!(out, "circuit: {}", metrics.state.label());
    match metrics.state {
        CircuitState::Open { since } => {
            let _ = write!(out, " since {}", since.to_rfc3339());
            if let Some(at) = metrics.reopens_at {
                let _ = write!(out, ", probing from {}", at.to_rfc3339());
            }
        }
        CircuitState::HalfOpen {
            consecutive_successes,
            ..
        } => {
            let _ = write!(out, " ({} consecutive successes)", consecutive_successes);
        }
        CircuitState::Closed => {}
    }
    out.push('\n');
    let _ = writeln!(out, "profile: {}", metrics.profile.kind());
    let _ = writeln!(
        out,
        "window: {} outcomes, {} ok, {} failed ({:.1}% failure rate)",
        metrics.window_len,
        metrics.successes,
        metrics.failures,
        metrics.failure_rate * 100.0
    );
    if let Some(at) = metrics.last_success {
        let _ = writeln!(out, "last success: {}", at.to_rfc3339());
    }
    if let Some(at) = metrics.last_failure {
        let _ = writeln!(out, "last failure: {}", at.to_rfc3339());
    }
    let _ = writeln!(
        out,
        "lifetime: {} ok, {} failed, opened {} times",
        metrics.counters.total_successes,
        metrics.counters.total_failures,
        metrics.counters.times_opened
    );
    out
}

pub fn render_status(status: &WorkspaceStatus) -> String {
    let mut out = format!("workspace: {}\n", status.workspace.display());
    match &status.lock {
        Some(lock) => out.push_str(&render_lock(lock)),
        None => out.push_str("lock: none\n"),
    }
    out.push_str(&render_circuit(&status.circuit));
    out
}
