//! Structured result of one pipeline run.

use crate::circuit::CircuitState;
use crate::profile::{OperatingProfile, ProfileKind};
use crate::protocol::{CommitId, GateResult};
use crate::sanitize::{ValidationOutcome, Verdict};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Apply,
    Advisory,
    Blocked,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Mode::Apply => "apply",
            Mode::Advisory => "advisory",
            Mode::Blocked => "blocked",
        };
        f.write_str(label)
    }
}

/// The verdicts that stop a candidate before the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    Invalid,
    Blocked,
}

impl Rejection {
    /// `None` for verdicts that may proceed.
    pub fn from_verdict(verdict: Verdict) -> Option<Self> {
        match verdict {
            Verdict::Invalid => Some(Rejection::Invalid),
            Verdict::Blocked => Some(Rejection::Blocked),
            Verdict::Valid | Verdict::Truncated => None,
        }
    }

    pub fn verdict(self) -> Verdict {
        match self {
            Rejection::Invalid => Verdict::Invalid,
            Rejection::Blocked => Verdict::Blocked,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.verdict(), f)
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    /// Every gate passed; the new HEAD is kept.
    Applied {
        head_before: CommitId,
        head_after: CommitId,
    },
    /// A gate failed; the change was reverted and the workspace locked.
    RolledBack {
        head_before: CommitId,
        head_applied: CommitId,
        head_reverted_to: CommitId,
        failed_gate: String,
        lock_path: PathBuf,
    },
    /// The candidate passed sanitization but applying was not requested.
    AdvisoryOnly,
    ExtractionFailed { reason: String },
    /// The sanitizer refused the candidate.
    Rejected { verdict: Rejection },
}

impl Resolution {
    pub fn mode(&self) -> Mode {
        match self {
            Resolution::Applied { .. } => Mode::Apply,
            Resolution::RolledBack { .. } => Mode::Blocked,
            Resolution::Rejected {
                verdict: Rejection::Blocked,
            } => Mode::Blocked,
            Resolution::Rejected { .. }
            | Resolution::AdvisoryOnly
            | Resolution::ExtractionFailed { .. } => Mode::Advisory,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub workspace: PathBuf,
    pub resolution: Resolution,
    /// Empty when nothing could be extracted.
    pub patch_text: String,
    pub confidence: f64,
    pub validation: Option<ValidationOutcome>,
    pub gate_results: Vec<GateResult>,
    /// Breaker state after this run's outcome was recorded.
    pub circuit_state: CircuitState,
}

impl PipelineReport {
    pub fn mode(&self) -> Mode {
        self.resolution.mode()
    }

    pub fn profile(&self) -> ProfileKind {
        OperatingProfile::for_state(&self.circuit_state).kind()
    }

    pub fn failed_gates(&self) -> impl Iterator<Item = &GateResult> {
        self.gate_results.iter().filter(|g| !g.passed)
    }
}

impl Serialize for PipelineReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("PipelineReport", 10)?;
        s.serialize_field("run_id", &self.run_id)?;
        s.serialize_field("workspace", &self.workspace)?;
        s.serialize_field("mode", &self.mode())?;
        s.serialize_field("resolution", &self.resolution)?;
        s.serialize_field("patch_text", &self.patch_text)?;
        s.serialize_field("confidence", &self.confidence)?;
        s.serialize_field("validation", &self.validation)?;
        s.serialize_field("gate_results", &self.gate_results)?;
        s.serialize_field("circuit_state", &self.circuit_state)?;
        s.serialize_field("profile", &self.profile())?;
        s.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(resolution: Resolution) -> PipelineReport {
        PipelineReport {
            run_id: Uuid::nil(),
            workspace: PathBuf::from("/tmp/ws"),
            resolution,
            patch_text: String::new(),
            confidence: 0.0,
            validation: None,
            gate_results: Vec::new(),
            circuit_state: CircuitState::Closed,
        }
    }

    #[test]
    fn test_mode_follows_resolution() {
        let head = CommitId::new("abc");
        assert_eq!(
            report(Resolution::Applied {
                head_before: head.clone(),
                head_after: head.clone()
            })
            .mode(),
            Mode::Apply
        );
        assert_eq!(
            report(Resolution::Rejected {
                verdict: Rejection::Blocked
            })
            .mode(),
            Mode::Blocked
        );
        assert_eq!(
            report(Resolution::Rejected {
                verdict: Rejection::Invalid
            })
            .mode(),
            Mode::Advisory
        );
        assert_eq!(
            report(Resolution::ExtractionFailed {
                reason: "none".into()
            })
            .mode(),
            Mode::Advisory
        );
    }

    #[test]
    fn test_only_stopping_verdicts_become_rejections() {
        assert_eq!(Rejection::from_verdict(Verdict::Valid), None);
        assert_eq!(Rejection::from_verdict(Verdict::Truncated), None);
        for verdict in [Verdict::Invalid, Verdict::Blocked] {
            let rejection = Rejection::from_verdict(verdict).unwrap();
            assert_eq!(rejection.verdict(), verdict);
            assert_eq!(rejection.to_string(), verdict.to_string());
        }
        let json = serde_json::to_value(Resolution::Rejected {
            verdict: Rejection::Blocked,
        })
        .unwrap();
        assert_eq!(json["verdict"], "blocked");
    }

    #[test]
    fn test_report_json_carries_mode_and_profile() {
        let json = serde_json::to_value(report(Resolution::AdvisoryOnly)).unwrap();
        assert_eq!(json["mode"], "advisory");
        assert_eq!(json["profile"], "normal");
        assert_eq!(json["resolution"]["kind"], "advisory_only");
        assert_eq!(json["circuit_state"]["state"], "closed");
    }
}
