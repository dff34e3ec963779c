//! Core domain model and contracts for patchwarden.

pub mod candidate;
pub mod circuit;
pub mod error;
pub mod outcome;
pub mod patch;
pub mod profile;
pub mod protocol;
pub mod sanitize;

pub use candidate::{Candidate, CandidateExtractor, CandidateScores};
pub use circuit::{BreakerConfig, BreakerMetrics, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use error::*;
pub use outcome::{Mode, PipelineReport, Rejection, Resolution};
pub use profile::{OperatingProfile, ProfileKind, QualityLevel};
pub use protocol::*;
pub use sanitize::{Sanitizer, SanitizerPolicy, ValidationOutcome, Verdict, Violation};
