//! Fixed operating profiles selected by the circuit breaker.

use crate::circuit::CircuitState;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLevel {
    High,
    Conservative,
    Minimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    Normal,
    Degraded,
    Emergency,
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProfileKind::Normal => "normal",
            ProfileKind::Degraded => "degraded",
            ProfileKind::Emergency => "emergency",
        };
        f.write_str(label)
    }
}

/// Patch budget and confidence floor for one breaker state.
///
/// Only the three constants below exist; there is no public constructor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OperatingProfile {
    kind: ProfileKind,
    max_patch_lines: usize,
    min_confidence: f64,
    quality_level: QualityLevel,
}

impl OperatingProfile {
    pub const NORMAL: OperatingProfile = OperatingProfile {
        kind: ProfileKind::Normal,
        max_patch_lines: 500,
        min_confidence: 0.8,
        quality_level: QualityLevel::High,
    };

    pub const DEGRADED: OperatingProfile = OperatingProfile {
        kind: ProfileKind::Degraded,
        max_patch_lines: 300,
        min_confidence: 0.6,
        quality_level: QualityLevel::Conservative,
    };

    pub const EMERGENCY: OperatingProfile = OperatingProfile {
        kind: ProfileKind::Emergency,
        max_patch_lines: 100,
        min_confidence: 0.4,
        quality_level: QualityLevel::Minimal,
    };

    pub fn for_state(state: &CircuitState) -> OperatingProfile {
        match state {
            CircuitState::Closed => Self::NORMAL,
            CircuitState::HalfOpen { .. } => Self::DEGRADED,
            CircuitState::Open { .. } => Self::EMERGENCY,
        }
    }

    pub fn kind(&self) -> ProfileKind {
        self.kind
    }

    pub fn max_patch_lines(&self) -> usize {
        self.max_patch_lines
    }

    pub fn min_confidence(&self) -> f64 {
        self.min_confidence
    }

    pub fn quality_level(&self) -> QualityLevel {
        self.quality_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_profile_follows_state() {
        let now = Utc::now();
        assert_eq!(OperatingProfile::for_state(&CircuitState::Closed), OperatingProfile::NORMAL);
        assert_eq!(
            OperatingProfile::for_state(&CircuitState::HalfOpen {
                since: now,
                consecutive_successes: 0
            })
            .kind(),
            ProfileKind::Degraded
        );
        let open = OperatingProfile::for_state(&CircuitState::Open { since: now });
        assert_eq!(open.max_patch_lines(), 100);
        assert_eq!(open.quality_level(), QualityLevel::Minimal);
    }

    #[test]
    fn test_budgets_tighten_as_profiles_degrade() {
        let order = [
            OperatingProfile::NORMAL,
            OperatingProfile::DEGRADED,
            OperatingProfile::EMERGENCY,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].max_patch_lines() > pair[1].max_patch_lines());
        }
    }
}
