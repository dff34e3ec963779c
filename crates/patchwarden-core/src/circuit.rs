//! Circuit breaker over apply outcomes
//!
//! Keeps a rolling window of the last `window_size` outcomes for one
//! workspace and decides whether new rollouts are admitted and which
//! operating profile they run under.
//!
//! ## States
//! - **Closed**: rollouts admitted under the normal profile
//! - **Open**: rollouts rejected until `recovery_timeout_secs` has elapsed
//! - **Half-Open**: rollouts admitted under the degraded profile while the
//!   workspace proves it has recovered
//!
//! Time is always passed in, so every transition is a function of the
//! window contents and the supplied clock.

use crate::profile::OperatingProfile;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Outcomes kept in the rolling window
    pub window_size: usize,
    /// Failure rate (0.0 - 1.0] that opens the circuit
    pub failure_threshold: f64,
    /// How long the circuit stays open before probing
    pub recovery_timeout_secs: u64,
    /// Consecutive half-open successes needed to close
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            failure_threshold: 0.1,
            recovery_timeout_secs: 300,
            success_threshold: 5,
        }
    }
}

impl BreakerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.window_size == 0 {
            return Err("breaker.window_size must be at least 1".to_string());
        }
        if !(self.failure_threshold > 0.0 && self.failure_threshold <= 1.0) {
            return Err(format!(
                "breaker.failure_threshold must be in (0, 1], got {}",
                self.failure_threshold
            ));
        }
        if self.recovery_timeout_secs == 0 {
            return Err("breaker.recovery_timeout_secs must be at least 1".to_string());
        }
        if self.success_threshold == 0 {
            return Err("breaker.success_threshold must be at least 1".to_string());
        }
        Ok(())
    }

    fn with_usable_window(mut self) -> Self {
        self.window_size = self.window_size.max(1);
        self
    }

    fn recovery_timeout(&self) -> Duration {
        Duration::seconds(self.recovery_timeout_secs.min(u64::from(u32::MAX)) as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open {
        since: DateTime<Utc>,
    },
    HalfOpen {
        since: DateTime<Utc>,
        consecutive_successes: u32,
    },
}

impl CircuitState {
    pub fn label(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open { .. } => "open",
            CircuitState::HalfOpen { .. } => "half_open",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, CircuitState::Open { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowEntry {
    pub success: bool,
    pub at: DateTime<Utc>,
}

/// Lifetime totals; unlike the window these never roll off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerCounters {
    pub total_successes: u64,
    pub total_failures: u64,
    pub times_opened: u64,
}

/// Everything needed to rebuild a breaker after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub window: Vec<WindowEntry>,
    #[serde(default)]
    pub counters: BreakerCounters,
    #[serde(default)]
    pub config: BreakerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerMetrics {
    pub state: CircuitState,
    pub window_len: usize,
    pub successes: usize,
    pub failures: usize,
    pub failure_rate: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub counters: BreakerCounters,
    pub profile: OperatingProfile,
    pub reopens_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    window: VecDeque<WindowEntry>,
    counters: BreakerCounters,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl CircuitBreaker {
    /// A zero `window_size` is treated as one.
    pub fn new(config: BreakerConfig) -> Self {
        let config = config.with_usable_window();
        Self {
            config,
            state: CircuitState::Closed,
            window: VecDeque::with_capacity(config.window_size),
            counters: BreakerCounters::default(),
        }
    }

    /// Rebuild from a snapshot under `config`. When the configured window is
    /// smaller than the stored one, only the newest entries are kept.
    pub fn from_snapshot(snapshot: BreakerSnapshot, config: BreakerConfig) -> Self {
        let config = config.with_usable_window();
        let keep = config.window_size;
        let skip = snapshot.window.len().saturating_sub(keep);
        let window: VecDeque<WindowEntry> = snapshot.window.into_iter().skip(skip).collect();
        Self {
            config,
            state: snapshot.state,
            window,
            counters: snapshot.counters,
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            window: self.window.iter().copied().collect(),
            counters: self.counters,
            config: self.config,
        }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&mut self, now: DateTime<Utc>) -> CircuitState {
        self.settle(now);
        self.state
    }

    pub fn should_allow_request(&mut self, now: DateTime<Utc>) -> bool {
        !self.state(now).is_open()
    }

    pub fn current_profile(&mut self, now: DateTime<Utc>) -> OperatingProfile {
        OperatingProfile::for_state(&self.state(now))
    }

    /// When an open circuit starts admitting requests again.
    pub fn reopens_at(&self) -> Option<DateTime<Utc>> {
        match self.state {
            CircuitState::Open { since } => Some(since + self.config.recovery_timeout()),
            _ => None,
        }
    }

    pub fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|e| !e.success).count();
        failures as f64 / self.window.len() as f64
    }

    /// Append one outcome and apply any transition it triggers.
    pub fn record_outcome(&mut self, success: bool, now: DateTime<Utc>) -> CircuitState {
        self.settle(now);

        while self.window.len() >= self.config.window_size {
            self.window.pop_front();
        }
        self.window.push_back(WindowEntry { success, at: now });
        if success {
            self.counters.total_successes += 1;
        } else {
            self.counters.total_failures += 1;
        }

        let tripped = self.failure_rate() >= self.config.failure_threshold;
        match self.state {
            CircuitState::Closed => {
                if tripped {
                    self.open(now);
                }
            }
            CircuitState::HalfOpen {
                since,
                consecutive_successes,
            } => {
                if tripped {
                    self.open(now);
                } else {
                    let consecutive = if success { consecutive_successes + 1 } else { 0 };
                    if consecutive >= self.config.success_threshold {
                        info!(successes = consecutive, "circuit closed");
                        self.state = CircuitState::Closed;
                    } else {
                        self.state = CircuitState::HalfOpen {
                            since,
                            consecutive_successes: consecutive,
                        };
                    }
                }
            }
            // Outcomes reported while open (callers bypassing the check) only
            // feed the window.
            CircuitState::Open { .. } => {}
        }
        self.state
    }

    /// Back to Closed with an empty window. Lifetime counters are kept.
    pub fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.window.clear();
        info!("circuit reset");
    }

    pub fn metrics(&mut self, now: DateTime<Utc>) -> BreakerMetrics {
        let state = self.state(now);
        let successes = self.window.iter().filter(|e| e.success).count();
        let last_of = |want: bool| {
            self.window
                .iter()
                .rev()
                .find(|e| e.success == want)
                .map(|e| e.at)
        };
        BreakerMetrics {
            state,
            window_len: self.window.len(),
            successes,
            failures: self.window.len() - successes,
            failure_rate: self.failure_rate(),
            last_success: last_of(true),
            last_failure: last_of(false),
            counters: self.counters,
            profile: OperatingProfile::for_state(&state),
            reopens_at: self.reopens_at(),
        }
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open { since: now };
        self.counters.times_opened += 1;
        info!(
            failure_rate = self.failure_rate(),
            window = self.window.len(),
            "circuit opened"
        );
    }

    // Open -> HalfOpen once the recovery timeout has passed. The window is
    // cleared so the probe period is judged on its own outcomes.
    fn settle(&mut self, now: DateTime<Utc>) {
        if let CircuitState::Open { since } = self.state {
            let half_open_at = since + self.config.recovery_timeout();
            if now >= half_open_at {
                self.state = CircuitState::HalfOpen {
                    since: half_open_at,
                    consecutive_successes: 0,
                };
                self.window.clear();
                info!("circuit half-open");
            }
        }
    }
}
