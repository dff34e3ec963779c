//! Rollout orchestration for patchwarden.

pub mod gate;
pub mod report;
pub mod warden;

#[cfg(test)]
mod testing;

pub use gate::{RolloutGate, RolloutOutcome, RolloutTarget};
pub use warden::{ApplyRequest, Warden, WardenSettings, WorkspaceStatus};
