//! Runtime adapters for patchwarden (git, sandboxed processes, persistence, config).

pub mod backend;
pub mod config;
pub mod git_ops;
pub mod lease;
pub mod sandbox;
pub mod store;
pub mod util;

pub use backend::LocalBackend;
pub use config::{Config, ConfigError};
pub use git_ops::GitWorkspace;
pub use sandbox::{ProcessSandbox, SandboxSettings};
pub use store::{FileLockStore, FileSnapshotStore};
