//! Configuration for patchwarden.
//!
//! Read from TOML. The first of these that exists wins:
//! `$PATCHWARDEN_CONFIG`, `<workspace>/.patchwarden/config.toml`,
//! `<config_dir>/patchwarden/config.toml`. Otherwise built-in defaults.

use crate::sandbox::{SandboxSettings, DEFAULT_NETWORK_TOOLS};
use crate::util::state_dir;
use patchwarden_core::sanitize::{DEFAULT_BLOCKED_CONTENT, DEFAULT_SENSITIVE_PATHS};
use patchwarden_core::{
    BreakerConfig, CommandLine, GateSpec, QuotaOverrides, Quotas, SanitizerPolicy,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const CONFIG_ENV: &str = "PATCHWARDEN_CONFIG";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config value `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

fn invalid(key: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.into(),
        reason: reason.into(),
    }
}

// A zero limit leaves a gate unable to start, so it is refused up front.
fn reject_zero_quotas(prefix: &str, fields: [(&str, Option<u64>); 5]) -> Result<(), ConfigError> {
    match fields.iter().find(|(_, value)| *value == Some(0)) {
        Some((field, _)) => Err(invalid(format!("{}.{}", prefix, field), "must be at least 1")),
        None => Ok(()),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub breaker: BreakerConfig,
    pub quotas: QuotaSettings,
    pub sandbox: SandboxConfig,
    pub sanitizer: SanitizerConfig,
    pub gates: Vec<GateConfig>,
}

/// Workspace-wide quota defaults. Memory is configured in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaSettings {
    pub cpu_seconds: u64,
    pub memory_mb: u64,
    pub max_processes: u64,
    pub max_open_files: u64,
    pub timeout_seconds: u64,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        let quotas = Quotas::default();
        Self {
            cpu_seconds: quotas.cpu_seconds,
            memory_mb: quotas.memory_bytes / (1024 * 1024),
            max_processes: quotas.max_processes,
            max_open_files: quotas.max_open_files,
            timeout_seconds: quotas.timeout_seconds,
        }
    }
}

impl QuotaSettings {
    pub fn to_quotas(&self) -> Quotas {
        Quotas {
            cpu_seconds: self.cpu_seconds,
            memory_bytes: self.memory_mb.saturating_mul(1024 * 1024),
            max_processes: self.max_processes,
            max_open_files: self.max_open_files,
            timeout_seconds: self.timeout_seconds,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub deny_network: bool,
    pub network_tools: Vec<String>,
    pub output_tail_bytes: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let settings = SandboxSettings::default();
        Self {
            deny_network: true,
            network_tools: settings.network_tools,
            output_tail_bytes: settings.output_tail_bytes,
        }
    }
}

impl SandboxConfig {
    pub fn settings(&self) -> SandboxSettings {
        SandboxSettings {
            network_tools: self.network_tools.clone(),
            output_tail_bytes: self.output_tail_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizerConfig {
    pub sensitive_paths: Vec<String>,
    pub blocked_content: Vec<String>,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            sensitive_paths: DEFAULT_SENSITIVE_PATHS.iter().map(|s| s.to_string()).collect(),
            blocked_content: DEFAULT_BLOCKED_CONTENT.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SanitizerConfig {
    pub fn policy(&self) -> Result<SanitizerPolicy, ConfigError> {
        SanitizerPolicy::from_patterns(self.sensitive_paths.as_slice(), self.blocked_content.as_slice())
            .map_err(|e| invalid("sanitizer", e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    pub name: String,
    pub command: CommandLine,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub failure_markers: Vec<String>,
    #[serde(default)]
    pub quotas: QuotaOverrides,
}

impl GateConfig {
    fn to_spec(&self, base: &Quotas) -> GateSpec {
        GateSpec {
            name: self.name.clone(),
            command: self.command.clone(),
            critical: self.critical,
            failure_markers: self.failure_markers.clone(),
            quotas: base.with_overrides(&self.quotas),
        }
    }
}

impl Config {
    fn global_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("patchwarden").join(CONFIG_FILE))
    }

    pub fn workspace_path(workspace: &Path) -> PathBuf {
        state_dir(workspace).join(CONFIG_FILE)
    }

    /// Which file `load` would read for this workspace, if any.
    pub fn resolve_path(workspace: &Path) -> Option<PathBuf> {
        let explicit = std::env::var_os(CONFIG_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        resolve_from(explicit, workspace, Self::global_path())
    }

    /// Load and validate the configuration for a workspace.
    pub fn load(workspace: &Path) -> Result<(Config, Option<PathBuf>), ConfigError> {
        match Self::resolve_path(workspace) {
            Some(path) => {
                let config = Self::load_from(&path)?;
                debug!(path = %path.display(), "config loaded");
                Ok((config, Some(path)))
            }
            None => Ok((Config::default(), None)),
        }
    }

    pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    pub fn from_toml_str(content: &str) -> Result<Config, ConfigError> {
        Self::parse(content, Path::new("<inline>"))
    }

    fn parse(content: &str, origin: &Path) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.breaker
            .validate()
            .map_err(|reason| invalid("breaker", reason))?;

        let q = &self.quotas;
        reject_zero_quotas(
            "quotas",
            [
                ("cpu_seconds", Some(q.cpu_seconds)),
                ("memory_mb", Some(q.memory_mb)),
                ("max_processes", Some(q.max_processes)),
                ("max_open_files", Some(q.max_open_files)),
                ("timeout_seconds", Some(q.timeout_seconds)),
            ],
        )?;

        for (field, patterns) in [
            ("sanitizer.sensitive_paths", &self.sanitizer.sensitive_paths),
            ("sanitizer.blocked_content", &self.sanitizer.blocked_content),
        ] {
            for (i, pattern) in patterns.iter().enumerate() {
                if let Err(e) = Regex::new(pattern) {
                    return Err(invalid(format!("{}[{}]", field, i), e.to_string()));
                }
            }
        }

        let mut seen = HashSet::new();
        for (i, gate) in self.gates.iter().enumerate() {
            let key = |field: &str| format!("gates[{}].{}", i, field);
            if gate.name.trim().is_empty() {
                return Err(invalid(key("name"), "must not be empty"));
            }
            if !seen.insert(gate.name.as_str()) {
                return Err(invalid(
                    key("name"),
                    format!("duplicate gate name '{}'", gate.name),
                ));
            }
            if gate.command.program_and_args().is_none() {
                return Err(invalid(key("command"), "must not be empty"));
            }
            let q = &gate.quotas;
            reject_zero_quotas(
                &key("quotas"),
                [
                    ("cpu_seconds", q.cpu_seconds),
                    ("memory_mb", q.memory_mb),
                    ("max_processes", q.max_processes),
                    ("max_open_files", q.max_open_files),
                    ("timeout_seconds", q.timeout_seconds),
                ],
            )?;
            for (j, marker) in gate.failure_markers.iter().enumerate() {
                if let Err(e) = Regex::new(marker) {
                    return Err(invalid(
                        format!("gates[{}].failure_markers[{}]", i, j),
                        e.to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Configured gates, or gates detected from the workspace toolchain.
    pub fn resolved_gates(&self, workspace: &Path) -> Vec<GateSpec> {
        let base = self.quotas.to_quotas();
        if self.gates.is_empty() {
            return detect_gates(workspace, &base);
        }
        self.gates.iter().map(|g| g.to_spec(&base)).collect()
    }
}

fn resolve_from(
    explicit: Option<PathBuf>,
    workspace: &Path,
    global: Option<PathBuf>,
) -> Option<PathBuf> {
    if explicit.is_some() {
        // An explicit path is used even when missing, so the read error surfaces.
        return explicit;
    }
    let local = Config::workspace_path(workspace);
    if local.is_file() {
        return Some(local);
    }
    global.filter(|p| p.is_file())
}

/// Default gates for whatever toolchains the workspace uses.
pub fn detect_gates(workspace: &Path, base: &Quotas) -> Vec<GateSpec> {
    let mut gates = vec![GateSpec::new(
        "whitespace",
        CommandLine::argv(["git", "diff", "--check", "HEAD~1"]),
    )];

    if workspace.join("Cargo.toml").is_file() {
        gates.push(GateSpec::new("cargo-check", CommandLine::argv(["cargo", "check"])).critical());
    }
    if workspace.join("go.mod").is_file() {
        gates.push(GateSpec::new("go-vet", CommandLine::argv(["go", "vet", "./..."])).critical());
    }
    if workspace.join("pyproject.toml").is_file() || workspace.join("setup.py").is_file() {
        gates.push(
            GateSpec::new(
                "python-compile",
                CommandLine::argv(["python", "-m", "compileall", "-q", "."]),
            )
            .critical(),
        );
    }
    if workspace.join("package.json").is_file() {
        gates.push(GateSpec::new("npm-test", CommandLine::argv(["npm", "test"])));
    }

    gates.into_iter().map(|g| g.with_quotas(*base)).collect()
}

/// Names of the tools shimmed by default.
pub fn default_network_tools() -> Vec<String> {
    DEFAULT_NETWORK_TOOLS.iter().map(|s| s.to_string()).collect()
}
