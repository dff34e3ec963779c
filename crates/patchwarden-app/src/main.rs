//! patchwarden - gate machine-generated patches before they land
//!
//! Extracts a unified diff from free-form model output, sanitizes it,
//! applies it to a git workspace and keeps it only if every gate passes.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use patchwarden_adapters::Config;
use patchwarden_core::{Mode, PipelineError, RolloutError, Verdict};
use patchwarden_engine::report::{render_circuit, render_lock, render_report, render_status};
use patchwarden_engine::{ApplyRequest, Warden};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "PATCHWARDEN_LOG";

#[derive(Parser, Debug)]
#[command(
    name = "patchwarden",
    about = "Safe-apply gate for machine-generated patches",
    version
)]
struct Cli {
    /// Log at debug level (overrides PATCHWARDEN_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract, sanitize, apply and gate a candidate patch
    Apply {
        #[command(flatten)]
        input: CandidateArgs,

        /// Stop after sanitization; never touch the workspace
        #[arg(long)]
        advisory: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Extract and sanitize only, under the workspace's current profile
    Check {
        #[command(flatten)]
        input: CandidateArgs,

        #[arg(long)]
        json: bool,
    },
    /// Show the rollback lock and circuit breaker of a workspace
    Status {
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
    },
    /// Remove the rollback lock left by a failed rollout
    Unlock {
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
    },
    /// Close the workspace's circuit breaker and clear its window
    ResetBreaker {
        #[arg(long, default_value = ".")]
        workspace: PathBuf,
    },
}

#[derive(Args, Debug)]
struct CandidateArgs {
    /// Git workspace the patch targets
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// File holding the model output, or `-` for stdin
    #[arg(long)]
    candidate: PathBuf,

    /// Files the change is expected to touch (repeatable)
    #[arg(long = "context")]
    context: Vec<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli.command) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("  error: {:#}", err);
            ExitCode::from(2)
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(command: Command) -> Result<ExitCode> {
    match command {
        Command::Apply {
            input,
            advisory,
            json,
        } => apply(input, !advisory, json),
        Command::Check { input, json } => check(input, json),
        Command::Status { workspace } => {
            let (workspace, warden, _) = open(&workspace)?;
            let status = warden.status(&workspace)?;
            print!("{}", render_status(&status));
            Ok(ExitCode::SUCCESS)
        }
        Command::Unlock { workspace } => {
            let (workspace, warden, _) = open(&workspace)?;
            match warden.unlock(&workspace)? {
                Some(lock) => {
                    println!("  Removed rollback lock");
                    print!("{}", render_lock(&lock));
                }
                None => println!("  No rollback lock in {}", workspace.display()),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::ResetBreaker { workspace } => {
            let (workspace, warden, _) = open(&workspace)?;
            let metrics = warden.reset_breaker(&workspace)?;
            print!("{}", render_circuit(&metrics));
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn apply(args: CandidateArgs, enable_apply: bool, json: bool) -> Result<ExitCode> {
    let (workspace, warden, config) = open(&args.workspace)?;
    let gates = config.resolved_gates(&workspace);
    if enable_apply && gates.is_empty() {
        tracing::warn!(
            "no gates configured or detected for {}; a clean apply is kept as-is",
            workspace.display()
        );
    }

    let request = ApplyRequest {
        workspace: workspace.clone(),
        candidate_text: read_candidate(&args.candidate)?,
        context_files: args.context,
        gates,
        enable_apply,
    };

    let report = match warden.run(&request) {
        Ok(report) => report,
        Err(err) => return Ok(surface(err)),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_report(&report));
    }

    Ok(match report.mode() {
        Mode::Apply => ExitCode::SUCCESS,
        Mode::Advisory | Mode::Blocked => ExitCode::from(1),
    })
}

fn check(args: CandidateArgs, json: bool) -> Result<ExitCode> {
    let (workspace, warden, _) = open(&args.workspace)?;
    let text = read_candidate(&args.candidate)?;

    let report = match warden.check(&workspace, &text, &args.context) {
        Ok(report) => report,
        Err(err) => return Ok(surface(err)),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_report(&report));
    }

    let acceptable = matches!(
        report.validation.as_ref().map(|v| v.verdict()),
        Some(Verdict::Valid | Verdict::Truncated)
    );
    Ok(if acceptable {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

/// Load the workspace's config and build a warden for it.
fn open(workspace: &Path) -> Result<(PathBuf, Warden, Config)> {
    let workspace = workspace
        .canonicalize()
        .with_context(|| format!("Workspace not found: {}", workspace.display()))?;
    let (config, origin) = Config::load(&workspace)?;
    match origin {
        Some(path) => tracing::debug!("loaded config from {}", path.display()),
        None => tracing::debug!("no config file, using defaults"),
    }
    let warden = Warden::local(&config)?;
    Ok((workspace, warden, config))
}

fn read_candidate(source: &Path) -> Result<String> {
    if source == Path::new("-") {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read candidate from stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(source)
        .with_context(|| format!("Failed to read candidate {}", source.display()))
}

/// Print an environment-level failure and map it to exit code 2.
fn surface(err: PipelineError) -> ExitCode {
    eprintln!("  error: {}", err);
    match &err {
        PipelineError::Rollout(RolloutError::WorkspaceLocked { lock }) => {
            eprint!("{}", render_lock(lock));
            eprintln!("  Run `patchwarden unlock` once the workspace has been inspected.");
        }
        PipelineError::Rollout(RolloutError::RevertFailed { .. }) => {
            eprintln!("  The applied commit is still at HEAD; repair it before unlocking.");
        }
        PipelineError::CircuitOpen { .. } => {
            eprintln!("  Run `patchwarden status` for breaker details.");
        }
        _ => {}
    }
    ExitCode::from(2)
}
