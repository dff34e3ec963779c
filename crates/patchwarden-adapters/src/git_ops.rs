//! Git operations for the apply/rollback workflow
//!
//! Patch application shells out to `git apply` (libgit2 cannot parse plain
//! non-git unified diffs); HEAD inspection, commits and reverts use git2.

use crate::util::run_command_with_timeout;
use anyhow::{Context, Result};
use git2::{Repository, Signature};
use patchwarden_core::{CommitId, VcsError, VersionControl};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info};

const GIT_APPLY_TIMEOUT_SECS: u64 = 60;

fn open_repo_discover(repo_path: &Path) -> Result<Repository> {
    Repository::discover(repo_path).with_context(|| {
        format!(
            "Failed to open repository from path '{}'",
            repo_path.display()
        )
    })
}

fn backend(err: anyhow::Error) -> VcsError {
    VcsError::Backend(format!("{:#}", err))
}

/// A git working tree used as the rollout target.
#[derive(Debug, Clone)]
pub struct GitWorkspace {
    root: PathBuf,
}

impl GitWorkspace {
    /// Open the repository containing `path`; the rollout runs at its root.
    pub fn open(path: &Path) -> Result<Self> {
        let repo = open_repo_discover(path)?;
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .ok_or_else(|| anyhow::anyhow!("'{}' is a bare repository", path.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn repo(&self) -> Result<Repository> {
        open_repo_discover(&self.root)
    }

    fn git_apply(&self, patch: &str, check_only: bool) -> Result<(), VcsError> {
        let mut file = tempfile::Builder::new()
            .prefix("patchwarden-")
            .suffix(".patch")
            .tempfile()
            .map_err(|e| VcsError::Backend(format!("Failed to stage patch file: {}", e)))?;
        file.write_all(patch.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| VcsError::Backend(format!("Failed to stage patch file: {}", e)))?;

        let strip = format!("-p{}", strip_level(patch));
        let mut cmd = Command::new("git");
        cmd.current_dir(&self.root)
            .env("GIT_TERMINAL_PROMPT", "0")
            .arg("apply");
        if check_only {
            cmd.arg("--check");
        }
        cmd.args(["--index", "--recount", "--whitespace=nowarn", &strip])
            .arg(file.path());

        let output = run_command_with_timeout(&mut cmd, Duration::from_secs(GIT_APPLY_TIMEOUT_SECS))
            .map_err(|e| VcsError::Backend(format!("Failed to run git apply: {}", e)))?;
        if output.timed_out {
            return Err(VcsError::Backend(format!(
                "git apply timed out after {}s",
                GIT_APPLY_TIMEOUT_SECS
            )));
        }
        if !output.success() {
            let detail = output.stderr.trim();
            return Err(VcsError::PatchRejected(if detail.is_empty() {
                "git apply rejected the patch".to_string()
            } else {
                detail.to_string()
            }));
        }
        Ok(())
    }

    fn head_commit(&self) -> Result<CommitId> {
        let repo = self.repo()?;
        let head = repo
            .head()
            .context("Repository has no HEAD (no commits yet?)")?;
        let commit = head.peel_to_commit()?;
        Ok(CommitId::new(commit.id().to_string()))
    }

    fn commit_index(&self, message: &str) -> Result<CommitId> {
        let repo = self.repo()?;
        let mut index = repo.index()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let parent = repo.head()?.peel_to_commit()?;

        let sig = signature(&repo)?;
        let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
        Ok(CommitId::new(oid.to_string()))
    }

    fn revert_commit(&self, target: &CommitId, message: &str) -> Result<Result<CommitId, VcsError>> {
        let repo = self.repo()?;
        let oid = git2::Oid::from_str(target.as_str())
            .with_context(|| format!("Invalid commit id '{}'", target))?;
        let commit = repo.find_commit(oid)?;

        repo.revert(&commit, None)
            .with_context(|| format!("Failed to revert {}", target.short()))?;

        let mut index = repo.index()?;
        if index.has_conflicts() {
            // Leave HEAD untouched and the tree as it was before the attempt.
            repo.cleanup_state()?;
            let head_tree = repo.head()?.peel_to_tree()?;
            index.read_tree(&head_tree)?;
            index.write()?;
            let mut checkout = git2::build::CheckoutBuilder::new();
            checkout.force();
            repo.checkout_head(Some(&mut checkout))?;
            return Ok(Err(VcsError::RevertConflict {
                commit: target.clone(),
            }));
        }

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let parent = repo.head()?.peel_to_commit()?;
        let sig = signature(&repo)?;
        let new_oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
        repo.cleanup_state()?;
        Ok(Ok(CommitId::new(new_oid.to_string())))
    }
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    let config = repo.config()?;
    let name = config
        .get_string("user.name")
        .unwrap_or_else(|_| "patchwarden".to_string());
    let email = config
        .get_string("user.email")
        .unwrap_or_else(|_| "patchwarden@local".to_string());
    Ok(Signature::now(&name, &email)?)
}

/// `-p1` for git-style `a/` `b/` headers, `-p0` for bare paths.
fn strip_level(patch: &str) -> u8 {
    if patch.lines().any(|l| l.starts_with("diff --git ")) {
        return 1;
    }
    let mut saw_path = false;
    for line in patch.lines() {
        let Some(raw) = line
            .strip_prefix("--- ")
            .or_else(|| line.strip_prefix("+++ "))
        else {
            continue;
        };
        let path = raw.split('\t').next().unwrap_or(raw).trim().trim_matches('"');
        if path == "/dev/null" {
            continue;
        }
        saw_path = true;
        if !(path.starts_with("a/") || path.starts_with("b/")) {
            return 0;
        }
    }
    if saw_path {
        1
    } else {
        0
    }
}

impl VersionControl for GitWorkspace {
    fn current_head(&self) -> Result<CommitId, VcsError> {
        self.head_commit().map_err(backend)
    }

    fn check_apply(&self, patch: &str) -> Result<(), VcsError> {
        self.git_apply(patch, true)
    }

    fn apply(&mut self, patch: &str) -> Result<(), VcsError> {
        self.git_apply(patch, false)?;
        debug!(root = %self.root.display(), "patch applied to index");
        Ok(())
    }

    fn commit(&mut self, message: &str) -> Result<CommitId, VcsError> {
        self.commit_index(message).map_err(backend)
    }

    fn revert(&mut self, commit: &CommitId, message: &str) -> Result<CommitId, VcsError> {
        let reverted = self.revert_commit(commit, message).map_err(backend)??;
        info!(reverted = %commit.short(), head = %reverted.short(), "commit reverted");
        Ok(reverted)
    }
}
