//! Git adapter for checkpoints and preflight.
//!
//! Every version-control operation the recovery subsystem performs goes
//! through this small, explicit wrapper around `git` subprocess calls. Each
//! call is bounded by a timeout. Callers must serialize operations per
//! working directory; nothing here takes a lock.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::io::process::{CommandOutput, run_command_with_timeout};

pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(120);
/// Patches are captured in memory; refuse anything larger than this.
pub const GIT_OUTPUT_LIMIT_BYTES: usize = 64 * 1024 * 1024;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

impl StatusEntry {
    pub fn is_untracked(&self) -> bool {
        self.code == "??"
    }
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    timeout: Duration,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            timeout: DEFAULT_GIT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `git --version`, run outside any repository.
    pub fn installed_version() -> Result<String> {
        let mut cmd = Command::new("git");
        cmd.arg("--version");
        let out = run_command_with_timeout(cmd, None, Duration::from_secs(10), 4096)?;
        if !out.success() {
            return Err(anyhow!("git --version failed: {}", out.stderr_lossy().trim()));
        }
        Ok(out.stdout_lossy().trim().to_string())
    }

    /// True if the working directory is inside a git work tree.
    pub fn is_repo(&self) -> Result<bool> {
        let out = self.run(&["rev-parse", "--is-inside-work-tree"], None)?;
        Ok(out.success() && out.stdout_lossy().trim() == "true")
    }

    /// True once HEAD resolves to a commit; false in a freshly initialized repository.
    pub fn has_commits(&self) -> Result<bool> {
        let out = self.run(&["rev-parse", "--verify", "-q", "HEAD^{commit}"], None)?;
        if out.timed_out {
            return Err(anyhow!("git rev-parse --verify HEAD timed out"));
        }
        Ok(out.status.success())
    }

    /// Full SHA of HEAD.
    pub fn head_commit(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    pub fn has_uncommitted_changes(&self) -> Result<bool> {
        Ok(!self.status_porcelain()?.is_empty())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run_capture(&["diff", "--cached", "--name-only"])?;
        Ok(!out.trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "--no-verify", "-m", message])?;
        Ok(true)
    }

    /// Mark untracked, non-ignored files as intent-to-add so they show up in `git diff`.
    #[instrument(skip_all)]
    pub fn intent_to_add_untracked(&self) -> Result<usize> {
        let out = self.run_capture(&["ls-files", "--others", "--exclude-standard", "-z"])?;
        let paths: Vec<&str> = out.split('\0').filter(|p| !p.is_empty()).collect();
        if paths.is_empty() {
            return Ok(0);
        }
        debug!(count = paths.len(), "marking untracked files intent-to-add");
        let mut args = vec!["add", "--intent-to-add", "--"];
        args.extend(paths.iter().copied());
        self.run_checked(&args)?;
        Ok(paths.len())
    }

    /// Binary-safe diff of the work tree against HEAD.
    pub fn diff_head_binary(&self) -> Result<String> {
        self.run_capture(&["diff", "--binary", "HEAD"])
    }

    /// Diff of a single path against HEAD (empty when unchanged or untracked).
    pub fn diff_path(&self, path: &str) -> Result<String> {
        self.run_capture(&["diff", "HEAD", "--", path])
    }

    #[instrument(skip_all, fields(commit))]
    pub fn reset_hard(&self, commit: &str) -> Result<()> {
        debug!(commit, "hard reset");
        self.run_checked(&["reset", "--hard", commit])?;
        Ok(())
    }

    /// Remove untracked, non-ignored files and directories.
    pub fn clean_untracked(&self) -> Result<()> {
        self.run_checked(&["clean", "-fd"])?;
        Ok(())
    }

    /// Apply a patch produced by [`Git::diff_head_binary`] to the work tree.
    #[instrument(skip_all, fields(patch_bytes = patch.len()))]
    pub fn apply_patch(&self, patch: &str) -> Result<()> {
        let args = ["apply", "--binary", "--whitespace=nowarn", "-"];
        let out = self.run(&args, Some(patch.as_bytes()))?;
        ensure_success(&args, &out)?;
        Ok(())
    }

    /// Stash all uncommitted changes, including untracked files.
    ///
    /// Returns the stash commit SHA, or `None` if there was nothing to stash.
    #[instrument(skip_all)]
    pub fn stash_push(&self, message: &str) -> Result<Option<String>> {
        if !self.has_uncommitted_changes()? {
            debug!("nothing to stash");
            return Ok(None);
        }
        self.run_checked(&["stash", "push", "--include-untracked", "-m", message])?;
        let sha = self.run_capture(&["rev-parse", "stash@{0}"])?;
        Ok(Some(sha.trim().to_string()))
    }

    /// Re-apply a stash by SHA or ref, then drop it from the stash list.
    #[instrument(skip_all, fields(stash_ref))]
    pub fn stash_apply(&self, stash_ref: &str) -> Result<()> {
        self.run_checked(&["stash", "apply", stash_ref])?;
        let resolved = self.run_capture(&["rev-parse", stash_ref])?;
        let list = self.run_capture(&["stash", "list", "--format=%H"])?;
        if let Some(index) = list.lines().position(|sha| sha.trim() == resolved.trim()) {
            let entry = format!("stash@{{{index}}}");
            if let Err(err) = self.run_checked(&["stash", "drop", &entry]) {
                warn!(err = %err, entry = %entry, "applied stash but could not drop it");
            }
        }
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        if output.stdout_truncated > 0 {
            return Err(anyhow!(
                "git {} output exceeded {} bytes",
                args.join(" "),
                GIT_OUTPUT_LIMIT_BYTES
            ));
        }
        Ok(output.stdout_lossy())
    }

    fn run_checked(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run(args, None)?;
        ensure_success(args, &output)?;
        Ok(output)
    }

    fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        run_command_with_timeout(cmd, stdin, self.timeout, GIT_OUTPUT_LIMIT_BYTES)
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn ensure_success(args: &[&str], output: &CommandOutput) -> Result<()> {
    if output.timed_out {
        return Err(anyhow!("git {} timed out", args.join(" ")));
    }
    if !output.status.success() {
        return Err(anyhow!(
            "git {} failed: {}",
            args.join(" "),
            output.stderr_lossy().trim()
        ));
    }
    Ok(())
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim();
    // Only renames and copies carry an "old -> new" pair.
    if code.contains(['R', 'C'])
        && let Some((_, new)) = path.split_once(" -> ")
    {
        path = new.trim();
    }
    Ok(StatusEntry {
        code,
        path: path.to_string(),
    })
}
