//! Test-only helpers: throwaway git repositories and record fixtures.

use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tempfile::TempDir;

use crate::core::checkpoint::{Checkpoint, StorageType, checkpoint_description};
use crate::core::failure::{BattleFailure, FailureType, get_recovery_options};
use crate::core::types::{
    Battle, BattleStatus, FeedbackResults, Iteration, IterationResult, Task, TaskStatus,
};
use crate::io::git::Git;

/// Git repository in a temp dir with one commit containing `README.md`.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let repo = Self { dir };
        repo.git_cmd(&["init", "-q"])?;
        repo.git_cmd(&["config", "user.email", "recovery@example.com"])?;
        repo.git_cmd(&["config", "user.name", "Recovery Tests"])?;
        repo.git_cmd(&["config", "commit.gpgsign", "false"])?;
        repo.write("README.md", "# test repo\n")?;
        repo.git_cmd(&["add", "-A"])?;
        repo.git_cmd(&["commit", "-q", "-m", "initial"])?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.root())
    }

    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.root().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.root().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.root().join(rel).exists()
    }

    pub fn remove(&self, rel: &str) -> Result<()> {
        let path = self.root().join(rel);
        fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))
    }

    /// Commit everything in the work tree and return the new HEAD.
    pub fn commit_all(&self, message: &str) -> Result<String> {
        self.git_cmd(&["add", "-A"])?;
        self.git_cmd(&["commit", "-q", "--allow-empty", "-m", message])?;
        self.git().head_commit()
    }

    fn git_cmd(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.root())
            .output()
            .with_context(|| format!("run git {}", args.join(" ")))?;
        if !output.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(())
    }
}

/// Pending task with one acceptance criterion and a short description.
pub fn task(id: &str) -> Task {
    Task {
        id: id.to_string(),
        title: format!("{id} title"),
        description: format!("{id} description"),
        acceptance_criteria: vec![format!("{id} works")],
        status: TaskStatus::Pending,
    }
}

/// Classified failure with the first recovery option as its suggestion.
pub fn failure(failure_type: FailureType, iteration: u32, recoverable: bool) -> BattleFailure {
    let message = match failure_type {
        FailureType::FeedbackFailure => "Feedback loop 'test' failed".to_string(),
        other => format!("{other:?} during iteration {iteration}"),
    };
    BattleFailure {
        failure_type,
        timestamp: Utc::now(),
        iteration,
        message,
        details: None,
        recoverable,
        suggested_action: get_recovery_options(failure_type)[0],
    }
}

pub fn iteration(number: u32) -> Iteration {
    Iteration {
        number,
        started_at: Utc::now(),
        completed_at: None,
        output: format!("iteration {number} output"),
        result: IterationResult::Failure,
        files_changed: Vec::new(),
        commit_hash: None,
        feedback_results: FeedbackResults::new(),
        retry_count: 0,
    }
}

/// Running battle with iterations `1..=count`.
pub fn battle_with_iterations(count: u32) -> Battle {
    Battle {
        id: "battle-1".to_string(),
        task_id: "task-1".to_string(),
        status: BattleStatus::Running,
        started_at: Utc::now(),
        iterations: (1..=count).map(iteration).collect(),
    }
}

pub fn commit_checkpoint(id: &str, after_iteration: u32) -> Checkpoint {
    Checkpoint {
        id: id.to_string(),
        battle_id: "battle-1".to_string(),
        after_iteration,
        storage_type: StorageType::Commit,
        commit_hash: Some(format!("{:0>40}", after_iteration)),
        base_commit_hash: None,
        patch: None,
        timestamp: Utc::now(),
        description: checkpoint_description(after_iteration),
        files: Vec::new(),
        feedback_results: FeedbackResults::new(),
    }
}

pub fn patch_checkpoint(id: &str, after_iteration: u32, patch: &str) -> Checkpoint {
    Checkpoint {
        storage_type: StorageType::Patch,
        commit_hash: None,
        base_commit_hash: Some(format!("{:0>40}", after_iteration)),
        patch: Some(patch.to_string()),
        ..commit_checkpoint(id, after_iteration)
    }
}
