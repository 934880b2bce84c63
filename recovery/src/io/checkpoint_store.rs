//! Checkpoint backends over a git working directory.
//!
//! - [`CommitCheckpointStore`]: the snapshot is a commit; restore hard-resets to it.
//! - [`PatchCheckpointStore`]: the snapshot is HEAD plus a binary diff of the
//!   uncommitted work; restore resets to HEAD and re-applies the diff.
//!
//! Both leave the caller's branch history alone on restore except for moving
//! HEAD. Neither locks the working directory: callers must not run two
//! checkpoint operations on the same directory at once.

use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use tracing::{debug, info, instrument};

use crate::core::checkpoint::{
    Checkpoint, MISSING_BASE_COMMIT_HASH, MISSING_COMMIT_HASH, StorageType,
    checkpoint_description,
};
use crate::core::types::{FeedbackResults, Iteration};
use crate::io::config::BattleConfig;
use crate::io::git::Git;

/// Inputs for creating one checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointRequest<'a> {
    pub battle_id: &'a str,
    /// Iteration the snapshot follows; `0` for the baseline.
    pub after_iteration: u32,
    /// Commit the execution loop already made for this iteration, if any.
    pub commit_hash: Option<&'a str>,
    pub files: &'a [String],
    pub feedback_results: &'a FeedbackResults,
    /// Overrides the generated description.
    pub description: Option<&'a str>,
}

impl<'a> CheckpointRequest<'a> {
    pub fn for_iteration(battle_id: &'a str, iteration: &'a Iteration) -> Self {
        Self {
            battle_id,
            after_iteration: iteration.number,
            commit_hash: iteration.commit_hash.as_deref(),
            files: &iteration.files_changed,
            feedback_results: &iteration.feedback_results,
            description: None,
        }
    }

    fn description(&self) -> String {
        self.description
            .map(str::to_string)
            .unwrap_or_else(|| checkpoint_description(self.after_iteration))
    }

    fn checkpoint(&self, storage_type: StorageType) -> Checkpoint {
        Checkpoint {
            id: generate_checkpoint_id(self.battle_id, self.after_iteration),
            battle_id: self.battle_id.to_string(),
            after_iteration: self.after_iteration,
            storage_type,
            commit_hash: None,
            base_commit_hash: None,
            patch: None,
            timestamp: Utc::now(),
            description: self.description(),
            files: self.files.to_vec(),
            feedback_results: self.feedback_results.clone(),
        }
    }
}

/// A way of snapshotting and restoring a working directory.
pub trait CheckpointStore {
    fn storage_type(&self) -> StorageType;

    fn create(&self, request: &CheckpointRequest<'_>, dir: &Path) -> Result<Checkpoint>;

    /// Restore `dir` to the snapshot, discarding everything done since.
    fn restore(&self, checkpoint: &Checkpoint, dir: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct CommitCheckpointStore {
    git_timeout: Duration,
}

impl CommitCheckpointStore {
    pub fn new(git_timeout: Duration) -> Self {
        Self { git_timeout }
    }
}

impl CheckpointStore for CommitCheckpointStore {
    fn storage_type(&self) -> StorageType {
        StorageType::Commit
    }

    #[instrument(skip_all, fields(battle_id = request.battle_id, after_iteration = request.after_iteration))]
    fn create(&self, request: &CheckpointRequest<'_>, dir: &Path) -> Result<Checkpoint> {
        let git = Git::new(dir).with_timeout(self.git_timeout);
        let commit_hash = match request.commit_hash.filter(|hash| !hash.trim().is_empty()) {
            Some(existing) => {
                debug!(commit = existing, "reusing iteration commit");
                existing.to_string()
            }
            None => {
                git.add_all()?;
                let message = format!(
                    "checkpoint({}): {}",
                    request.battle_id,
                    request.description()
                );
                if !git.commit_staged(&message)? {
                    debug!("tree unchanged, checkpointing current HEAD");
                }
                git.head_commit()?
            }
        };

        let mut checkpoint = request.checkpoint(StorageType::Commit);
        checkpoint.commit_hash = Some(commit_hash);
        info!(id = %checkpoint.id, commit = ?checkpoint.commit_hash, "commit checkpoint created");
        Ok(checkpoint)
    }

    #[instrument(skip_all, fields(id = %checkpoint.id))]
    fn restore(&self, checkpoint: &Checkpoint, dir: &Path) -> Result<()> {
        let Some(commit_hash) = checkpoint.commit_hash() else {
            bail!(MISSING_COMMIT_HASH);
        };
        let git = Git::new(dir).with_timeout(self.git_timeout);
        git.reset_hard(commit_hash)?;
        git.clean_untracked()?;
        info!(commit = commit_hash, "commit checkpoint restored");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PatchCheckpointStore {
    git_timeout: Duration,
}

impl PatchCheckpointStore {
    pub fn new(git_timeout: Duration) -> Self {
        Self { git_timeout }
    }
}

impl CheckpointStore for PatchCheckpointStore {
    fn storage_type(&self) -> StorageType {
        StorageType::Patch
    }

    #[instrument(skip_all, fields(battle_id = request.battle_id, after_iteration = request.after_iteration))]
    fn create(&self, request: &CheckpointRequest<'_>, dir: &Path) -> Result<Checkpoint> {
        let git = Git::new(dir).with_timeout(self.git_timeout);
        let base_commit_hash = git.head_commit()?;
        // New files only appear in `git diff HEAD` once the index knows about them.
        git.intent_to_add_untracked()?;
        let patch = git.diff_head_binary()?;

        let mut checkpoint = request.checkpoint(StorageType::Patch);
        checkpoint.base_commit_hash = Some(base_commit_hash);
        checkpoint.patch = Some(patch);
        info!(
            id = %checkpoint.id,
            base = ?checkpoint.base_commit_hash,
            patch_bytes = checkpoint.patch.as_deref().map_or(0, str::len),
            "patch checkpoint created"
        );
        Ok(checkpoint)
    }

    #[instrument(skip_all, fields(id = %checkpoint.id))]
    fn restore(&self, checkpoint: &Checkpoint, dir: &Path) -> Result<()> {
        let Some(base_commit_hash) = checkpoint.base_commit_hash() else {
            bail!(MISSING_BASE_COMMIT_HASH);
        };
        let git = Git::new(dir).with_timeout(self.git_timeout);
        git.reset_hard(base_commit_hash)?;
        git.clean_untracked()?;
        match checkpoint.patch() {
            Some(patch) => git.apply_patch(patch)?,
            None => debug!("empty patch, nothing to apply"),
        }
        info!(base = base_commit_hash, "patch checkpoint restored");
        Ok(())
    }
}

/// Backend matching `config.auto_commit`.
pub fn get_checkpoint_storage(config: &BattleConfig) -> Box<dyn CheckpointStore> {
    if config.auto_commit {
        Box::new(CommitCheckpointStore::new(config.git_timeout()))
    } else {
        Box::new(PatchCheckpointStore::new(config.git_timeout()))
    }
}

/// Backend that can restore `checkpoint`, chosen by how it was stored.
pub fn storage_for(checkpoint: &Checkpoint, config: &BattleConfig) -> Box<dyn CheckpointStore> {
    match checkpoint.storage_type {
        StorageType::Commit => Box::new(CommitCheckpointStore::new(config.git_timeout())),
        StorageType::Patch => Box::new(PatchCheckpointStore::new(config.git_timeout())),
    }
}

/// Iteration-0 baseline taken before the first attempt.
pub fn create_initial_checkpoint(
    battle_id: &str,
    dir: &Path,
    config: &BattleConfig,
) -> Result<Checkpoint> {
    let feedback_results = FeedbackResults::new();
    let request = CheckpointRequest {
        battle_id,
        after_iteration: 0,
        commit_hash: None,
        files: &[],
        feedback_results: &feedback_results,
        description: None,
    };
    get_checkpoint_storage(config).create(&request, dir)
}

pub fn restore_checkpoint(checkpoint: &Checkpoint, dir: &Path, config: &BattleConfig) -> Result<()> {
    storage_for(checkpoint, config).restore(checkpoint, dir)
}

fn generate_checkpoint_id(battle_id: &str, after_iteration: u32) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase();
    format!("ckpt-{battle_id}-{after_iteration}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestRepo, commit_checkpoint, patch_checkpoint};

    #[test]
    fn storage_follows_auto_commit() {
        let mut config = BattleConfig::default();
        assert_eq!(
            get_checkpoint_storage(&config).storage_type(),
            StorageType::Commit
        );
        config.auto_commit = false;
        assert_eq!(
            get_checkpoint_storage(&config).storage_type(),
            StorageType::Patch
        );
    }

    #[test]
    fn commit_create_reuses_iteration_commit() {
        let repo = TestRepo::new().expect("repo");
        let head = repo.git().head_commit().expect("head");
        repo.write("dirty.txt", "not committed\n").expect("write");

        let results = FeedbackResults::new();
        let files = vec!["dirty.txt".to_string()];
        let request = CheckpointRequest {
            battle_id: "b1",
            after_iteration: 2,
            commit_hash: Some(head.as_str()),
            files: &files,
            feedback_results: &results,
            description: None,
        };
        let checkpoint = CommitCheckpointStore::new(DEFAULT_TIMEOUT)
            .create(&request, repo.root())
            .expect("create");

        assert_eq!(checkpoint.commit_hash.as_deref(), Some(head.as_str()));
        assert_eq!(checkpoint.description, "After iteration 2");
        assert_eq!(checkpoint.files, files);
        // Nothing was committed on the caller's behalf.
        assert!(repo.git().has_uncommitted_changes().expect("status"));
    }

    #[test]
    fn initial_checkpoint_commits_current_tree() {
        let repo = TestRepo::new().expect("repo");
        let before = repo.git().head_commit().expect("head");
        repo.write("pending.txt", "staged by checkpoint\n").expect("write");

        let checkpoint =
            create_initial_checkpoint("b1", repo.root(), &BattleConfig::default()).expect("create");

        assert!(checkpoint.is_baseline());
        assert_eq!(checkpoint.description, "Before battle started");
        assert!(checkpoint.files.is_empty());
        assert!(checkpoint.feedback_results.is_empty());
        assert_ne!(checkpoint.commit_hash.as_deref(), Some(before.as_str()));
        assert!(!repo.git().has_uncommitted_changes().expect("status"));
    }

    #[test]
    fn initial_patch_checkpoint_on_clean_tree_has_empty_patch() {
        let repo = TestRepo::new().expect("repo");
        let config = BattleConfig {
            auto_commit: false,
            ..BattleConfig::default()
        };
        let checkpoint = create_initial_checkpoint("b1", repo.root(), &config).expect("create");
        assert_eq!(checkpoint.storage_type, StorageType::Patch);
        assert_eq!(checkpoint.patch(), None);
        assert!(checkpoint.base_commit_hash().is_some());
    }

    #[test]
    fn restore_rejects_missing_hashes_verbatim() {
        let repo = TestRepo::new().expect("repo");

        let mut commit = commit_checkpoint("c1", 1);
        commit.commit_hash = None;
        let err = CommitCheckpointStore::new(DEFAULT_TIMEOUT)
            .restore(&commit, repo.root())
            .expect_err("missing commit hash");
        assert_eq!(err.to_string(), "Commit-based checkpoint missing commitHash");

        let mut patch = patch_checkpoint("p1", 1, "");
        patch.base_commit_hash = None;
        let err = PatchCheckpointStore::new(DEFAULT_TIMEOUT)
            .restore(&patch, repo.root())
            .expect_err("missing base hash");
        assert_eq!(err.to_string(), "Patch-based checkpoint missing baseCommitHash");
    }

    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
}
