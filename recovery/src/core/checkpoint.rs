//! Checkpoint records and their structural validation.
//!
//! A checkpoint is a restorable snapshot of the working directory taken at an
//! iteration boundary. Two storage layouts exist: `commit` (a commit hash
//! holds the full tree) and `patch` (a base commit plus a diff on top of it).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::FeedbackResults;

pub const MISSING_ID: &str = "Checkpoint missing ID";
pub const MISSING_COMMIT_HASH: &str = "Commit-based checkpoint missing commitHash";
pub const MISSING_BASE_COMMIT_HASH: &str = "Patch-based checkpoint missing baseCommitHash";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Commit,
    Patch,
}

/// Immutable snapshot record.
///
/// Checkpoints come back from caller-owned storage, so the storage-specific
/// fields stay optional and are checked by [`validate_checkpoint`] rather
/// than by the type system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub battle_id: String,
    /// Iteration this snapshot follows; `0` is the pre-battle baseline.
    pub after_iteration: u32,
    pub storage_type: StorageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub files: Vec<String>,
    pub feedback_results: FeedbackResults,
}

impl Checkpoint {
    pub fn is_baseline(&self) -> bool {
        self.after_iteration == 0
    }

    /// Commit hash, treating an empty string as absent.
    pub fn commit_hash(&self) -> Option<&str> {
        non_empty(self.commit_hash.as_deref())
    }

    pub fn base_commit_hash(&self) -> Option<&str> {
        non_empty(self.base_commit_hash.as_deref())
    }

    /// Patch text, or `None` when there is nothing to apply.
    pub fn patch(&self) -> Option<&str> {
        self.patch.as_deref().filter(|patch| !patch.trim().is_empty())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

pub fn checkpoint_description(after_iteration: u32) -> String {
    if after_iteration == 0 {
        "Before battle started".to_string()
    } else {
        format!("After iteration {after_iteration}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointValidation {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckpointValidation {
    fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    fn invalid(error: &str) -> Self {
        Self {
            valid: false,
            error: Some(error.to_string()),
        }
    }
}

pub fn validate_checkpoint(checkpoint: &Checkpoint) -> CheckpointValidation {
    if checkpoint.id.trim().is_empty() {
        return CheckpointValidation::invalid(MISSING_ID);
    }
    match checkpoint.storage_type {
        StorageType::Commit if checkpoint.commit_hash().is_none() => {
            CheckpointValidation::invalid(MISSING_COMMIT_HASH)
        }
        StorageType::Patch if checkpoint.base_commit_hash().is_none() => {
            CheckpointValidation::invalid(MISSING_BASE_COMMIT_HASH)
        }
        _ => CheckpointValidation::ok(),
    }
}

pub fn find_checkpoint_by_iteration(
    checkpoints: &[Checkpoint],
    after_iteration: u32,
) -> Option<&Checkpoint> {
    checkpoints
        .iter()
        .find(|checkpoint| checkpoint.after_iteration == after_iteration)
}

pub fn get_initial_checkpoint(checkpoints: &[Checkpoint]) -> Option<&Checkpoint> {
    find_checkpoint_by_iteration(checkpoints, 0)
}

/// Checkpoint with the highest `after_iteration`.
pub fn latest_checkpoint(checkpoints: &[Checkpoint]) -> Option<&Checkpoint> {
    checkpoints
        .iter()
        .max_by_key(|checkpoint| checkpoint.after_iteration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{commit_checkpoint, patch_checkpoint};

    #[test]
    fn valid_checkpoints_pass() {
        assert_eq!(
            validate_checkpoint(&commit_checkpoint("c1", 1)),
            CheckpointValidation::ok()
        );
        assert!(validate_checkpoint(&patch_checkpoint("p1", 1, "")).valid);
    }

    #[test]
    fn missing_fields_report_exact_messages() {
        let mut missing_id = commit_checkpoint("c1", 1);
        missing_id.id = String::new();
        assert_eq!(
            validate_checkpoint(&missing_id).error.as_deref(),
            Some("Checkpoint missing ID")
        );

        let mut missing_commit = commit_checkpoint("c2", 1);
        missing_commit.commit_hash = None;
        assert_eq!(
            validate_checkpoint(&missing_commit).error.as_deref(),
            Some("Commit-based checkpoint missing commitHash")
        );

        let mut missing_base = patch_checkpoint("p2", 1, "diff");
        missing_base.base_commit_hash = Some(String::new());
        let validation = validate_checkpoint(&missing_base);
        assert!(!validation.valid);
        assert_eq!(
            validation.error.as_deref(),
            Some("Patch-based checkpoint missing baseCommitHash")
        );
    }

    #[test]
    fn lookup_by_iteration() {
        let list = vec![
            commit_checkpoint("c0", 0),
            commit_checkpoint("c2", 2),
            commit_checkpoint("c5", 5),
        ];
        assert_eq!(
            find_checkpoint_by_iteration(&list, 2).map(|c| c.id.as_str()),
            Some("c2")
        );
        assert!(find_checkpoint_by_iteration(&list, 3).is_none());
        assert_eq!(
            get_initial_checkpoint(&list).map(|c| c.id.as_str()),
            Some("c0")
        );
        assert_eq!(latest_checkpoint(&list).map(|c| c.id.as_str()), Some("c5"));
        assert!(get_initial_checkpoint(&list[1..]).is_none());
    }

    #[test]
    fn descriptions() {
        assert_eq!(checkpoint_description(0), "Before battle started");
        assert_eq!(checkpoint_description(3), "After iteration 3");
    }

    #[test]
    fn empty_patch_reads_as_none() {
        assert_eq!(patch_checkpoint("p", 1, "").patch(), None);
        assert_eq!(patch_checkpoint("p", 1, "diff --git").patch(), Some("diff --git"));
    }
}
