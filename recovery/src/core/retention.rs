//! Checkpoint retention.
//!
//! Pure selection over a battle's checkpoint list. Nothing here touches the
//! repository; the caller drops the returned ids from its own storage.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};

use crate::core::checkpoint::Checkpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointRetentionPolicy {
    /// Always keep this many of the newest checkpoints.
    pub max_checkpoints: usize,
    /// Keep anything younger than this.
    pub max_age: Duration,
    /// Keep checkpoints where any feedback loop failed.
    pub keep_failed: bool,
    /// Keep checkpoints where every feedback loop passed.
    pub keep_successful: bool,
}

pub const DEFAULT_RETENTION_POLICY: CheckpointRetentionPolicy = CheckpointRetentionPolicy {
    max_checkpoints: 10,
    max_age: Duration::days(7),
    keep_failed: true,
    keep_successful: true,
};

impl Default for CheckpointRetentionPolicy {
    fn default() -> Self {
        DEFAULT_RETENTION_POLICY
    }
}

/// Checkpoints that survive cleanup, in their original order.
pub fn cleanup_checkpoints(
    checkpoints: &[Checkpoint],
    policy: &CheckpointRetentionPolicy,
) -> Vec<Checkpoint> {
    cleanup_checkpoints_at(checkpoints, policy, Utc::now())
}

pub fn cleanup_checkpoints_at(
    checkpoints: &[Checkpoint],
    policy: &CheckpointRetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<Checkpoint> {
    let newest = newest_ids(checkpoints, policy.max_checkpoints);
    checkpoints
        .iter()
        .filter(|checkpoint| should_keep(checkpoint, policy, &newest, now))
        .cloned()
        .collect()
}

/// Ids that cleanup would drop; the complement of [`cleanup_checkpoints`].
pub fn get_checkpoints_to_remove(
    checkpoints: &[Checkpoint],
    policy: &CheckpointRetentionPolicy,
) -> Vec<String> {
    get_checkpoints_to_remove_at(checkpoints, policy, Utc::now())
}

pub fn get_checkpoints_to_remove_at(
    checkpoints: &[Checkpoint],
    policy: &CheckpointRetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<String> {
    let newest = newest_ids(checkpoints, policy.max_checkpoints);
    checkpoints
        .iter()
        .filter(|checkpoint| !should_keep(checkpoint, policy, &newest, now))
        .map(|checkpoint| checkpoint.id.clone())
        .collect()
}

fn newest_ids(checkpoints: &[Checkpoint], limit: usize) -> HashSet<&str> {
    let mut by_time: Vec<&Checkpoint> = checkpoints.iter().collect();
    by_time.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    by_time
        .into_iter()
        .take(limit)
        .map(|checkpoint| checkpoint.id.as_str())
        .collect()
}

fn should_keep(
    checkpoint: &Checkpoint,
    policy: &CheckpointRetentionPolicy,
    newest: &HashSet<&str>,
    now: DateTime<Utc>,
) -> bool {
    if newest.contains(checkpoint.id.as_str()) {
        return true;
    }
    if now - checkpoint.timestamp <= policy.max_age {
        return true;
    }
    let results = &checkpoint.feedback_results;
    if policy.keep_failed && results.values().any(|result| !result.passed) {
        return true;
    }
    policy.keep_successful && results.values().all(|result| result.passed)
}
