//! Shared battle, iteration, and task records.
//!
//! These mirror the history records the caller persists. The recovery
//! subsystem reads them for planning and hands back fresh values; it never
//! writes them to storage itself.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one named feedback loop (tests, lint, build, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackResult {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl FeedbackResult {
    pub fn passed() -> Self {
        Self {
            passed: true,
            output: None,
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            passed: false,
            output: Some(output.into()),
        }
    }
}

/// Feedback results keyed by loop name. Ordered so serialized output is stable.
pub type FeedbackResults = BTreeMap<String, FeedbackResult>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationResult {
    Pending,
    Success,
    Failure,
    Error,
}

/// A single attempt within a battle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iteration {
    /// 1-indexed iteration number.
    pub number: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub output: String,
    pub result: IterationResult,
    pub files_changed: Vec<String>,
    /// Commit recorded by the execution loop when it committed this iteration itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub feedback_results: FeedbackResults,
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BattleStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// One end-to-end execution of a task through repeated iterations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Battle {
    pub id: String,
    pub task_id: String,
    pub status: BattleStatus,
    pub started_at: DateTime<Utc>,
    /// Iterations in order; position `n - 1` holds iteration `n`.
    pub iterations: Vec<Iteration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub status: TaskStatus,
}
