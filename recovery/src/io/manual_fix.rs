//! Manual-fix sessions.
//!
//! While a human repairs the working directory, a session watches it and
//! collects one [`FileChange`] per touched path. The session ends either by
//! `complete` (only once verification passed) or by `abort`; both release
//! the watch. Sessions live in a [`SessionRegistry`] owned by the caller.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::failure::BattleFailure;
use crate::core::types::FeedbackResults;
use crate::io::git::Git;
use crate::io::watch::{ChangeType, DEFAULT_POLL_INTERVAL, FileWatch, WatchEvent};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("manual fix session '{id}' not found")]
    NotFound { id: String },
    #[error("manual fix session '{id}' cannot complete: fix not verified")]
    NotVerified { id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualFixSession {
    pub id: String,
    pub battle_id: String,
    pub task_id: String,
    pub working_dir: PathBuf,
    pub issue: BattleFailure,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_change_detected: Option<DateTime<Utc>>,
    pub detected_changes: Vec<FileChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_results: Option<FeedbackResults>,
    pub verified: bool,
}

impl ManualFixSession {
    /// Upsert by path: a newer change replaces the earlier one in place.
    pub fn record_change(
        &mut self,
        path: &str,
        change_type: ChangeType,
        now: DateTime<Utc>,
    ) -> &FileChange {
        let change = FileChange {
            path: path.to_string(),
            change_type,
            diff: None,
            detected_at: now,
        };
        self.last_change_detected = Some(now);
        let index = match self.detected_changes.iter().position(|c| c.path == path) {
            Some(index) => {
                self.detected_changes[index] = change;
                index
            }
            None => {
                self.detected_changes.push(change);
                self.detected_changes.len() - 1
            }
        };
        &self.detected_changes[index]
    }

    /// Text handed back to the agent when the battle continues.
    pub fn continuation_prompt(&self) -> String {
        let mut out = format!("A manual fix was applied for: {}\n\n", self.issue.message);
        if self.detected_changes.is_empty() {
            out.push_str("No file changes were detected during the manual fix.\n");
            return out;
        }
        out.push_str("Files changed:\n");
        for change in &self.detected_changes {
            let kind = match change.change_type {
                ChangeType::Created => "created",
                ChangeType::Modified => "modified",
                ChangeType::Deleted => "deleted",
            };
            out.push_str(&format!("- {kind}: {}\n", change.path));
        }
        out
    }
}

pub type ChangeCallback = Arc<dyn Fn(&FileChange) + Send + Sync>;

pub struct StartOptions {
    pub battle_id: String,
    pub task_id: String,
    pub working_dir: PathBuf,
    pub issue: BattleFailure,
    /// Called from the watcher thread after each recorded change.
    pub on_change: Option<ChangeCallback>,
    /// Scan interval if the watch falls back to polling.
    pub poll_interval: Duration,
}

impl StartOptions {
    pub fn new(
        battle_id: impl Into<String>,
        task_id: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        issue: BattleFailure,
    ) -> Self {
        Self {
            battle_id: battle_id.into(),
            task_id: task_id.into(),
            working_dir: working_dir.into(),
            issue,
            on_change: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_on_change(mut self, callback: ChangeCallback) -> Self {
        self.on_change = Some(callback);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Result of a successful `complete`.
#[derive(Debug, Clone)]
pub struct Completion {
    pub session: ManualFixSession,
    pub continuation: String,
}

struct Entry {
    session: Arc<Mutex<ManualFixSession>>,
    watch: FileWatch,
}

/// Active sessions and their watches.
#[derive(Default)]
pub struct SessionRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("active", &self.active_ids())
            .finish()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start watching `working_dir` and register the session.
    #[instrument(skip_all, fields(battle_id = %options.battle_id, task_id = %options.task_id))]
    pub fn start(&self, options: StartOptions) -> Result<ManualFixSession> {
        let session = ManualFixSession {
            id: generate_session_id(),
            battle_id: options.battle_id,
            task_id: options.task_id,
            working_dir: options.working_dir,
            issue: options.issue,
            status: SessionStatus::Active,
            started_at: Utc::now(),
            completed_at: None,
            last_change_detected: None,
            detected_changes: Vec::new(),
            verification_results: None,
            verified: false,
        };
        let id = session.id.clone();
        let working_dir = session.working_dir.clone();
        let snapshot = session.clone();
        let shared = Arc::new(Mutex::new(session));

        let watched = Arc::clone(&shared);
        let on_change = options.on_change;
        let watch = FileWatch::start(&working_dir, options.poll_interval, move |event: WatchEvent| {
            let change = {
                let mut session = lock(&watched);
                if session.status != SessionStatus::Active {
                    return;
                }
                session
                    .record_change(&event.path, event.change_type, Utc::now())
                    .clone()
            };
            debug!(path = %change.path, change_type = ?change.change_type, "manual fix change");
            if let Some(callback) = &on_change {
                callback(&change);
            }
        })?;

        lock(&self.entries).insert(
            id.clone(),
            Entry {
                session: shared,
                watch,
            },
        );
        info!(session_id = %id, dir = %working_dir.display(), "manual fix session started");
        Ok(snapshot)
    }

    /// Record a change reported by something other than the watch.
    pub fn record_change(
        &self,
        id: &str,
        path: &str,
        change_type: ChangeType,
    ) -> Result<(), SessionError> {
        let session = self.session(id)?;
        lock(&session).record_change(path, change_type, Utc::now());
        Ok(())
    }

    /// Store feedback results; the fix is verified when every result passed.
    pub fn set_verification_results(
        &self,
        id: &str,
        results: FeedbackResults,
    ) -> Result<ManualFixSession, SessionError> {
        let session = self.session(id)?;
        let mut session = lock(&session);
        session.verified = results.values().all(|r| r.passed);
        session.verification_results = Some(results);
        debug!(session_id = id, verified = session.verified, "verification results stored");
        Ok(session.clone())
    }

    /// End a verified session and build the continuation text.
    #[instrument(skip(self))]
    pub fn complete(&self, id: &str) -> Result<Completion, SessionError> {
        let mut entry = {
            let mut entries = lock(&self.entries);
            let entry = entries.get(id).ok_or_else(|| SessionError::NotFound {
                id: id.to_string(),
            })?;
            if !lock(&entry.session).verified {
                return Err(SessionError::NotVerified { id: id.to_string() });
            }
            entries.remove(id).ok_or_else(|| SessionError::NotFound {
                id: id.to_string(),
            })?
        };
        entry.watch.release();

        let mut session = lock(&entry.session);
        session.status = SessionStatus::Completed;
        session.completed_at = Some(Utc::now());
        let continuation = session.continuation_prompt();
        info!(detected_changes = session.detected_changes.len(), "manual fix session completed");
        Ok(Completion {
            session: session.clone(),
            continuation,
        })
    }

    /// Abort a session. Returns `None` when it is already gone.
    #[instrument(skip(self))]
    pub fn abort(&self, id: &str) -> Option<ManualFixSession> {
        let Some(mut entry) = lock(&self.entries).remove(id) else {
            debug!("session already ended");
            return None;
        };
        entry.watch.release();
        let mut session = lock(&entry.session);
        session.status = SessionStatus::Aborted;
        session.completed_at = Some(Utc::now());
        info!("manual fix session aborted");
        Some(session.clone())
    }

    /// Abort every active session and release its watch. Returns the count.
    pub fn cleanup_all(&self) -> usize {
        let drained: Vec<(String, Entry)> = lock(&self.entries).drain().collect();
        let count = drained.len();
        for (id, mut entry) in drained {
            entry.watch.release();
            let mut session = lock(&entry.session);
            session.status = SessionStatus::Aborted;
            session.completed_at = Some(Utc::now());
            debug!(session_id = %id, "session released during cleanup");
        }
        if count > 0 {
            info!(count, "manual fix sessions cleaned up");
        }
        count
    }

    pub fn get(&self, id: &str) -> Option<ManualFixSession> {
        let session = self.session(id).ok()?;
        let snapshot = lock(&session).clone();
        Some(snapshot)
    }

    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.entries).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Fill in `diff` for every recorded change from `git diff HEAD`.
    ///
    /// Files git does not track yet get no diff.
    pub fn attach_diffs(&self, id: &str, git: &Git) -> Result<ManualFixSession> {
        let session = self.session(id)?;
        let paths: Vec<String> = lock(&session)
            .detected_changes
            .iter()
            .map(|c| c.path.clone())
            .collect();

        let mut diffs = HashMap::new();
        for path in paths {
            match git.diff_path(&path) {
                Ok(diff) if !diff.trim().is_empty() => {
                    diffs.insert(path, diff);
                }
                Ok(_) => {}
                Err(err) => warn!(err = %err, path = %path, "could not diff changed file"),
            }
        }

        let mut session = lock(&session);
        for change in &mut session.detected_changes {
            if let Some(diff) = diffs.remove(&change.path) {
                change.diff = Some(diff);
            }
        }
        Ok(session.clone())
    }

    fn session(&self, id: &str) -> Result<Arc<Mutex<ManualFixSession>>, SessionError> {
        lock(&self.entries)
            .get(id)
            .map(|entry| Arc::clone(&entry.session))
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })
    }
}

/// A panic on the watcher thread must not wedge the registry.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn generate_session_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect::<String>()
        .to_lowercase();
    format!("fix-{}-{suffix}", Utc::now().format("%Y%m%d%H%M%S"))
}
