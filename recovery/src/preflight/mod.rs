//! Preflight: decide whether a battle may start.
//!
//! Every registered check runs on each call, in isolation. A check that
//! errors or panics shows up as a failing result in the report instead of
//! aborting the run. The report carries a signed preflight token only when
//! nothing blocks the start.

pub mod checks;

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::risk::{TaskRisk, assess_task_risk};
use crate::core::token::generate_preflight_token;
use crate::core::types::Task;
use crate::io::config::BattleConfig;
use crate::io::git::Git;

/// Metadata key under which the stash fix reports the stash commit.
pub const STASH_REF_KEY: &str = "stash_ref";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckCategory {
    Environment,
    Git,
    Config,
    Task,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckSeverity {
    Error,
    Warning,
    Info,
}

/// Everything a check may look at.
#[derive(Debug, Clone)]
pub struct PreflightContext {
    pub task: Task,
    pub config: BattleConfig,
    pub working_dir: PathBuf,
    /// Task of the battle currently running, if any.
    pub active_battle_task_id: Option<String>,
}

impl PreflightContext {
    pub fn new(task: Task, config: BattleConfig, working_dir: impl AsRef<Path>) -> Self {
        Self {
            task,
            config,
            working_dir: working_dir.as_ref().to_path_buf(),
            active_battle_task_id: None,
        }
    }

    pub fn with_active_battle(mut self, task_id: impl Into<String>) -> Self {
        self.active_battle_task_id = Some(task_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreflightOptions {
    /// Apply the auto-fix of every failing check that has one, then re-check.
    pub auto_fix: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub passed: bool,
    pub message: String,
    /// False when this failure must block the battle.
    pub can_proceed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl CheckOutcome {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            can_proceed: true,
            details: None,
            suggestion: None,
        }
    }

    /// Failed, but the battle may still start.
    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            ..Self::pass(message)
        }
    }

    /// Failed and blocking.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            can_proceed: false,
            ..Self::pass(message)
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl FixResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::ok(message)
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

pub type CheckFn = fn(&PreflightContext) -> Result<CheckOutcome>;
pub type FixFn = fn(&PreflightContext) -> Result<FixResult>;

/// Registered check. Holds function pointers, so it is never serialized
/// directly; see [`PreflightCheckView`].
#[derive(Debug, Clone, Copy)]
pub struct PreflightCheck {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub category: CheckCategory,
    pub severity: CheckSeverity,
    pub run: CheckFn,
    pub fix: Option<FixFn>,
}

impl PreflightCheck {
    pub fn view(&self) -> PreflightCheckView {
        PreflightCheckView {
            id: self.id.to_string(),
            name: self.name.to_string(),
            description: self.description.to_string(),
            category: self.category,
            severity: self.severity,
            has_auto_fix: self.fix.is_some(),
        }
    }
}

/// Serializable projection of a check: the fix function becomes a flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightCheckView {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: CheckCategory,
    pub severity: CheckSeverity,
    pub has_auto_fix: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightCheckResult {
    pub check: PreflightCheckView,
    pub result: CheckOutcome,
    pub duration_ms: u64,
    /// Set when an auto-fix ran during this preflight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<FixResult>,
}

impl PreflightCheckResult {
    /// A failed error-severity check that may not be overridden.
    pub fn is_blocking(&self) -> bool {
        self.check.severity == CheckSeverity::Error
            && !self.result.passed
            && !self.result.can_proceed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightSummary {
    pub total: usize,
    pub passed: usize,
    /// Failed checks by severity.
    pub warnings: usize,
    pub errors: usize,
    pub infos: usize,
}

impl PreflightSummary {
    fn from_results(results: &[PreflightCheckResult]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Self::default()
        };
        for r in results {
            if r.result.passed {
                summary.passed += 1;
                continue;
            }
            match r.check.severity {
                CheckSeverity::Error => summary.errors += 1,
                CheckSeverity::Warning => summary.warnings += 1,
                CheckSeverity::Info => summary.infos += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightReport {
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
    pub results: Vec<PreflightCheckResult>,
    pub summary: PreflightSummary,
    pub can_start: bool,
    /// Stash created by the `repo_status` auto-fix, to restore after the battle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stash_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preflight_token: Option<String>,
    pub task_risk: TaskRisk,
}

/// Outcome of [`apply_fix`]. `result` is absent when no fix ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixOutcome {
    pub fix: FixResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<PreflightCheckResult>,
}

/// Run the registered checks.
pub fn run_preflight(ctx: &PreflightContext, options: PreflightOptions) -> PreflightReport {
    run_preflight_with(checks::CHECKS, ctx, options)
}

/// Run an explicit set of checks.
#[instrument(skip_all, fields(task_id = %ctx.task.id, auto_fix = options.auto_fix))]
pub fn run_preflight_with(
    registry: &[PreflightCheck],
    ctx: &PreflightContext,
    options: PreflightOptions,
) -> PreflightReport {
    let started = Instant::now();
    let mut stash_ref = None;
    let mut results = Vec::with_capacity(registry.len());

    for check in registry {
        let mut result = evaluate(check, ctx);
        if options.auto_fix
            && !result.result.passed
            && let Some(fix) = check.fix
        {
            let fix_result = run_fix(check.id, fix, ctx);
            if fix_result.success {
                if let Some(stash) = fix_result.metadata.get(STASH_REF_KEY) {
                    stash_ref = Some(stash.clone());
                }
                result = evaluate(check, ctx);
            }
            result.fix = Some(fix_result);
        }
        results.push(result);
    }

    let summary = PreflightSummary::from_results(&results);
    let can_start = !results.iter().any(PreflightCheckResult::is_blocking);
    let timestamp = Utc::now();
    let preflight_token = can_start.then(|| generate_preflight_token(&ctx.task.id, timestamp));

    info!(
        passed = summary.passed,
        warnings = summary.warnings,
        errors = summary.errors,
        infos = summary.infos,
        can_start,
        "preflight finished"
    );
    PreflightReport {
        task_id: ctx.task.id.clone(),
        timestamp,
        duration_ms: millis(started.elapsed()),
        results,
        summary,
        can_start,
        stash_ref,
        preflight_token,
        task_risk: assess_task_risk(&ctx.task),
    }
}

/// Run one check's fix, then re-run the check.
///
/// Unknown checks and checks without a fix come back as an unsuccessful
/// [`FixResult`].
#[instrument(skip(ctx))]
pub fn apply_fix(check_id: &str, ctx: &PreflightContext) -> FixOutcome {
    let Some(check) = checks::find(check_id) else {
        return FixOutcome {
            fix: FixResult::failed(format!("Check '{check_id}' not found")),
            result: None,
        };
    };
    let Some(fix) = check.fix else {
        return FixOutcome {
            fix: FixResult::failed(format!("Check '{check_id}' has no auto-fix")),
            result: None,
        };
    };
    let fix = run_fix(check.id, fix, ctx);
    FixOutcome {
        fix,
        result: Some(evaluate(check, ctx)),
    }
}

/// Re-apply a stash produced by the `repo_status` fix.
#[instrument(skip(dir, config))]
pub fn restore_stash(dir: &Path, stash_ref: &str, config: &BattleConfig) -> FixResult {
    let git = Git::new(dir).with_timeout(config.git_timeout());
    match git.stash_apply(stash_ref) {
        Ok(()) => {
            info!("stash restored");
            FixResult::ok(format!("Restored stash {stash_ref}"))
        }
        Err(err) => {
            warn!(err = %err, "stash restore failed");
            FixResult::failed(format!("Failed to restore stash {stash_ref}: {err:#}"))
        }
    }
}

/// The registry as it may be shown to callers.
pub fn list_checks() -> Vec<PreflightCheckView> {
    checks::CHECKS.iter().map(PreflightCheck::view).collect()
}

fn evaluate(check: &PreflightCheck, ctx: &PreflightContext) -> PreflightCheckResult {
    let started = Instant::now();
    let result = match catch_unwind(AssertUnwindSafe(|| (check.run)(ctx))) {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => {
            warn!(check = check.id, err = %err, "check failed");
            CheckOutcome::fail(format!("Check failed: {err:#}"))
        }
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            warn!(check = check.id, reason = %reason, "check panicked");
            CheckOutcome::fail(format!("Check failed: {reason}"))
        }
    };
    debug!(check = check.id, passed = result.passed, "check evaluated");
    PreflightCheckResult {
        check: check.view(),
        result,
        duration_ms: millis(started.elapsed()),
        fix: None,
    }
}

fn run_fix(check_id: &str, fix: FixFn, ctx: &PreflightContext) -> FixResult {
    match catch_unwind(AssertUnwindSafe(|| fix(ctx))) {
        Ok(Ok(result)) => {
            debug!(check = check_id, success = result.success, "fix applied");
            result
        }
        Ok(Err(err)) => {
            warn!(check = check_id, err = %err, "fix failed");
            FixResult::failed(format!("Failed to apply fix: {err:#}"))
        }
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            warn!(check = check_id, reason = %reason, "fix panicked");
            FixResult::failed(format!("Failed to apply fix: {reason}"))
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
