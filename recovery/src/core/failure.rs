//! Failure classification for battle attempts.
//!
//! Turns whatever went wrong during an iteration into a [`BattleFailure`]
//! record with a fixed type, severity, recoverability, and suggested action.
//! Classification never fails: anything that is not one of the known
//! variants is treated as a non-recoverable `system_error`.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::RegexSet;
use serde::{Deserialize, Serialize};

/// Errors raised by the execution loop, as a closed tagged union.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BattleError {
    #[error("feedback loop '{loop_name}' failed")]
    FeedbackLoop { loop_name: String, output: String },
    #[error("iteration timed out after {minutes} minutes")]
    Timeout { minutes: u64 },
    #[error("{message}")]
    Agent {
        message: String,
        retryable: bool,
        #[serde(default)]
        stack: Option<String>,
    },
    #[error("cancelled: {}", .reason.as_deref().unwrap_or("by user"))]
    Cancellation {
        #[serde(default)]
        reason: Option<String>,
    },
    #[error("agent crashed: {message}")]
    Crash {
        message: String,
        #[serde(default)]
        signal: Option<String>,
        #[serde(default)]
        stack: Option<String>,
    },
    #[error("{message}")]
    System {
        message: String,
        #[serde(default)]
        stack: Option<String>,
    },
    /// Anything the execution loop could not attribute to a known variant.
    #[error("{message}")]
    Other {
        message: String,
        #[serde(default)]
        stack: Option<String>,
    },
}

impl BattleError {
    /// Recover a typed error from an `anyhow` chain.
    ///
    /// Untyped errors become [`BattleError::System`] when any cause reads like
    /// an OS resource or permission failure, and [`BattleError::Other`] otherwise.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        if let Some(typed) = err.downcast_ref::<BattleError>() {
            return typed.clone();
        }
        let message = err.to_string();
        let chain: Vec<String> = err.chain().skip(1).map(|cause| cause.to_string()).collect();
        let is_system = is_system_error_message(&message)
            || chain.iter().any(|cause| is_system_error_message(cause));
        let stack = (!chain.is_empty()).then(|| chain.join("\n"));
        if is_system {
            BattleError::System { message, stack }
        } else {
            BattleError::Other { message, stack }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    FeedbackFailure,
    Timeout,
    AgentError,
    SystemError,
    Cancellation,
    Crash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    RetryIteration,
    FixAndContinue,
    Rollback,
    Restart,
    ManualResolution,
}

impl RecoveryAction {
    pub fn description(self) -> &'static str {
        match self {
            RecoveryAction::RetryIteration => "Retry the failed iteration",
            RecoveryAction::FixAndContinue => "Fix the issue manually, then continue the battle",
            RecoveryAction::Rollback => "Roll back to the last checkpoint and retry",
            RecoveryAction::Restart => "Restart the battle from the current iteration",
            RecoveryAction::ManualResolution => "Resolve the issue manually before continuing",
        }
    }
}

/// Structured record of a failed attempt. Immutable once classified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleFailure {
    #[serde(rename = "type")]
    pub failure_type: FailureType,
    pub timestamp: DateTime<Utc>,
    pub iteration: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub recoverable: bool,
    pub suggested_action: RecoveryAction,
}

/// Execution context the classifier needs beyond the error itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifyContext {
    pub current_iteration: u32,
    /// Configured per-iteration timeout, echoed into timeout details.
    pub timeout_minutes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySuggestion {
    pub action: RecoveryAction,
    pub description: String,
    pub recommended: bool,
}

const SYSTEM_ERROR_PATTERNS: &[&str] = &[
    "ENOSPC",
    "EACCES",
    "EPERM",
    "EMFILE",
    "ENOMEM",
    "ENFILE",
    "disk full",
    "permission denied",
    "out of memory",
    "no space left",
];

static SYSTEM_ERROR_REGEX: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new(
        SYSTEM_ERROR_PATTERNS
            .iter()
            .map(|pattern| format!("(?i){}", regex::escape(pattern))),
    )
    .expect("static system error patterns")
});

/// True if the message looks like an OS-level resource or permission failure.
pub fn is_system_error_message(message: &str) -> bool {
    SYSTEM_ERROR_REGEX.is_match(message)
}

/// Classify an error raised during `ctx.current_iteration`.
pub fn classify_failure(error: &BattleError, ctx: &ClassifyContext) -> BattleFailure {
    classify_failure_at(error, ctx, Utc::now())
}

/// Like [`classify_failure`], with an explicit timestamp.
pub fn classify_failure_at(
    error: &BattleError,
    ctx: &ClassifyContext,
    now: DateTime<Utc>,
) -> BattleFailure {
    let (failure_type, message, details, recoverable, suggested_action) = match error {
        BattleError::FeedbackLoop { loop_name, output } => (
            FailureType::FeedbackFailure,
            format!("Feedback loop '{loop_name}' failed"),
            Some(output.clone()),
            true,
            RecoveryAction::RetryIteration,
        ),
        BattleError::Timeout { .. } => (
            FailureType::Timeout,
            "Iteration timed out".to_string(),
            Some(format!("Exceeded {} minutes", ctx.timeout_minutes)),
            true,
            RecoveryAction::RetryIteration,
        ),
        BattleError::Agent {
            message,
            retryable,
            stack,
        } => (
            FailureType::AgentError,
            message.clone(),
            stack.clone(),
            *retryable,
            if *retryable {
                RecoveryAction::RetryIteration
            } else {
                RecoveryAction::ManualResolution
            },
        ),
        BattleError::Cancellation { reason } => (
            FailureType::Cancellation,
            reason
                .clone()
                .unwrap_or_else(|| "Cancelled by user".to_string()),
            reason.clone(),
            true,
            RecoveryAction::Restart,
        ),
        BattleError::Crash {
            message,
            signal,
            stack,
        } => (
            FailureType::Crash,
            message.clone(),
            signal
                .as_ref()
                .map(|signal| format!("Signal: {signal}"))
                .or_else(|| stack.clone()),
            true,
            RecoveryAction::Restart,
        ),
        BattleError::System { message, stack } | BattleError::Other { message, stack } => {
            if matches!(error, BattleError::Other { .. }) {
                tracing::debug!(%message, "unclassified error, failing closed to system_error");
            }
            (
                FailureType::SystemError,
                message.clone(),
                stack.clone(),
                false,
                RecoveryAction::ManualResolution,
            )
        }
    };

    BattleFailure {
        failure_type,
        timestamp: now,
        iteration: ctx.current_iteration,
        message,
        details,
        recoverable,
        suggested_action,
    }
}

pub fn get_severity(failure_type: FailureType) -> Severity {
    match failure_type {
        FailureType::FeedbackFailure | FailureType::Cancellation => Severity::Low,
        FailureType::Timeout | FailureType::AgentError => Severity::Medium,
        FailureType::SystemError | FailureType::Crash => Severity::High,
    }
}

/// Recovery actions that make sense for a failure type, most preferred first.
pub fn get_recovery_options(failure_type: FailureType) -> &'static [RecoveryAction] {
    use RecoveryAction::{FixAndContinue, ManualResolution, Restart, RetryIteration, Rollback};
    match failure_type {
        FailureType::FeedbackFailure => &[RetryIteration, FixAndContinue, Rollback],
        FailureType::Timeout => &[RetryIteration, Rollback],
        FailureType::AgentError => &[RetryIteration, ManualResolution],
        FailureType::SystemError => &[ManualResolution, Restart],
        FailureType::Cancellation => &[Restart, Rollback],
        FailureType::Crash => &[Restart, Rollback, ManualResolution],
    }
}

/// Every option for the failure's type, with the suggested action marked.
///
/// A hand-built failure whose suggested action is outside its type's options
/// gets the first option marked, so exactly one entry is always recommended.
pub fn get_all_recovery_suggestions(failure: &BattleFailure) -> Vec<RecoverySuggestion> {
    let options = get_recovery_options(failure.failure_type);
    let recommended = if options.contains(&failure.suggested_action) {
        failure.suggested_action
    } else {
        options[0]
    };
    options
        .iter()
        .map(|&action| RecoverySuggestion {
            action,
            description: action.description().to_string(),
            recommended: action == recommended,
        })
        .collect()
}
