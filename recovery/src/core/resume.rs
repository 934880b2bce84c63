//! Resume planning after a classified failure.
//!
//! Given a [`BattleFailure`], decides which resume strategies are allowed,
//! which one to default to, where the battle resumes, and how the next
//! prompt is augmented.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::failure::{BattleFailure, RecoveryAction, get_recovery_options};
use crate::core::types::{Battle, FeedbackResults, Iteration, IterationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeStrategy {
    RetrySame,
    RetryWithContext,
    RollbackAndRetry,
    ContinueNext,
    ManualThenContinue,
}

impl ResumeStrategy {
    pub const ALL: [ResumeStrategy; 5] = [
        ResumeStrategy::RetrySame,
        ResumeStrategy::RetryWithContext,
        ResumeStrategy::RollbackAndRetry,
        ResumeStrategy::ContinueNext,
        ResumeStrategy::ManualThenContinue,
    ];

    /// The recovery action a strategy implies.
    pub fn implied_action(self) -> RecoveryAction {
        match self {
            ResumeStrategy::RetrySame
            | ResumeStrategy::RetryWithContext
            | ResumeStrategy::ContinueNext => RecoveryAction::RetryIteration,
            ResumeStrategy::RollbackAndRetry => RecoveryAction::Rollback,
            ResumeStrategy::ManualThenContinue => RecoveryAction::FixAndContinue,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeResult {
    pub success: bool,
    pub strategy: ResumeStrategy,
    /// Iteration number the battle resumes at.
    pub iteration: u32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_instructions: Option<String>,
}

pub fn build_resume_context(
    strategy: ResumeStrategy,
    failure: &BattleFailure,
    instructions: Option<&str>,
) -> ResumeResult {
    let n = failure.iteration;
    let (iteration, message, error_context) = match strategy {
        ResumeStrategy::RetrySame => (n, format!("Retrying iteration {n}"), None),
        ResumeStrategy::RetryWithContext => (
            n,
            format!("Retrying iteration {n} with error context"),
            Some(
                failure
                    .details
                    .clone()
                    .unwrap_or_else(|| failure.message.clone()),
            ),
        ),
        ResumeStrategy::RollbackAndRetry => (
            n,
            format!("Rolling back and retrying iteration {n}"),
            Some(format!("Previous attempt failed: {}", failure.message)),
        ),
        ResumeStrategy::ContinueNext => (
            n + 1,
            format!("Skipping iteration {n}, continuing with iteration {}", n + 1),
            None,
        ),
        ResumeStrategy::ManualThenContinue => (
            n,
            format!("Pausing for manual fix before resuming iteration {n}"),
            None,
        ),
    };

    ResumeResult {
        success: true,
        strategy,
        iteration,
        message,
        error_context,
        additional_instructions: instructions.map(str::to_string),
    }
}

/// Whether `strategy` is an acceptable way to continue after `failure`.
pub fn is_valid_resume_strategy(strategy: ResumeStrategy, failure: &BattleFailure) -> bool {
    if !failure.recoverable {
        return strategy == ResumeStrategy::ManualThenContinue;
    }
    get_recovery_options(failure.failure_type).contains(&strategy.implied_action())
}

pub fn get_default_resume_strategy(failure: &BattleFailure) -> ResumeStrategy {
    if !failure.recoverable {
        return ResumeStrategy::ManualThenContinue;
    }
    match failure.suggested_action {
        RecoveryAction::RetryIteration => ResumeStrategy::RetryWithContext,
        RecoveryAction::FixAndContinue => ResumeStrategy::ManualThenContinue,
        RecoveryAction::Rollback => ResumeStrategy::RollbackAndRetry,
        RecoveryAction::Restart => ResumeStrategy::RetrySame,
        RecoveryAction::ManualResolution => ResumeStrategy::ManualThenContinue,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryPromptOptions {
    pub include_error_context: bool,
    pub error_context: Option<String>,
    pub additional_instructions: Option<String>,
}

impl From<&ResumeResult> for RetryPromptOptions {
    fn from(result: &ResumeResult) -> Self {
        Self {
            include_error_context: result.error_context.is_some(),
            error_context: result.error_context.clone(),
            additional_instructions: result.additional_instructions.clone(),
        }
    }
}

/// Append error context, then instructions, to the base prompt.
pub fn build_retry_prompt(base: &str, options: &RetryPromptOptions) -> String {
    let mut prompt = base.to_string();

    if options.include_error_context
        && let Some(context) = options.error_context.as_deref().filter(|c| !c.is_empty())
    {
        prompt.push_str("\n\n## Previous Attempt Failed\n\n");
        prompt.push_str(context);
        prompt.push_str("\n\nAddress the error above before continuing.");
    }

    if let Some(instructions) = options
        .additional_instructions
        .as_deref()
        .filter(|i| !i.is_empty())
    {
        prompt.push_str("\n\n## Additional Instructions\n\n");
        prompt.push_str(instructions);
    }

    prompt
}

/// Fresh iteration shell for retrying iteration `n` of `battle`.
pub fn prepare_iteration_for_retry(battle: &Battle, n: u32) -> Iteration {
    prepare_iteration_for_retry_at(battle, n, Utc::now())
}

pub fn prepare_iteration_for_retry_at(battle: &Battle, n: u32, now: DateTime<Utc>) -> Iteration {
    let previous = n
        .checked_sub(1)
        .and_then(|index| battle.iterations.get(index as usize));
    let retry_count = previous.map_or(0, |iteration| iteration.retry_count) + 1;

    Iteration {
        number: n,
        started_at: now,
        completed_at: None,
        output: String::new(),
        result: IterationResult::Pending,
        files_changed: Vec::new(),
        commit_hash: None,
        feedback_results: FeedbackResults::new(),
        retry_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::failure::FailureType;
    use crate::test_support::{battle_with_iterations, failure};

    #[test]
    fn continue_next_advances_one_iteration() {
        let f = failure(FailureType::Timeout, 4, true);
        for strategy in ResumeStrategy::ALL {
            let result = build_resume_context(strategy, &f, None);
            let expected = if strategy == ResumeStrategy::ContinueNext {
                5
            } else {
                4
            };
            assert_eq!(result.iteration, expected, "{strategy:?}");
            assert!(result.success);
        }
    }

    #[test]
    fn error_context_per_strategy() {
        let mut f = failure(FailureType::FeedbackFailure, 2, true);
        f.details = Some("3 tests failed".to_string());

        assert_eq!(
            build_resume_context(ResumeStrategy::RetrySame, &f, None).error_context,
            None
        );
        assert_eq!(
            build_resume_context(ResumeStrategy::RetryWithContext, &f, None)
                .error_context
                .as_deref(),
            Some("3 tests failed")
        );
        assert_eq!(
            build_resume_context(ResumeStrategy::RollbackAndRetry, &f, None)
                .error_context
                .as_deref(),
            Some("Previous attempt failed: Feedback loop 'test' failed")
        );

        f.details = None;
        assert_eq!(
            build_resume_context(ResumeStrategy::RetryWithContext, &f, None)
                .error_context
                .as_deref(),
            Some("Feedback loop 'test' failed")
        );
    }

    #[test]
    fn manual_then_continue_mentions_pause_and_keeps_instructions() {
        let f = failure(FailureType::AgentError, 1, false);
        let result =
            build_resume_context(ResumeStrategy::ManualThenContinue, &f, Some("check .env"));
        assert!(result.message.contains("manual fix"));
        assert_eq!(result.additional_instructions.as_deref(), Some("check .env"));
    }

    #[test]
    fn non_recoverable_only_allows_manual() {
        let f = failure(FailureType::SystemError, 1, false);
        for strategy in ResumeStrategy::ALL {
            assert_eq!(
                is_valid_resume_strategy(strategy, &f),
                strategy == ResumeStrategy::ManualThenContinue,
                "{strategy:?}"
            );
        }
    }

    #[test]
    fn recoverable_strategies_follow_type_options() {
        let timeout = failure(FailureType::Timeout, 1, true);
        assert!(is_valid_resume_strategy(ResumeStrategy::RetrySame, &timeout));
        assert!(is_valid_resume_strategy(
            ResumeStrategy::RollbackAndRetry,
            &timeout
        ));
        assert!(!is_valid_resume_strategy(
            ResumeStrategy::ManualThenContinue,
            &timeout
        ));

        let feedback = failure(FailureType::FeedbackFailure, 1, true);
        assert!(is_valid_resume_strategy(
            ResumeStrategy::ManualThenContinue,
            &feedback
        ));

        let cancelled = failure(FailureType::Cancellation, 1, true);
        assert!(!is_valid_resume_strategy(
            ResumeStrategy::RetryWithContext,
            &cancelled
        ));
        assert!(is_valid_resume_strategy(
            ResumeStrategy::RollbackAndRetry,
            &cancelled
        ));
    }

    #[test]
    fn default_strategy_maps_suggested_action() {
        let mut f = failure(FailureType::FeedbackFailure, 1, true);
        let expected = [
            (
                RecoveryAction::RetryIteration,
                ResumeStrategy::RetryWithContext,
            ),
            (
                RecoveryAction::FixAndContinue,
                ResumeStrategy::ManualThenContinue,
            ),
            (RecoveryAction::Rollback, ResumeStrategy::RollbackAndRetry),
            (RecoveryAction::Restart, ResumeStrategy::RetrySame),
            (
                RecoveryAction::ManualResolution,
                ResumeStrategy::ManualThenContinue,
            ),
        ];
        for (action, strategy) in expected {
            f.suggested_action = action;
            assert_eq!(get_default_resume_strategy(&f), strategy, "{action:?}");
        }

        f.recoverable = false;
        f.suggested_action = RecoveryAction::RetryIteration;
        assert_eq!(
            get_default_resume_strategy(&f),
            ResumeStrategy::ManualThenContinue
        );
    }

    #[test]
    fn retry_prompt_sections_are_ordered_and_optional() {
        let base = "Implement the parser.";
        assert_eq!(
            build_retry_prompt(base, &RetryPromptOptions::default()),
            base
        );

        let skipped = RetryPromptOptions {
            include_error_context: false,
            error_context: Some("boom".to_string()),
            additional_instructions: None,
        };
        assert_eq!(build_retry_prompt(base, &skipped), base);

        let full = RetryPromptOptions {
            include_error_context: true,
            error_context: Some("boom".to_string()),
            additional_instructions: Some("use serde".to_string()),
        };
        let prompt = build_retry_prompt(base, &full);
        assert!(prompt.starts_with(base));
        let error_at = prompt.find("boom").expect("error section");
        let instructions_at = prompt.find("use serde").expect("instructions section");
        assert!(error_at < instructions_at);

        let instructions_only = RetryPromptOptions {
            include_error_context: true,
            error_context: None,
            additional_instructions: Some("use serde".to_string()),
        };
        let prompt = build_retry_prompt(base, &instructions_only);
        assert!(!prompt.contains("Previous Attempt"));
        assert!(prompt.ends_with("use serde"));
    }

    #[test]
    fn resume_result_feeds_retry_prompt() {
        let mut f = failure(FailureType::FeedbackFailure, 3, true);
        f.details = Some("lint failed on src/lib.rs".to_string());
        let base = "Implement the parser.";

        let with_context = build_resume_context(
            ResumeStrategy::RetryWithContext,
            &f,
            Some("keep the public API"),
        );
        let prompt = build_retry_prompt(base, &RetryPromptOptions::from(&with_context));
        assert!(prompt.contains("## Previous Attempt Failed\n\nlint failed on src/lib.rs"));
        assert!(prompt.ends_with("## Additional Instructions\n\nkeep the public API"));

        let same = build_resume_context(ResumeStrategy::RetrySame, &f, None);
        let options = RetryPromptOptions::from(&same);
        assert!(!options.include_error_context);
        assert_eq!(build_retry_prompt(base, &options), base);
    }

    #[test]
    fn retry_count_starts_at_one_and_increments() {
        let mut battle = battle_with_iterations(0);
        let first = prepare_iteration_for_retry(&battle, 1);
        assert_eq!(first.number, 1);
        assert_eq!(first.retry_count, 1);
        assert_eq!(first.result, IterationResult::Pending);
        assert!(first.output.is_empty());
        assert!(first.files_changed.is_empty());

        battle.iterations.push(first);
        let second = prepare_iteration_for_retry(&battle, 1);
        assert_eq!(second.retry_count, 2);

        battle.iterations[0] = second;
        let third = prepare_iteration_for_retry(&battle, 1);
        assert_eq!(third.retry_count, 3);
    }

    #[test]
    fn retry_of_unknown_or_zero_iteration_starts_fresh() {
        let battle = battle_with_iterations(2);
        assert_eq!(prepare_iteration_for_retry(&battle, 7).retry_count, 1);
        assert_eq!(prepare_iteration_for_retry(&battle, 0).retry_count, 1);
    }
}
