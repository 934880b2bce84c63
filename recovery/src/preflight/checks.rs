//! Registered preflight checks.
//!
//! Checks are independent: each reads the context, never another check's
//! result. Order here is the order they appear in a report.

use anyhow::Result;
use tracing::debug;

use crate::core::types::TaskStatus;
use crate::io::git::Git;
use crate::preflight::{
    CheckCategory, CheckOutcome, CheckSeverity, FixResult, PreflightCheck, PreflightContext,
    STASH_REF_KEY,
};

/// Paths listed in the details of a dirty-tree warning.
const MAX_LISTED_PATHS: usize = 10;

pub static CHECKS: &[PreflightCheck] = &[
    PreflightCheck {
        id: "git_installed",
        name: "Git installed",
        description: "git is available on PATH",
        category: CheckCategory::Environment,
        severity: CheckSeverity::Error,
        run: git_installed,
        fix: None,
    },
    PreflightCheck {
        id: "working_dir",
        name: "Working directory",
        description: "The working directory exists",
        category: CheckCategory::Environment,
        severity: CheckSeverity::Error,
        run: working_dir,
        fix: None,
    },
    PreflightCheck {
        id: "git_repo",
        name: "Git repository",
        description: "The working directory is inside a git work tree",
        category: CheckCategory::Git,
        severity: CheckSeverity::Error,
        run: git_repo,
        fix: None,
    },
    PreflightCheck {
        id: "repo_status",
        name: "Repository status",
        description: "The working tree has no uncommitted changes",
        category: CheckCategory::Git,
        severity: CheckSeverity::Warning,
        run: repo_status,
        fix: Some(stash_changes),
    },
    PreflightCheck {
        id: "config_valid",
        name: "Configuration",
        description: "Battle configuration passes validation",
        category: CheckCategory::Config,
        severity: CheckSeverity::Error,
        run: config_valid,
        fix: None,
    },
    PreflightCheck {
        id: "feedback_loops",
        name: "Feedback loops",
        description: "Verification commands configured for each iteration",
        category: CheckCategory::Config,
        severity: CheckSeverity::Info,
        run: feedback_loops,
        fix: None,
    },
    PreflightCheck {
        id: "iteration_limit",
        name: "Iteration limit",
        description: "Maximum iterations allowed per task",
        category: CheckCategory::Config,
        severity: CheckSeverity::Info,
        run: iteration_limit,
        fix: None,
    },
    PreflightCheck {
        id: "task_status",
        name: "Task status",
        description: "The task has not been completed already",
        category: CheckCategory::Task,
        severity: CheckSeverity::Error,
        run: task_status,
        fix: None,
    },
    PreflightCheck {
        id: "acceptance_criteria",
        name: "Acceptance criteria",
        description: "The task defines acceptance criteria",
        category: CheckCategory::Task,
        severity: CheckSeverity::Warning,
        run: acceptance_criteria,
        fix: None,
    },
    PreflightCheck {
        id: "no_concurrent",
        name: "No concurrent battle",
        description: "No other task has an active battle",
        category: CheckCategory::System,
        severity: CheckSeverity::Error,
        run: no_concurrent,
        fix: None,
    },
];

pub fn find(id: &str) -> Option<&'static PreflightCheck> {
    CHECKS.iter().find(|check| check.id == id)
}

fn git(ctx: &PreflightContext) -> Git {
    Git::new(&ctx.working_dir).with_timeout(ctx.config.git_timeout())
}

fn git_installed(_ctx: &PreflightContext) -> Result<CheckOutcome> {
    Ok(match Git::installed_version() {
        Ok(version) => CheckOutcome::pass(format!("Found {version}")),
        Err(err) => CheckOutcome::fail("git is not installed or not on PATH")
            .with_details(format!("{err:#}"))
            .with_suggestion("Install git and make sure it is on PATH"),
    })
}

fn working_dir(ctx: &PreflightContext) -> Result<CheckOutcome> {
    let dir = &ctx.working_dir;
    Ok(if dir.is_dir() {
        CheckOutcome::pass(format!("{} exists", dir.display()))
    } else {
        CheckOutcome::fail(format!("{} does not exist or is not a directory", dir.display()))
    })
}

fn git_repo(ctx: &PreflightContext) -> Result<CheckOutcome> {
    if !ctx.working_dir.is_dir() || !git(ctx).is_repo()? {
        return Ok(CheckOutcome::fail("Not a git repository")
            .with_suggestion("Run `git init` and commit the project first"));
    }
    // Baseline checkpoints are taken against HEAD.
    if !git(ctx).has_commits()? {
        return Ok(CheckOutcome::fail("Repository has no commits yet")
            .with_suggestion("Create an initial commit before starting a battle"));
    }
    Ok(CheckOutcome::pass("Inside a git repository"))
}

fn repo_status(ctx: &PreflightContext) -> Result<CheckOutcome> {
    let entries = git(ctx).status_porcelain()?;
    if entries.is_empty() {
        return Ok(CheckOutcome::pass("Working tree is clean"));
    }
    let mut details: Vec<String> = entries
        .iter()
        .take(MAX_LISTED_PATHS)
        .map(|entry| format!("{} {}", entry.code, entry.path))
        .collect();
    if entries.len() > MAX_LISTED_PATHS {
        details.push(format!("... and {} more", entries.len() - MAX_LISTED_PATHS));
    }
    Ok(
        CheckOutcome::warn(format!("{} uncommitted change(s)", entries.len()))
            .with_details(details.join("\n"))
            .with_suggestion("Commit or stash your changes so checkpoints start from a known state"),
    )
}

fn stash_changes(ctx: &PreflightContext) -> Result<FixResult> {
    let message = format!("recovery preflight: {}", ctx.task.id);
    Ok(match git(ctx).stash_push(&message)? {
        Some(stash_ref) => {
            debug!(stash_ref = %stash_ref, "stashed uncommitted changes");
            FixResult::ok(format!("Stashed uncommitted changes as {stash_ref}"))
                .with_metadata(STASH_REF_KEY, stash_ref)
        }
        None => FixResult::ok("Nothing to stash"),
    })
}

fn config_valid(ctx: &PreflightContext) -> Result<CheckOutcome> {
    Ok(match ctx.config.validate() {
        Ok(()) => CheckOutcome::pass("Configuration is valid"),
        Err(err) => CheckOutcome::fail(format!("Invalid configuration: {err}"))
            .with_suggestion("Fix the battle configuration file"),
    })
}

fn feedback_loops(ctx: &PreflightContext) -> Result<CheckOutcome> {
    let loops = &ctx.config.feedback_loops;
    if loops.is_empty() {
        return Ok(CheckOutcome::warn("No feedback loops configured")
            .with_suggestion("Add feedback loops so each iteration can be verified"));
    }
    let names: Vec<&str> = loops.iter().map(|l| l.name.as_str()).collect();
    Ok(CheckOutcome::pass(format!("Feedback loops: {}", names.join(", "))))
}

fn iteration_limit(ctx: &PreflightContext) -> Result<CheckOutcome> {
    Ok(CheckOutcome::pass(format!(
        "Up to {} iterations per task",
        ctx.config.max_iterations_per_task
    )))
}

fn task_status(ctx: &PreflightContext) -> Result<CheckOutcome> {
    let task = &ctx.task;
    Ok(match task.status {
        TaskStatus::Completed => CheckOutcome::fail(format!("Task '{}' is already completed", task.id))
            .with_suggestion("Reopen the task before starting another battle"),
        TaskStatus::Pending | TaskStatus::InProgress | TaskStatus::Failed => {
            CheckOutcome::pass(format!("Task '{}' is ready", task.id))
        }
    })
}

fn acceptance_criteria(ctx: &PreflightContext) -> Result<CheckOutcome> {
    let count = ctx.task.acceptance_criteria.len();
    Ok(if count == 0 {
        CheckOutcome::warn("Task has no acceptance criteria")
            .with_suggestion("Add acceptance criteria so success can be judged")
    } else {
        CheckOutcome::pass(format!("{count} acceptance criteria defined"))
    })
}

fn no_concurrent(ctx: &PreflightContext) -> Result<CheckOutcome> {
    Ok(match ctx.active_battle_task_id.as_deref() {
        Some(active) if active != ctx.task.id => {
            CheckOutcome::fail(format!("A battle is already running for task '{active}'"))
                .with_suggestion("Wait for it to finish or cancel it first")
        }
        Some(_) => CheckOutcome::pass("The active battle belongs to this task"),
        None => CheckOutcome::pass("No other battle is running"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::BattleConfig;
    use crate::test_support::{TestRepo, task};

    fn ctx(dir: &std::path::Path) -> PreflightContext {
        PreflightContext::new(task("t1"), BattleConfig::default(), dir)
    }

    #[test]
    fn ids_are_unique_and_only_repo_status_has_a_fix() {
        let mut ids: Vec<&str> = CHECKS.iter().map(|c| c.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), CHECKS.len());

        let fixable: Vec<&str> = CHECKS
            .iter()
            .filter(|c| c.fix.is_some())
            .map(|c| c.id)
            .collect();
        assert_eq!(fixable, vec!["repo_status"]);
    }

    #[test]
    fn no_concurrent_allows_same_task_only() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut context = ctx(temp.path());
        assert!(no_concurrent(&context).expect("run").passed);

        context.active_battle_task_id = Some("t1".to_string());
        assert!(no_concurrent(&context).expect("run").passed);

        context.active_battle_task_id = Some("other".to_string());
        let outcome = no_concurrent(&context).expect("run");
        assert!(!outcome.passed);
        assert!(!outcome.can_proceed);
        assert!(outcome.message.contains("other"));
    }

    #[test]
    fn acceptance_criteria_warns_when_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut context = ctx(temp.path());
        assert!(acceptance_criteria(&context).expect("run").passed);

        context.task.acceptance_criteria.clear();
        let outcome = acceptance_criteria(&context).expect("run");
        assert!(!outcome.passed);
        assert!(outcome.can_proceed);
    }

    #[test]
    fn repo_status_lists_dirty_paths_and_stash_fix_cleans() {
        let repo = TestRepo::new().expect("repo");
        let context = ctx(repo.root());
        assert_eq!(
            repo_status(&context).expect("run").message,
            "Working tree is clean"
        );

        repo.write("README.md", "changed\n").expect("write");
        repo.write("notes.txt", "new\n").expect("write");
        let outcome = repo_status(&context).expect("run");
        assert!(!outcome.passed);
        assert!(outcome.can_proceed);
        let details = outcome.details.expect("details");
        assert!(details.contains("README.md"));
        assert!(details.contains("notes.txt"));

        let fix = stash_changes(&context).expect("fix");
        assert!(fix.success);
        assert_eq!(
            fix.metadata.get(STASH_REF_KEY).map(String::len),
            Some(40)
        );
        assert!(repo_status(&context).expect("run").passed);
    }

    #[test]
    fn git_repo_fails_outside_repository() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = git_repo(&ctx(temp.path())).expect("run");
        assert!(!outcome.passed);

        let missing = ctx(&temp.path().join("missing"));
        assert!(!working_dir(&missing).expect("run").passed);
        assert!(!git_repo(&missing).expect("run").passed);
    }

    #[test]
    fn git_repo_requires_an_initial_commit() {
        let temp = tempfile::tempdir().expect("tempdir");
        let status = std::process::Command::new("git")
            .args(["init", "-q"])
            .current_dir(temp.path())
            .status()
            .expect("git init");
        assert!(status.success());

        let outcome = git_repo(&ctx(temp.path())).expect("run");
        assert!(!outcome.passed);
        assert!(!outcome.can_proceed);
        assert!(
            outcome
                .suggestion
                .as_deref()
                .expect("suggestion")
                .contains("initial commit")
        );

        let repo = TestRepo::new().expect("repo");
        assert!(git_repo(&ctx(repo.root())).expect("run").passed);
    }

    #[test]
    fn feedback_loops_reports_none_as_info() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut context = ctx(temp.path());
        let outcome = feedback_loops(&context).expect("run");
        assert!(!outcome.passed);
        assert!(outcome.can_proceed);

        context.config.feedback_loops.push(crate::io::config::FeedbackLoop {
            name: "test".to_string(),
            command: vec!["cargo".to_string(), "test".to_string()],
            required: true,
        });
        assert_eq!(
            feedback_loops(&context).expect("run").message,
            "Feedback loops: test"
        );
    }
}
