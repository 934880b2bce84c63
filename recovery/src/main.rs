//! `recovery` CLI: preflight, baseline checkpoints, and restores for battles.
//!
//! Every command prints JSON to stdout. Diagnostics go to stderr via
//! `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use recovery::core::checkpoint::{Checkpoint, validate_checkpoint};
use recovery::core::token::{TokenSigner, install_process_signer, validate_preflight_token_for};
use recovery::core::types::Task;
use recovery::exit_codes;
use recovery::io::checkpoint_store::{create_initial_checkpoint, restore_checkpoint};
use recovery::io::config::{BattleConfig, load_config};
use recovery::logging;
use recovery::preflight::{
    PreflightContext, PreflightOptions, list_checks, restore_stash, run_preflight,
};

/// Shared secret for preflight tokens across invocations.
const TOKEN_KEY_ENV: &str = "RECOVERY_TOKEN_KEY";

#[derive(Parser)]
#[command(
    name = "recovery",
    version,
    about = "Preflight checks, checkpoints, and recovery for agent battles"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every preflight check and print the report.
    Preflight {
        /// Task record (JSON).
        #[arg(long)]
        task: PathBuf,
        /// Battle config (TOML); defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Task id of the battle currently running, if any.
        #[arg(long)]
        active_task: Option<String>,
        /// Apply available auto-fixes (stashes uncommitted changes).
        #[arg(long)]
        auto_fix: bool,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
    /// Take the iteration-0 checkpoint. Requires a valid preflight token.
    Baseline {
        #[arg(long)]
        battle: String,
        #[arg(long)]
        task: String,
        #[arg(long)]
        token: String,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
    /// Restore the working directory to a checkpoint (JSON).
    Restore {
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
    /// List registered preflight checks.
    Checks,
    /// Re-apply a stash created by `preflight --auto-fix`.
    RestoreStash {
        stash_ref: String,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
}

fn main() {
    logging::init();
    install_token_key();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Preflight {
            task,
            config,
            active_task,
            auto_fix,
            dir,
        } => cmd_preflight(&task, config.as_deref(), active_task, auto_fix, &dir),
        Command::Baseline {
            battle,
            task,
            token,
            config,
            dir,
        } => cmd_baseline(&battle, &task, &token, config.as_deref(), &dir),
        Command::Restore {
            checkpoint,
            config,
            dir,
        } => cmd_restore(&checkpoint, config.as_deref(), &dir),
        Command::Checks => {
            print_json(&list_checks())?;
            Ok(exit_codes::OK)
        }
        Command::RestoreStash {
            stash_ref,
            config,
            dir,
        } => cmd_restore_stash(&stash_ref, config.as_deref(), &dir),
    }
}

fn cmd_preflight(
    task_path: &Path,
    config_path: Option<&Path>,
    active_task: Option<String>,
    auto_fix: bool,
    dir: &Path,
) -> Result<i32> {
    let task: Task = read_json(task_path)?;
    let mut ctx = PreflightContext::new(task, config(config_path)?, dir);
    ctx.active_battle_task_id = active_task;

    let report = run_preflight(&ctx, PreflightOptions { auto_fix });
    print_json(&report)?;
    Ok(if report.can_start {
        exit_codes::OK
    } else {
        exit_codes::BLOCKED
    })
}

fn cmd_baseline(
    battle_id: &str,
    task_id: &str,
    token: &str,
    config_path: Option<&Path>,
    dir: &Path,
) -> Result<i32> {
    if validate_preflight_token_for(token, task_id).is_none() {
        eprintln!("preflight token is invalid, expired, or issued for another task");
        return Ok(exit_codes::BLOCKED);
    }
    let checkpoint = create_initial_checkpoint(battle_id, dir, &config(config_path)?)?;
    print_json(&checkpoint)?;
    Ok(exit_codes::OK)
}

fn cmd_restore(checkpoint_path: &Path, config_path: Option<&Path>, dir: &Path) -> Result<i32> {
    let checkpoint: Checkpoint = read_json(checkpoint_path)?;
    let validation = validate_checkpoint(&checkpoint);
    if let Some(error) = validation.error {
        bail!("{error}");
    }
    restore_checkpoint(&checkpoint, dir, &config(config_path)?)?;
    print_json(&serde_json::json!({
        "restored": checkpoint.id,
        "after_iteration": checkpoint.after_iteration,
    }))?;
    Ok(exit_codes::OK)
}

fn cmd_restore_stash(stash_ref: &str, config_path: Option<&Path>, dir: &Path) -> Result<i32> {
    let result = restore_stash(dir, stash_ref, &config(config_path)?);
    print_json(&result)?;
    Ok(if result.success {
        exit_codes::OK
    } else {
        exit_codes::INVALID
    })
}

fn install_token_key() {
    let Ok(key) = std::env::var(TOKEN_KEY_ENV) else {
        debug!("no shared token key; tokens are valid only within this process");
        return;
    };
    if key.is_empty() {
        warn!(env = TOKEN_KEY_ENV, "empty token key ignored");
        return;
    }
    install_process_signer(TokenSigner::new(key.into_bytes()));
}

fn config(path: Option<&Path>) -> Result<BattleConfig> {
    match path {
        Some(path) => load_config(path),
        None => Ok(BattleConfig::default()),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_preflight() {
        let cli = Cli::parse_from([
            "recovery",
            "preflight",
            "--task",
            "task.json",
            "--active-task",
            "t9",
            "--auto-fix",
        ]);
        match cli.command {
            Command::Preflight {
                task,
                config,
                active_task,
                auto_fix,
                dir,
            } => {
                assert_eq!(task, PathBuf::from("task.json"));
                assert!(config.is_none());
                assert_eq!(active_task.as_deref(), Some("t9"));
                assert!(auto_fix);
                assert_eq!(dir, PathBuf::from("."));
            }
            _ => panic!("expected preflight"),
        }
    }

    #[test]
    fn parse_restore_stash_positional_ref() {
        let cli = Cli::parse_from(["recovery", "restore-stash", "abc123", "--dir", "/tmp/w"]);
        assert!(matches!(
            cli.command,
            Command::RestoreStash { ref stash_ref, .. } if stash_ref == "abc123"
        ));
    }

    #[test]
    fn baseline_requires_token() {
        assert!(Cli::try_parse_from(["recovery", "baseline", "--battle", "b", "--task", "t"]).is_err());
    }
}
