//! Battle configuration (TOML).

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::failure::ClassifyContext;

/// Configuration consumed by recovery and preflight.
///
/// Missing fields default to values suitable for a single local battle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BattleConfig {
    /// Verification commands run after every iteration.
    pub feedback_loops: Vec<FeedbackLoop>,

    /// Commit after each iteration; selects commit-backed checkpoints.
    pub auto_commit: bool,

    /// Per-iteration wall-clock budget for the agent, in minutes.
    pub timeout_minutes: u64,

    pub max_iterations_per_task: u32,

    /// Upper bound for any single git command.
    pub git_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedbackLoop {
    pub name: String,
    /// Command and arguments, e.g. `["cargo", "test"]`.
    pub command: Vec<String>,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl Default for BattleConfig {
    fn default() -> Self {
        Self {
            feedback_loops: Vec::new(),
            auto_commit: true,
            timeout_minutes: 30,
            max_iterations_per_task: 10,
            git_timeout_secs: 120,
        }
    }
}

impl BattleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout_minutes == 0 {
            return Err(anyhow!("timeout_minutes must be > 0"));
        }
        if self.max_iterations_per_task == 0 {
            return Err(anyhow!("max_iterations_per_task must be > 0"));
        }
        if self.git_timeout_secs == 0 {
            return Err(anyhow!("git_timeout_secs must be > 0"));
        }
        let mut seen = HashSet::new();
        for feedback_loop in &self.feedback_loops {
            if feedback_loop.command.is_empty() || feedback_loop.command[0].trim().is_empty() {
                return Err(anyhow!(
                    "feedback loop '{}' has an empty command",
                    feedback_loop.name
                ));
            }
            if !seen.insert(feedback_loop.name.as_str()) {
                return Err(anyhow!(
                    "duplicate feedback loop name '{}'",
                    feedback_loop.name
                ));
            }
        }
        Ok(())
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn classify_context(&self, current_iteration: u32) -> ClassifyContext {
        ClassifyContext {
            current_iteration,
            timeout_minutes: self.timeout_minutes,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `BattleConfig::default()`.
pub fn load_config(path: &Path) -> Result<BattleConfig> {
    if !path.exists() {
        let cfg = BattleConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: BattleConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &BattleConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_loop(name: &str) -> FeedbackLoop {
        FeedbackLoop {
            name: name.to_string(),
            command: vec!["cargo".to_string(), "test".to_string()],
            required: true,
        }
    }

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, BattleConfig::default());
        assert!(cfg.auto_commit);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("battle.toml");
        let cfg = BattleConfig {
            feedback_loops: vec![test_loop("test")],
            auto_commit: false,
            ..BattleConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("battle.toml");
        fs::write(
            &path,
            "auto_commit = false\n\n[[feedback_loops]]\nname = \"lint\"\ncommand = [\"just\", \"lint\"]\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert!(!cfg.auto_commit);
        assert_eq!(cfg.timeout_minutes, 30);
        assert_eq!(cfg.feedback_loops.len(), 1);
        assert!(cfg.feedback_loops[0].required);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let zero_timeout = BattleConfig {
            timeout_minutes: 0,
            ..BattleConfig::default()
        };
        assert!(
            zero_timeout
                .validate()
                .unwrap_err()
                .to_string()
                .contains("timeout_minutes")
        );

        let mut empty_command = test_loop("build");
        empty_command.command.clear();
        let cfg = BattleConfig {
            feedback_loops: vec![empty_command],
            ..BattleConfig::default()
        };
        assert!(cfg.validate().unwrap_err().to_string().contains("empty command"));

        let cfg = BattleConfig {
            feedback_loops: vec![test_loop("test"), test_loop("test")],
            ..BattleConfig::default()
        };
        assert!(cfg.validate().unwrap_err().to_string().contains("duplicate"));
    }
}
