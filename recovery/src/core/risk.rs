//! Heuristic task-risk assessment shown alongside preflight results.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::types::Task;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRisk {
    pub level: RiskLevel,
    pub recommendation: String,
    pub factors: Vec<String>,
}

const LONG_DESCRIPTION_CHARS: usize = 500;
const VERY_LONG_DESCRIPTION_CHARS: usize = 1500;
const MANY_CRITERIA: usize = 5;
const VERY_MANY_CRITERIA: usize = 10;

static COMPLEXITY_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(refactor\w*|migrat\w*|architecture|security|authentication|database|schema|concurren\w*|performance|breaking|rewrite)\b",
    )
    .expect("static keyword regex")
});

/// Score a task by description size, complexity keywords, and criteria count.
///
/// Every factor only adds to the score, so a longer description, more
/// keywords, or more criteria never lowers the level.
pub fn assess_task_risk(task: &Task) -> TaskRisk {
    let mut score = 0u32;
    let mut factors = Vec::new();

    let length = task.description.chars().count();
    if length > VERY_LONG_DESCRIPTION_CHARS {
        score += 2;
        factors.push(format!("Very long description ({length} characters)"));
    } else if length > LONG_DESCRIPTION_CHARS {
        score += 1;
        factors.push(format!("Long description ({length} characters)"));
    }

    let mut keywords: Vec<String> = COMPLEXITY_KEYWORDS
        .find_iter(&task.description)
        .map(|m| m.as_str().to_lowercase())
        .collect();
    keywords.sort();
    keywords.dedup();
    if !keywords.is_empty() {
        score += keywords.len().min(3) as u32;
        factors.push(format!("Complexity keywords: {}", keywords.join(", ")));
    }

    let criteria = task.acceptance_criteria.len();
    if criteria > VERY_MANY_CRITERIA {
        score += 2;
        factors.push(format!("Many acceptance criteria ({criteria})"));
    } else if criteria > MANY_CRITERIA {
        score += 1;
        factors.push(format!("Several acceptance criteria ({criteria})"));
    }

    let level = match score {
        0..=1 => RiskLevel::Low,
        2..=3 => RiskLevel::Medium,
        _ => RiskLevel::High,
    };
    let recommendation = match level {
        RiskLevel::Low => "Low risk: safe to run autonomously.",
        RiskLevel::Medium => "Moderate risk: run autonomously but review checkpoints between iterations.",
        RiskLevel::High => "High risk: run with human oversight and review each iteration.",
    };

    TaskRisk {
        level,
        recommendation: recommendation.to_string(),
        factors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::task;

    #[test]
    fn small_task_is_low_risk() {
        let risk = assess_task_risk(&task("t1"));
        assert_eq!(risk.level, RiskLevel::Low);
        assert!(risk.recommendation.contains("autonomously"));
        assert!(risk.factors.is_empty());
    }

    #[test]
    fn large_complex_task_is_high_risk() {
        let mut t = task("t2");
        t.description = format!(
            "Refactor the database schema and migrate authentication. {}",
            "x".repeat(1600)
        );
        t.acceptance_criteria = (0..12).map(|i| format!("criterion {i}")).collect();

        let risk = assess_task_risk(&t);
        assert_eq!(risk.level, RiskLevel::High);
        assert!(risk.recommendation.contains("human oversight"));
        assert_eq!(risk.factors.len(), 3);
    }

    #[test]
    fn risk_is_monotonic_in_size_and_criteria() {
        let mut t = task("t3");
        let mut previous = assess_task_risk(&t).level;
        for step in 0..20 {
            t.description.push_str(&"word ".repeat(40));
            if step % 3 == 0 {
                t.description.push_str(" performance ");
            }
            t.acceptance_criteria.push(format!("criterion {step}"));
            let level = assess_task_risk(&t).level;
            assert!(level >= previous, "risk decreased at step {step}");
            previous = level;
        }
        assert_eq!(previous, RiskLevel::High);
    }
}
