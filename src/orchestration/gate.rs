//! Pre-dispatch complexity gate.
//!
//! Scores a task's difficulty and decides whether it may be dispatched and
//! with what step budget. Budgets never exceed `step_ceiling`; a task that
//! would need more is split along the items its description lists, or
//! rejected when it lists none. The decision depends only on the task's
//! current fields, so evaluating an unchanged task twice gives the same
//! answer.

use crate::config::GateConfig;
use crate::core::dag::ChildSpec;
use crate::core::task::Task;
use crate::clog_debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// Backticked identifiers: `parse_header`, `Config::load`.
static INTERFACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`([^`\s]+)`").unwrap());

/// Bullet or numbered list items.
static LIST_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^[ \t]*(?:[-*+]|\d+[.)])[ \t]+(\S.*?)[ \t]*$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Proceed { step_budget: u32 },
    Split { children: Vec<ChildSpec> },
    Reject { reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct ComplexityGate {
    config: GateConfig,
}

impl ComplexityGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    pub fn ceiling(&self) -> u32 {
        self.config.step_ceiling
    }

    /// Distinct backticked identifiers in the description.
    pub fn interface_count(task: &Task) -> u32 {
        INTERFACE_RE
            .captures_iter(&task.description)
            .map(|caps| caps[1].to_string())
            .collect::<BTreeSet<_>>()
            .len() as u32
    }

    /// size + words / words_per_point + referenced interfaces + retries.
    pub fn difficulty(&self, task: &Task) -> u32 {
        let words = task.description.split_whitespace().count() as u32;
        task.size
            .saturating_add(words / self.config.words_per_point.max(1))
            .saturating_add(Self::interface_count(task))
            .saturating_add(task.retry_count)
    }

    /// Budget for a task that has never been admitted.
    pub fn initial_budget(&self, task: &Task) -> u32 {
        self.config.base_steps.saturating_add(
            self.config
                .steps_per_point
                .saturating_mul(self.difficulty(task)),
        )
    }

    /// Decide for the task's recorded budget, or the initial one if none.
    pub fn evaluate(&self, task: &Task) -> GateDecision {
        let budget = task
            .step_budget
            .unwrap_or_else(|| self.initial_budget(task));
        self.evaluate_with_budget(task, budget)
    }

    /// Decide as if the task needed `budget` steps.
    pub fn evaluate_with_budget(&self, task: &Task, budget: u32) -> GateDecision {
        if task.retry_count >= self.config.max_attempts {
            return GateDecision::Reject {
                reason: format!(
                    "{} attempts reached the limit of {}",
                    task.retry_count, self.config.max_attempts
                ),
            };
        }

        let difficulty = self.difficulty(task);
        let over_ceiling = budget > self.config.step_ceiling;
        let too_hard = difficulty > self.config.split_threshold;
        clog_debug!(
            "ComplexityGate: {} difficulty={} budget={} ceiling={}",
            task.id,
            difficulty,
            budget,
            self.config.step_ceiling
        );
        if !over_ceiling && !too_hard {
            return GateDecision::Proceed {
                step_budget: budget,
            };
        }

        let children = split_children(task);
        if children.len() >= 2 {
            return GateDecision::Split { children };
        }
        GateDecision::Reject {
            reason: if over_ceiling {
                format!(
                    "needs {} steps, above the ceiling of {}, and cannot be split",
                    budget, self.config.step_ceiling
                )
            } else {
                format!(
                    "difficulty {} is above {} and cannot be split",
                    difficulty, self.config.split_threshold
                )
            },
        }
    }
}

/// One child per listed item; the parent's size is shared between them.
fn split_children(task: &Task) -> Vec<ChildSpec> {
    let items: Vec<&str> = LIST_ITEM_RE
        .captures_iter(&task.description)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    if items.len() < 2 {
        return Vec::new();
    }
    let size = (task.size / items.len() as u32).max(1);
    items
        .into_iter()
        .map(|item| {
            ChildSpec::new(
                item,
                &format!("{}\n\nPart of {}: {}", item, task.id, task.title),
                size,
            )
        })
        .collect()
}
