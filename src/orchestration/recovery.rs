//! Failure classification and recovery decisions.
//!
//! Every failed attempt is reduced to [`FailureEvidence`] (a category, a
//! reason code and a detail string) and the `RecoveryEngine` turns that into
//! a [`RecoveryDecision`]. For results that produced output the verifier's
//! [`CheckOutcome`] decides the category, not the worker's own status. A
//! check runner that timed out is transient; one that could not start is an
//! environment error.
//!
//! ## Levels
//!
//! - `TRANSIENT` retries with the same budget, at most
//!   `max_transient_retries` times, then escalates.
//! - `WORKER_EXHAUSTION` retries with the budget multiplied by
//!   `budget_multiplier`, at most `max_adjusted_retries` times, then
//!   escalates. A raised budget above the gate ceiling is handed back to the
//!   gate, which answers SPLIT or REJECT.
//! - `SPECIFICATION_DEFECT` and `ENVIRONMENT_ERROR` escalate immediately.

use crate::config::RecoveryConfig;
use crate::core::dag::ChildSpec;
use crate::core::task::{BlockCode, Task};
use crate::orchestration::gate::{ComplexityGate, GateDecision};
use crate::orchestration::invoker::{WorkerResult, WorkerStatus};
use crate::orchestration::parser::Record;
use crate::orchestration::verifier::{CheckOutcome, RunnerFailure};
use crate::clog_debug;
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Transient,
    WorkerExhaustion,
    SpecificationDefect,
    EnvironmentError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryLevel {
    RetrySame,
    RetryAdjusted,
    Escalate,
    Split,
    Reject,
}

impl RecoveryLevel {
    pub fn is_retry(&self) -> bool {
        matches!(self, RecoveryLevel::RetrySame | RecoveryLevel::RetryAdjusted)
    }
}

/// Why an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEvidence {
    pub category: FailureCategory,
    /// Reason code used if the task ends up blocked.
    pub code: BlockCode,
    pub detail: String,
}

impl FailureEvidence {
    fn new(category: FailureCategory, code: BlockCode, detail: impl Into<String>) -> Self {
        Self {
            category,
            code,
            detail: detail.into(),
        }
    }

    /// Classify an attempt; `None` means it succeeded and the task is done.
    ///
    /// `check` is the verifier outcome for results that produced output.
    pub fn from_attempt(result: &WorkerResult, check: Option<&CheckOutcome>) -> Option<Self> {
        let error_detail = || {
            result
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default()
        };
        match result.status {
            WorkerStatus::Timeout => Some(Self::new(
                FailureCategory::Transient,
                BlockCode::TimeoutFailure,
                format!("timed out after {:?}", result.elapsed),
            )),
            WorkerStatus::ParseError => Some(Self::new(
                FailureCategory::Transient,
                BlockCode::ParseFailure,
                error_detail(),
            )),
            WorkerStatus::RuntimeError => {
                let environmental = result
                    .error
                    .as_ref()
                    .is_some_and(|e| e.kind.is_environmental());
                Some(if environmental {
                    Self::new(
                        FailureCategory::EnvironmentError,
                        BlockCode::EnvironmentError,
                        error_detail(),
                    )
                } else {
                    Self::new(
                        FailureCategory::Transient,
                        BlockCode::InvocationFailure,
                        error_detail(),
                    )
                })
            }
            WorkerStatus::Incomplete if result.records().is_empty() => Some(Self::new(
                FailureCategory::WorkerExhaustion,
                BlockCode::WorkerExhaustion,
                format!(
                    "step budget of {} ran out before any usable output",
                    result.step_budget
                ),
            )),
            WorkerStatus::Success | WorkerStatus::Incomplete => {
                let Some(check) = check else {
                    return Some(Self::new(
                        FailureCategory::Transient,
                        BlockCode::InvocationFailure,
                        "output was never verified",
                    ));
                };
                Self::from_check(result, check)
            }
        }
    }

    fn from_check(result: &WorkerResult, check: &CheckOutcome) -> Option<Self> {
        match &check.runner_failure {
            Some(RunnerFailure::Timeout(_)) => {
                return Some(Self::new(
                    FailureCategory::Transient,
                    BlockCode::TimeoutFailure,
                    check.to_string(),
                ))
            }
            Some(RunnerFailure::Environment(_)) => {
                return Some(Self::new(
                    FailureCategory::EnvironmentError,
                    BlockCode::EnvironmentError,
                    check.to_string(),
                ))
            }
            None => {}
        }
        if check.load_failed {
            let undefined = undefined_symbols(&check.missing_symbols, result.records());
            let detail = check.load_error.clone().unwrap_or_default();
            if !undefined.is_empty() {
                return Some(Self::new(
                    FailureCategory::WorkerExhaustion,
                    BlockCode::WorkerExhaustion,
                    format!("checks reference symbols never produced: {}", undefined.join(", ")),
                ));
            }
            if result.status == WorkerStatus::Incomplete {
                return Some(Self::new(
                    FailureCategory::WorkerExhaustion,
                    BlockCode::WorkerExhaustion,
                    format!("step budget ran out; checks could not load: {}", detail),
                ));
            }
            return Some(Self::new(
                FailureCategory::SpecificationDefect,
                BlockCode::VerificationLoadFailure,
                detail,
            ));
        }
        if !check.all_passed() {
            return Some(Self::new(
                FailureCategory::WorkerExhaustion,
                BlockCode::VerificationFailure,
                check.to_string(),
            ));
        }
        None
    }
}

/// Missing symbols that none of the produced changes defines.
fn undefined_symbols(missing: &[String], records: &[Record]) -> Vec<String> {
    missing
        .iter()
        .filter(|symbol| {
            let Ok(definition) = Regex::new(&format!(
                r"\b(?:fn|struct|enum|trait|type|const|static|mod|def|class)\s+{}\b",
                regex::escape(symbol)
            )) else {
                return true;
            };
            !records
                .iter()
                .filter_map(Record::as_change)
                .any(|change| definition.is_match(&change.content))
        })
        .cloned()
        .collect()
}

/// What to do with a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryDecision {
    pub category: FailureCategory,
    pub level: RecoveryLevel,
    /// Reason code for ESCALATE/REJECT, and the failure cause for retries.
    pub code: BlockCode,
    /// Budget for the next attempt (retries only).
    pub step_budget: Option<u32>,
    /// Replacement tasks (SPLIT only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildSpec>,
    pub rationale: String,
}

#[derive(Debug, Clone, Default)]
pub struct RecoveryEngine {
    config: RecoveryConfig,
    gate: ComplexityGate,
}

impl RecoveryEngine {
    pub fn new(config: RecoveryConfig, gate: ComplexityGate) -> Self {
        Self { config, gate }
    }

    pub fn decide(&self, task: &Task, evidence: &FailureEvidence) -> RecoveryDecision {
        let decision = match evidence.category {
            FailureCategory::Transient => self.transient(task, evidence),
            FailureCategory::WorkerExhaustion => self.exhaustion(task, evidence),
            FailureCategory::SpecificationDefect => self.escalate(
                evidence,
                format!("output is self-consistent but checks fail to load: {}", evidence.detail),
            ),
            FailureCategory::EnvironmentError => self.escalate(
                evidence,
                format!("environment must be fixed before resuming: {}", evidence.detail),
            ),
        };
        clog_debug!(
            "RecoveryEngine: {} {:?}/{:?} -> {:?} ({})",
            task.id,
            evidence.category,
            evidence.code,
            decision.level,
            decision.rationale
        );
        decision
    }

    fn transient(&self, task: &Task, evidence: &FailureEvidence) -> RecoveryDecision {
        if task.transient_retries >= self.config.max_transient_retries {
            return self.escalate(
                evidence,
                format!(
                    "{} transient retries exhausted: {}",
                    task.transient_retries, evidence.detail
                ),
            );
        }
        RecoveryDecision {
            category: evidence.category,
            level: RecoveryLevel::RetrySame,
            code: evidence.code,
            step_budget: task.step_budget,
            children: Vec::new(),
            rationale: format!(
                "transient failure, retry {} of {}: {}",
                task.transient_retries + 1,
                self.config.max_transient_retries,
                evidence.detail
            ),
        }
    }

    fn exhaustion(&self, task: &Task, evidence: &FailureEvidence) -> RecoveryDecision {
        if task.adjusted_retries >= self.config.max_adjusted_retries {
            return self.escalate(
                evidence,
                format!(
                    "{} adjusted retries exhausted: {}",
                    task.adjusted_retries, evidence.detail
                ),
            );
        }

        let current = task
            .step_budget
            .unwrap_or_else(|| self.gate.initial_budget(task));
        let raised = current.saturating_mul(self.config.budget_multiplier.max(2));

        if raised > self.gate.ceiling() {
            return match self.gate.evaluate_with_budget(task, raised) {
                GateDecision::Split { children } => RecoveryDecision {
                    category: evidence.category,
                    level: RecoveryLevel::Split,
                    code: evidence.code,
                    step_budget: None,
                    rationale: format!(
                        "budget {} would exceed ceiling {}; splitting into {} tasks",
                        raised,
                        self.gate.ceiling(),
                        children.len()
                    ),
                    children,
                },
                GateDecision::Reject { reason } => RecoveryDecision {
                    category: evidence.category,
                    level: RecoveryLevel::Reject,
                    code: BlockCode::Rejected,
                    step_budget: None,
                    children: Vec::new(),
                    rationale: reason,
                },
                GateDecision::Proceed { step_budget } => {
                    self.adjusted(evidence, step_budget, current)
                }
            };
        }
        self.adjusted(evidence, raised, current)
    }

    fn adjusted(&self, evidence: &FailureEvidence, raised: u32, current: u32) -> RecoveryDecision {
        RecoveryDecision {
            category: evidence.category,
            level: RecoveryLevel::RetryAdjusted,
            code: evidence.code,
            step_budget: Some(raised),
            children: Vec::new(),
            rationale: format!(
                "step budget {} -> {}: {}",
                current, raised, evidence.detail
            ),
        }
    }

    fn escalate(&self, evidence: &FailureEvidence, rationale: String) -> RecoveryDecision {
        RecoveryDecision {
            category: evidence.category,
            level: RecoveryLevel::Escalate,
            code: evidence.code,
            step_budget: None,
            children: Vec::new(),
            rationale,
        }
    }
}
