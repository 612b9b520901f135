//! Failure classification through full runs.

use std::sync::atomic::Ordering;

use conductor::core::task::{BlockCode, Task, TaskId, TaskState};
use conductor::core::TaskGraph;
use conductor::orchestration::{
    CheckOutcome, FailureCategory, InvocationErrorKind, RecoveryLevel, RunOutcome,
};
use conductor::Error;
use tempfile::TempDir;

use crate::fixtures::{
    chain_graph, change_output, independent_tasks, orchestrator, test_config, ScriptedCapability,
    ScriptedChecks, Step,
};

fn levels(report: &conductor::RunReport) -> Vec<RecoveryLevel> {
    report.decisions.iter().map(|(_, d)| d.level).collect()
}

/// Test: Environment errors skip verification and retries
/// Given T1 fails authentication
/// When the run executes
/// Then T1 is BLOCKED(EnvironmentError) at once and its dependents never start
#[tokio::test]
async fn test_environment_error_escalates_immediately() {
    let dir = TempDir::new().unwrap();
    let capability = ScriptedCapability::new()
        .script("T1", vec![Step::Fail(InvocationErrorKind::Authentication)]);
    let checks = ScriptedChecks::new();
    let runs = checks.runs();

    let mut orch = orchestrator(dir.path(), chain_graph(), capability, checks, test_config(2));
    let report = orch.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Blocked);
    assert_eq!(levels(&report), vec![RecoveryLevel::Escalate]);
    assert_eq!(report.decisions[0].1.category, FailureCategory::EnvironmentError);
    assert_eq!(report.blocked[0].code, BlockCode::EnvironmentError);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(
        report.pending,
        vec![
            (TaskId::from("T2"), TaskState::Backlog),
            (TaskId::from("T3"), TaskState::Backlog),
        ]
    );

    // the operator fixed the credentials
    orch.unblock(&TaskId::from("T1")).unwrap();
    let report = orch.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.done.len(), 3);
}

/// Test: Self-consistent output whose checks cannot load
/// Given T1 defines every symbol the loader reports missing
/// When the run executes
/// Then T1 is BLOCKED(VerificationLoadFailure) without any retry
#[tokio::test]
async fn test_specification_defect_escalates() {
    let dir = TempDir::new().unwrap();
    let capability = ScriptedCapability::new().script(
        "T1",
        vec![Step::Succeed(change_output(
            "src/codec.rs",
            "pub fn decode_frame() {}\n",
        ))],
    );
    let checks = ScriptedChecks::new().outcome(
        "T1",
        CheckOutcome::load_failure(
            "error[E0432]: unresolved import `decode_frame`",
            vec!["decode_frame".to_string()],
        ),
    );

    let mut orch =
        orchestrator(dir.path(), independent_tasks(1), capability, checks, test_config(1));
    let report = orch.run().await.unwrap();

    assert_eq!(levels(&report), vec![RecoveryLevel::Escalate]);
    assert_eq!(report.decisions[0].1.category, FailureCategory::SpecificationDefect);
    assert_eq!(report.blocked[0].code, BlockCode::VerificationLoadFailure);
}

/// Test: Undecodable structured output
/// Given a worker that keeps returning a broken JSON block
/// When the run executes
/// Then the task is retried three times and then BLOCKED(ParseFailure)
#[tokio::test]
async fn test_parse_failures_are_bounded() {
    let dir = TempDir::new().unwrap();
    let broken = "```json\n{\"changes\": [\n```".to_string();
    let capability = ScriptedCapability::new().script(
        "T1",
        vec![
            Step::Succeed(broken.clone()),
            Step::Succeed(broken.clone()),
            Step::Succeed(broken.clone()),
            Step::Succeed(broken),
        ],
    );
    let checks = ScriptedChecks::new();
    let runs = checks.runs();

    let mut orch =
        orchestrator(dir.path(), independent_tasks(1), capability, checks, test_config(1));
    let report = orch.run().await.unwrap();

    assert_eq!(
        levels(&report),
        vec![
            RecoveryLevel::RetrySame,
            RecoveryLevel::RetrySame,
            RecoveryLevel::RetrySame,
            RecoveryLevel::Escalate
        ]
    );
    assert_eq!(report.blocked[0].code, BlockCode::ParseFailure);
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    let task = orch.graph().get(&TaskId::from("T1")).unwrap();
    assert_eq!(task.transient_retries, 3);
    assert_eq!(task.step_budget, Some(20));
}

/// Test: Incomplete output that passes its checks
/// Given a worker that runs out of steps but leaves passing work behind
/// When the run executes
/// Then the task is DONE with no recovery decision
#[tokio::test]
async fn test_incomplete_but_verified_is_done() {
    let dir = TempDir::new().unwrap();
    let capability = ScriptedCapability::new().script(
        "T1",
        vec![Step::Exhaust(change_output("src/a.rs", "pub fn a() {}\n"))],
    );
    let mut orch = orchestrator(
        dir.path(),
        independent_tasks(1),
        capability,
        ScriptedChecks::new(),
        test_config(1),
    );
    let report = orch.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(report.decisions.is_empty());
}

/// Test: Exhaustion with nothing to show
/// Given a worker that runs out of steps before writing anything, and checks that pass anyway
/// When the run executes
/// Then the attempt is WORKER_EXHAUSTION, retried once with a doubled budget, and then DONE
#[tokio::test]
async fn test_exhausted_without_output_is_retried_not_done() {
    let dir = TempDir::new().unwrap();
    let capability = ScriptedCapability::new().script(
        "T1",
        vec![Step::Exhaust(
            "I ran out of turns before writing anything".to_string(),
        )],
    );
    let calls = capability.calls();
    let checks = ScriptedChecks::new();
    let runs = checks.runs();
    let mut orch = orchestrator(
        dir.path(),
        independent_tasks(1),
        capability,
        checks,
        test_config(1),
    );
    let report = orch.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(levels(&report), vec![RecoveryLevel::RetryAdjusted]);
    assert_eq!(report.decisions[0].1.category, FailureCategory::WorkerExhaustion);
    let budgets: Vec<u32> = calls.lock().unwrap().iter().map(|c| c.step_budget).collect();
    assert_eq!(budgets, vec![20, 40]);
    // only the second attempt had anything to verify
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

fn single(description: &str, config_ceiling: u32) -> (TaskGraph, conductor::Config) {
    let task = Task::new("P", "Codec", description);
    let mut config = test_config(1);
    config.gate.step_ceiling = config_ceiling;
    (TaskGraph::from_tasks(vec![task]).unwrap(), config)
}

/// Test: Raised budget above the ceiling, divisible task
/// Given failing checks, a ceiling of 50 and a description listing two parts
/// When the run executes
/// Then the budget goes 20 -> 40, the task is split and both parts complete
#[tokio::test]
async fn test_budget_over_ceiling_splits() {
    let dir = TempDir::new().unwrap();
    let (graph, config) = single("- encode frames\n- decode frames", 50);
    let checks = ScriptedChecks::new().outcome("P", CheckOutcome::counts(1, 2, 0));

    let mut orch = orchestrator(dir.path(), graph, ScriptedCapability::new(), checks, config);
    let report = orch.run().await.unwrap();

    assert_eq!(
        levels(&report),
        vec![RecoveryLevel::RetryAdjusted, RecoveryLevel::Split]
    );
    assert_eq!(report.decisions[0].1.step_budget, Some(40));
    assert_eq!(report.decisions[1].1.children.len(), 2);
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.done, vec![TaskId::from("P.1"), TaskId::from("P.2")]);
    let child = orch.graph().get(&TaskId::from("P.1")).unwrap();
    assert_eq!(child.split_from, Some(TaskId::from("P")));
    assert!(!orch.graph().contains(&TaskId::from("P")));
}

/// Test: Raised budget above the ceiling, indivisible task
/// Given failing checks, a ceiling of 50 and a single-paragraph description
/// When the run executes
/// Then the task is permanently BLOCKED(Rejected)
#[tokio::test]
async fn test_budget_over_ceiling_rejects() {
    let dir = TempDir::new().unwrap();
    let (graph, config) = single("Implement the whole codec", 50);
    let checks = ScriptedChecks::new().outcome("P", CheckOutcome::counts(1, 2, 0));

    let mut orch = orchestrator(dir.path(), graph, ScriptedCapability::new(), checks, config);
    let report = orch.run().await.unwrap();

    assert_eq!(
        levels(&report),
        vec![RecoveryLevel::RetryAdjusted, RecoveryLevel::Reject]
    );
    assert_eq!(report.blocked[0].code, BlockCode::Rejected);
    assert!(matches!(
        orch.unblock(&TaskId::from("P")),
        Err(Error::PermanentlyRejected(_))
    ));
}
