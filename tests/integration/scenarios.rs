//! Reference runs.
//!
//! Each test drives a complete run and checks the observable outcome: task
//! states, recovery decisions, budgets handed to the worker and the ledger.

use std::time::{Duration, Instant};

use conductor::core::task::{BlockCode, TaskId, TaskState};
use conductor::orchestration::{
    CheckOutcome, DispatchJob, FailureCategory, FailureEvidence, RecoveryEngine, RecoveryLevel,
    RunContext, RunOutcome, WorkerStatus,
};
use conductor::orchestration::gate::ComplexityGate;
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::fixtures::{
    chain_graph, change_output, dispatcher, independent_tasks, orchestrator, test_config,
    ScriptedCapability, ScriptedChecks, Step,
};

/// Test: Load failure on a reportedly successful attempt
/// Given a chain T1 -> T2 -> T3 where T3's checks reference a symbol T3 never produces
/// When the run executes
/// Then T3 is retried twice with doubled budgets and ends BLOCKED(WorkerExhaustion)
#[tokio::test]
async fn test_load_failure_escalates_after_adjusted_retries() {
    let dir = TempDir::new().unwrap();
    let t3_output = change_output("src/frame.rs", "pub fn encode_frame() {}\n");
    let capability = ScriptedCapability::new().script(
        "T3",
        vec![
            Step::Succeed(t3_output.clone()),
            Step::Succeed(t3_output.clone()),
            Step::Succeed(t3_output),
        ],
    );
    let calls = capability.calls();
    let checks = ScriptedChecks::new().outcome(
        "T3",
        CheckOutcome::load_failure(
            "error[E0425]: cannot find function `decode_frame` in this scope",
            vec!["decode_frame".to_string()],
        ),
    );

    let mut orch = orchestrator(dir.path(), chain_graph(), capability, checks, test_config(2));
    let report = orch.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Blocked);
    assert_eq!(report.done, vec![TaskId::from("T1"), TaskId::from("T2")]);
    assert_eq!(report.blocked.len(), 1);
    assert_eq!(report.blocked[0].id, TaskId::from("T3"));
    assert_eq!(report.blocked[0].code, BlockCode::WorkerExhaustion);

    let levels: Vec<RecoveryLevel> = report.decisions.iter().map(|(_, d)| d.level).collect();
    assert_eq!(
        levels,
        vec![
            RecoveryLevel::RetryAdjusted,
            RecoveryLevel::RetryAdjusted,
            RecoveryLevel::Escalate
        ]
    );
    assert!(report
        .decisions
        .iter()
        .all(|(_, d)| d.category == FailureCategory::WorkerExhaustion));

    let budgets: Vec<u32> = calls
        .lock()
        .unwrap()
        .iter()
        .filter(|c| c.task_id == TaskId::from("T3"))
        .map(|c| c.step_budget)
        .collect();
    assert_eq!(budgets, vec![20, 40, 80]);

    let t3 = orch.graph().get(&TaskId::from("T3")).unwrap();
    assert_eq!(t3.adjusted_retries, 2);
    assert_eq!(t3.transient_retries, 0);
}

/// Test: Concurrency limit of one
/// Given two independent tasks and concurrency_limit = 1
/// When the run executes
/// Then the second task starts only after the first has completed
#[tokio::test]
async fn test_limit_of_one_runs_sequentially() {
    let dir = TempDir::new().unwrap();
    let capability = ScriptedCapability::new().with_delay(Duration::from_millis(50));
    let calls = capability.calls();

    let mut orch = orchestrator(
        dir.path(),
        independent_tasks(2),
        capability,
        ScriptedChecks::new(),
        test_config(1),
    );
    let report = orch.run().await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Completed);

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].task_id, TaskId::from("T1"));
    assert!(
        calls[1].started >= calls[0].finished,
        "second task started before the first completed"
    );

    let t1 = orch.graph().get(&TaskId::from("T1")).unwrap();
    let t2 = orch.graph().get(&TaskId::from("T2")).unwrap();
    assert!(t2.started_at.unwrap() >= t1.completed_at.unwrap());
}

/// Test: Invocation timeout
/// Given one task whose worker hangs past the timeout and a concurrency limit of one
/// When the batch is dispatched
/// Then the result is TIMEOUT, recovery retries it unchanged and the slot is freed at once
#[tokio::test]
async fn test_timeout_is_transient_and_frees_slot() {
    let dir = TempDir::new().unwrap();
    let capability =
        ScriptedCapability::new().script("T1", vec![Step::Hang(Duration::from_secs(30))]);
    let dispatcher = dispatcher(
        dir.path(),
        capability,
        ScriptedChecks::new(),
        Duration::from_millis(100),
    );

    let mut graph = independent_tasks(2);
    graph.promote_ready();
    let jobs: Vec<DispatchJob> = graph
        .ready()
        .into_iter()
        .map(|task| DispatchJob {
            task: task.clone(),
            step_budget: 20,
        })
        .collect();

    let ctx = RunContext::new(test_config(1));
    let (tx, _rx) = mpsc::unbounded_channel();
    let started = Instant::now();
    let report = dispatcher.run(jobs, 1, &ctx, tx).await;
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "the hung invocation kept its slot"
    );

    let t1 = &report.results[&TaskId::from("T1")];
    assert_eq!(t1.result.status, WorkerStatus::Timeout);
    assert!(t1.check.is_none());
    assert_eq!(
        report.results[&TaskId::from("T2")].result.status,
        WorkerStatus::Success
    );

    let id = TaskId::from("T1");
    graph.start(&id, 20).unwrap();
    let evidence = FailureEvidence::from_attempt(&t1.result, t1.check.as_ref()).unwrap();
    assert_eq!(evidence.category, FailureCategory::Transient);
    assert_eq!(evidence.code, BlockCode::TimeoutFailure);

    let config = test_config(1);
    let engine = RecoveryEngine::new(config.recovery.clone(), ComplexityGate::new(config.gate));
    let decision = engine.decide(graph.get(&id).unwrap(), &evidence);
    assert_eq!(decision.level, RecoveryLevel::RetrySame);
    assert_eq!(decision.step_budget, Some(20));

    graph.requeue(&id, None).unwrap();
    let task = graph.get(&id).unwrap();
    assert_eq!(task.state, TaskState::Ready);
    assert_eq!(task.step_budget, Some(20));
    assert!(!dir.path().join("T1").exists(), "timed-out staging area was kept");
}

/// Test: Timeout inside a full run
/// Given a task that hangs once and then succeeds
/// When the run executes
/// Then one RETRY_SAME decision is recorded and the run completes
#[tokio::test]
async fn test_timeout_retried_within_run() {
    let dir = TempDir::new().unwrap();
    let capability =
        ScriptedCapability::new().script("T1", vec![Step::Hang(Duration::from_secs(30))]);
    let dispatcher = dispatcher(
        dir.path(),
        capability,
        ScriptedChecks::new(),
        Duration::from_millis(100),
    );
    let mut orch = conductor::Orchestrator::new(
        independent_tasks(1),
        dispatcher,
        RunContext::new(test_config(1)),
    );
    let report = orch.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.decisions.len(), 1);
    assert_eq!(report.decisions[0].1.level, RecoveryLevel::RetrySame);
    assert_eq!(report.decisions[0].1.code, BlockCode::TimeoutFailure);
    assert_eq!(orch.graph().get(&TaskId::from("T1")).unwrap().retry_count, 1);
}

/// Test: Budget exhaustion
/// Given a cost ceiling equal to two invocations and five ready tasks
/// When the run executes
/// Then exactly two are dispatched and the other three are reported unfinished
#[tokio::test]
async fn test_budget_exhaustion_reports_partial_run() {
    let dir = TempDir::new().unwrap();
    let capability = ScriptedCapability::new().with_cost(0.5);
    let calls = capability.calls();
    let mut config = test_config(5);
    config.budget.max_cost_usd = 1.0;
    config.budget.estimated_cost_per_invocation = 0.5;

    let mut orch = orchestrator(
        dir.path(),
        independent_tasks(5),
        capability,
        ScriptedChecks::new(),
        config,
    );
    let report = orch.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::BudgetExhausted);
    assert_eq!(calls.lock().unwrap().len(), 2);
    assert_eq!(report.ledger.invocations, 2);
    assert!((report.ledger.spent_usd - 1.0).abs() < 1e-9);
    assert_eq!(report.done, vec![TaskId::from("T1"), TaskId::from("T2")]);
    assert_eq!(
        report.pending,
        vec![
            (TaskId::from("T3"), TaskState::Ready),
            (TaskId::from("T4"), TaskState::Ready),
            (TaskId::from("T5"), TaskState::Ready),
        ]
    );
    assert!(orch.context().budget_exhausted.is_cancelled());
}
