//! Dispatch under load.
//!
//! These tests check the concurrency ceiling as seen by an in-order event
//! consumer and that one misbehaving job cannot take the others down.

use std::time::Duration;

use conductor::core::task::{TaskId, TaskState};
use conductor::orchestration::{
    DispatchEvent, DispatchJob, InvocationErrorKind, RecoveryLevel, RunContext, RunOutcome,
    WorkerStatus,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::fixtures::{
    dispatcher, independent_tasks, orchestrator, test_config, ScriptedCapability,
    ScriptedChecks, Step,
};

fn jobs(n: usize) -> Vec<DispatchJob> {
    let mut graph = independent_tasks(n);
    graph.promote_ready();
    graph
        .ready()
        .into_iter()
        .map(|task| DispatchJob {
            task: task.clone(),
            step_budget: 20,
        })
        .collect()
}

/// Test: Concurrency ceiling
/// Given 8 independent tasks and a limit of 3
/// When they are dispatched
/// Then an in-order consumer never sees more than 3 in progress, and does see 3
#[tokio::test]
async fn test_in_progress_never_exceeds_limit() {
    let dir = TempDir::new().unwrap();
    let capability = ScriptedCapability::new().with_delay(Duration::from_millis(30));
    let calls = capability.calls();
    let dispatcher = dispatcher(
        dir.path(),
        capability,
        ScriptedChecks::new(),
        Duration::from_secs(5),
    );
    let ctx = RunContext::new(test_config(3));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let consume = async {
        let mut in_progress = 0usize;
        let mut peak = 0usize;
        while let Some(event) = rx.recv().await {
            match event {
                DispatchEvent::Admitted { .. } => in_progress += 1,
                DispatchEvent::Finished(_) => in_progress -= 1,
            }
            peak = peak.max(in_progress);
        }
        peak
    };
    let (report, peak) = tokio::join!(dispatcher.run(jobs(8), 3, &ctx, tx), consume);

    assert_eq!(report.results.len(), 8);
    assert!(!report.partial);
    assert_eq!(peak, 3);

    let calls = calls.lock().unwrap();
    for call in calls.iter() {
        let overlapping = calls
            .iter()
            .filter(|other| other.started < call.finished && call.started < other.finished)
            .count();
        assert!(overlapping <= 3, "{} invocations overlapped", overlapping);
    }
}

/// Test: Fault isolation
/// Given one worker that panics among four
/// When they are dispatched
/// Then the panicking task gets a RUNTIME_ERROR result and the rest succeed
#[tokio::test]
async fn test_panic_is_isolated_to_its_task() {
    let dir = TempDir::new().unwrap();
    let capability = ScriptedCapability::new().script("T2", vec![Step::Panic]);
    let dispatcher = dispatcher(
        dir.path(),
        capability,
        ScriptedChecks::new(),
        Duration::from_secs(5),
    );
    let ctx = RunContext::new(test_config(2));
    let (tx, _rx) = mpsc::unbounded_channel();

    let report = dispatcher.run(jobs(4), 2, &ctx, tx).await;

    assert_eq!(report.results.len(), 4);
    let t2 = &report.results[&TaskId::from("T2")].result;
    assert_eq!(t2.status, WorkerStatus::RuntimeError);
    assert_eq!(t2.error.as_ref().unwrap().kind, InvocationErrorKind::Panic);
    for id in ["T1", "T3", "T4"] {
        assert_eq!(
            report.results[&TaskId::from(id)].result.status,
            WorkerStatus::Success
        );
    }
    assert_eq!(ctx.ledger.invocations(), 4);
    assert_eq!(ctx.ledger.reserved_usd(), 0.0);
}

/// Test: A panicking worker inside a run
/// Given a task whose first attempt panics
/// When the run executes
/// Then the task is retried and the run completes
#[tokio::test]
async fn test_panic_is_retried_within_run() {
    let dir = TempDir::new().unwrap();
    let capability = ScriptedCapability::new().script("T1", vec![Step::Panic]);
    let mut orch = orchestrator(
        dir.path(),
        independent_tasks(3),
        capability,
        ScriptedChecks::new(),
        test_config(3),
    );
    let report = orch.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.decisions.len(), 1);
    assert_eq!(report.decisions[0].0, TaskId::from("T1"));
    assert_eq!(report.decisions[0].1.level, RecoveryLevel::RetrySame);
    assert!(orch
        .graph()
        .tasks()
        .iter()
        .all(|t| t.state == TaskState::Done));
}
