//! Snapshots, resume and commits.

use std::time::Duration;

use conductor::core::dag::GraphSnapshot;
use conductor::core::task::{TaskId, TaskState};
use conductor::orchestration::{LedgerSnapshot, RunContext, RunOutcome};
use conductor::state::{RunSnapshot, SnapshotStore};
use conductor::{source, GitCommitter, Orchestrator};
use git2::Repository;
use tempfile::TempDir;
use uuid::Uuid;

use crate::fixtures::{
    chain_graph, dispatcher, orchestrator, test_config, ScriptedCapability, ScriptedChecks,
};

/// Test: Every transition is persisted
/// Given a store configured on the orchestrator
/// When a chain runs to completion
/// Then the latest snapshot holds the final graph and ledger
#[tokio::test]
async fn test_final_snapshot_matches_report() {
    let dir = TempDir::new().unwrap();
    let store = SnapshotStore::new(&dir.path().join("state"));
    let mut orch = orchestrator(
        &dir.path().join("staging"),
        chain_graph(),
        ScriptedCapability::new(),
        ScriptedChecks::new(),
        test_config(2),
    )
    .with_store(store.clone());
    let report = orch.run().await.unwrap();

    let latest = store.latest().unwrap().unwrap();
    assert_eq!(latest.run_id, report.run_id);
    assert_eq!(latest.ledger, report.ledger);
    assert_eq!(latest.graph, orch.graph().snapshot());
}

/// Test: Resume after an interruption
/// Given a snapshot taken while T1 was in progress
/// When the run is resumed from it
/// Then T1 is run again, the ledger keeps the earlier spend and the chain completes
#[tokio::test]
async fn test_resume_requeues_interrupted_task() {
    let dir = TempDir::new().unwrap();
    let mut graph = chain_graph();
    graph.promote_ready();
    graph.start(&TaskId::from("T1"), 20).unwrap();

    let run_id = Uuid::new_v4();
    let snapshot = RunSnapshot {
        run_id,
        saved_at: chrono::Utc::now(),
        graph: graph.snapshot(),
        ledger: LedgerSnapshot {
            spent_usd: 2.0,
            elapsed_ms: 5_000,
            invocations: 3,
            max_cost_usd: 50.0,
            max_time_ms: 3_600_000,
        },
        decisions: Vec::new(),
    };
    let store = SnapshotStore::new(dir.path());
    store.save(&snapshot).unwrap();

    let loaded = store.load(&run_id).unwrap().unwrap();
    let dispatcher = dispatcher(
        &dir.path().join("staging"),
        ScriptedCapability::new(),
        ScriptedChecks::new(),
        Duration::from_secs(5),
    );
    let mut orch = Orchestrator::resume(loaded, dispatcher, test_config(2)).unwrap();
    assert_eq!(
        orch.graph().get(&TaskId::from("T1")).unwrap().state,
        TaskState::Ready
    );

    let report = orch.run().await.unwrap();
    assert_eq!(report.run_id, run_id);
    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.ledger.invocations, 6);
    assert!((report.ledger.spent_usd - 2.3).abs() < 1e-9);
    assert_eq!(report.ledger.max_cost_usd, 50.0);
}

/// Test: Corrupt snapshots are refused
/// Given a snapshot whose graph contains a cycle
/// When it is resumed
/// Then resuming fails with a cycle error
#[tokio::test]
async fn test_resume_rejects_cyclic_snapshot() {
    let dir = TempDir::new().unwrap();
    let mut tasks = chain_graph().snapshot().tasks;
    tasks[0].deps = vec![TaskId::from("T3")];
    let snapshot = RunSnapshot {
        run_id: Uuid::new_v4(),
        saved_at: chrono::Utc::now(),
        graph: GraphSnapshot { tasks },
        ledger: RunContext::new(test_config(1)).ledger.snapshot(),
        decisions: Vec::new(),
    };
    let dispatcher = dispatcher(
        dir.path(),
        ScriptedCapability::new(),
        ScriptedChecks::new(),
        Duration::from_secs(5),
    );
    let err = Orchestrator::resume(snapshot, dispatcher, test_config(1))
        .err()
        .expect("cyclic snapshot accepted");
    assert!(err.is_cycle());
}

/// Test: DONE tasks are committed
/// Given a git repository and a specification source with two tasks
/// When the run completes
/// Then each task produced one commit on HEAD with its files in the working tree
#[tokio::test]
async fn test_done_tasks_are_committed() {
    let repo_dir = TempDir::new().unwrap();
    Repository::init(repo_dir.path()).unwrap();
    let work_dir = TempDir::new().unwrap();

    let specs = source::parse_toml(
        r#"
[[task]]
id = "T1"
title = "Frame type"
description = "Define `Frame`"

[[task]]
id = "T2"
title = "Decoder"
description = "Implement `decode_frame`"
deps = ["T1"]
"#,
    )
    .unwrap();
    let graph = source::build_graph(specs).unwrap();

    let mut orch = orchestrator(
        work_dir.path(),
        graph,
        ScriptedCapability::new(),
        ScriptedChecks::new(),
        test_config(2),
    )
    .with_committer(Box::new(GitCommitter::new(repo_dir.path()).unwrap()));
    let report = orch.run().await.unwrap();

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert_eq!(report.commits.len(), 2);
    assert_eq!(report.commits[0].0, TaskId::from("T1"));

    let repo = Repository::open(repo_dir.path()).unwrap();
    let head = repo.head().unwrap().peel_to_commit().unwrap();
    assert_eq!(head.id().to_string(), report.commits[1].1);
    assert_eq!(head.message(), Some("T2: Decoder"));
    assert_eq!(head.parent(0).unwrap().message(), Some("T1: Frame type"));
    assert!(repo_dir.path().join("src/T1.rs").exists());
    assert!(repo_dir.path().join("src/T2.rs").exists());
}
