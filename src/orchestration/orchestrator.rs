//! The run loop.
//!
//! The `Orchestrator` owns the task graph and is the only writer to it. A run
//! proceeds in dispatch rounds:
//!
//! 1. Promote BACKLOG tasks whose dependencies are DONE and take the ready set.
//! 2. Pass every ready task through the [`ComplexityGate`]. Split tasks are
//!    replaced by their children, rejected tasks are blocked, the rest become
//!    dispatch jobs.
//! 3. Hand the jobs to the [`Dispatcher`] and apply its events as they
//!    arrive: `Admitted` moves a task to IN_PROGRESS, `Finished` either
//!    completes it or asks the [`RecoveryEngine`] what to do next.
//! 4. Commit the changes of tasks that reached DONE, one at a time.
//!
//! The run ends when nothing is ready any more, or when the budget refuses
//! an admission.

use crate::config::Config;
use crate::core::dag::{ChildSpec, TaskGraph};
use crate::core::task::{BlockCode, TaskId, TaskState};
use crate::git::{Committer, GitCommitter};
use crate::orchestration::budget::{BudgetTracker, LedgerSnapshot};
use crate::orchestration::dispatcher::{
    DispatchEvent, DispatchJob, Dispatcher, RunContext, TaskOutcome, TaskPipeline,
};
use crate::orchestration::gate::{ComplexityGate, GateDecision};
use crate::orchestration::invoker::{Capability, CommandCapability, Invoker};
use crate::orchestration::overlay::{Overlay, OVERLAY_DIR};
use crate::orchestration::parser::{CodeChange, Record};
use crate::orchestration::recovery::{
    FailureEvidence, RecoveryDecision, RecoveryEngine, RecoveryLevel,
};
use crate::orchestration::verifier::{CheckRunner, CommandCheckRunner, Verifier};
use crate::state::{RunSnapshot, SnapshotStore};
use crate::{clog, clog_debug, clog_error, clog_warn, Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::mpsc;
use uuid::Uuid;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every task is DONE.
    Completed,
    /// Nothing is ready; at least one task is BLOCKED or waits on one.
    Blocked,
    /// The budget refused an admission; unfinished tasks are listed in `pending`.
    BudgetExhausted,
}

/// A task waiting for an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedTask {
    pub id: TaskId,
    pub code: BlockCode,
    pub detail: String,
}

/// Summary of a run, also the partial report when the budget ran out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    /// DONE tasks in ready order.
    pub done: Vec<TaskId>,
    pub blocked: Vec<BlockedTask>,
    /// Tasks that are neither DONE nor BLOCKED, with their state.
    pub pending: Vec<(TaskId, TaskState)>,
    /// Commits recorded during this run.
    pub commits: Vec<(TaskId, String)>,
    pub ledger: LedgerSnapshot,
    pub decisions: Vec<(TaskId, RecoveryDecision)>,
}

/// Everything the event consumer mutates.
#[derive(Debug, Default)]
struct RunState {
    graph: TaskGraph,
    decisions: Vec<(TaskId, RecoveryDecision)>,
    /// Changes of DONE tasks not yet handed to the committer.
    uncommitted: Vec<(TaskId, Vec<CodeChange>)>,
}

impl RunState {
    fn snapshot(&self, ctx: &RunContext) -> RunSnapshot {
        RunSnapshot {
            run_id: ctx.run_id,
            saved_at: Utc::now(),
            graph: self.graph.snapshot(),
            ledger: ctx.ledger.snapshot(),
            decisions: self.decisions.clone(),
        }
    }

    fn persist(&self, store: Option<&SnapshotStore>, ctx: &RunContext) -> Result<()> {
        match store {
            Some(store) => store.save(&self.snapshot(ctx)),
            None => Ok(()),
        }
    }

    /// Replace a task with children, blocking it with `CycleError` if the graph refuses.
    fn split_or_block(&mut self, id: &TaskId, children: &[ChildSpec]) -> Result<()> {
        match self.graph.split(id, children) {
            Ok(child_ids) => {
                clog!("Task {} split into {:?}", id, child_ids);
                Ok(())
            }
            Err(e) => {
                clog_warn!("Split of {} refused: {}", id, e);
                self.graph
                    .block(id, BlockCode::CycleError, &format!("split refused: {}", e))
            }
        }
    }

    /// Block a task whose update went wrong. The run goes on.
    fn quarantine(&mut self, id: &TaskId, detail: &str) {
        clog_error!("Task {}: {}", id, detail);
        let blockable = self
            .graph
            .get(id)
            .is_some_and(|t| matches!(t.state, TaskState::Ready | TaskState::InProgress));
        if blockable {
            if let Err(e) = self.graph.block(id, BlockCode::InvocationFailure, detail) {
                clog_error!("Task {} could not be blocked: {}", id, e);
            }
        }
    }

    fn apply(&mut self, event: DispatchEvent, recovery: &RecoveryEngine) -> Result<()> {
        match event {
            DispatchEvent::Admitted {
                task_id,
                step_budget,
                ..
            } => {
                self.graph.start(&task_id, step_budget)?;
                clog_debug!("Task {} in progress (budget {})", task_id, step_budget);
                Ok(())
            }
            DispatchEvent::Finished(outcome) => self.finish(outcome, recovery),
        }
    }

    fn finish(&mut self, outcome: TaskOutcome, recovery: &RecoveryEngine) -> Result<()> {
        let id = outcome.task_id;
        let task = self
            .graph
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::UnknownTask(id.clone()))?;

        let Some(evidence) = FailureEvidence::from_attempt(&outcome.result, outcome.check.as_ref())
        else {
            self.graph.complete(&id)?;
            let changes: Vec<CodeChange> = outcome
                .result
                .records()
                .iter()
                .filter_map(Record::as_change)
                .cloned()
                .collect();
            clog!(
                "Task {} done ({} changes, {})",
                id,
                changes.len(),
                outcome
                    .check
                    .as_ref()
                    .map(|c| c.to_string())
                    .unwrap_or_default()
            );
            self.uncommitted.push((id, changes));
            return Ok(());
        };

        let decision = recovery.decide(&task, &evidence);
        match decision.level {
            RecoveryLevel::RetrySame => self.graph.requeue(&id, None)?,
            RecoveryLevel::RetryAdjusted => self.graph.requeue(&id, decision.step_budget)?,
            RecoveryLevel::Escalate => {
                clog_warn!("Task {} blocked ({}): {}", id, decision.code, decision.rationale);
                self.graph.block(&id, decision.code, &decision.rationale)?
            }
            RecoveryLevel::Reject => {
                clog_warn!("Task {} rejected: {}", id, decision.rationale);
                self.graph.block(&id, BlockCode::Rejected, &decision.rationale)?
            }
            RecoveryLevel::Split => self.split_or_block(&id, &decision.children)?,
        }
        self.decisions.push((id, decision));
        Ok(())
    }
}

/// Drives one run of the task graph to completion.
pub struct Orchestrator<C, R> {
    state: RunState,
    gate: ComplexityGate,
    recovery: RecoveryEngine,
    dispatcher: Dispatcher<C, R>,
    ctx: RunContext,
    committer: Option<Box<dyn Committer>>,
    store: Option<SnapshotStore>,
    commits: Vec<(TaskId, String)>,
}

impl<C, R> Orchestrator<C, R>
where
    C: Capability + 'static,
    R: CheckRunner + 'static,
{
    pub fn new(graph: TaskGraph, dispatcher: Dispatcher<C, R>, ctx: RunContext) -> Self {
        let gate = ComplexityGate::new(ctx.config.gate.clone());
        let recovery = RecoveryEngine::new(ctx.config.recovery.clone(), gate.clone());
        Self {
            state: RunState {
                graph,
                ..RunState::default()
            },
            gate,
            recovery,
            dispatcher,
            ctx,
            committer: None,
            store: None,
            commits: Vec::new(),
        }
    }

    /// Continue an interrupted run. Tasks caught IN_PROGRESS go back to READY
    /// and the ledger keeps what was already spent.
    pub fn resume(
        snapshot: RunSnapshot,
        dispatcher: Dispatcher<C, R>,
        config: Config,
    ) -> Result<Self> {
        let ledger = BudgetTracker::restore(
            &snapshot.ledger,
            config.budget.estimated_cost_per_invocation,
        );
        let ctx = RunContext::new(config)
            .with_run_id(snapshot.run_id)
            .with_ledger(ledger);
        let graph = TaskGraph::from_snapshot(snapshot.graph)?;
        clog!(
            "Resuming run {} ({} tasks, ${:.2} spent)",
            snapshot.run_id,
            graph.len(),
            ctx.ledger.spent_usd()
        );
        let mut orchestrator = Self::new(graph, dispatcher, ctx);
        orchestrator.state.decisions = snapshot.decisions;
        Ok(orchestrator)
    }

    pub fn with_committer(mut self, committer: Box<dyn Committer>) -> Self {
        self.committer = Some(committer);
        self
    }

    pub fn with_store(mut self, store: SnapshotStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.state.graph
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn decisions(&self) -> &[(TaskId, RecoveryDecision)] {
        &self.state.decisions
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.state.snapshot(&self.ctx)
    }

    /// Operator intervention: put a BLOCKED task back in the queue.
    pub fn unblock(&mut self, id: &TaskId) -> Result<()> {
        self.state.graph.unblock(id)?;
        clog!("Task {} unblocked", id);
        self.state.persist(self.store.as_ref(), &self.ctx)
    }

    /// Run rounds until nothing is ready or the budget is exhausted.
    pub async fn run(&mut self) -> Result<RunReport> {
        crate::log::set_run(Some(&self.ctx.run_id.to_string()));
        clog!(
            "Run {} started: {} tasks, concurrency {}",
            self.ctx.run_id,
            self.state.graph.len(),
            self.ctx.config.dispatch.concurrency
        );
        let mut budget_exhausted = false;
        let mut round = 0u32;

        loop {
            if !self.state.graph.promote_ready().is_empty() {
                self.state.persist(self.store.as_ref(), &self.ctx)?;
            }
            if self.ctx.budget_exhausted.is_cancelled() || self.ctx.ledger.exceeded() {
                budget_exhausted = true;
                break;
            }

            let (jobs, reshaped) = self.gate_ready()?;
            if jobs.is_empty() {
                if reshaped {
                    continue;
                }
                break;
            }

            round += 1;
            clog_debug!("Run {} round {}: {} jobs", self.ctx.run_id, round, jobs.len());
            self.dispatch_round(jobs).await?;
            self.commit_done()?;
        }

        let report = self.report(budget_exhausted);
        clog!(
            "Run {} finished: {:?} (done {}, blocked {}, pending {}, ${:.2})",
            report.run_id,
            report.outcome,
            report.done.len(),
            report.blocked.len(),
            report.pending.len(),
            report.ledger.spent_usd
        );
        crate::log::set_run(None);
        Ok(report)
    }

    /// Gate every ready task. Returns the jobs to dispatch and whether the
    /// graph changed shape (splits or blocks) along the way.
    fn gate_ready(&mut self) -> Result<(Vec<DispatchJob>, bool)> {
        let ready: Vec<_> = self.state.graph.ready().into_iter().cloned().collect();
        let mut jobs = Vec::with_capacity(ready.len());
        let mut reshaped = false;

        for task in ready {
            match self.gate.evaluate(&task) {
                GateDecision::Proceed { step_budget } => {
                    jobs.push(DispatchJob { task, step_budget })
                }
                GateDecision::Split { children } => {
                    self.state.split_or_block(&task.id, &children)?;
                    reshaped = true;
                }
                GateDecision::Reject { reason } => {
                    clog_warn!("Task {} rejected before dispatch: {}", task.id, reason);
                    self.state.graph.block(&task.id, BlockCode::Rejected, &reason)?;
                    reshaped = true;
                }
            }
        }
        if reshaped {
            self.state.persist(self.store.as_ref(), &self.ctx)?;
        }
        Ok((jobs, reshaped))
    }

    async fn dispatch_round(&mut self, jobs: Vec<DispatchJob>) -> Result<()> {
        let Self {
            state,
            recovery,
            dispatcher,
            ctx,
            store,
            ..
        } = self;
        let (recovery, dispatcher, ctx, store) = (&*recovery, &*dispatcher, &*ctx, store.as_ref());
        let limit = ctx.config.dispatch.concurrency;
        let (tx, mut rx) = mpsc::unbounded_channel::<DispatchEvent>();
        let mut admitted = HashSet::new();
        let mut finished = HashSet::new();

        let mut persist_error = None;

        let consume = async {
            while let Some(event) = rx.recv().await {
                let task_id = event.task_id().clone();
                match &event {
                    DispatchEvent::Admitted { .. } => admitted.insert(task_id.clone()),
                    DispatchEvent::Finished(_) => finished.insert(task_id.clone()),
                };
                if let Err(e) = state.apply(event, recovery) {
                    state.quarantine(&task_id, &format!("state update failed: {}", e));
                }
                if let Err(e) = state.persist(store, ctx) {
                    clog_error!("Snapshot could not be saved: {}", e);
                    persist_error.get_or_insert(e);
                }
            }
        };
        let (report, ()) = tokio::join!(dispatcher.run(jobs, limit, ctx, tx), consume);

        for lost in admitted.difference(&finished) {
            state.quarantine(lost, "admitted but never reported back");
        }
        if report.partial {
            clog_warn!("Budget exhausted; not admitted: {:?}", report.not_admitted);
        }
        if let Some(e) = persist_error {
            return Err(e);
        }
        state.persist(store, ctx)
    }

    /// Hand DONE tasks' changes to the committer, outside the concurrent region.
    fn commit_done(&mut self) -> Result<()> {
        let uncommitted = std::mem::take(&mut self.state.uncommitted);
        let Some(committer) = self.committer.as_mut() else {
            return Ok(());
        };
        for (id, changes) in uncommitted {
            let Some(task) = self.state.graph.get(&id) else {
                continue;
            };
            if let Some(commit) = committer.commit(task, &changes)? {
                self.commits.push((id, commit));
            }
        }
        Ok(())
    }

    fn report(&self, budget_exhausted: bool) -> RunReport {
        let mut done = Vec::new();
        let mut blocked = Vec::new();
        let mut pending = Vec::new();
        for task in self.state.graph.tasks() {
            match &task.state {
                TaskState::Done => done.push(task.id.clone()),
                TaskState::Blocked { code, detail } => blocked.push(BlockedTask {
                    id: task.id.clone(),
                    code: *code,
                    detail: detail.clone(),
                }),
                other => pending.push((task.id.clone(), other.clone())),
            }
        }
        let outcome = if budget_exhausted && !pending.is_empty() {
            RunOutcome::BudgetExhausted
        } else if self.state.graph.all_done() {
            RunOutcome::Completed
        } else if budget_exhausted {
            RunOutcome::BudgetExhausted
        } else {
            RunOutcome::Blocked
        };
        RunReport {
            run_id: self.ctx.run_id,
            outcome,
            done,
            blocked,
            pending,
            commits: self.commits.clone(),
            ledger: self.ctx.ledger.snapshot(),
            decisions: self.state.decisions.clone(),
        }
    }
}

impl Orchestrator<CommandCapability, CommandCheckRunner> {
    /// Wire the configured agent CLI, check command and state directory.
    ///
    /// Checks run against a per-task copy of the project directory. When the
    /// project is a git repository, DONE tasks are committed to it.
    ///
    /// # Errors
    /// `Validation` for unusable settings, `WorkerBinaryNotFound` if the
    /// agent CLI is not on `PATH`, `NoHomeDir` when a default directory
    /// cannot be resolved.
    pub fn from_config(graph: TaskGraph, config: Config) -> Result<Self> {
        config.validate()?;
        let capability = CommandCapability::new(&config.worker)?;
        let project = config.project_dir()?;
        let staging = config.staging_root()?;
        let overlay =
            Overlay::new(project.clone(), staging.join(OVERLAY_DIR)).excluding(staging.clone());
        let invoker = Invoker::from_config(capability, staging, &config.worker);
        let verifier =
            Verifier::new(CommandCheckRunner::from_config(&config.verifier)).with_overlay(overlay);
        let store = SnapshotStore::new(&config.state_dir()?);
        let dispatcher = Dispatcher::new(TaskPipeline::new(invoker, verifier));
        let orch = Self::new(graph, dispatcher, RunContext::new(config)).with_store(store);

        match GitCommitter::new(&project) {
            Ok(committer) => Ok(orch.with_committer(Box::new(committer))),
            Err(e) => {
                clog_warn!(
                    "{} is not a git repository, DONE tasks will not be committed: {}",
                    project.display(),
                    e
                );
                Ok(orch)
            }
        }
    }
}
