//! Bounded-concurrency dispatch of ready tasks.
//!
//! The `Dispatcher` fans a batch of gated tasks out to worker invocations
//! and collects their results. At most `limit` jobs are in flight at once;
//! the rest wait in a queue and are admitted earliest-ready-first as slots
//! free up.
//!
//! A job runs the whole [`TaskPipeline`] for one task (invoke, then verify
//! when there is output) while holding its slot, so a task counts against
//! the limit until its outcome is known. Panics inside a job are caught and
//! reported as a `RUNTIME_ERROR` result for that task only.
//!
//! Before every admission the run's [`BudgetTracker`] is asked for a
//! reservation. Once it refuses, nothing new is admitted, in-flight jobs are
//! drained normally, and the report is marked partial.
//!
//! Admissions and completions are published on an unbounded channel as
//! [`DispatchEvent`]s. A job publishes `Finished` before releasing its slot,
//! so a consumer applying the events in order never sees more than `limit`
//! tasks in progress.

use crate::config::Config;
use crate::core::task::{Task, TaskId};
use crate::orchestration::budget::BudgetTracker;
use crate::orchestration::invoker::{
    Capability, InvocationError, InvocationErrorKind, Invoker, WorkerResult, WorkerStatus,
};
use crate::orchestration::verifier::{CheckOutcome, CheckRunner, Verifier};
use crate::{clog, clog_debug, clog_error, clog_warn};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// State shared by everything taking part in one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub ledger: Arc<BudgetTracker>,
    pub config: Arc<Config>,
    /// Cancelled once the budget refuses an admission.
    pub budget_exhausted: CancellationToken,
}

impl RunContext {
    pub fn new(config: Config) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            ledger: Arc::new(BudgetTracker::from_config(&config.budget)),
            config: Arc::new(config),
            budget_exhausted: CancellationToken::new(),
        }
    }

    pub fn with_ledger(mut self, ledger: BudgetTracker) -> Self {
        self.ledger = Arc::new(ledger);
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }
}

/// A gated task ready to be admitted.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    pub task: Task,
    pub step_budget: u32,
}

/// Final outcome of one dispatched task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub result: WorkerResult,
    /// Verifier outcome; `None` when the invocation produced nothing to verify.
    pub check: Option<CheckOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Progress notifications, in admission/completion order.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    Admitted {
        task_id: TaskId,
        step_budget: u32,
        at: DateTime<Utc>,
    },
    Finished(TaskOutcome),
}

impl DispatchEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            DispatchEvent::Admitted { task_id, .. } => task_id,
            DispatchEvent::Finished(outcome) => &outcome.task_id,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DispatchReport {
    pub results: BTreeMap<TaskId, TaskOutcome>,
    /// The budget stopped admissions before the batch was exhausted.
    pub partial: bool,
    /// Jobs that were never admitted, in queue order.
    pub not_admitted: Vec<TaskId>,
}

/// Invoke-then-verify for a single task.
pub struct TaskPipeline<C, R> {
    invoker: Invoker<C>,
    verifier: Verifier<R>,
}

impl<C: Capability, R: CheckRunner> TaskPipeline<C, R> {
    pub fn new(invoker: Invoker<C>, verifier: Verifier<R>) -> Self {
        Self { invoker, verifier }
    }

    pub fn invoker(&self) -> &Invoker<C> {
        &self.invoker
    }

    pub fn verifier(&self) -> &Verifier<R> {
        &self.verifier
    }

    pub async fn execute(
        &self,
        task: &Task,
        step_budget: u32,
    ) -> (WorkerResult, Option<CheckOutcome>) {
        let result = self.invoker.invoke(task, step_budget).await;
        let check = if result.produced_output() {
            Some(
                self.verifier
                    .verify(task, result.records(), &result.staging)
                    .await,
            )
        } else {
            None
        };
        (result, check)
    }
}

pub struct Dispatcher<C, R> {
    pipeline: Arc<TaskPipeline<C, R>>,
}

impl<C, R> Dispatcher<C, R>
where
    C: Capability + 'static,
    R: CheckRunner + 'static,
{
    pub fn new(pipeline: TaskPipeline<C, R>) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }

    pub fn pipeline(&self) -> &TaskPipeline<C, R> {
        &self.pipeline
    }

    /// Run `jobs` with at most `limit` in flight.
    pub async fn run(
        &self,
        jobs: Vec<DispatchJob>,
        limit: usize,
        ctx: &RunContext,
        events: mpsc::UnboundedSender<DispatchEvent>,
    ) -> DispatchReport {
        let semaphore = Arc::new(Semaphore::new(limit.max(1)));
        let mut queue: VecDeque<DispatchJob> = jobs.into();
        let mut join_set: JoinSet<TaskOutcome> = JoinSet::new();
        let mut report = DispatchReport::default();

        clog_debug!(
            "Dispatcher: run={} jobs={} limit={}",
            ctx.run_id,
            queue.len(),
            limit
        );

        while !queue.is_empty() {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };

            while let Some(joined) = join_set.try_join_next() {
                reap(joined, &mut report);
            }

            let Some(reservation) = ctx.ledger.try_reserve() else {
                clog_warn!(
                    "Dispatcher: budget exhausted (spent ${:.2}), {} jobs not admitted",
                    ctx.ledger.spent_usd(),
                    queue.len()
                );
                ctx.budget_exhausted.cancel();
                report.partial = true;
                drop(permit);
                break;
            };

            let Some(job) = queue.pop_front() else {
                ctx.ledger.release(reservation);
                break;
            };
            let task_id = job.task.id.clone();
            let _ = events.send(DispatchEvent::Admitted {
                task_id: task_id.clone(),
                step_budget: job.step_budget,
                at: Utc::now(),
            });
            clog_debug!("Dispatcher: admitted {} budget={}", task_id, job.step_budget);

            let pipeline = Arc::clone(&self.pipeline);
            let ledger = Arc::clone(&ctx.ledger);
            let events = events.clone();
            join_set.spawn(async move {
                let started_at = Utc::now();
                let execution = AssertUnwindSafe(pipeline.execute(&job.task, job.step_budget))
                    .catch_unwind()
                    .await;
                let (mut result, check) = match execution {
                    Ok(done) => done,
                    Err(panic) => {
                        let message = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "worker job panicked".to_string());
                        clog_error!("Dispatcher: job {} panicked: {}", job.task.id, message);
                        let result = WorkerResult::failed(
                            &job.task.id,
                            WorkerStatus::RuntimeError,
                            Some(InvocationError::new(InvocationErrorKind::Panic, message)),
                            job.step_budget,
                            Duration::ZERO,
                        );
                        (result, None)
                    }
                };
                ledger.settle(reservation, result.estimated_cost, result.elapsed);
                dedup_records(&mut result);

                let outcome = TaskOutcome {
                    task_id: job.task.id.clone(),
                    result,
                    check,
                    started_at,
                    finished_at: Utc::now(),
                };
                let _ = events.send(DispatchEvent::Finished(outcome.clone()));
                drop(permit);
                outcome
            });
        }

        if report.partial {
            report.not_admitted = queue.into_iter().map(|job| job.task.id).collect();
        }

        if !join_set.is_empty() {
            clog_debug!("Dispatcher: draining {} in-flight jobs", join_set.len());
        }
        while let Some(joined) = join_set.join_next().await {
            reap(joined, &mut report);
        }

        clog!(
            "Dispatcher: run={} finished {} tasks{}",
            ctx.run_id,
            report.results.len(),
            if report.partial { " (partial)" } else { "" }
        );
        report
    }
}

fn reap(joined: Result<TaskOutcome, tokio::task::JoinError>, report: &mut DispatchReport) {
    match joined {
        Ok(outcome) => {
            report.results.insert(outcome.task_id.clone(), outcome);
        }
        Err(e) => clog_error!("Dispatcher: job could not be joined: {}", e),
    }
}

/// Keep the first record of every signature.
fn dedup_records(result: &mut WorkerResult) {
    if let Some(records) = result.payload.as_mut() {
        let mut seen = HashSet::new();
        records.retain(|record| seen.insert(record.signature()));
    }
}
