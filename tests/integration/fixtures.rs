//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Scripted worker capabilities and check runners
//! - Predefined task graphs
//! - Building an orchestrator over a temporary staging area

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use conductor::config::Config;
use conductor::core::task::{Task, TaskId};
use conductor::core::TaskGraph;
use conductor::orchestration::{
    Capability, CapabilityOutput, CheckOutcome, CheckRunner, Dispatcher, InvocationError,
    InvocationErrorKind, Invoker, Orchestrator, RunContext, TaskPipeline, Verifier, WorkerRequest,
};

/// A fenced JSON block creating one file.
pub fn change_output(path: &str, content: &str) -> String {
    let payload = serde_json::json!({
        "changes": [{"path": path, "action": "create", "content": content}]
    });
    format!("Done.\n\n```json\n{}\n```\n", payload)
}

/// What a scripted worker does on one attempt.
#[derive(Debug, Clone)]
pub enum Step {
    /// Return the text as a completed run.
    Succeed(String),
    /// Return the text, flagged as having run out of steps.
    Exhaust(String),
    Fail(InvocationErrorKind),
    /// Sleep, then succeed with a default change.
    Hang(Duration),
    Panic,
}

/// One recorded attempt.
#[derive(Debug, Clone)]
pub struct Call {
    pub task_id: TaskId,
    pub step_budget: u32,
    pub started: Instant,
    pub finished: Instant,
}

pub type CallLog = Arc<Mutex<Vec<Call>>>;

/// Worker that replays per-task scripts; tasks without a script (or whose
/// script ran out) succeed with a default change after `delay`.
pub struct ScriptedCapability {
    scripts: Mutex<HashMap<TaskId, VecDeque<Step>>>,
    delay: Duration,
    cost_usd: f64,
    calls: CallLog,
}

impl ScriptedCapability {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            cost_usd: 0.1,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn script(self, id: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(TaskId::from(id), steps.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = cost_usd;
        self
    }

    pub fn calls(&self) -> CallLog {
        Arc::clone(&self.calls)
    }

    fn next_step(&self, id: &TaskId) -> Step {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| {
                Step::Succeed(change_output(
                    &format!("src/{}.rs", id.as_str().replace('.', "_")),
                    "pub fn done() {}\n",
                ))
            })
    }
}

impl Capability for ScriptedCapability {
    async fn run(&self, request: &WorkerRequest) -> Result<CapabilityOutput, InvocationError> {
        let started = Instant::now();
        let step = self.next_step(&request.task_id);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let output = match step {
            Step::Succeed(text) => Ok(CapabilityOutput {
                text,
                cost_usd: Some(self.cost_usd),
                steps: Some(request.step_budget / 2),
                ..Default::default()
            }),
            Step::Exhaust(text) => Ok(CapabilityOutput {
                text,
                exhausted: true,
                cost_usd: Some(self.cost_usd),
                steps: Some(request.step_budget),
            }),
            Step::Fail(kind) => {
                Err(InvocationError::new(kind, format!("scripted {:?} failure", kind)))
            }
            Step::Panic => panic!("scripted worker panic in {}", request.task_id),
            Step::Hang(duration) => {
                tokio::time::sleep(duration).await;
                Ok(CapabilityOutput {
                    text: change_output("src/slow.rs", "pub fn slow() {}\n"),
                    cost_usd: Some(self.cost_usd),
                    ..Default::default()
                })
            }
        };
        self.calls.lock().unwrap().push(Call {
            task_id: request.task_id.clone(),
            step_budget: request.step_budget,
            started,
            finished: Instant::now(),
        });
        output
    }
}

/// Check runner returning a fixed outcome per task, passing by default.
#[derive(Default)]
pub struct ScriptedChecks {
    outcomes: HashMap<TaskId, CheckOutcome>,
    runs: Arc<AtomicUsize>,
}

impl ScriptedChecks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcome(mut self, id: &str, outcome: CheckOutcome) -> Self {
        self.outcomes.insert(TaskId::from(id), outcome);
        self
    }

    pub fn runs(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.runs)
    }
}

impl CheckRunner for ScriptedChecks {
    async fn run(&self, task: &Task, _staging: &Path) -> conductor::Result<CheckOutcome> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .outcomes
            .get(&task.id)
            .cloned()
            .unwrap_or_else(|| CheckOutcome::counts(3, 0, 0)))
    }
}

/// Defaults for tests: flat step budgets (20, 40, 80, ...) and a large cost ceiling.
pub fn test_config(concurrency: usize) -> Config {
    let mut config = Config::default();
    config.dispatch.concurrency = concurrency;
    config.gate.base_steps = 20;
    config.gate.steps_per_point = 0;
    config.gate.step_ceiling = 200;
    config.budget.max_cost_usd = 100.0;
    config.budget.estimated_cost_per_invocation = 0.1;
    config
}

pub fn test_task(id: &str, order: u32) -> Task {
    Task::new(id, &format!("Task {}", id), "Implement the piece").with_order(order)
}

/// `n` tasks with no dependencies, T1..Tn.
pub fn independent_tasks(n: usize) -> TaskGraph {
    let tasks = (1..=n)
        .map(|i| test_task(&format!("T{}", i), i as u32))
        .collect();
    TaskGraph::from_tasks(tasks).unwrap()
}

/// T1 -> T2 -> T3.
pub fn chain_graph() -> TaskGraph {
    let t1 = test_task("T1", 0);
    let mut t2 = test_task("T2", 1);
    t2.deps = vec!["T1".into()];
    let mut t3 = test_task("T3", 2);
    t3.deps = vec!["T2".into()];
    TaskGraph::from_tasks(vec![t1, t2, t3]).unwrap()
}

pub fn dispatcher(
    staging: &Path,
    capability: ScriptedCapability,
    checks: ScriptedChecks,
    timeout: Duration,
) -> Dispatcher<ScriptedCapability, ScriptedChecks> {
    let invoker = Invoker::new(capability, staging.to_path_buf()).with_timeout(timeout);
    Dispatcher::new(TaskPipeline::new(invoker, Verifier::new(checks)))
}

pub fn orchestrator(
    staging: &Path,
    graph: TaskGraph,
    capability: ScriptedCapability,
    checks: ScriptedChecks,
    config: Config,
) -> Orchestrator<ScriptedCapability, ScriptedChecks> {
    let dispatcher = dispatcher(staging, capability, checks, Duration::from_secs(5));
    Orchestrator::new(graph, dispatcher, RunContext::new(config))
}
