//! Task data model and lifecycle state machine.
//!
//! Tasks are the atomic units of work handed to worker invocations. Every
//! state change goes through one of the guarded transition methods on
//! [`Task`]; an illegal move returns [`Error::InvalidTransition`] and leaves
//! the task untouched.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a task, as declared by the specification source.
///
/// Children created by a split are named `<parent>.<n>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier of the `n`th (1-based) child produced by splitting this task.
    pub fn child(&self, n: usize) -> TaskId {
        TaskId(format!("{}.{}", self.0, n))
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The fixed set of worker roles in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    /// Produces code changes for an issue.
    #[default]
    Implementer,
    /// Produces test code for an issue.
    TestWriter,
    /// Reviews staged changes and reports findings.
    Reviewer,
    /// Runs the project's tests and reports per-test outcomes.
    Tester,
}

impl std::fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerRole::Implementer => write!(f, "implementer"),
            WorkerRole::TestWriter => write!(f, "test_writer"),
            WorkerRole::Reviewer => write!(f, "reviewer"),
            WorkerRole::Tester => write!(f, "tester"),
        }
    }
}

/// Closed taxonomy of reasons a task is BLOCKED.
///
/// Operators route on these codes, so free text only ever appears as the
/// accompanying detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockCode {
    TimeoutFailure,
    ParseFailure,
    InvocationFailure,
    VerificationLoadFailure,
    VerificationFailure,
    WorkerExhaustion,
    EnvironmentError,
    CycleError,
    /// Permanent: the task can never be resumed.
    Rejected,
}

impl BlockCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockCode::TimeoutFailure => "timeout_failure",
            BlockCode::ParseFailure => "parse_failure",
            BlockCode::InvocationFailure => "invocation_failure",
            BlockCode::VerificationLoadFailure => "verification_load_failure",
            BlockCode::VerificationFailure => "verification_failure",
            BlockCode::WorkerExhaustion => "worker_exhaustion",
            BlockCode::EnvironmentError => "environment_error",
            BlockCode::CycleError => "cycle_error",
            BlockCode::Rejected => "rejected",
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, BlockCode::Rejected)
    }
}

impl std::fmt::Display for BlockCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskState {
    /// Waiting on dependencies.
    #[default]
    Backlog,
    /// Dependencies satisfied, waiting for a dispatch slot.
    Ready,
    /// Admitted by the dispatcher.
    InProgress,
    /// Verified and finished.
    Done,
    /// Needs intervention before it can continue.
    Blocked {
        code: BlockCode,
        detail: String,
    },
}

impl TaskState {
    fn name(&self) -> &'static str {
        match self {
            TaskState::Backlog => "backlog",
            TaskState::Ready => "ready",
            TaskState::InProgress => "in_progress",
            TaskState::Done => "done",
            TaskState::Blocked { .. } => "blocked",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Blocked { code, .. } => write!(f, "blocked({})", code),
            other => f.write_str(other.name()),
        }
    }
}

/// A single work item in the task graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    /// Dependency ids in declaration order.
    pub deps: Vec<TaskId>,
    /// Position in the specification source; first key of the ready ordering.
    pub order: u32,
    /// Size estimate in points.
    pub size: u32,
    pub role: WorkerRole,
    pub state: TaskState,
    /// Total RETRY_* requeues so far.
    pub retry_count: u32,
    /// RETRY_SAME requeues so far.
    pub transient_retries: u32,
    /// RETRY_ADJUSTED requeues so far.
    pub adjusted_retries: u32,
    /// Step budget of the last admission, or the raised budget after RETRY_ADJUSTED.
    pub step_budget: Option<u32>,
    /// Parent task when this task was produced by a split.
    pub split_from: Option<TaskId>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, title: &str, description: &str) -> Self {
        Self {
            id: id.into(),
            title: title.to_string(),
            description: description.to_string(),
            deps: Vec::new(),
            order: 0,
            size: 1,
            role: WorkerRole::default(),
            state: TaskState::Backlog,
            retry_count: 0,
            transient_retries: 0,
            adjusted_retries: 0,
            step_budget: None,
            split_from: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_order(mut self, order: u32) -> Self {
        self.order = order;
        self
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }

    pub fn with_role(mut self, role: WorkerRole) -> Self {
        self.role = role;
        self
    }

    /// The blocking reason code, if blocked.
    pub fn block_code(&self) -> Option<BlockCode> {
        match &self.state {
            TaskState::Blocked { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == TaskState::Done
    }

    /// DONE, or BLOCKED with a permanent code.
    pub fn is_terminal(&self) -> bool {
        match &self.state {
            TaskState::Done => true,
            TaskState::Blocked { code, .. } => code.is_permanent(),
            _ => false,
        }
    }

    /// BACKLOG or READY: may appear in the ready set once dependencies are done.
    pub fn is_waiting(&self) -> bool {
        matches!(self.state, TaskState::Backlog | TaskState::Ready)
    }

    fn invalid(&self, to: &'static str) -> Error {
        Error::InvalidTransition {
            task: self.id.clone(),
            from: self.state.clone(),
            to,
        }
    }

    /// BACKLOG → READY. The caller has established that dependencies are done.
    pub fn mark_ready(&mut self) -> Result<()> {
        match self.state {
            TaskState::Backlog => {
                self.state = TaskState::Ready;
                Ok(())
            }
            TaskState::Ready => Ok(()),
            _ => Err(self.invalid("ready")),
        }
    }

    /// READY → IN_PROGRESS, recording the admitted step budget.
    pub fn start(&mut self, step_budget: u32) -> Result<()> {
        if self.state != TaskState::Ready {
            return Err(self.invalid("in_progress"));
        }
        self.state = TaskState::InProgress;
        self.step_budget = Some(step_budget);
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// IN_PROGRESS → DONE.
    pub fn complete(&mut self) -> Result<()> {
        if self.state != TaskState::InProgress {
            return Err(self.invalid("done"));
        }
        self.state = TaskState::Done;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// IN_PROGRESS → READY after RETRY_SAME (`raised_budget == None`) or
    /// RETRY_ADJUSTED (`Some(budget)`, which must be strictly larger).
    pub fn requeue(&mut self, raised_budget: Option<u32>) -> Result<()> {
        if self.state != TaskState::InProgress {
            return Err(self.invalid("ready"));
        }
        match raised_budget {
            Some(budget) => {
                if self.step_budget.is_some_and(|current| budget <= current) {
                    return Err(Error::Validation(format!(
                        "adjusted budget {} for task {} does not exceed {:?}",
                        budget, self.id, self.step_budget
                    )));
                }
                self.step_budget = Some(budget);
                self.adjusted_retries += 1;
            }
            None => self.transient_retries += 1,
        }
        self.retry_count += 1;
        self.state = TaskState::Ready;
        Ok(())
    }

    /// READY or IN_PROGRESS → BLOCKED.
    pub fn block(&mut self, code: BlockCode, detail: &str) -> Result<()> {
        if !matches!(self.state, TaskState::Ready | TaskState::InProgress) {
            return Err(self.invalid("blocked"));
        }
        self.state = TaskState::Blocked {
            code,
            detail: detail.to_string(),
        };
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// BLOCKED → READY after an operator cleared the reason.
    ///
    /// Retry accounting restarts so the task gets a fresh bounded attempt
    /// sequence; rejected tasks stay blocked.
    pub fn unblock(&mut self) -> Result<()> {
        match &self.state {
            TaskState::Blocked { code, .. } if code.is_permanent() => {
                Err(Error::PermanentlyRejected(self.id.clone()))
            }
            TaskState::Blocked { .. } => {
                self.state = TaskState::Ready;
                self.retry_count = 0;
                self.transient_retries = 0;
                self.adjusted_retries = 0;
                self.step_budget = None;
                self.completed_at = None;
                Ok(())
            }
            _ => Err(self.invalid("ready")),
        }
    }

    /// Put an interrupted IN_PROGRESS task back in the queue when resuming.
    pub(crate) fn abandon(&mut self) {
        if self.state == TaskState::InProgress {
            self.state = TaskState::Ready;
            self.started_at = None;
        }
    }
}
