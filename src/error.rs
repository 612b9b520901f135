use thiserror::Error;

use crate::core::task::{TaskId, TaskState};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Malformed task specification: {0}")]
    MalformedSpec(String),

    #[error("Task not found: {0}")]
    UnknownTask(TaskId),

    #[error("Task already exists: {0}")]
    DuplicateTask(TaskId),

    #[error("Dependency {from} -> {to} would create a cycle")]
    Cycle { from: TaskId, to: TaskId },

    #[error("Invalid transition for task {task}: {from} -> {to}")]
    InvalidTransition {
        task: TaskId,
        from: TaskState,
        to: &'static str,
    },

    #[error("Dependencies of task {task} are not complete: {pending:?}")]
    DependenciesPending { task: TaskId, pending: Vec<TaskId> },

    #[error("Task {0} is permanently rejected")]
    PermanentlyRejected(TaskId),

    #[error("Worker binary not found: {0}")]
    WorkerBinaryNotFound(String),

    #[error("Background task failed: {0}")]
    TaskJoin(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl Error {
    /// True for the graph-integrity failure that refuses an `add`/`split`.
    pub fn is_cycle(&self) -> bool {
        matches!(self, Error::Cycle { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
