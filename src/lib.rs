//! conductor: the orchestration core of a spec-to-commit pipeline of worker
//! agents.
//!
//! A specification source is loaded into a [`TaskGraph`]; the
//! [`Orchestrator`] gates ready tasks, dispatches them to worker invocations
//! under a concurrency limit and a run budget, verifies what comes back and
//! decides how to recover from failures. Finished work is committed to git.

pub mod config;
pub mod core;
pub mod error;
pub mod git;
pub mod log;
pub mod orchestration;
pub mod source;
pub mod state;
pub mod util;

pub use config::Config;
pub use crate::core::{BlockCode, Task, TaskGraph, TaskId, TaskState, WorkerRole};
pub use error::{Error, Result};
pub use git::{Committer, GitCommitter};
pub use orchestration::{Orchestrator, RunContext, RunOutcome, RunReport};
pub use state::{RunSnapshot, SnapshotStore};
