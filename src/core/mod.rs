//! Core domain models for orchestration runs.
//!
//! This module contains the task model with its guarded lifecycle and the
//! dependency graph the dispatcher draws ready work from.

pub mod dag;
pub mod task;

pub use dag::{ChildSpec, GraphSnapshot, StateCounts, TaskGraph};
pub use task::{BlockCode, Task, TaskId, TaskState, WorkerRole};
