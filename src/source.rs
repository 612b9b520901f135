//! Loading the initial task list.
//!
//! A specification source is either a TOML file of `[[task]]` tables or a
//! JSON array of the same objects:
//!
//! ```toml
//! [[task]]
//! id = "T2"
//! title = "Frame decoder"
//! description = "Implement `decode_frame`"
//! deps = ["T1"]
//! size = 3
//! role = "implementer"
//! ```
//!
//! Declaration order becomes each task's `order`, the first key of the
//! ready ordering.

use crate::core::dag::TaskGraph;
use crate::core::task::{Task, WorkerRole};
use crate::{clog, Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

fn default_size() -> u32 {
    1
}

/// One task as declared by the specification source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub deps: Vec<String>,
    #[serde(default = "default_size")]
    pub size: u32,
    #[serde(default)]
    pub role: WorkerRole,
}

#[derive(Debug, Deserialize)]
struct TomlSource {
    #[serde(default)]
    task: Vec<TaskSpec>,
}

pub fn parse_toml(content: &str) -> Result<Vec<TaskSpec>> {
    let source: TomlSource = toml::from_str(content)?;
    Ok(source.task)
}

pub fn parse_json(content: &str) -> Result<Vec<TaskSpec>> {
    Ok(serde_json::from_str(content)?)
}

/// Read a `.toml` or `.json` source file.
pub fn load(path: &Path) -> Result<Vec<TaskSpec>> {
    let content = fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => parse_toml(&content),
        Some("json") => parse_json(&content),
        _ => Err(Error::MalformedSpec(format!(
            "unsupported source format: {}",
            path.display()
        ))),
    }
}

/// Ids name staging directories, so they must be a single plain path
/// component: alphanumeric first, then `-`, `_` or `.`.
fn valid_id(id: &str) -> bool {
    let mut chars = id.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Validate specs and turn them into BACKLOG tasks.
pub fn into_tasks(specs: Vec<TaskSpec>) -> Result<Vec<Task>> {
    specs
        .into_iter()
        .enumerate()
        .map(|(order, spec)| {
            if !valid_id(&spec.id) {
                return Err(Error::MalformedSpec(format!("invalid task id {:?}", spec.id)));
            }
            if spec.title.trim().is_empty() {
                return Err(Error::MalformedSpec(format!("task {} has no title", spec.id)));
            }
            if spec.size == 0 {
                return Err(Error::MalformedSpec(format!("task {} has size 0", spec.id)));
            }
            let mut task = Task::new(spec.id.as_str(), &spec.title, &spec.description)
                .with_order(order as u32)
                .with_size(spec.size)
                .with_role(spec.role);
            task.deps = spec.deps.into_iter().map(Into::into).collect();
            Ok(task)
        })
        .collect()
}

/// Build the task graph; malformed input and cycles are fatal here.
pub fn build_graph(specs: Vec<TaskSpec>) -> Result<TaskGraph> {
    let graph = TaskGraph::from_tasks(into_tasks(specs)?)?;
    clog!("Loaded {} tasks from specification source", graph.len());
    Ok(graph)
}
