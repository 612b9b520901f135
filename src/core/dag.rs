//! Task dependency graph.
//!
//! `TaskGraph` keeps tasks as nodes of a petgraph `StableDiGraph` with an
//! edge `a -> b` meaning "a must be DONE before b may start". The graph is
//! acyclic at all times: every mutation that could introduce a cycle is
//! validated first and refused with [`Error::Cycle`], leaving the graph
//! exactly as it was.

use crate::core::task::{BlockCode, Task, TaskId, TaskState, WorkerRole};
use crate::error::{Error, Result};
use crate::{clog_debug, clog_error};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Specification of one child produced by splitting a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSpec {
    pub title: String,
    pub description: String,
    pub size: u32,
    /// Extra dependencies beyond the parent's unmet ones.
    #[serde(default)]
    pub deps: Vec<TaskId>,
}

impl ChildSpec {
    pub fn new(title: &str, description: &str, size: u32) -> Self {
        Self {
            title: title.to_string(),
            description: description.to_string(),
            size,
            deps: Vec::new(),
        }
    }
}

/// Serializable view of the whole graph; edges are carried by `Task::deps`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub tasks: Vec<Task>,
}

/// Number of tasks in each lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub backlog: usize,
    pub ready: usize,
    pub in_progress: usize,
    pub done: usize,
    pub blocked: usize,
}

/// The task dependency graph.
#[derive(Clone)]
pub struct TaskGraph {
    graph: StableDiGraph<Task, ()>,
    index: HashMap<TaskId, NodeIndex>,
    /// Cleared on every structural mutation, rebuilt on demand.
    topo: OnceLock<Vec<TaskId>>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            index: HashMap::new(),
            topo: OnceLock::new(),
        }
    }

    /// Build a graph from tasks whose `deps` may reference any task in the list.
    ///
    /// # Errors
    /// `DuplicateTask` / `UnknownTask` for malformed input, `Cycle` if the
    /// declared dependencies are cyclic.
    pub fn from_tasks(tasks: Vec<Task>) -> Result<Self> {
        let mut graph = Self::new();
        let mut declared = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            if graph.index.contains_key(&task.id) {
                return Err(Error::DuplicateTask(task.id));
            }
            declared.push((task.id.clone(), std::mem::take(&mut task.deps)));
            let id = task.id.clone();
            let node = graph.graph.add_node(task);
            graph.index.insert(id, node);
        }
        for (id, deps) in declared {
            for dep in deps {
                graph.link(&dep, &id)?;
            }
        }
        clog_debug!(
            "TaskGraph::from_tasks tasks={} edges={}",
            graph.len(),
            graph.graph.edge_count()
        );
        Ok(graph)
    }

    /// Restore a graph from a snapshot; interrupted IN_PROGRESS tasks go back to READY.
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self> {
        let mut graph = Self::from_tasks(snapshot.tasks)?;
        let nodes: Vec<NodeIndex> = graph.graph.node_indices().collect();
        for node in nodes {
            graph.graph[node].abandon();
        }
        Ok(graph)
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            tasks: self.tasks().into_iter().cloned().collect(),
        }
    }

    /// Add a task that depends on `deps`, all of which must already exist.
    pub fn add(&mut self, mut task: Task, deps: &[TaskId]) -> Result<()> {
        if self.index.contains_key(&task.id) {
            return Err(Error::DuplicateTask(task.id));
        }
        for dep in deps {
            if *dep == task.id {
                return Err(Error::Cycle {
                    from: dep.clone(),
                    to: task.id,
                });
            }
            if !self.index.contains_key(dep) {
                return Err(Error::UnknownTask(dep.clone()));
            }
        }

        task.deps = Vec::new();
        let id = task.id.clone();
        let node = self.graph.add_node(task);
        self.index.insert(id.clone(), node);
        for dep in deps {
            // A fresh node has no outgoing edges, so these cannot close a cycle.
            self.insert_edge(dep, &id);
        }
        self.topo = OnceLock::new();
        Ok(())
    }

    /// Declare that `from` must be DONE before `to` may start.
    ///
    /// # Errors
    /// `UnknownTask` if either end is missing, `Cycle` if `to` already
    /// reaches `from`, `Validation` if `to` has already been started.
    pub fn add_dependency(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_node = self.node(from)?;
        let to_node = self.node(to)?;
        self.check_acyclic(from_node, to_node, from, to)?;
        if !self.graph[to_node].is_waiting() {
            return Err(Error::Validation(format!(
                "cannot add dependency to task {} in state {}",
                to, self.graph[to_node].state
            )));
        }
        self.link(from, to)?;

        let from_done = self.graph[from_node].is_done();
        let target = &mut self.graph[to_node];
        if !from_done && target.state == TaskState::Ready {
            target.state = TaskState::Backlog;
        }
        Ok(())
    }

    fn check_acyclic(
        &self,
        from_node: NodeIndex,
        to_node: NodeIndex,
        from: &TaskId,
        to: &TaskId,
    ) -> Result<()> {
        if from_node == to_node || has_path_connecting(&self.graph, to_node, from_node, None) {
            return Err(Error::Cycle {
                from: from.clone(),
                to: to.clone(),
            });
        }
        Ok(())
    }

    /// Add the edge `from -> to` regardless of task state.
    fn link(&mut self, from: &TaskId, to: &TaskId) -> Result<()> {
        let from_node = self.node(from)?;
        let to_node = self.node(to)?;
        self.check_acyclic(from_node, to_node, from, to)?;
        if self.graph.find_edge(from_node, to_node).is_none() {
            self.insert_edge(from, to);
            self.topo = OnceLock::new();
        }
        Ok(())
    }

    fn insert_edge(&mut self, from: &TaskId, to: &TaskId) {
        let (Some(&from_node), Some(&to_node)) = (self.index.get(from), self.index.get(to)) else {
            return;
        };
        self.graph.add_edge(from_node, to_node, ());
        let deps = &mut self.graph[to_node].deps;
        if !deps.contains(from) {
            deps.push(from.clone());
        }
    }

    fn node(&self, id: &TaskId) -> Result<NodeIndex> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| Error::UnknownTask(id.clone()))
    }

    fn task_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        let node = self.node(id)?;
        Ok(&mut self.graph[node])
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).map(|&node| &self.graph[node])
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// All tasks ordered by (declared order, id).
    pub fn tasks(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.graph.node_weights().collect();
        tasks.sort_by(|a, b| (a.order, &a.id).cmp(&(b.order, &b.id)));
        tasks
    }

    /// Tasks that directly depend on `id`.
    pub fn dependents(&self, id: &TaskId) -> Vec<&Task> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(node, Direction::Outgoing)
            .map(|n| &self.graph[n])
            .collect()
    }

    /// Dependencies of `id` that are not yet DONE.
    pub fn pending_deps(&self, id: &TaskId) -> Vec<TaskId> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        let mut pending: Vec<TaskId> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .map(|n| &self.graph[n])
            .filter(|dep| !dep.is_done())
            .map(|dep| dep.id.clone())
            .collect();
        pending.sort();
        pending
    }

    pub fn deps_done(&self, id: &TaskId) -> bool {
        self.pending_deps(id).is_empty()
    }

    /// BACKLOG/READY tasks whose dependencies are all DONE, ordered by
    /// (declared order, id).
    pub fn ready(&self) -> Vec<&Task> {
        self.tasks()
            .into_iter()
            .filter(|task| task.is_waiting() && self.deps_done(&task.id))
            .collect()
    }

    /// Promote every BACKLOG task whose dependencies are DONE; returns the promoted ids.
    pub fn promote_ready(&mut self) -> Vec<TaskId> {
        let promotable: Vec<TaskId> = self
            .ready()
            .into_iter()
            .filter(|task| task.state == TaskState::Backlog)
            .map(|task| task.id.clone())
            .collect();
        for id in &promotable {
            if let Ok(task) = self.task_mut(id) {
                let _ = task.mark_ready();
            }
        }
        promotable
    }

    /// READY → IN_PROGRESS, guarded on every dependency being DONE.
    pub fn start(&mut self, id: &TaskId, step_budget: u32) -> Result<()> {
        let pending = self.pending_deps(id);
        if !pending.is_empty() {
            return Err(Error::DependenciesPending {
                task: id.clone(),
                pending,
            });
        }
        self.task_mut(id)?.start(step_budget)
    }

    pub fn complete(&mut self, id: &TaskId) -> Result<()> {
        self.task_mut(id)?.complete()
    }

    pub fn requeue(&mut self, id: &TaskId, raised_budget: Option<u32>) -> Result<()> {
        self.task_mut(id)?.requeue(raised_budget)
    }

    pub fn block(&mut self, id: &TaskId, code: BlockCode, detail: &str) -> Result<()> {
        self.task_mut(id)?.block(code, detail)
    }

    /// Operator intervention: clear a non-permanent block.
    pub fn unblock(&mut self, id: &TaskId) -> Result<()> {
        self.task_mut(id)?.unblock()
    }

    /// Replace task `id` with `children`.
    ///
    /// Children inherit the parent's unmet dependencies and its dependents;
    /// a dependent's `deps` list has the parent replaced by the children in
    /// place. The result is validated on a candidate copy and committed only
    /// if acyclic.
    ///
    /// Child ids are `<id>.<n>`, skipping suffixes already taken.
    ///
    /// # Errors
    /// `Cycle` if the split would introduce a cycle, `UnknownTask` for a
    /// child dependency that does not exist, `Validation` if the task is not
    /// READY/IN_PROGRESS or no children were given.
    pub fn split(&mut self, id: &TaskId, children: &[ChildSpec]) -> Result<Vec<TaskId>> {
        let parent_node = self.node(id)?;
        let parent = self.graph[parent_node].clone();
        if !matches!(parent.state, TaskState::Ready | TaskState::InProgress) {
            return Err(Error::Validation(format!(
                "cannot split task {} in state {}",
                id, parent.state
            )));
        }
        if children.is_empty() {
            return Err(Error::Validation(format!("split of {} has no children", id)));
        }

        let unmet = self.pending_deps(id);
        let dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(parent_node, Direction::Outgoing)
            .collect();

        let mut graph = self.graph.clone();
        let mut index = self.index.clone();
        graph.remove_node(parent_node);
        index.remove(id);

        let mut child_ids = Vec::with_capacity(children.len());
        let mut suffix = 0;
        for spec in children {
            let child_id = loop {
                suffix += 1;
                let candidate = id.child(suffix);
                if !index.contains_key(&candidate) {
                    break candidate;
                }
            };
            let mut child = Task::new(child_id.clone(), &spec.title, &spec.description)
                .with_order(parent.order)
                .with_size(spec.size.max(1))
                .with_role(parent.role);
            child.split_from = Some(id.clone());

            let mut deps = unmet.clone();
            for extra in &spec.deps {
                if !deps.contains(extra) {
                    deps.push(extra.clone());
                }
            }
            let mut dep_nodes = Vec::with_capacity(deps.len());
            for dep in &deps {
                let node = *index
                    .get(dep)
                    .ok_or_else(|| Error::UnknownTask(dep.clone()))?;
                dep_nodes.push(node);
            }
            child.deps = deps;

            let child_node = graph.add_node(child);
            index.insert(child_id.clone(), child_node);
            for dep_node in dep_nodes {
                graph.add_edge(dep_node, child_node, ());
            }
            child_ids.push(child_id);
        }

        for &dependent in &dependents {
            for child_id in &child_ids {
                graph.add_edge(index[child_id], dependent, ());
            }
            let deps = &mut graph[dependent].deps;
            if let Some(pos) = deps.iter().position(|d| d == id) {
                deps.splice(pos..=pos, child_ids.iter().cloned());
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            let at = graph[cycle.node_id()].id.clone();
            clog_debug!("TaskGraph::split refused for {}: cycle at {}", id, at);
            return Err(Error::Cycle {
                from: id.clone(),
                to: at,
            });
        }

        self.graph = graph;
        self.index = index;
        self.topo = OnceLock::new();
        clog_debug!("TaskGraph::split {} -> {:?}", id, child_ids);
        Ok(child_ids)
    }

    /// Tasks in dependency order, recomputed lazily after mutations.
    pub fn topological_order(&self) -> &[TaskId] {
        self.topo.get_or_init(|| match toposort(&self.graph, None) {
            Ok(nodes) => nodes.into_iter().map(|n| self.graph[n].id.clone()).collect(),
            Err(cycle) => {
                clog_error!(
                    "TaskGraph invariant broken: cycle at {}",
                    self.graph[cycle.node_id()].id
                );
                Vec::new()
            }
        })
    }

    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for task in self.graph.node_weights() {
            match task.state {
                TaskState::Backlog => counts.backlog += 1,
                TaskState::Ready => counts.ready += 1,
                TaskState::InProgress => counts.in_progress += 1,
                TaskState::Done => counts.done += 1,
                TaskState::Blocked { .. } => counts.blocked += 1,
            }
        }
        counts
    }

    pub fn all_done(&self) -> bool {
        self.graph.node_weights().all(Task::is_done)
    }

    /// Role of a task, defaulting to the implementer for unknown ids.
    pub fn role_of(&self, id: &TaskId) -> WorkerRole {
        self.get(id).map(|t| t.role).unwrap_or_default()
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.len())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}
