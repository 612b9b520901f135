//! Worker invocation adapter.
//!
//! The `Invoker` wraps one call to an external worker capability with a step
//! budget and a wall-clock timeout, and always returns a [`WorkerResult`]:
//! timeouts, process failures and undecodable output are captured as a
//! status, never propagated as errors.
//!
//! Each invocation gets an exclusive staging directory
//! (`<staging_root>/<task_id>/`) where proposed file contents are written.
//! The directory is cleared before every attempt and after a timeout; the
//! working tree is never touched here.
//!
//! [`CommandCapability`] is the production capability: it runs a headless
//! CLI worker (by default `claude -p ... --output-format json`) and reads
//! its JSON envelope.

use crate::config::WorkerConfig;
use crate::core::task::{Task, TaskId, WorkerRole};
use crate::error::{Error, Result};
use crate::orchestration::parser::{self, ChangeAction, Fallback, Record, Shape};
use crate::{clog_debug, clog_trace, clog_warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Everything a capability needs to perform one task attempt.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub task_id: TaskId,
    pub role: WorkerRole,
    pub prompt: String,
    /// Maximum steps/turns the worker may take.
    pub step_budget: u32,
    /// Exclusive scratch directory for this attempt.
    pub staging: PathBuf,
}

/// Raw output of a capability that ran to some conclusion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilityOutput {
    pub text: String,
    /// The step budget ran out before the worker finished.
    pub exhausted: bool,
    pub cost_usd: Option<f64>,
    pub steps: Option<u32>,
}

/// Why an invocation failed to produce output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationErrorKind {
    Authentication,
    Quota,
    Network,
    /// The worker process could not be started.
    Spawn,
    /// The worker exited unsuccessfully for an unrecognized reason.
    Exit,
    /// The staging area could not be prepared or written.
    Staging,
    /// Output was present but did not match the expected shape.
    Decode,
    /// The invocation task panicked.
    Panic,
}

impl InvocationErrorKind {
    /// Failures that retrying cannot fix without outside intervention.
    pub fn is_environmental(&self) -> bool {
        matches!(
            self,
            Self::Authentication | Self::Quota | Self::Spawn | Self::Staging
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationError {
    pub kind: InvocationErrorKind,
    pub message: String,
}

impl InvocationError {
    pub fn new(kind: InvocationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for InvocationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// An external reasoning/execution capability.
pub trait Capability: Send + Sync {
    fn run(
        &self,
        request: &WorkerRequest,
    ) -> impl Future<Output = std::result::Result<CapabilityOutput, InvocationError>> + Send;
}

/// Outcome category of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Success,
    Timeout,
    ParseError,
    RuntimeError,
    /// Budget exhausted; the payload holds whatever was emitted.
    Incomplete,
}

/// Immutable result of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerResult {
    pub task_id: TaskId,
    pub status: WorkerStatus,
    pub raw_output: String,
    pub payload: Option<Vec<Record>>,
    pub elapsed: Duration,
    pub estimated_cost: f64,
    pub error: Option<InvocationError>,
    pub step_budget: u32,
    pub steps: u32,
    pub staging: PathBuf,
}

impl WorkerResult {
    /// A result carrying only a failure, with no output.
    pub fn failed(
        task_id: &TaskId,
        status: WorkerStatus,
        error: Option<InvocationError>,
        step_budget: u32,
        elapsed: Duration,
    ) -> Self {
        Self {
            task_id: task_id.clone(),
            status,
            raw_output: String::new(),
            payload: None,
            elapsed,
            estimated_cost: 0.0,
            error,
            step_budget,
            steps: 0,
            staging: PathBuf::new(),
        }
    }

    pub fn records(&self) -> &[Record] {
        self.payload.as_deref().unwrap_or(&[])
    }

    /// True when the output should be handed to the verifier. An exhausted
    /// attempt with nothing usable has nothing to verify.
    pub fn produced_output(&self) -> bool {
        match self.status {
            WorkerStatus::Success => true,
            WorkerStatus::Incomplete => !self.records().is_empty(),
            _ => false,
        }
    }
}

/// Invokes a capability under a step budget and timeout.
#[derive(Debug, Clone)]
pub struct Invoker<C> {
    capability: C,
    timeout: Duration,
    staging_root: PathBuf,
    cost_per_step: f64,
}

impl<C: Capability> Invoker<C> {
    pub fn new(capability: C, staging_root: PathBuf) -> Self {
        let defaults = WorkerConfig::default();
        Self {
            capability,
            timeout: defaults.timeout(),
            staging_root,
            cost_per_step: defaults.cost_per_step,
        }
    }

    pub fn from_config(capability: C, staging_root: PathBuf, config: &WorkerConfig) -> Self {
        Self {
            capability,
            timeout: config.timeout(),
            staging_root,
            cost_per_step: config.cost_per_step,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn capability(&self) -> &C {
        &self.capability
    }

    /// `<staging_root>/<task_id>`, or `None` when the id is not a single
    /// visible path component and would address some other directory.
    pub fn staging_dir(&self, task_id: &TaskId) -> Option<PathBuf> {
        let mut components = Path::new(task_id.as_str()).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(name)), None)
                if !name.to_string_lossy().starts_with('.') =>
            {
                Some(self.staging_root.join(name))
            }
            _ => None,
        }
    }

    /// Run one attempt of `task` with `step_budget` steps.
    pub async fn invoke(&self, task: &Task, step_budget: u32) -> WorkerResult {
        let started = Instant::now();
        let Some(staging) = self.staging_dir(&task.id) else {
            return WorkerResult::failed(
                &task.id,
                WorkerStatus::RuntimeError,
                Some(InvocationError::new(
                    InvocationErrorKind::Staging,
                    format!("task id {:?} cannot name a staging directory", task.id.as_str()),
                )),
                step_budget,
                started.elapsed(),
            );
        };

        if let Err(e) = reset_dir(&staging).await {
            return WorkerResult::failed(
                &task.id,
                WorkerStatus::RuntimeError,
                Some(InvocationError::new(InvocationErrorKind::Staging, e.to_string())),
                step_budget,
                started.elapsed(),
            );
        }

        let request = WorkerRequest {
            task_id: task.id.clone(),
            role: task.role,
            prompt: build_prompt(task, step_budget),
            step_budget,
            staging: staging.clone(),
        };
        clog_debug!(
            "Invoker: {} role={} budget={} timeout={:?}",
            task.id,
            task.role,
            step_budget,
            self.timeout
        );

        let outcome = tokio::time::timeout(self.timeout, self.capability.run(&request)).await;
        let elapsed = started.elapsed();

        let output = match outcome {
            Err(_) => {
                clog_warn!("Invoker: {} timed out after {:?}", task.id, self.timeout);
                let _ = tokio::fs::remove_dir_all(&staging).await;
                return WorkerResult::failed(
                    &task.id,
                    WorkerStatus::Timeout,
                    None,
                    step_budget,
                    elapsed,
                );
            }
            Ok(Err(error)) => {
                clog_warn!("Invoker: {} failed: {}", task.id, error);
                let mut result = WorkerResult::failed(
                    &task.id,
                    WorkerStatus::RuntimeError,
                    Some(error),
                    step_budget,
                    elapsed,
                );
                result.staging = staging;
                return result;
            }
            Ok(Ok(output)) => output,
        };
        clog_trace!("Invoker: {} raw output:\n{}", task.id, output.text);

        let steps = output.steps.unwrap_or(0);
        let mut result = WorkerResult {
            task_id: task.id.clone(),
            status: WorkerStatus::Success,
            raw_output: output.text.clone(),
            payload: None,
            elapsed,
            estimated_cost: output
                .cost_usd
                .unwrap_or(steps as f64 * self.cost_per_step),
            error: None,
            step_budget,
            steps,
            staging: staging.clone(),
        };

        let shape = Shape::for_role(task.role);
        match parser::parse(&output.text, shape, Fallback::for_role(task.role)) {
            Ok(records) => {
                if let Err(error) = stage_records(&staging, &records).await {
                    result.status = WorkerStatus::ParseError;
                    result.error = Some(error);
                    return result;
                }
                result.payload = Some(records);
                if output.exhausted {
                    result.status = WorkerStatus::Incomplete;
                }
            }
            Err(failure) if output.exhausted => {
                clog_debug!("Invoker: {} exhausted with no usable output: {}", task.id, failure);
                result.status = WorkerStatus::Incomplete;
            }
            Err(failure) => {
                result.status = WorkerStatus::ParseError;
                result.error = Some(InvocationError::new(
                    InvocationErrorKind::Decode,
                    failure.to_string(),
                ));
            }
        }
        result
    }
}

fn build_prompt(task: &Task, step_budget: u32) -> String {
    let deliverable = match Shape::for_role(task.role) {
        Shape::CodeChanges => {
            "Reply with a ```json block: {\"changes\": [{\"path\", \
             \"action\": \"create|modify|delete\", \"content\"}]} holding full file contents."
        }
        Shape::Findings => {
            "Reply with a ```json block: {\"findings\": [{\"severity\": \
             \"info|warning|error\", \"file\", \"line\", \"message\"}]}."
        }
        Shape::TestOutcomes => {
            "Reply with a ```json block: {\"tests\": [{\"name\", \"passed\"}]}."
        }
    };
    format!(
        "Role: {}\nTask {}: {}\n\n{}\n\nYou have at most {} steps. {}",
        task.role, task.id, task.title, task.description, step_budget, deliverable
    )
}

async fn reset_dir(dir: &Path) -> std::io::Result<()> {
    if tokio::fs::try_exists(dir).await? {
        tokio::fs::remove_dir_all(dir).await?;
    }
    tokio::fs::create_dir_all(dir).await
}

async fn stage_records(
    staging: &Path,
    records: &[Record],
) -> std::result::Result<(), InvocationError> {
    for change in records.iter().filter_map(Record::as_change) {
        if change.action == ChangeAction::Delete {
            continue;
        }
        let target = change.relative_path().map(|p| staging.join(p)).ok_or_else(|| {
            InvocationError::new(
                InvocationErrorKind::Decode,
                format!("path {} escapes the staging area", change.path),
            )
        })?;
        write_file(&target, &change.content)
            .await
            .map_err(|e| InvocationError::new(InvocationErrorKind::Staging, e.to_string()))?;
    }
    Ok(())
}

async fn write_file(target: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(target, content).await
}

/// Envelope printed by a headless CLI worker with `--output-format json`.
#[derive(Debug, Deserialize)]
struct Envelope {
    subtype: Option<String>,
    result: Option<String>,
    total_cost_usd: Option<f64>,
    num_turns: Option<u32>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Runs a headless CLI worker as a child process.
#[derive(Debug, Clone)]
pub struct CommandCapability {
    binary: PathBuf,
    args: Vec<String>,
}

impl CommandCapability {
    /// Locate the configured worker binary on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns `WorkerBinaryNotFound` if the binary cannot be found.
    pub fn new(config: &WorkerConfig) -> Result<Self> {
        let binary = which::which(&config.binary)
            .map_err(|_| Error::WorkerBinaryNotFound(config.binary.clone()))?;
        Ok(Self {
            binary,
            args: config.args.clone(),
        })
    }

    pub fn with_binary(binary: PathBuf, args: Vec<String>) -> Self {
        Self { binary, args }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn render_args(&self, request: &WorkerRequest) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{prompt}", &request.prompt)
                    .replace("{steps}", &request.step_budget.to_string())
            })
            .collect()
    }

    /// Interpret the worker's JSON envelope.
    fn parse_envelope(
        stdout: &str,
    ) -> Option<std::result::Result<CapabilityOutput, InvocationError>> {
        let envelope: Envelope = serde_json::from_str(stdout.trim()).ok()?;
        let text = envelope.result.clone().unwrap_or_default();
        let output = |exhausted| CapabilityOutput {
            text: text.clone(),
            exhausted,
            cost_usd: envelope.total_cost_usd,
            steps: envelope.num_turns,
        };
        Some(match envelope.subtype.as_deref() {
            Some("success") if !envelope.is_error => Ok(output(false)),
            Some("error_max_turns") => Ok(output(true)),
            _ => {
                let message = envelope
                    .error
                    .clone()
                    .or(envelope.result.clone())
                    .unwrap_or_else(|| "worker reported an error".to_string());
                Err(InvocationError::new(classify_failure(&message), message))
            }
        })
    }
}

impl Capability for CommandCapability {
    async fn run(
        &self,
        request: &WorkerRequest,
    ) -> std::result::Result<CapabilityOutput, InvocationError> {
        let output = Command::new(&self.binary)
            .args(self.render_args(request))
            .current_dir(&request.staging)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| InvocationError::new(InvocationErrorKind::Spawn, e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if let Some(parsed) = Self::parse_envelope(&stdout) {
            return parsed;
        }
        if output.status.success() {
            return Ok(CapabilityOutput {
                text: stdout.trim().to_string(),
                ..Default::default()
            });
        }

        let message = if stderr.trim().is_empty() {
            format!(
                "worker exited with code {}",
                output.status.code().unwrap_or(-1)
            )
        } else {
            stderr.trim().to_string()
        };
        Err(InvocationError::new(classify_failure(&message), message))
    }
}

/// Map a worker failure message to an error kind.
pub fn classify_failure(message: &str) -> InvocationErrorKind {
    let lower = message.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    if any(&["401", "unauthorized", "authentication", "invalid api key", "not logged in"]) {
        InvocationErrorKind::Authentication
    } else if any(&["quota", "rate limit", "rate_limit", "429", "credit balance"]) {
        InvocationErrorKind::Quota
    } else if any(&["network", "connection", "timed out", "dns", "econnreset", "overloaded"]) {
        InvocationErrorKind::Network
    } else {
        InvocationErrorKind::Exit
    }
}
