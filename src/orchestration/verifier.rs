//! Check execution against a task's output.
//!
//! The `Verifier` runs the project's checks through a [`CheckRunner`] and
//! reports a [`CheckOutcome`]. The outcome keeps three situations apart:
//!
//! - every check ran and passed (possibly zero checks),
//! - checks ran and some failed or errored,
//! - the checks could not be loaded or collected at all (`load_failed`).
//!
//! Routing depends on that last flag, so a compile or import failure is never
//! folded into "zero checks". When the runner itself fails (it timed out, or
//! the command could not be started) the outcome carries a [`RunnerFailure`]
//! instead, since nothing is known about the task's output.
//!
//! With an [`Overlay`] attached, checks run against a copy of the project
//! with the task's changes applied. Without one they run in the task's
//! staging area.

use crate::config::VerifierConfig;
use crate::core::task::Task;
use crate::error::{Error, Result};
use crate::orchestration::overlay::Overlay;
use crate::orchestration::parser::{Record, Severity};
use crate::{clog_debug, clog_trace, clog_warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;

/// `test result: ok. 3 passed; 1 failed; ...` from cargo test.
static CARGO_SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"test result: \w+\. (\d+) passed; (\d+) failed;").unwrap()
});

/// `===== 2 failed, 5 passed, 1 error in 0.12s =====` from pytest.
static PYTEST_SUMMARY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^=+ (.+) in [\d.]+s\b.*=+\s*$").unwrap());

static PYTEST_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) (passed|failed|errors?)").unwrap());

/// Compile, import, or collection failures: nothing could run.
static LOAD_FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?m)^(error\[E\d+\].*|error: could not compile.*",
        r"|.*ImportError.*|.*ModuleNotFoundError.*",
        r"|.*errors? during collection.*|ERROR collecting.*)$",
    ))
    .unwrap()
});

static MISSING_SYMBOL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"cannot find (?:value|function|type|struct|trait|macro) `([A-Za-z_][A-Za-z0-9_]*)`",
        r"|unresolved import `([A-Za-z0-9_:]+)`",
        r"|cannot import name '([A-Za-z_][A-Za-z0-9_]*)'",
        r"|No module named '([A-Za-z0-9_.]+)'",
    ))
    .unwrap()
});

/// Result of running a task's checks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub passed: u32,
    pub failed: u32,
    pub errored: u32,
    /// The checks could not be loaded or collected.
    pub load_failed: bool,
    pub load_error: Option<String>,
    /// Symbols the loader reported as missing, in first-seen order.
    pub missing_symbols: Vec<String>,
    #[serde(default)]
    pub runner_failure: Option<RunnerFailure>,
}

/// The checks never produced a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerFailure {
    Timeout(String),
    /// The runner could not be started, or its working copy could not be built.
    Environment(String),
}

impl std::fmt::Display for RunnerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerFailure::Timeout(detail) => write!(f, "check runner timed out: {}", detail),
            RunnerFailure::Environment(detail) => write!(f, "check runner unavailable: {}", detail),
        }
    }
}

impl CheckOutcome {
    pub fn counts(passed: u32, failed: u32, errored: u32) -> Self {
        Self {
            passed,
            failed,
            errored,
            ..Default::default()
        }
    }

    pub fn load_failure(error: &str, missing_symbols: Vec<String>) -> Self {
        Self {
            load_failed: true,
            load_error: Some(error.to_string()),
            missing_symbols,
            ..Default::default()
        }
    }

    pub fn runner_failed(failure: RunnerFailure) -> Self {
        Self {
            runner_failure: Some(failure),
            ..Default::default()
        }
    }

    pub fn all_passed(&self) -> bool {
        self.runner_failure.is_none() && !self.load_failed && self.failed == 0 && self.errored == 0
    }

    pub fn total(&self) -> u32 {
        self.passed + self.failed + self.errored
    }
}

impl std::fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(failure) = &self.runner_failure {
            write!(f, "{}", failure)
        } else if self.load_failed {
            write!(
                f,
                "checks could not load: {}",
                self.load_error.as_deref().unwrap_or("unknown error")
            )
        } else {
            write!(
                f,
                "{} passed, {} failed, {} errored",
                self.passed, self.failed, self.errored
            )
        }
    }
}

/// Something that can run the project's checks for a task inside `workdir`.
pub trait CheckRunner: Send + Sync {
    fn run(&self, task: &Task, workdir: &Path) -> impl Future<Output = Result<CheckOutcome>> + Send;
}

/// Interpret check runner output.
///
/// Load markers win over counts. With no recognizable summary, a clean exit
/// means zero checks and a failing exit means nothing could be collected.
pub fn parse_check_output(success: bool, output: &str) -> CheckOutcome {
    if let Some(marker) = LOAD_FAILURE_RE.find(output) {
        let mut symbols: Vec<String> = Vec::new();
        for caps in MISSING_SYMBOL_RE.captures_iter(output) {
            let symbol = caps
                .iter()
                .skip(1)
                .flatten()
                .next()
                .map(|m| m.as_str().rsplit("::").next().unwrap_or(m.as_str()).to_string());
            if let Some(symbol) = symbol {
                if !symbols.contains(&symbol) {
                    symbols.push(symbol);
                }
            }
        }
        return CheckOutcome::load_failure(marker.as_str().trim(), symbols);
    }

    let mut outcome = CheckOutcome::default();
    let mut found = false;
    for caps in CARGO_SUMMARY_RE.captures_iter(output) {
        found = true;
        outcome.passed += caps[1].parse::<u32>().unwrap_or(0);
        outcome.failed += caps[2].parse::<u32>().unwrap_or(0);
    }
    for summary in PYTEST_SUMMARY_RE.captures_iter(output) {
        for caps in PYTEST_COUNT_RE.captures_iter(&summary[1]) {
            found = true;
            let n = caps[1].parse::<u32>().unwrap_or(0);
            match &caps[2] {
                "passed" => outcome.passed += n,
                "failed" => outcome.failed += n,
                _ => outcome.errored += n,
            }
        }
    }

    match (found, success) {
        (true, true) => outcome,
        (true, false) => {
            if outcome.failed == 0 && outcome.errored == 0 {
                outcome.errored = 1;
            }
            outcome
        }
        (false, true) => CheckOutcome::default(),
        (false, false) => {
            CheckOutcome::load_failure("check runner failed without reporting results", Vec::new())
        }
    }
}

/// Runs a configured command, e.g. `cargo test`, and parses its summary.
#[derive(Debug, Clone)]
pub struct CommandCheckRunner {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandCheckRunner {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout: Duration::from_secs(300),
        }
    }

    pub fn from_config(config: &VerifierConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: config.timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl CheckRunner for CommandCheckRunner {
    async fn run(&self, task: &Task, workdir: &Path) -> Result<CheckOutcome> {
        clog_debug!(
            "CommandCheckRunner: {} {:?} in {} for {}",
            self.program,
            self.args,
            workdir.display(),
            task.id
        );
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.program)
                .args(&self.args)
                .current_dir(workdir)
                .env("CONDUCTOR_TASK", task.id.as_str())
                .env("CONDUCTOR_WORKDIR", workdir)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))??;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push('\n');
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        clog_trace!("check output for {}:\n{}", task.id, text);
        Ok(parse_check_output(output.status.success(), &text))
    }
}

/// Verifies a task's produced records with a check runner.
#[derive(Debug, Clone)]
pub struct Verifier<R> {
    runner: R,
    overlay: Option<Overlay>,
}

impl<R: CheckRunner> Verifier<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            overlay: None,
        }
    }

    pub fn with_overlay(mut self, overlay: Overlay) -> Self {
        self.overlay = Some(overlay);
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn overlay(&self) -> Option<&Overlay> {
        self.overlay.as_ref()
    }

    /// Run the checks for `task` and fold in blocking findings and failing
    /// test outcomes reported by the worker itself.
    pub async fn verify(&self, task: &Task, records: &[Record], staging: &Path) -> CheckOutcome {
        let mut outcome = match &self.overlay {
            Some(overlay) => {
                let changes = records.iter().filter_map(Record::as_change).cloned().collect();
                match overlay.prepare(&task.id, changes).await {
                    Ok(workdir) => {
                        let outcome = self.run_checks(task, &workdir).await;
                        if let Err(e) = overlay.discard(&task.id).await {
                            clog_warn!("Could not remove overlay for {}: {}", task.id, e);
                        }
                        outcome
                    }
                    Err(e) => CheckOutcome::runner_failed(RunnerFailure::Environment(format!(
                        "could not prepare overlay: {}",
                        e
                    ))),
                }
            }
            None => self.run_checks(task, staging).await,
        };
        if outcome.runner_failure.is_some() {
            clog_debug!("Verifier: {} -> {}", task.id, outcome);
            return outcome;
        }

        for record in records {
            match record {
                Record::Finding(f) if f.severity == Severity::Error => outcome.failed += 1,
                Record::Test(t) if !t.passed => outcome.failed += 1,
                _ => {}
            }
        }
        clog_debug!("Verifier: {} -> {}", task.id, outcome);
        outcome
    }

    async fn run_checks(&self, task: &Task, workdir: &Path) -> CheckOutcome {
        match self.runner.run(task, workdir).await {
            Ok(outcome) => outcome,
            Err(Error::Timeout(limit)) => CheckOutcome::runner_failed(RunnerFailure::Timeout(
                format!("no verdict after {}s", limit.as_secs()),
            )),
            Err(e) => CheckOutcome::runner_failed(RunnerFailure::Environment(e.to_string())),
        }
    }
}
