use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{clog_debug, Error, Result};

/// Run configuration, read from `~/.conductor/conductor.toml`.
///
/// Every section is optional in the file; missing keys take the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Where run snapshots are written. Defaults to `~/.conductor/runs`.
    pub state_dir: Option<String>,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum concurrent worker invocations.
    pub concurrency: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_cost_usd: f64,
    pub max_time_secs: u64,
    /// Cost reserved for each admission before the real cost is known.
    pub estimated_cost_per_invocation: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_cost_usd: 25.0,
            max_time_secs: 4 * 60 * 60,
            estimated_cost_per_invocation: 0.50,
        }
    }
}

impl BudgetConfig {
    pub fn max_time(&self) -> Duration {
        Duration::from_secs(self.max_time_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GateConfig {
    pub base_steps: u32,
    pub steps_per_point: u32,
    /// Hard ceiling on any step budget handed to a worker.
    pub step_ceiling: u32,
    /// Difficulty above which a task is split up front.
    pub split_threshold: u32,
    pub words_per_point: u32,
    /// Retry count at which a task is rejected outright.
    pub max_attempts: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            base_steps: 20,
            steps_per_point: 5,
            step_ceiling: 200,
            split_threshold: 30,
            words_per_point: 50,
            max_attempts: 6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    pub max_transient_retries: u32,
    pub max_adjusted_retries: u32,
    pub budget_multiplier: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_transient_retries: 3,
            max_adjusted_retries: 2,
            budget_multiplier: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub binary: String,
    /// Arguments; `{prompt}` and `{steps}` are substituted per invocation.
    pub args: Vec<String>,
    pub timeout_secs: u64,
    /// Fallback cost estimate when the worker does not report one.
    pub cost_per_step: f64,
    pub staging_dir: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            args: vec![
                "-p".to_string(),
                "{prompt}".to_string(),
                "--output-format".to_string(),
                "json".to_string(),
                "--max-turns".to_string(),
                "{steps}".to_string(),
            ],
            timeout_secs: 600,
            cost_per_step: 0.02,
            staging_dir: None,
        }
    }
}

impl WorkerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerifierConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Project the checks belong to; the current directory when unset.
    pub project_dir: Option<String>,
    pub timeout_secs: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            program: "cargo".to_string(),
            args: vec!["test".to_string()],
            project_dir: None,
            timeout_secs: 300,
        }
    }
}

impl VerifierConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::conductor_dir()?.join("runs")),
        }
    }

    pub fn staging_root(&self) -> Result<PathBuf> {
        match &self.worker.staging_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::conductor_dir()?.join("staging")),
        }
    }

    pub fn project_dir(&self) -> Result<PathBuf> {
        match &self.verifier.project_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(std::env::current_dir()?),
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        clog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            clog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        clog_debug!(
            "Config loaded: concurrency={}, max_cost_usd={}, step_ceiling={}",
            config.dispatch.concurrency,
            config.budget.max_cost_usd,
            config.gate.step_ceiling
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                clog_debug!("Creating config directory {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Reject settings that would make the run unbounded or inert.
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.concurrency == 0 {
            return Err(Error::Validation("dispatch.concurrency must be at least 1".into()));
        }
        if self.recovery.budget_multiplier < 2 {
            return Err(Error::Validation(
                "recovery.budget_multiplier must be at least 2".into(),
            ));
        }
        if self.gate.base_steps == 0 || self.gate.step_ceiling < self.gate.base_steps {
            return Err(Error::Validation(
                "gate.step_ceiling must be at least gate.base_steps, which must be positive".into(),
            ));
        }
        if self.gate.words_per_point == 0 {
            return Err(Error::Validation("gate.words_per_point must be positive".into()));
        }
        if self.budget.max_cost_usd < 0.0 || self.budget.estimated_cost_per_invocation < 0.0 {
            return Err(Error::Validation("budget costs must not be negative".into()));
        }
        Ok(())
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
