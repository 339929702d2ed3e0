use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::DEFAULT_ROLE;
use crate::{clog_debug, Error, Result};

pub const DEFAULT_BASELINE_BRANCH: &str = "convoy/baseline";

fn default_baseline_branch() -> String {
    DEFAULT_BASELINE_BRANCH.to_string()
}

/// Daemon configuration, loaded from `~/.convoy/convoy.toml` or `--config`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Repository to orchestrate. Defaults to the current directory.
    #[serde(default)]
    pub repo: Option<String>,
    /// Branch that accumulates merged task work.
    #[serde(default = "default_baseline_branch")]
    pub baseline_branch: String,
    #[serde(default)]
    pub worktree_dir: Option<String>,
    #[serde(default)]
    pub state_dir: Option<String>,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub bus: BusSettings,
    #[serde(default)]
    pub coordinator: CoordinatorSettings,
    #[serde(default)]
    pub roles: BTreeMap<String, RoleConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repo: None,
            baseline_branch: default_baseline_branch(),
            worktree_dir: None,
            state_dir: None,
            supervisor: SupervisorSettings::default(),
            scheduler: SchedulerSettings::default(),
            health: HealthSettings::default(),
            bus: BusSettings::default(),
            coordinator: CoordinatorSettings::default(),
            roles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    pub poll_interval_ms: u64,
    pub drain_timeout_secs: u64,
    /// Journal entries between ledger snapshots.
    pub snapshot_every: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            drain_timeout_secs: 30,
            snapshot_every: 64,
        }
    }
}

impl SupervisorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Maximum number of tasks in flight at once.
    pub parallelism: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self { parallelism: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub poll_interval_ms: u64,
    pub unresponsive_timeout_secs: u64,
    pub max_restarts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub grace_period_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            unresponsive_timeout_secs: 300,
            max_restarts: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 60_000,
            grace_period_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    /// Bounded queue size per recipient.
    pub queue_capacity: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSettings {
    /// Keep the branch of a conflicting or discarded context for inspection.
    pub keep_failed_branches: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            keep_failed_branches: true,
        }
    }
}

/// How to launch a worker for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleConfig {
    /// Program and leading arguments.
    pub command: Vec<String>,
    /// Append the task prompt as the last argument.
    pub append_prompt: bool,
    /// Write bus messages addressed to the worker to its stdin. When off,
    /// stdin is closed and the worker has no bus endpoint.
    pub stdin_messages: bool,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
            append_prompt: true,
            stdin_messages: false,
        }
    }
}

impl Config {
    pub fn convoy_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".convoy"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::convoy_dir()?.join("convoy.toml"))
    }

    /// Load from the default location, falling back to defaults.
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
            "Config loaded: baseline={}, parallelism={}, roles={:?}",
            config.baseline_branch,
            config.scheduler.parallelism,
            config.roles.keys().collect::<Vec<_>>()
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        clog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.parallelism == 0 {
            return Err(Error::Validation(
                "scheduler.parallelism must be at least 1".to_string(),
            ));
        }
        if self.bus.queue_capacity == 0 {
            return Err(Error::Validation(
                "bus.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.supervisor.snapshot_every == 0 {
            return Err(Error::Validation(
                "supervisor.snapshot_every must be at least 1".to_string(),
            ));
        }
        let timeout_ms = self.health.unresponsive_timeout_secs.saturating_mul(1000);
        if self.health.poll_interval_ms >= timeout_ms {
            return Err(Error::Validation(
                "health.poll_interval_ms must be shorter than health.unresponsive_timeout_secs"
                    .to_string(),
            ));
        }
        if self.baseline_branch.trim().is_empty() {
            return Err(Error::Validation("baseline_branch is empty".to_string()));
        }
        for (name, role) in &self.roles {
            if role.command.is_empty() {
                return Err(Error::Validation(format!(
                    "roles.{}.command must not be empty",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Repository root to orchestrate.
    pub fn repo_path(&self) -> Result<PathBuf> {
        match &self.repo {
            Some(repo) => Ok(expand_tilde(repo)),
            None => Ok(std::env::current_dir()?),
        }
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        match &self.worktree_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::convoy_dir()?.join("worktrees")),
        }
    }

    /// Ledger, inbox, worker logs and lock live here.
    pub fn state_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.state_dir {
            return Ok(expand_tilde(dir));
        }
        let repo = self.repo_path()?;
        let name = repo
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "default".to_string());
        Ok(Self::convoy_dir()?
            .join("state")
            .join(crate::util::sanitize_name(&name)))
    }

    /// Launch settings for `role`, falling back to the default role.
    pub fn role(&self, role: &str) -> RoleConfig {
        self.roles
            .get(role)
            .or_else(|| self.roles.get(DEFAULT_ROLE))
            .cloned()
            .unwrap_or_default()
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.worktrees_dir()?, self.state_dir()?] {
            if !dir.exists() {
                clog_debug!("Creating directory: {}", dir.display());
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
