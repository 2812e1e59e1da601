use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::orchestration::gate::{
    ConflictRules, DEFAULT_GENERATED_PATTERNS, DEFAULT_MANUAL_PATTERNS, DEFAULT_MAX_ASSISTED_HUNKS,
};
use crate::orchestration::health::HealthConfig;
use crate::orchestration::scheduler::SchedulePolicy;
use crate::{mlog_debug, Error, Result};

fn default_workers() -> usize {
    4
}

fn default_task_timeout_secs() -> u64 {
    crate::agent::DEFAULT_TIMEOUT_SECS
}

fn default_heartbeat_interval_secs() -> u64 {
    crate::orchestration::health::DEFAULT_HEARTBEAT_INTERVAL_SECS
}

fn default_missed_heartbeats() -> u32 {
    crate::orchestration::health::DEFAULT_MISSED_HEARTBEATS
}

fn default_retire_after_failures() -> u32 {
    crate::orchestration::health::DEFAULT_RETIRE_AFTER
}

fn default_starvation_timeout_secs() -> u64 {
    90
}

fn default_git_timeout_secs() -> u64 {
    60
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_session_prefix() -> String {
    "maestro".to_string()
}

fn default_true() -> bool {
    true
}

fn default_generated_patterns() -> Vec<String> {
    DEFAULT_GENERATED_PATTERNS.iter().map(|p| p.to_string()).collect()
}

fn default_manual_patterns() -> Vec<String> {
    DEFAULT_MANUAL_PATTERNS.iter().map(|p| p.to_string()).collect()
}

fn default_max_assisted_hunks() -> usize {
    DEFAULT_MAX_ASSISTED_HUNKS
}

/// `[conflicts]` table: how the merge gate classifies conflicted files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictConfig {
    /// Regexes for generated files resolved by keeping our side.
    #[serde(default = "default_generated_patterns")]
    pub generated_patterns: Vec<String>,
    /// Regexes for files that always need a human.
    #[serde(default = "default_manual_patterns")]
    pub manual_patterns: Vec<String>,
    /// More hunks than this in one file escalates to manual.
    #[serde(default = "default_max_assisted_hunks")]
    pub max_assisted_hunks: usize,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            generated_patterns: default_generated_patterns(),
            manual_patterns: default_manual_patterns(),
            max_assisted_hunks: default_max_assisted_hunks(),
        }
    }
}

impl ConflictConfig {
    pub fn rules(&self) -> Result<ConflictRules> {
        ConflictRules::from_patterns(
            &self.generated_patterns,
            &self.manual_patterns,
            self.max_assisted_hunks,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub policy: SchedulePolicy,
    /// Branch tasks start from and merge into. Defaults to the current HEAD.
    #[serde(default)]
    pub base_branch: Option<String>,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_missed_heartbeats")]
    pub missed_heartbeats: u32,
    #[serde(default = "default_retire_after_failures")]
    pub retire_after_failures: u32,
    /// Start a replacement when a worker is retired.
    #[serde(default = "default_true")]
    pub replace_retired: bool,
    /// How long ready tasks may wait with no live worker before the run fails.
    #[serde(default = "default_starvation_timeout_secs")]
    pub starvation_timeout_secs: u64,
    #[serde(default = "default_git_timeout_secs")]
    pub git_timeout_secs: u64,
    pub worktree_dir: Option<String>,
    pub state_file: Option<String>,
    pub socket_path: Option<String>,
    #[serde(default = "default_agent_command")]
    pub agent_command: String,
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
    #[serde(default)]
    pub conflicts: ConflictConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            policy: SchedulePolicy::default(),
            base_branch: None,
            task_timeout_secs: default_task_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            missed_heartbeats: default_missed_heartbeats(),
            retire_after_failures: default_retire_after_failures(),
            replace_retired: true,
            starvation_timeout_secs: default_starvation_timeout_secs(),
            git_timeout_secs: default_git_timeout_secs(),
            worktree_dir: None,
            state_file: None,
            socket_path: None,
            agent_command: default_agent_command(),
            session_prefix: default_session_prefix(),
            conflicts: ConflictConfig::default(),
        }
    }
}

impl Config {
    pub fn maestro_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".maestro"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::maestro_dir()?.join("maestro.toml"))
    }

    pub fn state_path(&self) -> Result<PathBuf> {
        self.path_or_default(self.state_file.as_deref(), "state.json")
    }

    pub fn socket_path(&self) -> Result<PathBuf> {
        self.path_or_default(self.socket_path.as_deref(), "maestro.sock")
    }

    pub fn worktrees_dir(&self) -> Result<PathBuf> {
        self.path_or_default(self.worktree_dir.as_deref(), "worktrees")
    }

    fn path_or_default(&self, configured: Option<&str>, default: &str) -> Result<PathBuf> {
        match configured {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::maestro_dir()?.join(default)),
        }
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn starvation_timeout(&self) -> Duration {
        Duration::from_secs(self.starvation_timeout_secs)
    }

    pub fn health(&self) -> HealthConfig {
        HealthConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs.max(1)),
            missed_heartbeats: self.missed_heartbeats,
            retire_after_failures: self.retire_after_failures,
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        mlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            mlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        mlog_debug!(
            "Config loaded: workers={}, policy={}, agent_command={}",
            config.workers,
            config.policy,
            config.agent_command
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::Validation("workers must be at least 1".to_string()));
        }
        if self.task_timeout_secs == 0 {
            return Err(Error::Validation(
                "task_timeout_secs must be positive".to_string(),
            ));
        }
        if self.missed_heartbeats == 0 {
            return Err(Error::Validation(
                "missed_heartbeats must be at least 1".to_string(),
            ));
        }
        self.conflicts.rules()?;
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        let maestro_dir = Self::maestro_dir()?;
        mlog_debug!("Config::save dir={}", maestro_dir.display());
        if !maestro_dir.exists() {
            fs::create_dir_all(&maestro_dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        mlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let maestro_dir = Self::maestro_dir()?;
        let worktrees_dir = self.worktrees_dir()?;
        mlog_debug!(
            "Config::ensure_dirs maestro={} worktrees={}",
            maestro_dir.display(),
            worktrees_dir.display()
        );
        for dir in [&maestro_dir, &worktrees_dir] {
            if !dir.exists() {
                mlog_debug!("Creating directory: {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        for file in [self.state_path()?, self.socket_path()?] {
            if let Some(parent) = file.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
