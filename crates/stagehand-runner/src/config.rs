//! Runner configuration.

use serde::{Deserialize, Serialize};
use stagehand_core::{Error, ExecutorOptions, Result};
use stagehand_scheduler::ResourcePool;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which backend commands are executed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Local,
    Cluster,
    Probe,
}

/// Runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Backend new commands run on.
    #[serde(default)]
    pub backend: BackendKind,
    /// Script implementing the cluster backend protocol.
    #[serde(default)]
    pub cluster_script: Option<PathBuf>,
    /// Capacity of each resource category.
    #[serde(default)]
    pub resources: ResourcePool,
    /// Options passed to every executor, overridden by per-command options.
    #[serde(default)]
    pub options: ExecutorOptions,
    /// Interval between backend status polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long a job may stay unaccounted for before it is declared failed.
    #[serde(default = "default_unknown_grace_secs")]
    pub unknown_grace_secs: u64,
    /// Where running executors are persisted for reattachment.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Per-command wall-clock limit.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Report what would run instead of running it.
    #[serde(default)]
    pub dry_run: bool,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_unknown_grace_secs() -> u64 {
    300
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".stagehand/state")
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            cluster_script: None,
            resources: ResourcePool::default(),
            options: ExecutorOptions::new(),
            poll_interval_ms: default_poll_interval_ms(),
            unknown_grace_secs: default_unknown_grace_secs(),
            state_dir: default_state_dir(),
            timeout_seconds: None,
            dry_run: false,
        }
    }
}

impl RunnerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend == BackendKind::Cluster && self.cluster_script.is_none() {
            return Err(Error::Config(
                "the cluster backend requires cluster_script".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            unknown_grace: Duration::from_secs(self.unknown_grace_secs),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}

/// Timing knobs handed to executors. Not persisted with them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorSettings {
    pub poll_interval: Duration,
    pub unknown_grace: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        RunnerConfig::default().settings()
    }
}
