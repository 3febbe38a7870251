//! Commands handed to executors.

use crate::ids::CommandId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Captured standard output of a command.
pub const CMD_OUT_FILENAME: &str = "cmd.out";

/// Captured standard error of a command.
pub const CMD_ERR_FILENAME: &str = "cmd.err";

/// File the exit code of a command is written to.
pub const CMD_EXIT_FILENAME: &str = "cmd.exit";

/// Script containing the command actually executed.
pub const CMD_FILENAME: &str = "cmd_run.sh";

/// Transcript of every command a pipeline ran.
pub const COMMAND_LOG_FILENAME: &str = "commandlog.txt";

/// Default resource category every command draws from.
pub const THREADS: &str = "threads";

/// Backend options passed through to an executor untouched.
pub type ExecutorOptions = BTreeMap<String, String>;

/// Amount of each resource category a command needs while it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceRequest(BTreeMap<String, u32>);

impl ResourceRequest {
    /// An empty request. Commands built with [`Command::new`] ask for one thread.
    pub fn none() -> Self {
        Self(BTreeMap::new())
    }

    pub fn threads(amount: u32) -> Self {
        Self::none().with(THREADS, amount)
    }

    pub fn with(mut self, category: impl Into<String>, amount: u32) -> Self {
        self.0.insert(category.into(), amount);
        self
    }

    pub fn amount(&self, category: &str) -> u32 {
        self.0.get(category).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| *v == 0)
    }
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self::threads(1)
    }
}

/// One invocation of an external process implementing a stage.
///
/// Owned by the driver and handed to exactly one executor at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: CommandId,
    /// Name of the stage the command belongs to.
    pub name: String,
    pub script: String,
    pub work_dir: PathBuf,
    #[serde(default)]
    pub resources: ResourceRequest,
    #[serde(default)]
    pub options: ExecutorOptions,
}

impl Command {
    pub fn new(name: impl Into<String>, script: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: CommandId::new(),
            name: name.into(),
            script: script.into(),
            work_dir: work_dir.into(),
            resources: ResourceRequest::default(),
            options: ExecutorOptions::new(),
        }
    }

    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Directory holding the bookkeeping files for this command.
    pub fn job_dir(&self) -> PathBuf {
        self.work_dir
            .join(".stagehand")
            .join("commands")
            .join(self.id.to_string())
    }
}

/// Every bookkeeping file name an executor may create next to real outputs.
pub fn bookkeeping_files() -> Vec<String> {
    [CMD_OUT_FILENAME, CMD_ERR_FILENAME, CMD_EXIT_FILENAME, CMD_FILENAME]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
