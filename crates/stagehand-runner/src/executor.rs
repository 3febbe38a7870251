//! The executor abstraction shared by every backend.

use crate::cluster::ClusterExecutor;
use crate::config::{BackendKind, ExecutorSettings, RunnerConfig};
use crate::local::LocalExecutor;
use crate::probe::ProbeExecutor;
use crate::sink::SharedSink;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagehand_core::command::{CMD_EXIT_FILENAME, CMD_FILENAME};
use stagehand_core::{Command, CommandStatus, Error, ExecutorOptions, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

/// One externally running unit of work.
///
/// All methods take `&self` so that `status` can be read while another task
/// sits in `wait_for`.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Launch the command. May be called once per executor.
    async fn start(
        &self,
        options: &ExecutorOptions,
        command: &Command,
        stdout: SharedSink,
        stderr: SharedSink,
    ) -> Result<()>;

    /// Current status, without blocking. `Unknown` before `start`.
    fn status(&self) -> CommandStatus;

    /// Wait for a terminal state and return the exit code.
    async fn wait_for(&self) -> Result<i32>;

    /// Ask the backend to terminate the command. Best effort.
    async fn stop(&self) -> Result<()>;

    /// Release backend-side resources after `wait_for`. Idempotent.
    async fn cleanup(&self) -> Result<()>;

    /// One line describing the job for humans.
    fn status_message(&self) -> String;

    /// Files the executor writes itself that are never pipeline outputs.
    fn ignorable_outputs(&self) -> Vec<String>;
}

/// An executor bound to one of the supported backends.
///
/// This is the form executors are persisted in. Anything only meaningful
/// inside the current process is skipped and rebuilt by [`Executor::rehydrate`].
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum Executor {
    Local(LocalExecutor),
    Cluster(ClusterExecutor),
    Probe(ProbeExecutor),
}

impl Executor {
    /// A fresh executor for the configured backend.
    pub fn from_config(config: &RunnerConfig) -> Result<Self> {
        let settings = config.settings();
        match config.backend {
            BackendKind::Local => Ok(Executor::Local(LocalExecutor::new())),
            BackendKind::Probe => Ok(Executor::Probe(ProbeExecutor::new())),
            BackendKind::Cluster => {
                let script = config.cluster_script.clone().ok_or_else(|| {
                    Error::Config("the cluster backend requires cluster_script".to_string())
                })?;
                Ok(Executor::Cluster(ClusterExecutor::new(script, settings)))
            }
        }
    }

    pub fn backend(&self) -> BackendKind {
        match self {
            Executor::Local(_) => BackendKind::Local,
            Executor::Cluster(_) => BackendKind::Cluster,
            Executor::Probe(_) => BackendKind::Probe,
        }
    }

    /// Reattach to the job after loading this executor from disk.
    pub async fn rehydrate(&self, settings: ExecutorSettings) -> Result<()> {
        match self {
            Executor::Local(e) => e.rehydrate(settings).await,
            Executor::Cluster(e) => e.rehydrate(settings).await,
            Executor::Probe(_) => Ok(()),
        }
    }

    fn inner(&self) -> &dyn CommandExecutor {
        match self {
            Executor::Local(e) => e,
            Executor::Cluster(e) => e,
            Executor::Probe(e) => e,
        }
    }
}

#[async_trait]
impl CommandExecutor for Executor {
    async fn start(
        &self,
        options: &ExecutorOptions,
        command: &Command,
        stdout: SharedSink,
        stderr: SharedSink,
    ) -> Result<()> {
        self.inner().start(options, command, stdout, stderr).await
    }

    fn status(&self) -> CommandStatus {
        self.inner().status()
    }

    async fn wait_for(&self) -> Result<i32> {
        self.inner().wait_for().await
    }

    async fn stop(&self) -> Result<()> {
        self.inner().stop().await
    }

    async fn cleanup(&self) -> Result<()> {
        self.inner().cleanup().await
    }

    fn status_message(&self) -> String {
        self.inner().status_message()
    }

    fn ignorable_outputs(&self) -> Vec<String> {
        self.inner().ignorable_outputs()
    }
}

/// Wait for `executor`, stopping it if it outlives `limit`.
///
/// A failure to stop is logged and does not replace the timeout error.
pub async fn wait_with_timeout(executor: &dyn CommandExecutor, limit: Duration) -> Result<i32> {
    match timeout(limit, executor.wait_for()).await {
        Ok(result) => result,
        Err(_) => {
            warn!(timeout_secs = limit.as_secs(), "Command timed out, stopping it");
            if let Err(e) = executor.stop().await {
                warn!(error = %e, "Failed to stop timed out command");
            }
            Err(Error::Timeout {
                seconds: limit.as_secs(),
            })
        }
    }
}

/// Write the command's script into its job directory.
pub(crate) async fn write_run_script(job_dir: &Path, script: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(job_dir).await?;
    let path = job_dir.join(CMD_FILENAME);
    let mut contents = script.to_string();
    if !contents.ends_with('\n') {
        contents.push('\n');
    }
    tokio::fs::write(&path, contents).await?;
    info!(script = %path.display(), "Wrote command script");
    Ok(path)
}

/// Exit code left in the job directory, if the job got that far.
pub(crate) async fn read_exit_file(job_dir: &Path) -> Result<Option<i32>> {
    match tokio::fs::read_to_string(job_dir.join(CMD_EXIT_FILENAME)).await {
        Ok(contents) => contents
            .trim()
            .parse::<i32>()
            .map(Some)
            .map_err(|e| Error::Backend(format!("Malformed exit code file: {}", e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Environment describing a job to the process that runs it.
///
/// Command options override the executor-wide ones.
pub(crate) fn job_environment(
    options: &ExecutorOptions,
    command: &Command,
    script: &Path,
) -> Vec<(String, String)> {
    let mut env = vec![
        ("STAGEHAND_COMMAND".to_string(), script.display().to_string()),
        ("STAGEHAND_NAME".to_string(), command.name.clone()),
        (
            "STAGEHAND_JOB_DIR".to_string(),
            command.job_dir().display().to_string(),
        ),
    ];
    let mut merged = options.clone();
    merged.extend(command.options.clone());
    for (key, value) in merged {
        env.push((format!("STAGEHAND_OPT_{}", option_env_key(&key)), value));
    }
    env
}

pub(crate) fn option_env_key(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Signal a whole process group with the system `kill` utility.
pub(crate) async fn kill_process_group(pgid: u32, signal: &str) -> Result<()> {
    let status = tokio::process::Command::new("kill")
        .arg(format!("-{}", signal))
        .arg("--")
        .arg(format!("-{}", pgid))
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::Backend(format!(
            "kill -{} of process group {} failed with {}",
            signal, pgid, status
        )))
    }
}

/// Whether a process with this id is still around.
pub(crate) async fn process_alive(pid: u32) -> bool {
    tokio::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Remove a job directory, treating an already-missing one as success.
pub(crate) async fn remove_job_dir(job_dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(job_dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
