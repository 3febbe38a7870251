//! Executes commands through an external batch scheduler.
//!
//! The scheduler is driven by a backend script that speaks a small
//! protocol:
//!
//! - `<script> start` submits the job described by the `STAGEHAND_*`
//!   environment and prints its job id.
//! - `<script> status <job>` prints a status word, optionally followed by
//!   the exit code once the job is complete.
//! - `<script> stop <job>` cancels the job.
//!
//! The job is expected to leave its output in `cmd.out` and `cmd.err` in the
//! job directory. Both are relayed to the command's sinks on completion.

use crate::config::ExecutorSettings;
use crate::executor::{
    CommandExecutor, job_environment, option_env_key, read_exit_file, remove_job_dir,
    write_run_script,
};
use crate::relay::relay_output;
use crate::sink::SharedSink;
use crate::tracker::StatusTracker;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use stagehand_core::command::{CMD_ERR_FILENAME, CMD_OUT_FILENAME, bookkeeping_files};
use stagehand_core::{Command, CommandId, CommandStatus, Error, ExecutorOptions, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClusterJob {
    command_id: CommandId,
    name: String,
    job_dir: PathBuf,
    job_id: Option<String>,
    #[serde(default)]
    options: ExecutorOptions,
}

impl ClusterJob {
    /// Environment for the `status` and `stop` verbs.
    fn environment(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("STAGEHAND_NAME".to_string(), self.name.clone()),
            (
                "STAGEHAND_JOB_DIR".to_string(),
                self.job_dir.display().to_string(),
            ),
        ];
        for (key, value) in &self.options {
            env.push((format!("STAGEHAND_OPT_{}", option_env_key(key)), value.clone()));
        }
        env
    }
}

#[derive(Serialize, Deserialize)]
struct ClusterSnapshot {
    script: PathBuf,
    job: Option<ClusterJob>,
    status: CommandStatus,
    exit_code: Option<i32>,
}

/// Executor submitting commands to a batch scheduler via a backend script.
#[derive(Debug)]
pub struct ClusterExecutor {
    script: PathBuf,
    settings: ExecutorSettings,
    job: Mutex<Option<ClusterJob>>,
    tracker: StatusTracker,
}

impl ClusterExecutor {
    pub fn new(script: impl Into<PathBuf>, settings: ExecutorSettings) -> Self {
        Self {
            script: script.into(),
            settings,
            job: Mutex::new(None),
            tracker: StatusTracker::default(),
        }
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    pub fn job_id(&self) -> Option<String> {
        self.job().and_then(|job| job.job_id)
    }

    fn job(&self) -> Option<ClusterJob> {
        self.job.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Resume polling a job submitted by an earlier process.
    ///
    /// Output of a reattached job stays in its job directory.
    pub async fn rehydrate(&self, settings: ExecutorSettings) -> Result<()> {
        let Some(job) = self.job() else {
            return Ok(());
        };
        if job.job_id.is_none() || self.tracker.status().is_terminal() {
            return Ok(());
        }
        info!(command = %job.name, job_id = ?job.job_id, "Reattached to cluster job");
        tokio::spawn(poll_job(
            self.script.clone(),
            job,
            self.tracker.clone(),
            settings,
            None,
        ));
        Ok(())
    }

    async fn submit(
        &self,
        options: &ExecutorOptions,
        command: &Command,
        job_dir: &Path,
        stdout: SharedSink,
        stderr: SharedSink,
    ) -> Result<()> {
        let script = write_run_script(job_dir, &command.script).await?;
        let env = job_environment(options, command, &script);
        let printed = invoke(&self.script, &["start"], &env).await?;
        let job_id = printed
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| Error::Backend("backend start printed no job id".to_string()))?
            .to_string();

        let job = {
            let mut guard = self.job.lock().unwrap_or_else(PoisonError::into_inner);
            let job = guard
                .as_mut()
                .ok_or_else(|| Error::Internal("cluster job vanished during start".to_string()))?;
            job.job_id = Some(job_id.clone());
            job.clone()
        };

        self.tracker.advance(CommandStatus::Queueing);
        info!(command = %command.name, id = %command.id, job_id = %job_id, "Submitted cluster job");

        tokio::spawn(poll_job(
            self.script.clone(),
            job,
            self.tracker.clone(),
            self.settings,
            Some((stdout, stderr)),
        ));
        Ok(())
    }

    fn snapshot(&self) -> ClusterSnapshot {
        let snapshot = self.tracker.snapshot();
        ClusterSnapshot {
            script: self.script.clone(),
            job: self.job(),
            status: snapshot.status,
            exit_code: snapshot.exit_code,
        }
    }

    fn from_snapshot(snapshot: ClusterSnapshot) -> Self {
        let tracker = StatusTracker::restored(snapshot.status, snapshot.exit_code);
        Self {
            script: snapshot.script,
            settings: ExecutorSettings::default(),
            job: Mutex::new(snapshot.job),
            tracker,
        }
    }
}

#[async_trait]
impl CommandExecutor for ClusterExecutor {
    async fn start(
        &self,
        options: &ExecutorOptions,
        command: &Command,
        stdout: SharedSink,
        stderr: SharedSink,
    ) -> Result<()> {
        let job_dir = command.job_dir();
        {
            let mut job = self.job.lock().unwrap_or_else(PoisonError::into_inner);
            if job.is_some() {
                return Err(Error::AlreadyStarted(command.id));
            }
            let mut merged = options.clone();
            merged.extend(command.options.clone());
            *job = Some(ClusterJob {
                command_id: command.id,
                name: command.name.clone(),
                job_dir: job_dir.clone(),
                job_id: None,
                options: merged,
            });
        }

        let submitted = self.submit(options, command, &job_dir, stdout, stderr).await;
        if submitted.is_err() {
            *self.job.lock().unwrap_or_else(PoisonError::into_inner) = None;
        }
        submitted
    }

    fn status(&self) -> CommandStatus {
        self.tracker.status()
    }

    async fn wait_for(&self) -> Result<i32> {
        if self.job().is_none() {
            return Err(Error::NotStarted);
        }
        self.tracker.wait_complete().await
    }

    async fn stop(&self) -> Result<()> {
        let job = self.job().ok_or(Error::NotStarted)?;
        if self.tracker.status().is_terminal() {
            return Ok(());
        }
        let Some(job_id) = job.job_id.as_deref() else {
            return Ok(());
        };
        info!(command = %job.name, job_id, "Cancelling cluster job");
        invoke(&self.script, &["stop", job_id], &job.environment()).await?;
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let Some(job) = self.job() else {
            return Ok(());
        };
        remove_job_dir(&job.job_dir).await
    }

    fn status_message(&self) -> String {
        match self.job() {
            Some(ClusterJob {
                name,
                job_id: Some(job_id),
                ..
            }) => format!("cluster job {} ({}): {}", job_id, name, self.status()),
            Some(job) => format!("cluster job {} (submitting)", job.name),
            None => "cluster job (not started)".to_string(),
        }
    }

    fn ignorable_outputs(&self) -> Vec<String> {
        bookkeeping_files()
    }
}

/// Run one backend protocol verb and return what it printed.
async fn invoke(script: &Path, args: &[&str], env: &[(String, String)]) -> Result<String> {
    debug!(script = %script.display(), ?args, "Invoking cluster backend");
    let output = tokio::process::Command::new(script)
        .args(args)
        .envs(env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::Backend(format!("Failed to run {}: {}", script.display(), e)))?;
    if !output.status.success() {
        return Err(Error::Backend(format!(
            "{} {} failed with {}: {}",
            script.display(),
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse a `status` reply such as `RUNNING` or `COMPLETED 0`.
fn parse_status_reply(reply: &str) -> (CommandStatus, Option<i32>) {
    let mut words = reply.split_whitespace();
    let status = words
        .next()
        .map(CommandStatus::parse_report)
        .unwrap_or(CommandStatus::Unknown);
    let code = words.next().and_then(|w| w.parse::<i32>().ok());
    (status, code)
}

async fn poll_job(
    script: PathBuf,
    job: ClusterJob,
    tracker: StatusTracker,
    settings: ExecutorSettings,
    sinks: Option<(SharedSink, SharedSink)>,
) {
    let Some(job_id) = job.job_id.clone() else {
        return;
    };
    let mut lost_since: Option<Instant> = None;
    loop {
        if tracker.status().is_terminal() {
            return;
        }
        let reply = invoke(&script, &["status", job_id.as_str()], &job.environment()).await;
        let reported = match reply {
            Ok(reply) => parse_status_reply(&reply),
            Err(e) => {
                warn!(command = %job.name, job_id = %job_id, error = %e, "Cluster status poll failed");
                (CommandStatus::Unknown, None)
            }
        };

        match reported {
            (CommandStatus::Complete, code) => {
                tracker.advance(CommandStatus::Exiting);
                let code = match code {
                    Some(code) => code,
                    None => exit_code_from_job_dir(&job).await,
                };
                if let Some((out, err)) = &sinks {
                    relay_job_files(&job, out.clone(), err.clone()).await;
                }
                info!(command = %job.name, job_id = %job_id, exit_code = code, "Cluster job completed");
                tracker.complete(code);
                return;
            }
            (CommandStatus::Unknown, _) => {
                let since = *lost_since.get_or_insert_with(Instant::now);
                tracker.advance(CommandStatus::Unknown);
                if since.elapsed() >= settings.unknown_grace {
                    warn!(command = %job.name, job_id = %job_id, "Cluster job lost, declaring it failed");
                    tracker.complete(-1);
                    return;
                }
            }
            (status, _) => {
                lost_since = None;
                tracker.advance(status);
            }
        }
        tokio::time::sleep(settings.poll_interval).await;
    }
}

async fn exit_code_from_job_dir(job: &ClusterJob) -> i32 {
    match read_exit_file(&job.job_dir).await {
        Ok(Some(code)) => code,
        Ok(None) => {
            warn!(command = %job.name, "Cluster job completed without an exit code");
            -1
        }
        Err(e) => {
            warn!(command = %job.name, error = %e, "Failed to read cluster job exit code");
            -1
        }
    }
}

async fn open_or_empty(path: PathBuf) -> Box<dyn AsyncRead + Unpin + Send> {
    match tokio::fs::File::open(&path).await {
        Ok(file) => Box::new(file),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "No job output file");
            Box::new(tokio::io::empty())
        }
    }
}

async fn relay_job_files(job: &ClusterJob, out: SharedSink, err: SharedSink) {
    let stdout = open_or_empty(job.job_dir.join(CMD_OUT_FILENAME)).await;
    let stderr = open_or_empty(job.job_dir.join(CMD_ERR_FILENAME)).await;
    relay_output(&job.name, stdout, stderr, out, err).join().await;
}

impl Serialize for ClusterExecutor {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ClusterExecutor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        ClusterSnapshot::deserialize(deserializer).map(Self::from_snapshot)
    }
}
