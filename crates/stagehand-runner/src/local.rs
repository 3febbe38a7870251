//! Executes commands as child processes of this host.
//!
//! Each job runs `bash` on a wrapper that executes the command script and
//! records its exit code in the job directory, so a later process can
//! reattach after this one is gone. Jobs get their own process group and
//! [`stop`](CommandExecutor::stop) signals the group. Descendants that move
//! to another group or session are out of reach and may survive.

use crate::config::ExecutorSettings;
use crate::executor::{
    CommandExecutor, job_environment, kill_process_group, process_alive, read_exit_file,
    remove_job_dir, write_run_script,
};
use crate::relay::relay_output;
use crate::sink::SharedSink;
use crate::tracker::StatusTracker;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use stagehand_core::command::{CMD_EXIT_FILENAME, bookkeeping_files};
use stagehand_core::{Command, CommandId, CommandStatus, Error, ExecutorOptions, Result};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Runs the script given as `$1` and writes its exit code to `$2`.
const WRAPPER: &str = r#"bash "$1"; code=$?; printf '%s\n' "$code" > "$2"; exit "$code""#;

/// The persisted part of a launched job.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalJob {
    command_id: CommandId,
    name: String,
    job_dir: PathBuf,
    pid: Option<u32>,
}

#[derive(Serialize, Deserialize)]
struct LocalSnapshot {
    job: Option<LocalJob>,
    status: CommandStatus,
    exit_code: Option<i32>,
}

/// Executor for processes on the local host.
#[derive(Debug, Default)]
pub struct LocalExecutor {
    job: Mutex<Option<LocalJob>>,
    tracker: StatusTracker,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn job(&self) -> Option<LocalJob> {
        self.job.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Pick up a job launched by an earlier process.
    ///
    /// The exit code file wins if present. Otherwise a live process is
    /// watched until the file appears, and a job with neither is reported
    /// `Unknown` and failed once the grace period runs out.
    pub async fn rehydrate(&self, settings: ExecutorSettings) -> Result<()> {
        let Some(job) = self.job() else {
            return Ok(());
        };
        if self.tracker.status().is_terminal() {
            return Ok(());
        }
        if let Some(code) = read_exit_file(&job.job_dir).await? {
            info!(command = %job.name, exit_code = code, "Reattached to finished local job");
            self.tracker.complete(code);
            return Ok(());
        }
        match job.pid {
            Some(pid) if process_alive(pid).await => {
                info!(command = %job.name, pid, "Reattached to running local job");
                self.tracker.advance(CommandStatus::Running);
            }
            _ => {
                warn!(command = %job.name, "Local job has no exit code and no process");
                self.tracker.advance(CommandStatus::Unknown);
            }
        }
        tokio::spawn(watch_detached(self.tracker.clone(), job, settings));
        Ok(())
    }

    async fn launch(
        &self,
        options: &ExecutorOptions,
        command: &Command,
        job_dir: &Path,
        stdout: SharedSink,
        stderr: SharedSink,
    ) -> Result<()> {
        let script = write_run_script(job_dir, &command.script).await?;
        let exit_file = job_dir.join(CMD_EXIT_FILENAME);

        let mut process = std::process::Command::new("bash");
        process
            .arg("-c")
            .arg(WRAPPER)
            .arg("stagehand")
            .arg(&script)
            .arg(&exit_file)
            .current_dir(&command.work_dir)
            .envs(job_environment(options, command, &script))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        let mut child = tokio::process::Command::from(process)
            .spawn()
            .map_err(|e| Error::Backend(format!("Failed to spawn bash: {}", e)))?;

        let pid = child.id();
        if let Some(job) = self
            .job
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            job.pid = pid;
        }

        let child_stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("child stdout was not piped".to_string()))?;
        let child_stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("child stderr was not piped".to_string()))?;
        let relay = relay_output(&command.name, child_stdout, child_stderr, stdout, stderr);

        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
        *self.kill.lock().unwrap_or_else(PoisonError::into_inner) = Some(kill_tx);

        self.tracker.advance(CommandStatus::Running);
        info!(command = %command.name, id = %command.id, pid = ?pid, "Started local command");

        let tracker = self.tracker.clone();
        let name = command.name.clone();
        tokio::spawn(async move {
            let waited = tokio::select! {
                status = child.wait() => status,
                Ok(()) = &mut kill_rx => {
                    let signalled = match pid {
                        Some(pid) => kill_process_group(pid, "TERM").await,
                        None => Err(Error::Backend("no pid".to_string())),
                    };
                    if let Err(e) = signalled {
                        debug!(command = %name, error = %e, "Group kill failed, killing child");
                        if let Err(e) = child.start_kill() {
                            warn!(command = %name, error = %e, "Failed to kill local command");
                        }
                    }
                    child.wait().await
                }
            };
            tracker.advance(CommandStatus::Exiting);
            relay.join().await;
            let code = match waited {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!(command = %name, error = %e, "Failed to wait for local command");
                    -1
                }
            };
            info!(command = %name, exit_code = code, "Local command exited");
            tracker.complete(code);
        });

        Ok(())
    }

    fn snapshot(&self) -> LocalSnapshot {
        let snapshot = self.tracker.snapshot();
        LocalSnapshot {
            job: self.job(),
            status: snapshot.status,
            exit_code: snapshot.exit_code,
        }
    }

    fn from_snapshot(snapshot: LocalSnapshot) -> Self {
        let tracker = StatusTracker::restored(snapshot.status, snapshot.exit_code);
        Self {
            job: Mutex::new(snapshot.job),
            tracker,
            kill: Mutex::new(None),
        }
    }
}

#[async_trait]
impl CommandExecutor for LocalExecutor {
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
            *job = Some(LocalJob {
                command_id: command.id,
                name: command.name.clone(),
                job_dir: job_dir.clone(),
                pid: None,
            });
        }

        let launched = self.launch(options, command, &job_dir, stdout, stderr).await;
        if launched.is_err() {
            *self.job.lock().unwrap_or_else(PoisonError::into_inner) = None;
        }
        launched
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
        let Some(job) = self.job() else {
            return Err(Error::NotStarted);
        };
        if self.tracker.status().is_terminal() {
            return Ok(());
        }
        let sender = self.kill.lock().unwrap_or_else(PoisonError::into_inner).take();
        match (sender, job.pid) {
            (Some(tx), _) => {
                info!(command = %job.name, "Stopping local command");
                // The monitor may have finished already.
                let _ = tx.send(());
                Ok(())
            }
            (None, Some(pid)) => {
                info!(command = %job.name, pid, "Stopping reattached local command");
                kill_process_group(pid, "TERM").await
            }
            (None, None) => Ok(()),
        }
    }

    async fn cleanup(&self) -> Result<()> {
        let Some(job) = self.job() else {
            return Ok(());
        };
        remove_job_dir(&job.job_dir).await?;
        debug!(job_dir = %job.job_dir.display(), "Removed local job directory");
        Ok(())
    }

    fn status_message(&self) -> String {
        match self.job() {
            Some(LocalJob {
                name,
                pid: Some(pid),
                ..
            }) => format!("local job {} (pid {}): {}", name, pid, self.status()),
            Some(job) => format!("local job {}: {}", job.name, self.status()),
            None => "local job (not started)".to_string(),
        }
    }

    fn ignorable_outputs(&self) -> Vec<String> {
        bookkeeping_files()
    }
}

/// Poll a job this process did not spawn until it has an exit code.
async fn watch_detached(tracker: StatusTracker, job: LocalJob, settings: ExecutorSettings) {
    let mut lost_since: Option<Instant> = None;
    loop {
        if tracker.status().is_terminal() {
            return;
        }
        match read_exit_file(&job.job_dir).await {
            Ok(Some(code)) => {
                info!(command = %job.name, exit_code = code, "Detached local job finished");
                tracker.complete(code);
                return;
            }
            Ok(None) => {}
            Err(e) => warn!(command = %job.name, error = %e, "Failed to read exit code"),
        }

        let alive = match job.pid {
            Some(pid) => process_alive(pid).await,
            None => false,
        };
        if alive {
            lost_since = None;
            tracker.advance(CommandStatus::Running);
        } else {
            let since = *lost_since.get_or_insert_with(Instant::now);
            tracker.advance(CommandStatus::Unknown);
            if since.elapsed() >= settings.unknown_grace && exit_file_missing(&job.job_dir).await {
                warn!(command = %job.name, "Local job lost, declaring it failed");
                tracker.complete(-1);
                return;
            }
        }
        tokio::time::sleep(settings.poll_interval).await;
    }
}

async fn exit_file_missing(job_dir: &Path) -> bool {
    !matches!(read_exit_file(job_dir).await, Ok(Some(_)))
}

impl Serialize for LocalExecutor {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LocalExecutor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        LocalSnapshot::deserialize(deserializer).map(Self::from_snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{NullSink, SharedBuffer};
    use std::sync::Arc;
    use std::time::Duration;

    fn fast() -> ExecutorSettings {
        ExecutorSettings {
            poll_interval: Duration::from_millis(20),
            unknown_grace: Duration::from_millis(200),
        }
    }

    async fn run(executor: &LocalExecutor, command: &Command) -> (i32, String, String) {
        let out = SharedBuffer::new();
        let err = SharedBuffer::new();
        executor
            .start(
                &ExecutorOptions::new(),
                command,
                Arc::new(out.clone()),
                Arc::new(err.clone()),
            )
            .await
            .unwrap();
        let code = executor.wait_for().await.unwrap();
        (code, out.contents(), err.contents())
    }

    #[tokio::test]
    async fn test_echo_is_relayed() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();
        let command = Command::new("hello", "echo hello\necho oops >&2", dir.path());

        let (code, out, err) = run(&executor, &command).await;
        assert_eq!(code, 0);
        assert_eq!(out, "hello\n");
        assert_eq!(err, "oops\n");
        assert_eq!(executor.status(), CommandStatus::Complete);
    }

    #[tokio::test]
    async fn test_nonzero_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();
        let command = Command::new("fails", "exit 3", dir.path());

        let (code, _, _) = run(&executor, &command).await;
        assert_eq!(code, 3);
        assert_eq!(executor.wait_for().await.unwrap(), 3);

        let recorded = std::fs::read_to_string(command.job_dir().join(CMD_EXIT_FILENAME)).unwrap();
        assert_eq!(recorded.trim(), "3");
    }

    #[tokio::test]
    async fn test_runs_in_work_dir_with_options() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();
        let command = Command::new("env", "pwd\necho \"$STAGEHAND_OPT_QUEUE\"", dir.path())
            .with_option("queue", "short");

        let (code, out, _) = run(&executor, &command).await;
        assert_eq!(code, 0);
        let expected_dir = dir.path().canonicalize().unwrap();
        let mut lines = out.lines();
        assert_eq!(Path::new(lines.next().unwrap()).canonicalize().unwrap(), expected_dir);
        assert_eq!(lines.next(), Some("short"));
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();
        assert_eq!(executor.status(), CommandStatus::Unknown);
        assert!(matches!(executor.wait_for().await, Err(Error::NotStarted)));

        let command = Command::new("twice", "true", dir.path());
        executor
            .start(&ExecutorOptions::new(), &command, Arc::new(NullSink), Arc::new(NullSink))
            .await
            .unwrap();
        let again = executor
            .start(&ExecutorOptions::new(), &command, Arc::new(NullSink), Arc::new(NullSink))
            .await;
        assert!(matches!(again, Err(Error::AlreadyStarted(_))));
        assert_eq!(executor.wait_for().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();
        let command = Command::new("clean", "true", dir.path());
        run(&executor, &command).await;

        assert!(command.job_dir().exists());
        executor.cleanup().await.unwrap();
        executor.cleanup().await.unwrap();
        assert!(!command.job_dir().exists());
    }

    #[tokio::test]
    async fn test_rehydrate_running_job() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();
        let command = Command::new("slow", "sleep 0.5\nexit 4", dir.path());
        executor
            .start(&ExecutorOptions::new(), &command, Arc::new(NullSink), Arc::new(NullSink))
            .await
            .unwrap();

        let saved = serde_json::to_string(&executor).unwrap();
        let restored: LocalExecutor = serde_json::from_str(&saved).unwrap();
        restored.rehydrate(fast()).await.unwrap();

        let code = tokio::time::timeout(Duration::from_secs(10), restored.wait_for())
            .await
            .expect("reattached job completes")
            .unwrap();
        assert_eq!(code, 4);
    }

    #[tokio::test]
    async fn test_rehydrate_lost_job_fails_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new();
        let command = Command::new("lost", "true", dir.path());
        run(&executor, &command).await;
        std::fs::remove_file(command.job_dir().join(CMD_EXIT_FILENAME)).unwrap();

        let mut saved = serde_json::to_value(&executor).unwrap();
        saved["status"] = serde_json::json!("RUNNING");
        saved["exit_code"] = serde_json::Value::Null;
        let restored: LocalExecutor = serde_json::from_value(saved).unwrap();
        restored.rehydrate(fast()).await.unwrap();
        assert_eq!(restored.status(), CommandStatus::Unknown);

        let code = tokio::time::timeout(Duration::from_secs(10), restored.wait_for())
            .await
            .expect("lost job is declared failed")
            .unwrap();
        assert_eq!(code, -1);
    }
}
