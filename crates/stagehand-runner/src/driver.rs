//! Runs stage commands: up-to-date checks, resource acquisition, execution
//! and output bookkeeping.

use crate::config::RunnerConfig;
use crate::executor::{CommandExecutor, Executor, wait_with_timeout};
use crate::outputs::{
    OutputMatcher, TimestampMap, missing_files, outputs_up_to_date, scan_output_directory,
    timestamp_path,
};
use crate::sink::{FileSink, NullSink, OutputSink, SharedSink};
use crate::store::ExecutorStore;
use chrono::Utc;
use stagehand_core::command::COMMAND_LOG_FILENAME;
use stagehand_core::events::{EventRecord, PipelineEvent};
use stagehand_core::failure::join_branches;
use stagehand_core::glob::GlobCache;
use stagehand_core::ports::EventBus;
use stagehand_core::{BranchFailure, Command, CommandId, Error, PipelineError, TestAbort};
use stagehand_scheduler::{ResourceBidder, ResourceRequestor};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// A command plus the files it reads and writes, relative to its work dir.
#[derive(Debug, Clone)]
pub struct StageCommand {
    pub command: Command,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl StageCommand {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs.extend(inputs.into_iter().map(Into::into));
        self
    }

    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs.extend(outputs.into_iter().map(Into::into));
        self
    }
}

/// What running a stage command amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub command_id: CommandId,
    /// The outputs were already up to date and nothing ran.
    pub skipped: bool,
    pub exit_code: Option<i32>,
    /// Every file the command created or modified.
    pub new_outputs: Vec<PathBuf>,
    /// The subset of `new_outputs` matching the declared outputs.
    pub declared_outputs: Vec<PathBuf>,
}

impl CommandOutcome {
    fn skipped(command_id: CommandId) -> Self {
        Self {
            command_id,
            skipped: true,
            exit_code: None,
            new_outputs: Vec::new(),
            declared_outputs: Vec::new(),
        }
    }
}

/// Drives stage commands through the configured backend.
pub struct StageDriver {
    config: RunnerConfig,
    bidder: ResourceBidder,
    events: Arc<dyn EventBus>,
    store: Option<ExecutorStore>,
    globs: GlobCache,
    stdout: SharedSink,
    stderr: SharedSink,
    timestamps: Mutex<()>,
}

impl StageDriver {
    pub fn new(config: RunnerConfig, events: Arc<dyn EventBus>) -> Self {
        let bidder = ResourceBidder::new(config.resources.clone());
        Self {
            config,
            bidder,
            events,
            store: None,
            globs: GlobCache::new(),
            stdout: Arc::new(NullSink),
            stderr: Arc::new(NullSink),
            timestamps: Mutex::new(()),
        }
    }

    /// Share a bidder with other drivers instead of owning one.
    pub fn with_bidder(mut self, bidder: ResourceBidder) -> Self {
        self.bidder = bidder;
        self
    }

    /// Persist running executors so they can be reattached to.
    pub fn with_store(mut self, store: ExecutorStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_output(mut self, stdout: SharedSink, stderr: SharedSink) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn bidder(&self) -> &ResourceBidder {
        &self.bidder
    }

    fn publish(&self, event: PipelineEvent, command: &Command, description: String) {
        self.events.publish(
            EventRecord::new(event, description)
                .with_detail("stage", command.name.clone())
                .with_detail("command", command.id.to_string()),
        );
    }

    /// Report an executor or bidder fault as the end of the command.
    fn failed(&self, command: &Command, e: Error) -> BranchFailure {
        error!(stage = %command.name, error = %e, "Command could not be run");
        self.publish(PipelineEvent::CommandFailed, command, e.to_string());
        e.into()
    }

    /// Run one stage command on behalf of `requestor`.
    pub async fn run_command(
        &self,
        requestor: Arc<dyn ResourceRequestor>,
        stage: StageCommand,
    ) -> Result<CommandOutcome, BranchFailure> {
        let command = &stage.command;
        let work_dir = command.work_dir.as_path();
        self.publish(
            PipelineEvent::CommandCheck,
            command,
            format!("Checking stage {}", command.name),
        );

        let missing_inputs = missing_files(work_dir, &stage.inputs).await;
        if let Some(first) = missing_inputs.first() {
            let failure = PipelineError::input_missing(
                input_type(first),
                format!(
                    "stage {} needs {} which could not be found",
                    command.name,
                    missing_inputs.join(", ")
                ),
            )
            .with_context(command.name.clone());
            warn!(stage = %command.name, missing = ?missing_inputs, "Inputs missing");
            self.publish(PipelineEvent::CommandFailed, command, failure.to_string());
            return Err(failure.into());
        }

        if outputs_up_to_date(work_dir, &stage.outputs, &stage.inputs).await {
            info!(stage = %command.name, "Outputs are up to date, skipping");
            return Ok(CommandOutcome::skipped(command.id));
        }

        if self.config.dry_run {
            let mut to_create = missing_files(work_dir, &stage.outputs).await;
            if to_create.is_empty() {
                to_create = stage.outputs.clone();
            }
            info!(stage = %command.name, outputs = ?to_create, "Dry run, not executing");
            return Err(TestAbort::new(format!(
                "Pipeline stopped before executing stage {}",
                command.name
            ))
            .with_missing_outputs(to_create)
            .into());
        }

        let grant = self
            .bidder
            .acquire(requestor, command.resources.clone())
            .await
            .map_err(|e| self.failed(command, e))?;
        debug!(stage = %command.name, bid = %grant.bid(), "Resources granted");

        let mut baseline = TimestampMap::new();
        baseline
            .record(work_dir)
            .await
            .map_err(|e| self.failed(command, e))?;
        self.log_command(command);

        let executor = Executor::from_config(&self.config).map_err(|e| self.failed(command, e))?;
        executor
            .start(
                &self.config.options,
                command,
                self.stdout.clone(),
                self.stderr.clone(),
            )
            .await
            .map_err(|e| self.failed(command, e))?;
        if let Some(store) = &self.store {
            if let Err(e) = store.save(command, &executor).await {
                warn!(stage = %command.name, error = %e, "Failed to persist executor");
            }
        }
        self.publish(
            PipelineEvent::CommandStarted,
            command,
            executor.status_message(),
        );

        let waited = match self.config.timeout() {
            Some(limit) => wait_with_timeout(&executor, limit).await,
            None => executor.wait_for().await,
        };
        grant.release();
        if let Err(e) = executor.cleanup().await {
            warn!(stage = %command.name, error = %e, "Failed to clean up after command");
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(&command.id).await {
                warn!(stage = %command.name, error = %e, "Failed to remove executor record");
            }
        }

        let exit_code = match waited {
            Ok(code) => code,
            Err(Error::Timeout { seconds }) => {
                let failure = PipelineError::new(format!(
                    "Command in stage {} did not finish within {} seconds",
                    command.name, seconds
                ))
                .with_context(command.name.clone());
                self.publish(PipelineEvent::CommandFailed, command, failure.to_string());
                return Err(failure.into());
            }
            Err(e) => return Err(self.failed(command, e)),
        };

        if exit_code != 0 {
            let failure = PipelineError::new(format!(
                "Command failed with exit status = {}:\n\n{}",
                exit_code,
                command.script.trim_end()
            ))
            .with_context(command.name.clone());
            error!(stage = %command.name, exit_code, "Command failed");
            self.events.publish(
                EventRecord::new(PipelineEvent::CommandFailed, failure.to_string())
                    .with_detail("stage", command.name.clone())
                    .with_detail("command", command.id.to_string())
                    .with_detail("exit_code", exit_code),
            );
            return Err(failure.into());
        }

        let new_outputs = scan_output_directory(work_dir, &baseline).await?;
        let matcher = OutputMatcher::new(&stage.outputs, executor.ignorable_outputs(), &self.globs)?;
        let declared_outputs: Vec<PathBuf> =
            matcher.declared(&new_outputs).into_iter().cloned().collect();
        let still_missing = missing_files(work_dir, &stage.outputs).await;
        if !still_missing.is_empty() {
            warn!(stage = %command.name, missing = ?still_missing, "Declared outputs were not created");
        }
        self.save_timestamps(work_dir).await?;

        info!(
            stage = %command.name,
            new_outputs = new_outputs.len(),
            "Command finished"
        );
        self.publish(
            PipelineEvent::CommandFinished,
            command,
            format!("Stage {} finished", command.name),
        );

        Ok(CommandOutcome {
            command_id: command.id,
            skipped: false,
            exit_code: Some(exit_code),
            new_outputs,
            declared_outputs,
        })
    }

    /// Merge the work dir's current state into its saved timestamp map.
    async fn save_timestamps(&self, work_dir: &Path) -> Result<(), BranchFailure> {
        let _guard = self.timestamps.lock().await;
        let path = timestamp_path(work_dir);
        let mut timestamps = TimestampMap::load(&path).await?;
        timestamps.record(work_dir).await?;
        timestamps.save(&path).await?;
        Ok(())
    }

    /// Append the command to the work dir's transcript.
    fn log_command(&self, command: &Command) {
        let entry = format!(
            "\n# Stage {} ({})\n{}\n",
            command.name,
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            command.script.trim_end()
        );
        let appended = FileSink::append_to(&command.work_dir.join(COMMAND_LOG_FILENAME))
            .and_then(|sink| sink.append(&entry));
        if let Err(e) = appended {
            warn!(stage = %command.name, error = %e, "Failed to write command log");
        }
    }
}

/// Category of an input, as shown in input-missing messages.
fn input_type(input: &str) -> String {
    Path::new(input)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| "file".to_string())
}

/// Run branches concurrently and join their results.
///
/// Results keep the order of `branches`. A branch task that panics is a
/// fatal failure.
pub async fn run_branches<T, F>(branches: Vec<F>) -> Result<Vec<T>, BranchFailure>
where
    T: Send + 'static,
    F: Future<Output = Result<T, BranchFailure>> + Send + 'static,
{
    let count = branches.len();
    let mut join_set = JoinSet::new();
    for (index, branch) in branches.into_iter().enumerate() {
        join_set.spawn(async move { (index, branch.await) });
    }

    let mut results = Vec::with_capacity(count);
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => {
                error!(error = %e, "Branch task failed");
                results.push((
                    usize::MAX,
                    Err(BranchFailure::Fatal(Error::Internal(format!(
                        "branch task failed: {}",
                        e
                    )))),
                ));
            }
        }
    }
    results.sort_by_key(|(index, _)| *index);
    debug!(branches = count, "All branches joined");
    join_branches(results.into_iter().map(|(_, result)| result))
}
