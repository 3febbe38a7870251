//! Command handlers.

use crate::commands::ExecArgs;
use console::{Term, style};
use futures::StreamExt;
use stagehand_core::ports::{EventBus, InMemoryEventBus};
use stagehand_core::{BranchFailure, Command, ResourceRequest};
use stagehand_runner::outputs::timestamp_path;
use stagehand_runner::{
    CommandExecutor, CommandRecord, ExecutorStore, OutputSink, RunnerConfig, StageCommand, StageDriver,
    TimestampMap, scan_output_directory,
};
use stagehand_scheduler::BiddingFlag;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Writes relayed command output straight to the terminal.
struct TermSink(Term);

impl OutputSink for TermSink {
    fn append(&self, text: &str) -> io::Result<()> {
        self.0.write_str(text)
    }
}

fn store_for(config: &RunnerConfig) -> ExecutorStore {
    ExecutorStore::new(&config.state_dir)
}

/// Run a script as a single stage.
pub async fn exec(mut config: RunnerConfig, args: ExecArgs) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(backend) = args.backend {
        config.backend = backend.into();
    }
    if args.cluster_script.is_some() {
        config.cluster_script = args.cluster_script.clone();
    }
    if args.timeout.is_some() {
        config.timeout_seconds = args.timeout;
    }
    config.dry_run |= args.dry_run;
    config.validate()?;

    let mut command = Command::new(&args.name, &args.script, &args.dir);
    if let Some(threads) = args.threads {
        command = command.with_resources(ResourceRequest::threads(threads));
    }
    let stage = StageCommand::new(command)
        .with_inputs(args.inputs.clone())
        .with_outputs(args.outputs.clone());

    let bus = Arc::new(InMemoryEventBus::default());
    let mut events = bus.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            info!(subject = %event.subject(), "{}", event.description);
        }
    });

    let store = store_for(&config);
    let driver = StageDriver::new(config, bus)
        .with_store(store)
        .with_output(Arc::new(TermSink(Term::stdout())), Arc::new(TermSink(Term::stderr())));

    println!(
        "{} Running stage {}",
        style("▶").cyan(),
        style(&args.name).bold()
    );
    let requestor = Arc::new(BiddingFlag::new(args.name.clone()));
    match driver.run_command(requestor, stage).await {
        Ok(outcome) if outcome.skipped => {
            println!("{} Stage {} is up to date", style("✓").green(), args.name);
        }
        Ok(outcome) => {
            println!("{} Stage {} finished", style("✓").green(), args.name);
            for output in &outcome.new_outputs {
                let marker = if outcome.declared_outputs.contains(output) {
                    style("+").green()
                } else {
                    style("+").dim()
                };
                println!("  {} {}", marker, output.display());
            }
        }
        Err(BranchFailure::TestAbort(abort)) => {
            println!("{} {}", style("!").yellow(), abort);
        }
        Err(failure) => {
            eprintln!("{} {}", style("✗").red(), failure);
            std::process::exit(1);
        }
    }
    Ok(())
}

/// List files that are new since the timestamps were last recorded.
pub async fn outputs(
    dir: &Path,
    timestamps: Option<PathBuf>,
    record: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = timestamps.unwrap_or_else(|| timestamp_path(dir));
    let mut map = TimestampMap::load(&path).await?;
    let new_files = scan_output_directory(dir, &map).await?;

    if new_files.is_empty() {
        println!("{} No new outputs in {}", style("✓").green(), dir.display());
    } else {
        println!("{} new output(s):", new_files.len());
        for file in &new_files {
            println!("  {} {}", style("+").green(), file.display());
        }
    }

    if record {
        map.record(dir).await?;
        map.save(&path).await?;
        println!("{} Recorded {} timestamp(s)", style("✓").green(), map.len());
    }
    Ok(())
}

/// Reattach to persisted commands.
///
/// Each record is handled on its own: a record that cannot be rehydrated,
/// waited for or removed is reported and left in the store while the rest
/// carry on. Fails once every record has been handled if any of them did.
pub async fn reattach(config: &RunnerConfig, wait: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = store_for(config);
    let records = store.load_all().await?;
    if records.is_empty() {
        println!("No commands to reattach to in {}", store.dir().display());
        return Ok(());
    }

    let mut attached = Vec::with_capacity(records.len());
    let mut failed = 0usize;
    for record in records {
        match record.executor.rehydrate(config.settings()).await {
            Ok(()) => {
                println!(
                    "{} {} {}",
                    style("●").cyan(),
                    style(&record.command.name).bold(),
                    record.executor.status_message()
                );
                attached.push(record);
            }
            Err(e) => {
                warn!(command = %record.command.name, error = %e, "Cannot reattach to command");
                println!("{} {} could not be reattached: {}", style("✗").red(), record.command.name, e);
                failed += 1;
            }
        }
    }

    if wait {
        for record in attached {
            match finish(&store, &record).await {
                Ok(code) => {
                    let marker = if code == 0 {
                        style("✓").green()
                    } else {
                        style("✗").red()
                    };
                    println!("{} {} exited with {}", marker, record.command.name, code);
                }
                Err(e) => {
                    warn!(command = %record.command.name, error = %e, "Cannot finish reattached command");
                    println!("{} {} failed: {}", style("✗").red(), record.command.name, e);
                    failed += 1;
                }
            }
        }
    }

    if failed > 0 {
        return Err(format!("{} command(s) could not be reattached", failed).into());
    }
    Ok(())
}

/// Wait for a reattached command, then drop its job files and record.
async fn finish(store: &ExecutorStore, record: &CommandRecord) -> stagehand_core::Result<i32> {
    let code = record.executor.wait_for().await?;
    record.executor.cleanup().await?;
    store.remove(&record.command.id).await?;
    Ok(code)
}

/// Print the effective configuration.
pub fn show_config(config: &RunnerConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Ok(path) = crate::config::config_path() {
        println!("{} {}", style("User config:").dim(), path.display());
    }
    print!("{}", serde_yaml::to_string(config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_runner::{Executor, LocalExecutor, ProbeExecutor};
    use std::time::Duration;

    #[tokio::test]
    async fn test_reattach_carries_on_past_a_broken_record() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunnerConfig {
            state_dir: dir.path().join("state"),
            ..RunnerConfig::default()
        };
        let store = store_for(&config);

        // Never started, so waiting on it fails.
        let broken = Command::new("broken", "true", dir.path());
        store
            .save(&broken, &Executor::Local(LocalExecutor::new()))
            .await
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let healthy = Command::new("healthy", "true", dir.path());
        store
            .save(&healthy, &Executor::Probe(ProbeExecutor::new()))
            .await
            .unwrap();

        let result = reattach(&config, true).await;
        assert!(result.unwrap_err().to_string().contains("1 command(s)"));
        assert!(store.load(&healthy.id).await.unwrap().is_none());
        assert!(store.load(&broken.id).await.unwrap().is_some());
    }
}
