//! An executor that runs nothing.
//!
//! Used to discover what a command would reference without doing the work.

use crate::executor::CommandExecutor;
use crate::sink::SharedSink;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stagehand_core::{Command, CommandStatus, ExecutorOptions, Result};
use tracing::debug;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ProbeExecutor {}

impl ProbeExecutor {
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl CommandExecutor for ProbeExecutor {
    async fn start(
        &self,
        _options: &ExecutorOptions,
        command: &Command,
        _stdout: SharedSink,
        _stderr: SharedSink,
    ) -> Result<()> {
        debug!(command = %command.name, "Probing command");
        Ok(())
    }

    /// A probe never has a status.
    fn status(&self) -> CommandStatus {
        CommandStatus::Unknown
    }

    async fn wait_for(&self) -> Result<i32> {
        Ok(0)
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn status_message(&self) -> String {
        "probe (nothing runs)".to_string()
    }

    fn ignorable_outputs(&self) -> Vec<String> {
        Vec::new()
    }
}
