//! Lifecycle events emitted by the execution core.
//!
//! The core only publishes these; formatting and delivery belong to
//! notification and report components.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEvent {
    // Pipeline lifecycle
    Started,
    Finished,
    Failed,
    Succeeded,

    // Stage lifecycle
    StageStarted,
    StageCompleted,
    StageFailed,

    // Command lifecycle
    CommandCheck,
    CommandStarted,
    CommandFinished,
    CommandFailed,

    ReportGenerated,
    /// Triggered explicitly by the user.
    Send,
}

/// One published event with its free-text description and details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event: PipelineEvent,
    pub description: String,
    #[serde(default)]
    pub details: BTreeMap<String, serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(event: PipelineEvent, description: impl Into<String>) -> Self {
        Self {
            event,
            description: description.into(),
            details: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Dotted subject consumers can filter on.
    pub fn subject(&self) -> String {
        let stage = self
            .details
            .get("stage")
            .and_then(|v| v.as_str())
            .unwrap_or("_");
        match self.event {
            PipelineEvent::Started => "pipeline.started".to_string(),
            PipelineEvent::Finished => "pipeline.finished".to_string(),
            PipelineEvent::Failed => "pipeline.failed".to_string(),
            PipelineEvent::Succeeded => "pipeline.succeeded".to_string(),
            PipelineEvent::StageStarted => format!("stage.{}.started", stage),
            PipelineEvent::StageCompleted => format!("stage.{}.completed", stage),
            PipelineEvent::StageFailed => format!("stage.{}.failed", stage),
            PipelineEvent::CommandCheck => format!("stage.{}.command.check", stage),
            PipelineEvent::CommandStarted => format!("stage.{}.command.started", stage),
            PipelineEvent::CommandFinished => format!("stage.{}.command.finished", stage),
            PipelineEvent::CommandFailed => format!("stage.{}.command.failed", stage),
            PipelineEvent::ReportGenerated => "report.generated".to_string(),
            PipelineEvent::Send => "user.send".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_includes_stage() {
        let record = EventRecord::new(PipelineEvent::CommandStarted, "sort started")
            .with_detail("stage", "sort");
        assert_eq!(record.subject(), "stage.sort.command.started");
    }

    #[test]
    fn test_subject_without_stage() {
        let record = EventRecord::new(PipelineEvent::StageFailed, "failed");
        assert_eq!(record.subject(), "stage._.failed");
    }
}
