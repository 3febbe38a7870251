//! Shared, monotonic view of one command's status.

use stagehand_core::{CommandStatus, Error, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Status and, once complete, exit code of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub status: CommandStatus,
    pub exit_code: Option<i32>,
}

/// Cloneable handle on a command's status.
///
/// Reports that would move the status backwards, or out of `Complete`, are
/// ignored. Reading never blocks.
#[derive(Debug, Clone)]
pub struct StatusTracker {
    tx: Arc<watch::Sender<StatusSnapshot>>,
}

impl StatusTracker {
    pub fn new(initial: CommandStatus) -> Self {
        let (tx, _) = watch::channel(StatusSnapshot {
            status: initial,
            exit_code: None,
        });
        Self { tx: Arc::new(tx) }
    }

    /// Tracker for a command loaded back from a saved snapshot.
    ///
    /// A `Complete` status without an exit code is not trusted and starts
    /// out `Unknown`, so rehydration can query the job again.
    pub fn restored(status: CommandStatus, exit_code: Option<i32>) -> Self {
        let snapshot = match (status, exit_code) {
            (CommandStatus::Complete, Some(code)) => StatusSnapshot {
                status,
                exit_code: Some(code),
            },
            (CommandStatus::Complete, None) => StatusSnapshot {
                status: CommandStatus::Unknown,
                exit_code: None,
            },
            (status, _) => StatusSnapshot {
                status,
                exit_code: None,
            },
        };
        let (tx, _) = watch::channel(snapshot);
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        *self.tx.borrow()
    }

    pub fn status(&self) -> CommandStatus {
        self.tx.borrow().status
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.tx.borrow().exit_code
    }

    /// Apply a status report. Returns whether the status changed.
    pub fn advance(&self, next: CommandStatus) -> bool {
        if next == CommandStatus::Complete {
            // Completion must carry an exit code; see `complete`.
            return false;
        }
        self.tx.send_if_modified(|snapshot| {
            if snapshot.status == next {
                return false;
            }
            if !snapshot.status.can_transition_to(next) {
                debug!(from = %snapshot.status, to = %next, "Ignoring status report");
                return false;
            }
            snapshot.status = next;
            true
        })
    }

    /// Record the terminal state. Returns false if already complete.
    pub fn complete(&self, exit_code: i32) -> bool {
        self.tx.send_if_modified(|snapshot| {
            if snapshot.status.is_terminal() {
                debug!(exit_code, "Ignoring second completion");
                return false;
            }
            snapshot.status = CommandStatus::Complete;
            snapshot.exit_code = Some(exit_code);
            true
        })
    }

    /// Wait until complete and return the exit code.
    pub async fn wait_complete(&self) -> Result<i32> {
        let mut rx = self.tx.subscribe();
        let snapshot = rx
            .wait_for(|s| s.status.is_terminal())
            .await
            .map_err(|_| Error::Internal("status channel closed".to_string()))?;
        snapshot
            .exit_code
            .ok_or_else(|| Error::Internal("completed without an exit code".to_string()))
    }
}

impl Default for StatusTracker {
    /// Nothing is known about a command that has not started.
    fn default() -> Self {
        Self::new(CommandStatus::Unknown)
    }
}
