//! Command lifecycle states and the rules for moving between them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a command running on some backend.
///
/// States move strictly forward (`Queueing` → `Waiting` → `Running` →
/// `Exiting` → `Complete`, skipping allowed). `Unknown` may be entered from
/// any non-terminal state when a backend cannot report on a job, and may be
/// left for any state once the job has been reconciled. Nothing leaves
/// `Complete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    /// Submitted but not yet scheduled.
    Queueing,
    /// Scheduled, waiting for a resource or start.
    Waiting,
    Running,
    /// Process exited; exit code and output are being finalized.
    Exiting,
    Complete,
    /// The backend has lost track of the job.
    Unknown,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Complete)
    }

    fn rank(&self) -> Option<u8> {
        match self {
            CommandStatus::Queueing => Some(0),
            CommandStatus::Waiting => Some(1),
            CommandStatus::Running => Some(2),
            CommandStatus::Exiting => Some(3),
            CommandStatus::Complete => Some(4),
            CommandStatus::Unknown => None,
        }
    }

    /// Whether a report of `next` may replace the current state.
    pub fn can_transition_to(&self, next: CommandStatus) -> bool {
        if *self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (None, Some(_)) => true,
            (Some(current), Some(next)) => next > current,
        }
    }

    /// Parse a status word as reported by a backend. Unrecognized words map
    /// to `Unknown`.
    pub fn parse_report(word: &str) -> CommandStatus {
        match word.trim().to_ascii_uppercase().as_str() {
            "QUEUEING" | "QUEUED" | "PENDING" => CommandStatus::Queueing,
            "WAITING" | "HELD" => CommandStatus::Waiting,
            "RUNNING" => CommandStatus::Running,
            "EXITING" => CommandStatus::Exiting,
            "COMPLETE" | "COMPLETED" | "DONE" => CommandStatus::Complete,
            _ => CommandStatus::Unknown,
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = match self {
            CommandStatus::Queueing => "QUEUEING",
            CommandStatus::Waiting => "WAITING",
            CommandStatus::Running => "RUNNING",
            CommandStatus::Exiting => "EXITING",
            CommandStatus::Complete => "COMPLETE",
            CommandStatus::Unknown => "UNKNOWN",
        };
        f.write_str(word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CommandStatus; 6] = [
        CommandStatus::Queueing,
        CommandStatus::Waiting,
        CommandStatus::Running,
        CommandStatus::Exiting,
        CommandStatus::Complete,
        CommandStatus::Unknown,
    ];

    #[test]
    fn test_nothing_leaves_complete() {
        for next in ALL {
            let allowed = CommandStatus::Complete.can_transition_to(next);
            assert_eq!(allowed, next == CommandStatus::Complete, "COMPLETE -> {next}");
        }
    }

    #[test]
    fn test_forward_only() {
        assert!(CommandStatus::Queueing.can_transition_to(CommandStatus::Running));
        assert!(CommandStatus::Running.can_transition_to(CommandStatus::Complete));
        assert!(!CommandStatus::Running.can_transition_to(CommandStatus::Waiting));
        assert!(!CommandStatus::Exiting.can_transition_to(CommandStatus::Queueing));
    }

    #[test]
    fn test_unknown_escape_hatch() {
        for from in ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(CommandStatus::Unknown));
        }
        for to in ALL {
            assert!(CommandStatus::Unknown.can_transition_to(to));
        }
    }

    #[test]
    fn test_parse_report() {
        assert_eq!(CommandStatus::parse_report("running\n"), CommandStatus::Running);
        assert_eq!(CommandStatus::parse_report("COMPLETE"), CommandStatus::Complete);
        assert_eq!(CommandStatus::parse_report("garbage"), CommandStatus::Unknown);
    }

    #[test]
    fn test_serializes_screaming_case() {
        let json = serde_json::to_string(&CommandStatus::Queueing).unwrap();
        assert_eq!(json, "\"QUEUEING\"");
    }
}
