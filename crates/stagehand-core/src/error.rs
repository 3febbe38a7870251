//! Error types for Stagehand.
//!
//! These are infrastructure faults. User-facing pipeline failures live in
//! [`crate::failure`] and wrap this type only as [`crate::BranchFailure::Fatal`].

use crate::ids::CommandId;
use crate::status::CommandStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Executor errors
    #[error("Command {0} has already been started")]
    AlreadyStarted(CommandId),

    #[error("Command has not been started")]
    NotStarted,

    #[error("Invalid status transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: CommandStatus,
        to: CommandStatus,
    },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Command timeout after {seconds} seconds")]
    Timeout { seconds: u64 },

    // Resource errors
    #[error("Unknown resource category: {0}")]
    UnknownResource(String),

    #[error("Request for {requested} {category} exceeds pool capacity of {capacity}")]
    ExceedsCapacity {
        category: String,
        requested: u32,
        capacity: u32,
    },

    #[error("Bid {0} was abandoned before it could be granted")]
    BidAbandoned(String),

    // Pattern errors
    #[error("Invalid glob pattern '{pattern}': {message}")]
    InvalidGlob { pattern: String, message: String },

    // Infrastructure errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
