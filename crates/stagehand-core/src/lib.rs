//! Stagehand Core
//!
//! Shared vocabulary for the Stagehand execution core: commands and their
//! lifecycle, the user-facing failure taxonomy, glob matching, and the
//! event port consumed by notification and reporting components.

pub mod command;
pub mod error;
pub mod events;
pub mod failure;
pub mod glob;
pub mod ids;
pub mod ports;
pub mod status;

pub use command::{Command, ExecutorOptions, ResourceRequest};
pub use error::{Error, Result};
pub use failure::{BranchFailure, PipelineError, PipelinePaused, SummaryError, TestAbort};
pub use ids::*;
pub use status::CommandStatus;
