//! Stagehand Runner
//!
//! Executes stage commands on a local or cluster backend, relays their
//! output, and works out which files they produced.

pub mod cluster;
pub mod config;
pub mod driver;
pub mod executor;
pub mod local;
pub mod outputs;
pub mod probe;
pub mod relay;
pub mod sink;
pub mod store;
pub mod tracker;

pub use cluster::ClusterExecutor;
pub use config::{BackendKind, ExecutorSettings, RunnerConfig};
pub use driver::{CommandOutcome, StageCommand, StageDriver, run_branches};
pub use executor::{CommandExecutor, Executor, wait_with_timeout};
pub use local::LocalExecutor;
pub use outputs::{OutputMatcher, TimestampMap, scan_output_directory};
pub use probe::ProbeExecutor;
pub use relay::{RelayHandle, relay_output};
pub use sink::{ChannelSink, FileSink, NullSink, OutputLine, OutputSink, OutputStream, SharedBuffer, SharedSink};
pub use store::{CommandRecord, ExecutorStore};
pub use tracker::{StatusSnapshot, StatusTracker};
