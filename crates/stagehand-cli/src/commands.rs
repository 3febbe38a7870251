//! CLI command definitions.

use clap::{Args, Subcommand, ValueEnum};
use stagehand_runner::BackendKind;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run a script as a single stage
    Exec(ExecArgs),

    /// List files that are new since the last recorded run
    Outputs {
        /// Directory to scan
        #[arg(default_value = ".")]
        dir: PathBuf,

        /// Timestamp map to compare against
        #[arg(long)]
        timestamps: Option<PathBuf>,

        /// Record the current state afterwards
        #[arg(long)]
        record: bool,
    },

    /// Reattach to commands left running by an earlier invocation
    Reattach {
        /// Wait for each command to finish
        #[arg(short, long)]
        wait: bool,
    },

    /// Show the effective configuration
    Config,
}

#[derive(Args)]
pub struct ExecArgs {
    /// Shell script to run
    pub script: String,

    /// Stage name
    #[arg(short, long, default_value = "stage")]
    pub name: String,

    /// Working directory
    #[arg(short, long, default_value = ".")]
    pub dir: PathBuf,

    /// Backend to run on
    #[arg(long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Backend script for the cluster backend
    #[arg(long)]
    pub cluster_script: Option<PathBuf>,

    /// Threads the command needs
    #[arg(short, long)]
    pub threads: Option<u32>,

    /// Declared input file (repeatable)
    #[arg(short, long = "input")]
    pub inputs: Vec<String>,

    /// Declared output file (repeatable)
    #[arg(short, long = "output")]
    pub outputs: Vec<String>,

    /// Kill the command after this many seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Report what would run without running it
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    Local,
    Cluster,
    Probe,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Local => BackendKind::Local,
            BackendArg::Cluster => BackendKind::Cluster,
            BackendArg::Probe => BackendKind::Probe,
        }
    }
}
