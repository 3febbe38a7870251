//! Stagehand CLI entrypoint.

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod handlers;

use commands::Commands;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(author, version, about = "Run pipeline stage commands locally or on a cluster", long_about = None)]
struct Cli {
    /// Configuration file to use instead of the usual search
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);
    let config = config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Exec(args) => handlers::exec(config, args).await?,
        Commands::Outputs {
            dir,
            timestamps,
            record,
        } => handlers::outputs(&dir, timestamps, record).await?,
        Commands::Reattach { wait } => handlers::reattach(&config, wait).await?,
        Commands::Config => handlers::show_config(&config)?,
    }

    Ok(())
}
