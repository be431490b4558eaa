//! Undertow CLI - Command-line interface
//!
//! Runs simulated playback sessions and inspects buffer windows and file
//! selection without a media player attached.

mod commands;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use undertow_core::tracing_setup::{CliLogLevel, LogSettings, init_tracing};

#[derive(Parser)]
#[command(name = "undertow")]
#[command(about = "Progressive playback over torrent downloads")]
#[command(version)]
struct Cli {
    /// Console log level
    #[arg(long, global = true, value_enum, default_value_t = CliLogLevel::Info)]
    log_level: CliLogLevel,

    /// Level for buffering and reader logs, defaults to --log-level
    #[arg(long, global = true, value_enum)]
    streaming_log_level: Option<CliLogLevel>,

    /// Write a full trace of this run to the given file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut logging = LogSettings::new(cli.log_level.as_tracing_level());
    if let Some(level) = cli.streaming_log_level {
        logging = logging.with_streaming(level.as_tracing_level());
    }
    if let Some(path) = cli.log_file {
        logging = logging.with_file(path);
    }
    init_tracing(&logging).context("failed to initialize logging")?;

    commands::handle_command(cli.command).await
}
