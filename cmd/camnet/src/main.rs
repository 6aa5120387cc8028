//! camnet - multi-camera handover coordinator.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{CheckCommand, ReplayCommand, RunCommand};

/// Multi-camera handover coordinator.
///
/// Consumes per-camera detections, keeps one global identity per subject
/// and publishes identity assignments and camera-to-camera handovers.
#[derive(Parser)]
#[command(name = "camnet")]
#[command(about = "Multi-camera handover coordinator")]
#[command(version)]
pub struct Cli {
    /// Config file (YAML or JSON); built-in defaults when omitted
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Debug logging (RUST_LOG overrides)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the coordinator against the message bus
    Run(RunCommand),
    /// Decide a recorded detection log offline
    Replay(ReplayCommand),
    /// Validate configuration and print the topology
    Check(CheckCommand),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let result = match &cli.command {
        Commands::Run(cmd) => cmd.run(&cli).await,
        Commands::Replay(cmd) => cmd.run(&cli),
        Commands::Check(cmd) => cmd.run(&cli),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            if commands::is_fatal(&e) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
