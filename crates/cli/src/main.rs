//! nb - cross-cloud object client
//!
//! One command line for local files, S3, GCS, Azure Blob and the asset
//! store. Transfers run as jobs that can be interrupted and resumed.

mod commands;
mod config;
mod exit_code;
mod output;

use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use commands::{Commands, Context};
use config::CliConfig;
use exit_code::ExitCode;
use output::{Formatter, OutputConfig};

#[derive(Parser, Debug)]
#[command(name = "nb", version, about = "Cross-cloud object client", long_about = None)]
struct Cli {
    /// Print JSON instead of human-readable output
    #[arg(long, global = true)]
    json: bool,

    /// Disable colors
    #[arg(long, global = true)]
    no_color: bool,

    /// Disable progress bars
    #[arg(long, global = true)]
    no_progress: bool,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Directory containing providers.toml
    #[arg(long, global = true, env = "NB_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Directory for jobs.json and checkpoints
    #[arg(long, global = true, env = "NB_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

fn init_tracing(verbose: u8) {
    // NB_LOG takes precedence over -v
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env("NB_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> ExitCode {
    let formatter = Formatter::new(OutputConfig {
        json: cli.json,
        no_color: cli.no_color,
        no_progress: cli.no_progress,
        quiet: cli.quiet,
    });

    let mut config = match config::config_dir(cli.config_dir.as_deref()) {
        Some(dir) => match CliConfig::load(&dir) {
            Ok(config) => config,
            Err(e) => {
                formatter.error(&format!("{e:#}"));
                return ExitCode::UsageError;
            }
        },
        None => CliConfig::default(),
    };
    if let Some(state_dir) = cli.state_dir {
        config.engine.state_dir = Some(state_dir);
    }

    let registry = match config.registry().await {
        Ok(registry) => registry,
        Err(e) => {
            formatter.error(&format!("{e:#}"));
            return ExitCode::UsageError;
        }
    };

    let ctx = Context {
        formatter,
        config,
        registry,
    };
    commands::execute(cli.command, &ctx).await
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let code = run(cli).await;
    std::process::exit(code.code());
}
