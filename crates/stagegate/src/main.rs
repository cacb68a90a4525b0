//! Stagegate - staged workflow runner with quality gates and snapshots
//!
//! Main entry point for the Stagegate CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use stagegate_config::LoggingSection;
use tracing_appender::non_blocking::WorkerGuard;

mod commands;

use commands::{config, rehearse, validate};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Stagegate - staged workflow runner with quality gates and snapshots
#[derive(Parser)]
#[command(name = "stagegate")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// User config directory (default: platform config dir)
    #[arg(long, global = true, env = "STAGEGATE_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Parse and validate a workflow definition
    Validate(validate::ValidateArgs),

    /// Dry-run a workflow definition with no-op executors
    Rehearse(rehearse::RehearseArgs),

    /// Configuration management
    Config(config::ConfigArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = stagegate_config::load_config_with_options(None, cli.config_dir.as_deref())?;
    let config_dir = cli
        .config_dir
        .clone()
        .or_else(stagegate_config::user_config_dir);

    let _guard = init_tracing(&loaded.config.logging(), config_dir.as_ref(), cli.verbose);
    for warning in &loaded.warnings {
        tracing::warn!(%warning, "Config layer skipped");
    }

    let ctx = commands::Context {
        json_output: cli.json,
        verbose: cli.verbose,
        config_dir,
        config: loaded,
    };

    match cli.command {
        Commands::Validate(args) => validate::run(args, &ctx).await,
        Commands::Rehearse(args) => rehearse::run(args, &ctx).await,
        Commands::Config(args) => config::run(args, &ctx).await,
    }
}

/// Console (human-readable, stderr) + daily rolling JSON file.
///
/// The returned guard flushes the file writer on drop.
fn init_tracing(logging: &LoggingSection, config_dir: Option<&PathBuf>, verbose: bool) -> Option<WorkerGuard> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::prelude::*;

    let console_filter = if verbose {
        EnvFilter::new("stagegate=debug,stagegate_pipeline=debug,stagegate_config=debug,info")
    } else {
        EnvFilter::try_new(&logging.level).unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let console = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let log_dir = logging
        .directory
        .clone()
        .or_else(|| config_dir.map(|d| d.join("logs")));

    match log_dir {
        Some(dir) if logging.file => {
            let file_appender = tracing_appender::rolling::daily(&dir, "stagegate.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::registry()
                .with(console)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking)
                        .with_filter(EnvFilter::new(
                            "stagegate=trace,stagegate_pipeline=trace,stagegate_config=trace,info",
                        )),
                )
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry().with(console).init();
            None
        }
    }
}
