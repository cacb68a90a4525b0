//! Config command - configuration management.

use anyhow::{Result, anyhow};
use clap::{Args, Subcommand};
use serde::Serialize;
use stagegate_config::StagegateConfig;

use super::Context;

/// Arguments for the config command.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the resolved configuration and where it was loaded from
    Show,

    /// Show the user configuration file path
    Path,
}

#[derive(Debug, Serialize)]
struct ShowOutput<'a> {
    sources: Vec<SourceOutput>,
    warnings: &'a [String],
    config: StagegateConfig,
}

#[derive(Debug, Serialize)]
struct SourceOutput {
    layer: &'static str,
    path: String,
    loaded: bool,
}

/// Run the config command.
pub async fn run(args: ConfigArgs, ctx: &Context) -> Result<()> {
    match args.command {
        ConfigCommand::Show => cmd_show(ctx),
        ConfigCommand::Path => cmd_path(ctx),
    }
}

/// Every section filled in, defaults included.
fn resolved(config: &StagegateConfig) -> StagegateConfig {
    StagegateConfig {
        pipeline: Some(config.pipeline()),
        snapshots: Some(config.snapshots()),
        logging: Some(config.logging()),
    }
}

fn cmd_show(ctx: &Context) -> Result<()> {
    let loaded = &ctx.config;
    let config = resolved(&loaded.config);

    if ctx.json_output {
        let output = ShowOutput {
            sources: loaded
                .sources
                .iter()
                .map(|s| SourceOutput {
                    layer: s.layer.as_str(),
                    path: s.path.display().to_string(),
                    loaded: s.loaded,
                })
                .collect(),
            warnings: &loaded.warnings,
            config,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("# Stagegate Configuration\n");

    println!("Config file search order (later overrides earlier):");
    for source in &loaded.sources {
        let status = if source.loaded { "✓ loaded" } else { "· not found" };
        println!("  {} {:<8} {}", status, source.layer, source.path.display());
    }
    println!();

    if !loaded.warnings.is_empty() {
        println!("Warnings:");
        for w in &loaded.warnings {
            println!("  ⚠ {}", w);
        }
        println!();
    }

    println!("{}", config.to_toml()?);
    Ok(())
}

fn cmd_path(ctx: &Context) -> Result<()> {
    let dir = ctx
        .config_dir
        .as_ref()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?;
    let path = dir.join("config.toml");
    if ctx.json_output {
        println!(
            "{}",
            serde_json::json!({ "path": path.display().to_string(), "exists": path.exists() })
        );
    } else {
        println!("{}", path.display());
    }
    Ok(())
}
