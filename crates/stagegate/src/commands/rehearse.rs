//! Rehearse command - dry-run a workflow with no-op executors.
//!
//! Every stage type is bound to `NoopExecutor`, so steps succeed immediately
//! and only the orchestration is exercised: stage order, quality gates,
//! snapshots and events. Gate checks read the execution context, which holds
//! the definition's `input` (plus any `--input` overrides) under `input`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use clap::Args;
use console::{Style, style};
use serde_json::Value;
use stagegate_pipeline::{
    NoopExecutor, PipelineConfig, PipelineEngine, PipelineEvent, QualityGateEvaluator, Workflow,
    WorkflowState, load_workflow,
};
use tokio::sync::broadcast::error::RecvError;

use super::Context;

/// Arguments for the rehearse command.
#[derive(Args, Debug)]
pub struct RehearseArgs {
    /// Path to the workflow TOML file
    pub file: PathBuf,

    /// Extra workflow input as key=value (value parsed as JSON when possible)
    #[arg(short, long = "input", value_name = "KEY=VALUE")]
    pub inputs: Vec<String>,

    /// Do not evaluate quality gates
    #[arg(long)]
    pub skip_gates: bool,
}

/// Run the rehearse command.
pub async fn run(args: RehearseArgs, ctx: &Context) -> Result<()> {
    let mut workflow = load_workflow(&args.file)?;
    for raw in &args.inputs {
        let (key, value) = parse_input(raw)?;
        workflow.input.insert(key, value);
    }

    let mut config = PipelineConfig::from_config(&ctx.config.config);
    // Rehearsal snapshots never outlive the process
    config.snapshot_dir = None;
    if args.skip_gates {
        config.enable_quality_gates = false;
    }

    let engine = Arc::new(
        PipelineEngine::new(config).with_evaluator(QualityGateEvaluator::with_default_runners()),
    );
    engine.register_executor_for_all(Arc::new(NoopExecutor));

    let total_stages = workflow.stages.len();
    let mut events = engine.subscribe();
    let (workflow_id, handle) = engine.spawn(workflow)?;

    loop {
        match events.recv().await {
            Ok(event) => {
                if event.workflow_id() != workflow_id {
                    continue;
                }
                print_event(&event, total_stages, ctx)?;
                if event.is_terminal() {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event stream lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }

    let outcome = handle.await.context("rehearsal task panicked")?;
    if let Err(e) = engine.shutdown() {
        tracing::warn!(error = %e, "Failed to clean up rehearsal snapshots");
    }

    let finished = match outcome {
        Ok(workflow) => workflow,
        Err(e) => bail!("Rehearsal failed: {e}"),
    };
    if !ctx.json_output {
        print_summary(&finished);
    }
    Ok(())
}

/// Split `key=value`; the value is JSON if it parses, else a plain string.
fn parse_input(raw: &str) -> Result<(String, Value)> {
    let Some((key, value)) = raw.split_once('=') else {
        bail!("Invalid input '{raw}': expected KEY=VALUE");
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("Invalid input '{raw}': empty key");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn print_event(event: &PipelineEvent, total_stages: usize, ctx: &Context) -> Result<()> {
    if ctx.json_output {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    let dim = Style::new().dim();
    match event {
        PipelineEvent::WorkflowStart { workflow_id, title } => {
            println!("{} {} {}", style("▶").cyan(), style(title).bold(), dim.apply_to(workflow_id));
        }
        PipelineEvent::WorkflowProgress(progress) => {
            if ctx.verbose {
                println!(
                    "    {} {}",
                    dim.apply_to(format!("{:>5.1}%", progress.overall_progress)),
                    dim.apply_to(&progress.message)
                );
            }
        }
        PipelineEvent::StageStart {
            stage_id,
            stage_index,
            ..
        } => {
            println!(
                "  {} {} {}",
                style("→").cyan(),
                stage_id,
                dim.apply_to(format!("[{}/{}]", stage_index + 1, total_stages))
            );
        }
        PipelineEvent::StageComplete { stage_id, .. } => {
            println!("    {} {stage_id} complete", style("✓").green());
        }
        PipelineEvent::GatePassed { report, .. } => {
            let note = if report.skipped { " (overridden)" } else { "" };
            println!(
                "    {} gate {} passed, score {:.2}{note}",
                style("✓").green(),
                report.gate_id,
                report.score
            );
        }
        PipelineEvent::GateFailed { report, .. } => {
            println!(
                "    {} gate {} failed, score {:.2} < {:.2}{}",
                style("✗").red(),
                report.gate_id,
                report.score,
                report.threshold,
                if report.blocking { "" } else { " (non-blocking)" }
            );
            for check in report.failed_checks() {
                println!("      {} {}: {}", dim.apply_to("-"), check.name, check.message);
            }
        }
        PipelineEvent::WorkflowComplete { .. } => {
            println!("{} workflow completed", style("✓").green().bold());
        }
        PipelineEvent::WorkflowFailed { stage_id, error, .. } => {
            let at = stage_id.as_deref().map(|s| format!(" at {s}")).unwrap_or_default();
            println!("{} workflow failed{at}: {error}", style("✗").red().bold());
        }
        PipelineEvent::WorkflowPaused { .. } => println!("  {} paused", style("⏸").yellow()),
        PipelineEvent::WorkflowResumed { .. } => println!("  {} resumed", style("▶").cyan()),
        PipelineEvent::WorkflowCancelled { reason, .. } => {
            println!("{} workflow cancelled: {reason}", style("■").yellow().bold());
        }
    }
    Ok(())
}

fn print_summary(workflow: &Workflow) {
    let dim = Style::new().dim();
    let elapsed = match (workflow.started_at, workflow.ended_at) {
        (Some(start), Some(end)) => format!("{} ms", (end - start).num_milliseconds()),
        _ => "-".to_string(),
    };
    let steps: usize = workflow.stages.iter().map(|s| s.steps.len()).sum();
    let state = match workflow.status() {
        WorkflowState::Completed => style(workflow.status().as_str()).green(),
        other => style(other.as_str()).yellow(),
    };
    println!();
    println!(
        "  {} {}  {} {}  {} {}  {} {}",
        dim.apply_to("State:"),
        state,
        dim.apply_to("Stages:"),
        workflow.stages.len(),
        dim.apply_to("Steps:"),
        steps,
        dim.apply_to("Elapsed:"),
        elapsed
    );
}
