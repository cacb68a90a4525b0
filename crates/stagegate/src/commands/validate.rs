//! Validate command - parse and check a workflow definition.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args;
use console::{Style, style};
use serde::Serialize;
use stagegate_pipeline::{Workflow, WorkflowFile};

use super::Context;

/// Arguments for the validate command.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the workflow TOML file
    pub file: PathBuf,
}

#[derive(Debug, Serialize)]
struct ValidateOutput<'a> {
    valid: bool,
    file: String,
    title: &'a str,
    stages: Vec<StageSummary<'a>>,
}

#[derive(Debug, Serialize)]
struct StageSummary<'a> {
    id: &'a str,
    stage_type: &'static str,
    steps: usize,
    gate: Option<&'a str>,
    checks: usize,
}

/// Run the validate command.
pub async fn run(args: ValidateArgs, ctx: &Context) -> Result<()> {
    let file = WorkflowFile::from_file(&args.file)?;
    file.workflow
        .validate()
        .with_context(|| format!("{} is not a valid workflow", args.file.display()))?;
    let workflow = file.workflow.to_workflow();

    let output = ValidateOutput {
        valid: true,
        file: args.file.display().to_string(),
        title: &workflow.title,
        stages: summarize(&workflow),
    };

    if ctx.json_output {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let dim = Style::new().dim();
    println!(
        "{} {} ({} stage(s))",
        style("✓").green(),
        style(&workflow.title).bold(),
        output.stages.len()
    );
    for stage in &output.stages {
        let gate = match stage.gate {
            Some(gate) => format!("gate {gate}, {} check(s)", stage.checks),
            None => "no gate".to_string(),
        };
        println!(
            "  {:<16} {:<15} {} step(s)  {}",
            stage.id,
            stage.stage_type,
            stage.steps,
            dim.apply_to(gate)
        );
    }
    Ok(())
}

fn summarize(workflow: &Workflow) -> Vec<StageSummary<'_>> {
    workflow
        .stages
        .iter()
        .map(|stage| StageSummary {
            id: &stage.id,
            stage_type: stage.stage_type.as_str(),
            steps: stage.steps.len(),
            gate: stage.gate.as_ref().map(|g| g.id.as_str()),
            checks: stage.gate.as_ref().map_or(0, |g| g.checks.len()),
        })
        .collect()
}
