//! Declarative workflow definitions.
//!
//! Parses TOML workflow files into `WorkflowDefinition` structs, validates
//! them, and converts them to runnable [`Workflow`]s.
//!
//! # Example TOML
//!
//! ```toml
//! [workflow]
//! title = "Release"
//! description = "Build, verify and ship"
//!
//! [workflow.input]
//! version = "1.4.0"
//!
//! [[workflow.stages]]
//! id = "build"
//! type = "implementation"
//! snapshot_files = ["Cargo.lock"]
//!
//! [[workflow.stages.steps]]
//! id = "compile"
//! name = "Compile"
//!
//! [workflow.stages.gate]
//! threshold = 0.75
//! blocking = true
//!
//! [[workflow.stages.gate.checks]]
//! name = "coverage"
//! kind = "test_coverage"
//! params = { min = 80 }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::PipelineError;
use crate::gate::{CheckKind, DEFAULT_PASS_THRESHOLD, QualityCheck, QualityGate};
use crate::model::{Context, Stage, StageType, Step, Workflow};

/// Top-level wrapper matching the TOML structure `[workflow]`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowFile {
    pub workflow: WorkflowDefinition,
}

/// A complete declarative workflow definition.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowDefinition {
    /// Fixed workflow id. A fresh one is generated when absent.
    #[serde(default)]
    pub id: Option<String>,

    pub title: String,

    #[serde(default)]
    pub description: String,

    /// Caller input, published to steps under the `input` context key.
    #[serde(default)]
    pub input: Context,

    /// Ordered stages.
    pub stages: Vec<StageDefinition>,
}

/// One stage of a workflow.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StageDefinition {
    pub id: String,

    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(rename = "type")]
    pub stage_type: StageType,

    #[serde(default)]
    pub steps: Vec<StepDefinition>,

    #[serde(default)]
    pub gate: Option<GateDefinition>,

    /// Files backed up before the stage runs.
    #[serde(default)]
    pub snapshot_files: Vec<PathBuf>,

    /// Tables captured before the stage runs.
    #[serde(default)]
    pub snapshot_tables: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StepDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_threshold() -> f64 {
    DEFAULT_PASS_THRESHOLD
}

fn default_true() -> bool {
    true
}

fn default_weight() -> f64 {
    1.0
}

/// Quality gate attached to a stage.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GateDefinition {
    /// Defaults to `<stage id>-gate`.
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub name: Option<String>,

    /// Minimum weighted pass ratio (0.0–1.0).
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    #[serde(default = "default_true")]
    pub blocking: bool,

    #[serde(default)]
    pub checks: Vec<CheckDefinition>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckDefinition {
    pub name: String,
    pub kind: CheckKind,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Runner parameters.
    #[serde(default)]
    pub params: Context,
}

// ─────────────────────────────────────────────────────────────────────────────
// Parsing
// ─────────────────────────────────────────────────────────────────────────────

impl WorkflowFile {
    /// Parse a workflow from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, PipelineError> {
        toml::from_str(toml_str)
            .map_err(|e| PipelineError::InvalidWorkflow(format!("TOML parse error: {}", e)))
    }

    /// Parse a workflow from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, PipelineError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::InvalidWorkflow(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }
}

/// Read, validate and convert a workflow file.
pub fn load_workflow(path: &Path) -> Result<Workflow, PipelineError> {
    let file = WorkflowFile::from_file(path)?;
    file.workflow.validate()?;
    debug!(path = %path.display(), stages = file.workflow.stages.len(), "Loaded workflow definition");
    Ok(file.workflow.to_workflow())
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation and conversion
// ─────────────────────────────────────────────────────────────────────────────

impl WorkflowDefinition {
    /// Validate the definition for structural correctness.
    ///
    /// Checks: non-empty title and stages, unique non-empty stage ids, unique
    /// step ids within a stage, unique gate ids, thresholds in range and
    /// non-negative check weights.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.title.trim().is_empty() {
            return Err(PipelineError::InvalidWorkflow(
                "Workflow title cannot be empty".into(),
            ));
        }

        if self.stages.is_empty() {
            return Err(PipelineError::InvalidWorkflow(
                "Workflow must have at least one stage".into(),
            ));
        }

        let mut stage_ids = HashSet::new();
        let mut gate_ids = HashSet::new();
        for stage in &self.stages {
            if stage.id.is_empty() {
                return Err(PipelineError::InvalidWorkflow(
                    "Stage ID cannot be empty".into(),
                ));
            }
            if !stage_ids.insert(stage.id.as_str()) {
                return Err(PipelineError::InvalidWorkflow(format!(
                    "Duplicate stage ID: {}",
                    stage.id
                )));
            }

            let mut step_ids = HashSet::new();
            for step in &stage.steps {
                if step.id.is_empty() {
                    return Err(PipelineError::InvalidWorkflow(format!(
                        "Step ID cannot be empty in stage '{}'",
                        stage.id
                    )));
                }
                if !step_ids.insert(step.id.as_str()) {
                    return Err(PipelineError::InvalidWorkflow(format!(
                        "Duplicate step ID '{}' in stage '{}'",
                        step.id, stage.id
                    )));
                }
            }

            if let Some(ref gate) = stage.gate {
                if !gate_ids.insert(gate.effective_id(&stage.id)) {
                    return Err(PipelineError::InvalidWorkflow(format!(
                        "Duplicate gate ID: {}",
                        gate.effective_id(&stage.id)
                    )));
                }
                if !(0.0..=1.0).contains(&gate.threshold) {
                    return Err(PipelineError::InvalidWorkflow(format!(
                        "Gate threshold {} in stage '{}' must be between 0.0 and 1.0",
                        gate.threshold, stage.id
                    )));
                }
                for check in &gate.checks {
                    if check.name.is_empty() {
                        return Err(PipelineError::InvalidWorkflow(format!(
                            "Check name cannot be empty in stage '{}'",
                            stage.id
                        )));
                    }
                    if !check.weight.is_finite() || check.weight < 0.0 {
                        return Err(PipelineError::InvalidWorkflow(format!(
                            "Check '{}' in stage '{}' has invalid weight {}",
                            check.name, stage.id, check.weight
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    /// Build a runnable workflow. Call [`Self::validate`] first.
    pub fn to_workflow(&self) -> Workflow {
        let mut workflow = match self.id {
            Some(ref id) => Workflow::with_id(id, &self.title),
            None => Workflow::new(&self.title),
        }
        .with_description(&self.description);
        workflow.input = self.input.clone();

        for stage_def in &self.stages {
            workflow.stages.push(stage_def.to_stage());
        }
        workflow
    }
}

impl StageDefinition {
    fn to_stage(&self) -> Stage {
        let name = self.name.as_deref().unwrap_or(&self.id);
        let mut stage = Stage::new(&self.id, name, self.stage_type);
        for step in &self.steps {
            stage = stage.with_step(Step::new(&step.id, step.name.as_deref().unwrap_or(&step.id)));
        }
        if let Some(ref gate) = self.gate {
            stage = stage.with_gate(gate.to_gate(&self.id));
        }
        stage.snapshot_files = self.snapshot_files.clone();
        stage.snapshot_tables = self.snapshot_tables.clone();
        stage
    }
}

impl GateDefinition {
    fn effective_id(&self, stage_id: &str) -> String {
        self.id.clone().unwrap_or_else(|| format!("{stage_id}-gate"))
    }

    fn to_gate(&self, stage_id: &str) -> QualityGate {
        let id = self.effective_id(stage_id);
        let name = self.name.clone().unwrap_or_else(|| id.clone());
        let mut gate = QualityGate::new(id, name)
            .with_threshold(self.threshold)
            .with_blocking(self.blocking);
        for check in &self.checks {
            let mut quality_check = QualityCheck::new(&check.name, check.kind.clone()).with_weight(check.weight);
            quality_check.params = check.params.clone();
            gate = gate.with_check(quality_check);
        }
        gate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GateStatus;
    use crate::model::RunStatus;
    use crate::state::WorkflowState;
    use serde_json::json;

    const VALID: &str = r#"
[workflow]
id = "release-1"
title = "Release"
description = "Build and ship"

[workflow.input]
version = "1.4.0"

[[workflow.stages]]
id = "build"
name = "Build"
type = "implementation"
snapshot_files = ["Cargo.lock"]
snapshot_tables = ["artifacts"]

[[workflow.stages.steps]]
id = "compile"
name = "Compile"

[[workflow.stages.steps]]
id = "link"

[workflow.stages.gate]
threshold = 0.75

[[workflow.stages.gate.checks]]
name = "coverage"
kind = "test_coverage"
weight = 2.0
params = { min = 80 }

[[workflow.stages.gate.checks]]
name = "license"
kind = { custom = "license" }

[[workflow.stages]]
id = "ship"
type = "deployment"

[[workflow.stages.steps]]
id = "push"
"#;

    #[test]
    fn test_parse_valid_workflow() {
        let file = WorkflowFile::from_toml(VALID).unwrap();
        let def = &file.workflow;
        assert_eq!(def.title, "Release");
        assert_eq!(def.stages.len(), 2);
        assert_eq!(def.stages[0].stage_type, StageType::Implementation);
        assert_eq!(def.input["version"], json!("1.4.0"));
        def.validate().unwrap();
    }

    #[test]
    fn test_to_workflow() {
        let wf = WorkflowFile::from_toml(VALID).unwrap().workflow.to_workflow();
        assert_eq!(wf.id, "release-1");
        assert_eq!(wf.status(), WorkflowState::Idle);
        assert_eq!(wf.stages[0].steps[1].name, "link");
        assert_eq!(wf.stages[0].steps[0].status, RunStatus::Pending);
        assert_eq!(wf.stages[0].snapshot_files, vec![PathBuf::from("Cargo.lock")]);
        assert_eq!(wf.stages[1].name, "ship");

        let gate = wf.stages[0].gate.as_ref().unwrap();
        assert_eq!(gate.id, "build-gate");
        assert_eq!(gate.pass_threshold, 0.75);
        assert!(gate.is_blocking);
        assert_eq!(gate.status, GateStatus::Pending);
        assert_eq!(gate.checks[0].weight, 2.0);
        assert_eq!(gate.checks[0].params["min"], json!(80));
        assert_eq!(gate.checks[1].kind, CheckKind::Custom("license".into()));
    }

    #[test]
    fn test_generated_id_when_absent() {
        let toml = r#"
[workflow]
title = "Tiny"

[[workflow.stages]]
id = "only"
type = "custom"
"#;
        let def = WorkflowFile::from_toml(toml).unwrap().workflow;
        def.validate().unwrap();
        let a = def.to_workflow();
        let b = def.to_workflow();
        assert_ne!(a.id, b.id);
        assert!(a.stages[0].steps.is_empty());
    }

    #[test]
    fn test_validate_no_stages() {
        let def = WorkflowFile::from_toml("[workflow]\ntitle = \"x\"\nstages = []\n").unwrap().workflow;
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("at least one stage"));
    }

    #[test]
    fn test_validate_duplicate_stage_ids() {
        let toml = r#"
[workflow]
title = "Dup"

[[workflow.stages]]
id = "a"
type = "design"

[[workflow.stages]]
id = "a"
type = "review"
"#;
        let err = WorkflowFile::from_toml(toml).unwrap().workflow.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate stage ID"));
    }

    #[test]
    fn test_validate_duplicate_step_ids() {
        let toml = r#"
[workflow]
title = "Dup"

[[workflow.stages]]
id = "a"
type = "testing"

[[workflow.stages.steps]]
id = "x"

[[workflow.stages.steps]]
id = "x"
"#;
        let err = WorkflowFile::from_toml(toml).unwrap().workflow.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate step ID"));
    }

    #[test]
    fn test_validate_threshold_range() {
        let toml = r#"
[workflow]
title = "Gate"

[[workflow.stages]]
id = "a"
type = "review"

[workflow.stages.gate]
threshold = 1.5
"#;
        let err = WorkflowFile::from_toml(toml).unwrap().workflow.validate().unwrap_err();
        assert!(err.to_string().contains("between 0.0 and 1.0"));
    }

    #[test]
    fn test_validate_negative_weight() {
        let toml = r#"
[workflow]
title = "Gate"

[[workflow.stages]]
id = "a"
type = "review"

[workflow.stages.gate]

[[workflow.stages.gate.checks]]
name = "lint"
kind = "lint"
weight = -1.0
"#;
        let err = WorkflowFile::from_toml(toml).unwrap().workflow.validate().unwrap_err();
        assert!(err.to_string().contains("invalid weight"));
    }

    #[test]
    fn test_unknown_stage_type_rejected() {
        let toml = r#"
[workflow]
title = "Bad"

[[workflow.stages]]
id = "a"
type = "teleport"
"#;
        assert!(WorkflowFile::from_toml(toml).is_err());
    }

    #[test]
    fn test_invalid_toml_syntax() {
        let err = WorkflowFile::from_toml("not valid toml [[[").unwrap_err();
        assert!(err.to_string().contains("TOML parse error"));
    }

    #[test]
    fn test_load_workflow_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("release.toml");
        std::fs::write(&path, VALID).unwrap();
        let wf = load_workflow(&path).unwrap();
        assert_eq!(wf.stages.len(), 2);

        let missing = load_workflow(&dir.path().join("missing.toml")).unwrap_err();
        assert!(missing.to_string().contains("Failed to read"));
    }
}
