//! Workflow data model: workflows own stages, stages own steps and an
//! optional quality gate.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gate::{GateStatus, QualityGate};
use crate::state::{StateMachine, WorkflowState};

/// Key-value store shared by all steps of a workflow.
pub type Context = serde_json::Map<String, Value>;

/// Context key under which the workflow input is published to steps.
pub const INPUT_KEY: &str = "input";

// ─────────────────────────────────────────────────────────────────────────────
// Stage types
// ─────────────────────────────────────────────────────────────────────────────

/// Kind of work a stage performs. Selects the registered step executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    Analysis,
    Design,
    Implementation,
    Testing,
    Review,
    Deployment,
    Custom,
}

impl StageType {
    /// Every stage type, in pipeline order.
    pub const ALL: [StageType; 7] = [
        StageType::Analysis,
        StageType::Design,
        StageType::Implementation,
        StageType::Testing,
        StageType::Review,
        StageType::Deployment,
        StageType::Custom,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageType::Analysis => "analysis",
            StageType::Design => "design",
            StageType::Implementation => "implementation",
            StageType::Testing => "testing",
            StageType::Review => "review",
            StageType::Deployment => "deployment",
            StageType::Custom => "custom",
        }
    }
}

impl fmt::Display for StageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Steps
// ─────────────────────────────────────────────────────────────────────────────

/// Status shared by stages and steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Smallest unit of executable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    pub status: RunStatus,
    /// Payload returned by the step executor.
    #[serde(default)]
    pub result: Context,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Executor invocations made for the latest run of this step.
    #[serde(default)]
    pub attempts: u32,
}

impl Step {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: RunStatus::Pending,
            result: Context::new(),
            started_at: None,
            ended_at: None,
            error: None,
            attempts: 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    fn reset(&mut self) {
        self.status = RunStatus::Pending;
        self.result.clear();
        self.started_at = None;
        self.ended_at = None;
        self.error = None;
        self.attempts = 0;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stages
// ─────────────────────────────────────────────────────────────────────────────

/// Ordered phase of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: String,
    pub name: String,
    pub stage_type: StageType,
    pub steps: Vec<Step>,
    pub gate: Option<QualityGate>,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Files backed up when the stage is snapshotted.
    #[serde(default)]
    pub snapshot_files: Vec<PathBuf>,
    /// Tables captured when the stage is snapshotted.
    #[serde(default)]
    pub snapshot_tables: Vec<String>,
}

impl Stage {
    pub fn new(id: impl Into<String>, name: impl Into<String>, stage_type: StageType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            stage_type,
            steps: Vec::new(),
            gate: None,
            status: RunStatus::Pending,
            started_at: None,
            ended_at: None,
            snapshot_files: Vec::new(),
            snapshot_tables: Vec::new(),
        }
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_gate(mut self, gate: QualityGate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_snapshot_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_files.push(path.into());
        self
    }

    pub fn with_snapshot_table(mut self, table: impl Into<String>) -> Self {
        self.snapshot_tables.push(table.into());
        self
    }

    pub fn completed_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.is_completed()).count()
    }

    /// Completed-steps percentage (0.0–100.0). A stage without steps is
    /// complete by definition.
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 100.0;
        }
        self.completed_steps() as f64 / self.steps.len() as f64 * 100.0
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Results of completed steps keyed by step id.
    pub fn step_results(&self) -> Context {
        self.steps
            .iter()
            .filter(|s| s.is_completed())
            .map(|s| (s.id.clone(), Value::Object(s.result.clone())))
            .collect()
    }

    /// Prepare a failed stage for another run: completed steps are kept,
    /// everything else goes back to pending. An overridden gate stays
    /// overridden.
    pub(crate) fn prepare_retry(&mut self) {
        self.status = RunStatus::Pending;
        self.ended_at = None;
        for step in self.steps.iter_mut().filter(|s| !s.is_completed()) {
            step.reset();
        }
        if let Some(ref mut gate) = self.gate
            && gate.status != GateStatus::Skipped
        {
            gate.reset();
        }
    }

    /// Reset run-time fields. Step results and gate verdicts are cleared.
    pub fn reset(&mut self) {
        self.status = RunStatus::Pending;
        self.started_at = None;
        self.ended_at = None;
        for step in &mut self.steps {
            step.reset();
        }
        if let Some(ref mut gate) = self.gate {
            gate.reset();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Logs and progress projections
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Append-only workflow log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub stage_id: Option<String>,
    pub step_id: Option<String>,
}

/// Read-only progress projection emitted with `workflow:progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowProgress {
    pub workflow_id: String,
    pub state: WorkflowState,
    pub current_stage_index: usize,
    pub total_stages: usize,
    pub stage_id: Option<String>,
    /// Current stage completion (0.0–100.0).
    pub stage_progress: f64,
    /// Whole-workflow completion (0.0–100.0).
    pub overall_progress: f64,
    pub message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Workflow
// ─────────────────────────────────────────────────────────────────────────────

/// Aggregate root: an ordered list of stages plus run-time state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub title: String,
    pub description: String,
    pub stages: Vec<Stage>,
    pub state: StateMachine,
    pub current_stage_index: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub input: Context,
    pub context: Context,
    pub logs: Vec<WorkflowLog>,
    pub paused_at: Option<DateTime<Utc>>,
    /// Message of the error that failed the workflow, if any.
    pub error: Option<String>,
}

impl Workflow {
    /// Create an empty workflow with a generated id.
    pub fn new(title: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), title)
    }

    pub fn with_id(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            stages: Vec::new(),
            state: StateMachine::new(),
            current_stage_index: 0,
            started_at: None,
            ended_at: None,
            input: Context::new(),
            context: Context::new(),
            logs: Vec::new(),
            paused_at: None,
            error: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.input.insert(key.into(), value);
        self
    }

    /// Current lifecycle state.
    pub fn status(&self) -> WorkflowState {
        self.state.state()
    }

    pub fn stage(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    pub fn current_stage(&self) -> Option<&Stage> {
        self.stages.get(self.current_stage_index)
    }

    /// First stage that ended in failure.
    pub fn failed_stage(&self) -> Option<&Stage> {
        self.stages.iter().find(|s| s.status == RunStatus::Failed)
    }

    /// Locate a gate by its id (or by its owning stage id).
    pub fn gate_mut(&mut self, gate_id: &str) -> Option<&mut QualityGate> {
        self.stages.iter_mut().find_map(|stage| {
            let stage_id = stage.id.as_str();
            match stage.gate {
                Some(ref mut gate) if gate.id == gate_id || stage_id == gate_id => Some(gate),
                _ => None,
            }
        })
    }

    /// Whole-workflow completion (0.0–100.0), counting partial stages.
    pub fn overall_progress(&self) -> f64 {
        if self.stages.is_empty() {
            return 100.0;
        }
        let total: f64 = self
            .stages
            .iter()
            .map(|s| match s.status {
                RunStatus::Completed => 100.0,
                _ => s.progress(),
            })
            .sum();
        total / self.stages.len() as f64
    }

    /// Build a progress projection for the current position.
    pub fn progress(&self, message: impl Into<String>) -> WorkflowProgress {
        let stage = self.current_stage();
        WorkflowProgress {
            workflow_id: self.id.clone(),
            state: self.status(),
            current_stage_index: self.current_stage_index,
            total_stages: self.stages.len(),
            stage_id: stage.map(|s| s.id.clone()),
            stage_progress: stage.map(|s| s.progress()).unwrap_or(0.0),
            overall_progress: self.overall_progress(),
            message: message.into(),
        }
    }

    /// Append a log line.
    pub fn log(
        &mut self,
        level: LogLevel,
        message: impl Into<String>,
        stage_id: Option<&str>,
        step_id: Option<&str>,
    ) {
        self.logs.push(WorkflowLog {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            stage_id: stage_id.map(str::to_string),
            step_id: step_id.map(str::to_string),
        });
    }

    /// Most recent log line.
    pub fn last_log(&self) -> Option<&WorkflowLog> {
        self.logs.last()
    }
}
