//! Error types for the pipeline orchestrator.

use thiserror::Error;

use crate::state::WorkflowState;

/// Result type for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur during pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// An illegal lifecycle call. Never retried.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition {
        from: WorkflowState,
        to: WorkflowState,
    },

    /// The workflow is not in a state that allows the requested operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A step exhausted its retries.
    #[error("Execution failed at {stage_id}/{step_id}: {message}")]
    ExecutionFailed {
        stage_id: String,
        step_id: String,
        message: String,
    },

    /// A blocking quality gate scored below its threshold.
    #[error("Quality gate '{gate}' failed: score {score:.2} below threshold {threshold:.2}")]
    QualityGateFailed {
        gate: String,
        score: f64,
        threshold: f64,
    },

    /// Cooperative cancellation was observed.
    #[error("Workflow cancelled")]
    Cancelled,

    /// No snapshot is registered for the stage.
    #[error("Snapshot not found for stage: {0}")]
    SnapshotNotFound(String),

    /// One or more parts of a snapshot could not be restored.
    #[error("Snapshot restore failed for stage {stage_id}: {message}")]
    SnapshotRestoreFailed { stage_id: String, message: String },

    /// Workflow not found in the registry or history.
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Quality gate not found in a workflow.
    #[error("Quality gate not found: {0}")]
    GateNotFound(String),

    /// No step executor registered for a stage type.
    #[error("No executor registered for stage type: {0}")]
    NoExecutor(String),

    /// Invalid workflow definition.
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// Filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Table store error.
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for PipelineError {
    fn from(err: rusqlite::Error) -> Self {
        PipelineError::Database(err.to_string())
    }
}

impl PipelineError {
    /// Whether this error is the cooperative-cancellation marker.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}
