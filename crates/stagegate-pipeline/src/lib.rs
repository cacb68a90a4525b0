//! Staged workflow orchestration for Stagegate.
//!
//! This crate provides the `PipelineEngine`: it runs a workflow's stages in
//! order, each stage's steps through a pluggable executor, evaluates quality
//! gates between stages, and snapshots execution context, files and table
//! rows so a stage can be rolled back.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  PipelineEngine                                         │
//! │  - Active-workflow registry + bounded history           │
//! │  - StepExecutor per StageType (retry, backoff, timeout) │
//! │  - QualityGateEvaluator between stages                  │
//! │  - SnapshotStore at stage boundaries                    │
//! │  - pause / resume / cancel at suspension points         │
//! │  - PipelineEvent broadcast                              │
//! └─────────────────────────────────────────────────────────┘
//!            │ drives
//!            ▼
//!   Workflow ─ StateMachine (idle → running ⇄ paused → terminal)
//! ```

pub mod definition;
pub mod engine;
pub mod error;
pub mod events;
pub mod gate;
pub mod history;
pub mod model;
pub mod retry;
pub mod snapshot;
pub mod state;
pub mod step;
pub mod table;

pub use definition::{
    CheckDefinition, GateDefinition, StageDefinition, StepDefinition, WorkflowDefinition,
    WorkflowFile, load_workflow,
};
pub use engine::{PipelineConfig, PipelineEngine};
pub use error::{PipelineError, Result};
pub use events::{EventBus, PipelineEvent};
pub use gate::{
    CheckKind, CheckOutcome, CheckReport, CheckRunner, CheckStatus, ContextPresenceRunner,
    ContextThresholdRunner, GateReport, GateStatus, QualityCheck, QualityGate,
    QualityGateEvaluator,
};
pub use history::{HistoryEntry, WorkflowHistory};
pub use model::{
    Context, LogLevel, RunStatus, Stage, StageType, Step, Workflow, WorkflowLog, WorkflowProgress,
};
pub use retry::RetryPolicy;
pub use snapshot::{
    FileBackup, RestoreMode, RestoreResult, RestoreTarget, Snapshot, SnapshotReceipt,
    SnapshotRequest, SnapshotStore, deep_copy,
};
pub use state::{StateMachine, StateTransition, WorkflowState};
pub use step::{FnExecutor, NoopExecutor, StepError, StepExecutor, StepOutput};
pub use table::{Row, SqliteTableStore, TableStore};
