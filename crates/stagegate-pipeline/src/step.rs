//! Pluggable step execution.
//!
//! The engine looks up one [`StepExecutor`] per [`StageType`](crate::model::StageType) and calls it
//! for every step of stages of that type.

use std::fmt;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;

use crate::model::{Context, Stage, Step};

/// What a successful step hands back.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    /// Stored on the step as its result payload.
    pub result: Context,
    /// Merged into the workflow context before the next step runs.
    pub context_updates: Context,
}

impl StepOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, key: impl Into<String>, value: Value) -> Self {
        self.result.insert(key.into(), value);
        self
    }

    pub fn with_update(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context_updates.insert(key.into(), value);
        self
    }
}

/// Failure reported by a step executor.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StepError {
    pub message: String,
    /// When false, remaining attempts are skipped.
    pub retryable: bool,
}

impl StepError {
    /// A transient failure worth another attempt.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that no retry will fix.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Performs the work of a step.
///
/// Executors receive snapshots of the stage, the step and the workflow
/// context; they never see the live workflow. Any async I/O is fine, the
/// engine only imposes the per-step timeout.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, stage: &Stage, step: &Step, context: &Context) -> Result<StepOutput, StepError>;
}

/// Succeeds immediately, echoing where it ran.
#[derive(Debug, Default, Clone)]
pub struct NoopExecutor;

#[async_trait]
impl StepExecutor for NoopExecutor {
    async fn execute(&self, stage: &Stage, step: &Step, _context: &Context) -> Result<StepOutput, StepError> {
        Ok(StepOutput::new()
            .with_result("stage_type", json!(stage.stage_type))
            .with_result("step", json!(step.id))
            .with_result("noop", json!(true)))
    }
}

/// Adapts a synchronous closure into a [`StepExecutor`].
pub struct FnExecutor<F> {
    func: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(&Stage, &Step, &Context) -> Result<StepOutput, StepError> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> fmt::Debug for FnExecutor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnExecutor").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> StepExecutor for FnExecutor<F>
where
    F: Fn(&Stage, &Step, &Context) -> Result<StepOutput, StepError> + Send + Sync,
{
    async fn execute(&self, stage: &Stage, step: &Step, context: &Context) -> Result<StepOutput, StepError> {
        (self.func)(stage, step, context)
    }
}
