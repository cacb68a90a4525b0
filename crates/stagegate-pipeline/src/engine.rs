//! Pipeline engine: drives workflows stage by stage.
//!
//! Provides `PipelineEngine` which owns the active-workflow registry, the
//! step executor table, the quality gate evaluator, the snapshot store and
//! the bounded history of finished workflows.
//!
//! Within one workflow execution is strictly sequential. Pause, resume and
//! cancel are requests from other tasks; the executing task honors them at
//! suspension points (before each stage for pause, before each step and
//! during retry backoff for cancel).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use stagegate_config::{PipelineSection, SnapshotSection, StagegateConfig};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::gate::{CheckKind, CheckRunner, GateReport, QualityGateEvaluator};
use crate::history::{HistoryEntry, WorkflowHistory};
use crate::model::{Context, INPUT_KEY, LogLevel, RunStatus, StageType, Workflow};
use crate::retry::{RetryFailure, RetryPolicy, run_with_retry};
use crate::snapshot::{RestoreMode, RestoreResult, RestoreTarget, SnapshotRequest, SnapshotStore};
use crate::state::WorkflowState;
use crate::step::StepExecutor;
use crate::table::TableStore;

/// Configuration for the pipeline engine.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Run stage quality gates.
    pub enable_quality_gates: bool,
    /// Fail the workflow when a blocking gate fails.
    pub stop_on_gate_failure: bool,
    /// Snapshot each stage before it runs.
    pub enable_snapshots: bool,
    /// Retries per step after the first attempt.
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Limit for a single step attempt.
    pub step_timeout: Duration,
    pub max_snapshots: usize,
    pub max_history_entries: usize,
    /// Snapshot backup root. A private temp directory when unset.
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_sections(&PipelineSection::default(), &SnapshotSection::default())
    }
}

impl PipelineConfig {
    pub fn from_sections(pipeline: &PipelineSection, snapshots: &SnapshotSection) -> Self {
        Self {
            enable_quality_gates: pipeline.enable_quality_gates,
            stop_on_gate_failure: pipeline.stop_on_gate_failure,
            enable_snapshots: pipeline.enable_snapshots,
            max_retries: pipeline.max_retries,
            retry_base_delay: pipeline.retry_base_delay(),
            retry_max_delay: pipeline.retry_max_delay(),
            step_timeout: pipeline.step_timeout(),
            max_snapshots: snapshots.max_snapshots,
            max_history_entries: pipeline.max_history_entries,
            snapshot_dir: snapshots.directory.clone(),
        }
    }

    pub fn from_config(config: &StagegateConfig) -> Self {
        Self::from_sections(&config.pipeline(), &config.snapshots())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
        }
    }
}

/// Signals shared between the executing task and control calls.
struct RunControl {
    cancel: CancellationToken,
    /// `true` while a pause is requested.
    paused: watch::Sender<bool>,
    cancel_reason: Mutex<Option<String>>,
}

impl RunControl {
    fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused,
            cancel_reason: Mutex::new(None),
        }
    }
}

/// Registry entry for one workflow.
#[derive(Clone)]
struct Run {
    workflow: Arc<Mutex<Workflow>>,
    control: Arc<RunControl>,
}

/// The pipeline engine.
pub struct PipelineEngine {
    config: PipelineConfig,
    executors: RwLock<HashMap<StageType, Arc<dyn StepExecutor>>>,
    evaluator: RwLock<QualityGateEvaluator>,
    snapshots: Arc<SnapshotStore>,
    table_store: Option<Arc<dyn TableStore>>,
    registry: Mutex<HashMap<String, Run>>,
    history: Mutex<WorkflowHistory>,
    events: EventBus,
}

impl std::fmt::Debug for PipelineEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineEngine")
            .field("config", &self.config)
            .field("executors", &self.executors.read().keys().collect::<Vec<_>>())
            .field("active", &self.registry.lock().len())
            .finish_non_exhaustive()
    }
}

impl PipelineEngine {
    /// Create an engine with no executors and an evaluator without runners.
    pub fn new(config: PipelineConfig) -> Self {
        let snapshots = match config.snapshot_dir {
            Some(ref dir) => SnapshotStore::new(dir, config.max_snapshots),
            None => SnapshotStore::in_temp_dir(config.max_snapshots),
        };
        info!(
            snapshot_root = %snapshots.root().display(),
            max_retries = config.max_retries,
            "Pipeline engine initialized"
        );
        Self {
            history: Mutex::new(WorkflowHistory::new(config.max_history_entries)),
            config,
            executors: RwLock::new(HashMap::new()),
            evaluator: RwLock::new(QualityGateEvaluator::new()),
            snapshots: Arc::new(snapshots),
            table_store: None,
            registry: Mutex::new(HashMap::new()),
            events: EventBus::default(),
        }
    }

    /// Table store used for stage table snapshots and restores.
    pub fn with_table_store(mut self, store: Arc<dyn TableStore>) -> Self {
        self.table_store = Some(store);
        self
    }

    pub fn with_evaluator(self, evaluator: QualityGateEvaluator) -> Self {
        *self.evaluator.write() = evaluator;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    // ─────────────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────────────

    /// Register (or replace) the executor for a stage type.
    pub fn register_executor(&self, stage_type: StageType, executor: Arc<dyn StepExecutor>) {
        debug!(%stage_type, "Registering step executor");
        self.executors.write().insert(stage_type, executor);
    }

    /// Use one executor for every stage type.
    pub fn register_executor_for_all(&self, executor: Arc<dyn StepExecutor>) {
        let mut executors = self.executors.write();
        for stage_type in StageType::ALL {
            executors.insert(stage_type, executor.clone());
        }
    }

    pub fn has_executor(&self, stage_type: StageType) -> bool {
        self.executors.read().contains_key(&stage_type)
    }

    /// Register (or replace) the runner for a quality check kind.
    pub fn register_check_runner(&self, kind: CheckKind, runner: Arc<dyn CheckRunner>) {
        debug!(%kind, "Registering check runner");
        self.evaluator.write().register(kind, runner);
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Execution
    // ─────────────────────────────────────────────────────────────────────

    /// Execute a workflow to completion on the current task.
    ///
    /// Returns the finished workflow. On failure the error is returned and
    /// the failed workflow stays queryable through [`Self::get_workflow`].
    pub async fn execute(&self, workflow: Workflow) -> Result<Workflow> {
        let run = self.register(workflow)?;
        self.drive(run).await
    }

    /// Execute a workflow on its own task.
    ///
    /// The workflow is registered before this returns, so control calls
    /// with the returned id take effect immediately.
    pub fn spawn(self: &Arc<Self>, workflow: Workflow) -> Result<(String, JoinHandle<Result<Workflow>>)> {
        let workflow_id = workflow.id.clone();
        let run = self.register(workflow)?;
        // Already running here, so pause/cancel with the id are valid at once
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move { engine.drive(run).await });
        Ok((workflow_id, handle))
    }

    /// Re-run a failed workflow from the stage that failed.
    ///
    /// Completed stages and completed steps of the failed stage are kept.
    pub async fn retry(&self, workflow_id: &str) -> Result<Workflow> {
        let run = {
            let mut registry = self.registry.lock();
            let run = registry
                .get_mut(workflow_id)
                .ok_or_else(|| PipelineError::WorkflowNotFound(workflow_id.to_string()))?;

            let mut wf = run.workflow.lock();
            wf.state.retry()?;
            let index = wf.current_stage_index;
            if let Some(stage) = wf.stages.get_mut(index) {
                stage.prepare_retry();
            }
            wf.ended_at = None;
            wf.error = None;
            wf.log(LogLevel::Info, "Retrying workflow", None, None);
            drop(wf);

            run.control = Arc::new(RunControl::new());
            run.clone()
        };

        info!(workflow_id, "Retrying workflow");
        let title = run.workflow.lock().title.clone();
        self.events.emit(PipelineEvent::WorkflowStart {
            workflow_id: workflow_id.to_string(),
            title,
        });

        let result = self.run_stages(&run).await;
        self.finalize(&run, result).await
    }

    /// Register the workflow and move it to `running`.
    fn register(&self, mut workflow: Workflow) -> Result<Run> {
        if !workflow.state.can_start() {
            return Err(PipelineError::InvalidState(format!(
                "workflow {} cannot start from '{}'",
                workflow.id,
                workflow.status()
            )));
        }

        let mut registry = self.registry.lock();
        if registry.contains_key(&workflow.id) {
            return Err(PipelineError::InvalidState(format!(
                "workflow {} is already registered",
                workflow.id
            )));
        }
        workflow.state.start()?;
        workflow.started_at = Some(Utc::now());
        if !workflow.input.is_empty() && !workflow.context.contains_key(INPUT_KEY) {
            let input = Value::Object(workflow.input.clone());
            workflow.context.insert(INPUT_KEY.to_string(), input);
        }
        workflow.log(LogLevel::Info, "Workflow started", None, None);
        let (workflow_id, title) = (workflow.id.clone(), workflow.title.clone());

        let run = Run {
            workflow: Arc::new(Mutex::new(workflow)),
            control: Arc::new(RunControl::new()),
        };
        registry.insert(workflow_id.clone(), run.clone());
        drop(registry);

        info!(workflow_id = %workflow_id, %title, "Workflow started");
        self.events.emit(PipelineEvent::WorkflowStart { workflow_id, title });
        Ok(run)
    }

    async fn drive(&self, run: Run) -> Result<Workflow> {
        let result = self.run_stages(&run).await;
        self.finalize(&run, result).await
    }

    async fn run_stages(&self, run: &Run) -> Result<()> {
        let (start, total) = {
            let wf = run.workflow.lock();
            (wf.current_stage_index, wf.stages.len())
        };

        for index in start..total {
            self.checkpoint(run).await?;
            self.run_stage(run, index).await?;
        }
        Ok(())
    }

    /// Honor cancellation and a pending pause.
    async fn checkpoint(&self, run: &Run) -> Result<()> {
        let control = &run.control;
        if control.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let mut paused = control.paused.subscribe();
        while *paused.borrow_and_update() {
            debug!("Workflow paused, waiting for resume");
            tokio::select! {
                _ = control.cancel.cancelled() => return Err(PipelineError::Cancelled),
                changed = paused.changed() => {
                    if changed.is_err() {
                        return Err(PipelineError::Cancelled);
                    }
                }
            }
        }

        if control.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    async fn run_stage(&self, run: &Run, index: usize) -> Result<()> {
        let capture = {
            let mut wf = run.workflow.lock();
            wf.current_stage_index = index;
            self.config.enable_snapshots.then(|| SnapshotCapture::of(&wf, index))
        };
        if let Some(capture) = capture {
            let errors = self.snapshot_stage(capture).await;
            let mut wf = run.workflow.lock();
            let stage_id = wf.stages[index].id.clone();
            for error in errors {
                wf.log(LogLevel::Warn, format!("Snapshot: {error}"), Some(&stage_id), None);
            }
        }

        let (workflow_id, stage_id, step_count) = {
            let mut wf = run.workflow.lock();
            let stage = &mut wf.stages[index];
            stage.status = RunStatus::Running;
            stage.started_at = Some(Utc::now());
            stage.ended_at = None;
            let (stage_id, step_count) = (stage.id.clone(), stage.steps.len());
            wf.log(LogLevel::Info, "Stage started", Some(&stage_id), None);
            (wf.id.clone(), stage_id, step_count)
        };

        info!(workflow_id = %workflow_id, stage_id = %stage_id, index, "Stage started");
        self.events.emit(PipelineEvent::StageStart {
            workflow_id: workflow_id.clone(),
            stage_id: stage_id.clone(),
            stage_index: index,
        });

        for step_index in 0..step_count {
            if run.control.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            self.run_step(run, index, step_index).await?;
        }

        self.run_gate(run, index).await?;

        let progress = {
            let mut wf = run.workflow.lock();
            let stage = &mut wf.stages[index];
            stage.status = RunStatus::Completed;
            stage.ended_at = Some(Utc::now());
            wf.log(LogLevel::Info, "Stage completed", Some(&stage_id), None);
            wf.progress(format!("Stage {stage_id} completed"))
        };

        info!(workflow_id = %workflow_id, stage_id = %stage_id, "Stage completed");
        self.events.emit(PipelineEvent::StageComplete { workflow_id, stage_id });
        self.events.emit(PipelineEvent::WorkflowProgress(progress));
        Ok(())
    }

    /// Capture the stage snapshot on the blocking pool, off the workflow lock.
    async fn snapshot_stage(&self, capture: SnapshotCapture) -> Vec<String> {
        let store = Arc::clone(&self.snapshots);
        let database = self.table_store.clone();
        let key = capture.key.clone();
        let task = tokio::task::spawn_blocking(move || {
            let request = SnapshotRequest {
                context: Some(&capture.context),
                files: capture.files,
                database: database.as_deref(),
                tables: capture.tables,
            };
            store.create_snapshot(&capture.key, &capture.stage_name, request)
        });
        match task.await {
            Ok(receipt) => receipt.errors,
            Err(e) => {
                warn!(snapshot = %key, error = %e, "Snapshot task failed");
                vec![e.to_string()]
            }
        }
    }

    async fn run_step(&self, run: &Run, stage_index: usize, step_index: usize) -> Result<()> {
        let (workflow_id, stage, step, context, progress) = {
            let mut wf = run.workflow.lock();
            let step = &mut wf.stages[stage_index].steps[step_index];
            if step.is_completed() {
                return Ok(());
            }
            step.status = RunStatus::Running;
            step.started_at = Some(Utc::now());
            step.ended_at = None;
            step.error = None;
            let stage = wf.stages[stage_index].clone();
            let step = stage.steps[step_index].clone();
            let progress = wf.progress(format!("Step {} started", step.id));
            (wf.id.clone(), stage, step, wf.context.clone(), progress)
        };
        self.events.emit(PipelineEvent::WorkflowProgress(progress));

        let executor = self.executors.read().get(&stage.stage_type).cloned();
        let Some(executor) = executor else {
            self.record_step_failure(run, stage_index, step_index, 0, "no executor registered");
            return Err(PipelineError::NoExecutor(stage.stage_type.to_string()));
        };

        debug!(workflow_id = %workflow_id, stage_id = %stage.id, step_id = %step.id, "Running step");
        let label = format!("{}/{}", stage.id, step.id);
        let outcome = run_with_retry(
            &self.config.retry_policy(),
            self.config.step_timeout,
            &run.control.cancel,
            &label,
            |attempt| {
                debug!(step_id = %step.id, attempt, "Invoking step executor");
                executor.execute(&stage, &step, &context)
            },
        )
        .await;

        match outcome {
            Ok((output, attempts)) => {
                let progress = {
                    let mut wf = run.workflow.lock();
                    let target = &mut wf.stages[stage_index].steps[step_index];
                    target.status = RunStatus::Completed;
                    target.result = output.result;
                    target.ended_at = Some(Utc::now());
                    target.attempts = attempts;
                    wf.context.extend(output.context_updates);
                    wf.log(
                        LogLevel::Debug,
                        format!("Step completed after {attempts} attempt(s)"),
                        Some(&stage.id),
                        Some(&step.id),
                    );
                    wf.progress(format!("Step {} completed", step.id))
                };
                debug!(workflow_id = %workflow_id, step_id = %step.id, attempts, "Step completed");
                self.events.emit(PipelineEvent::WorkflowProgress(progress));
                Ok(())
            }
            Err(RetryFailure::Cancelled { attempts }) => {
                self.record_step_failure(run, stage_index, step_index, attempts, "cancelled");
                Err(PipelineError::Cancelled)
            }
            Err(RetryFailure::Exhausted { attempts, message }) => {
                self.record_step_failure(run, stage_index, step_index, attempts, &message);
                Err(PipelineError::ExecutionFailed {
                    stage_id: stage.id,
                    step_id: step.id,
                    message,
                })
            }
        }
    }

    fn record_step_failure(&self, run: &Run, stage_index: usize, step_index: usize, attempts: u32, message: &str) {
        let progress = {
            let mut wf = run.workflow.lock();
            let stage_id = wf.stages[stage_index].id.clone();
            let step = &mut wf.stages[stage_index].steps[step_index];
            step.status = RunStatus::Failed;
            step.error = Some(message.to_string());
            step.ended_at = Some(Utc::now());
            step.attempts = attempts;
            let step_id = step.id.clone();
            wf.log(
                LogLevel::Error,
                format!("Step failed: {message}"),
                Some(&stage_id),
                Some(&step_id),
            );
            wf.progress(format!("Step {step_id} failed"))
        };
        self.events.emit(PipelineEvent::WorkflowProgress(progress));
    }

    async fn run_gate(&self, run: &Run, index: usize) -> Result<()> {
        let (workflow_id, stage_id, mut gate, gate_context) = {
            let wf = run.workflow.lock();
            let stage = &wf.stages[index];
            let Some(ref gate) = stage.gate else {
                return Ok(());
            };
            if !self.config.enable_quality_gates {
                debug!(stage_id = %stage.id, "Quality gates disabled, skipping");
                return Ok(());
            }
            let mut context = wf.context.clone();
            context.extend(stage.step_results());
            (wf.id.clone(), stage.id.clone(), gate.clone(), context)
        };

        let evaluator = self.evaluator.read().clone();
        let report = evaluator.evaluate(&mut gate, &gate_context).await;

        {
            let mut wf = run.workflow.lock();
            wf.stages[index].gate = Some(gate);
            let (level, verdict) = if report.passed {
                (LogLevel::Info, "passed")
            } else {
                (LogLevel::Warn, "failed")
            };
            wf.log(
                level,
                format!(
                    "Quality gate {} {verdict} (score {:.2}, threshold {:.2})",
                    report.gate_id, report.score, report.threshold
                ),
                Some(&stage_id),
                None,
            );
        }

        if report.passed {
            self.events.emit(PipelineEvent::GatePassed {
                workflow_id,
                stage_id,
                report,
            });
            return Ok(());
        }

        let blocking = report.blocking && self.config.stop_on_gate_failure;
        let err = PipelineError::QualityGateFailed {
            gate: report.gate_id.clone(),
            score: report.score,
            threshold: report.threshold,
        };
        if !blocking {
            warn!(workflow_id = %workflow_id, stage_id = %stage_id, "Non-blocking {err}");
        }
        self.events.emit(PipelineEvent::GateFailed {
            workflow_id,
            stage_id,
            report,
        });
        if blocking { Err(err) } else { Ok(()) }
    }

    async fn finalize(&self, run: &Run, result: Result<()>) -> Result<Workflow> {
        let result = match result {
            Ok(()) => self.checkpoint(run).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                let finished = {
                    let mut wf = run.workflow.lock();
                    wf.state.complete()?;
                    wf.ended_at = Some(Utc::now());
                    wf.log(LogLevel::Info, "Workflow completed", None, None);
                    wf.clone()
                };
                self.archive(&finished, true);
                info!(workflow_id = %finished.id, "Workflow completed");
                self.events.emit(PipelineEvent::WorkflowProgress(finished.progress("Workflow completed")));
                self.events.emit(PipelineEvent::WorkflowComplete {
                    workflow_id: finished.id.clone(),
                });
                Ok(finished)
            }
            Err(PipelineError::Cancelled) => {
                let reason = run
                    .control
                    .cancel_reason
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "cancelled".to_string());
                let finished = {
                    let mut wf = run.workflow.lock();
                    if wf.state.can_cancel() {
                        wf.state.cancel(reason.clone())?;
                    }
                    wf.ended_at = Some(Utc::now());
                    wf.paused_at = None;
                    let index = wf.current_stage_index;
                    if let Some(stage) = wf.stages.get_mut(index)
                        && stage.status == RunStatus::Running
                    {
                        stage.status = RunStatus::Pending;
                        stage.ended_at = Some(Utc::now());
                    }
                    wf.log(LogLevel::Warn, format!("Workflow cancelled: {reason}"), None, None);
                    wf.clone()
                };
                self.archive(&finished, true);
                info!(workflow_id = %finished.id, %reason, "Workflow cancelled");
                self.events.emit(PipelineEvent::WorkflowCancelled {
                    workflow_id: finished.id,
                    reason,
                });
                Err(PipelineError::Cancelled)
            }
            Err(e) => {
                let message = e.to_string();
                let (finished, stage_id) = {
                    let mut wf = run.workflow.lock();
                    // A pause requested mid-step does not block the failure
                    if wf.state.can_resume() {
                        wf.state.resume()?;
                        wf.paused_at = None;
                    }
                    wf.state.fail(message.clone())?;
                    wf.ended_at = Some(Utc::now());
                    wf.error = Some(message.clone());
                    let index = wf.current_stage_index;
                    let stage_id = wf.stages.get_mut(index).map(|stage| {
                        if stage.status == RunStatus::Running {
                            stage.status = RunStatus::Failed;
                            stage.ended_at = Some(Utc::now());
                        }
                        stage.id.clone()
                    });
                    wf.log(LogLevel::Error, format!("Workflow failed: {message}"), stage_id.as_deref(), None);
                    (wf.clone(), stage_id)
                };
                self.archive(&finished, false);
                error!(workflow_id = %finished.id, stage_id = ?stage_id, error = %message, "Workflow failed");
                self.events.emit(PipelineEvent::WorkflowFailed {
                    workflow_id: finished.id,
                    stage_id,
                    error: message,
                });
                Err(e)
            }
        }
    }

    /// Copy into history; completed and cancelled runs also leave the registry.
    fn archive(&self, workflow: &Workflow, deregister: bool) {
        if deregister {
            self.registry.lock().remove(&workflow.id);
        }
        self.history.lock().push(workflow.clone());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Control
    // ─────────────────────────────────────────────────────────────────────

    fn lookup(&self, workflow_id: &str) -> Result<Run> {
        self.registry
            .lock()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| PipelineError::WorkflowNotFound(workflow_id.to_string()))
    }

    /// Request a pause. The running stage finishes; the next one waits.
    pub fn pause(&self, workflow_id: &str) -> Result<()> {
        let run = self.lookup(workflow_id)?;
        {
            let mut wf = run.workflow.lock();
            wf.state.pause()?;
            wf.paused_at = Some(Utc::now());
            wf.log(LogLevel::Info, "Workflow paused", None, None);
        }
        run.control.paused.send_replace(true);
        info!(workflow_id, "Workflow paused");
        self.events.emit(PipelineEvent::WorkflowPaused {
            workflow_id: workflow_id.to_string(),
        });
        Ok(())
    }

    pub fn resume(&self, workflow_id: &str) -> Result<()> {
        let run = self.lookup(workflow_id)?;
        {
            let mut wf = run.workflow.lock();
            wf.state.resume()?;
            wf.paused_at = None;
            wf.log(LogLevel::Info, "Workflow resumed", None, None);
        }
        run.control.paused.send_replace(false);
        info!(workflow_id, "Workflow resumed");
        self.events.emit(PipelineEvent::WorkflowResumed {
            workflow_id: workflow_id.to_string(),
        });
        Ok(())
    }

    /// Request cancellation. Also wakes a paused workflow.
    pub fn cancel(&self, workflow_id: &str, reason: impl Into<String>) -> Result<()> {
        let run = self.lookup(workflow_id)?;
        {
            let wf = run.workflow.lock();
            if !wf.state.can_cancel() {
                return Err(PipelineError::InvalidStateTransition {
                    from: wf.status(),
                    to: WorkflowState::Cancelled,
                });
            }
        }
        let reason = reason.into();
        info!(workflow_id, %reason, "Cancellation requested");
        *run.control.cancel_reason.lock() = Some(reason);
        run.control.cancel.cancel();
        Ok(())
    }

    /// Force a gate of a registered workflow to pass without running it.
    pub fn override_gate(&self, workflow_id: &str, gate_id: &str, reason: impl Into<String>) -> Result<GateReport> {
        let run = self.lookup(workflow_id)?;
        let mut wf = run.workflow.lock();
        let reason = reason.into();
        let gate = wf
            .gate_mut(gate_id)
            .ok_or_else(|| PipelineError::GateNotFound(gate_id.to_string()))?;
        let report = QualityGateEvaluator::override_gate(gate, reason.clone());
        wf.log(LogLevel::Warn, format!("Quality gate {gate_id} overridden: {reason}"), None, None);
        Ok(report)
    }

    /// Apply a stage snapshot to a workflow that is not running.
    ///
    /// Files and tables are restored in place; the context is applied with
    /// `mode`. Partial failures are reported in the result.
    pub fn restore_snapshot(&self, workflow_id: &str, stage_id: &str, mode: RestoreMode) -> Result<RestoreResult> {
        let run = self.lookup(workflow_id)?;
        let mut wf = run.workflow.lock();
        if wf.status() == WorkflowState::Running {
            return Err(PipelineError::InvalidState(format!(
                "workflow {workflow_id} is running; pause it before restoring"
            )));
        }

        let target = RestoreTarget {
            database: self.table_store.as_deref(),
        };
        let result = self
            .snapshots
            .restore_snapshot(&snapshot_key(workflow_id, stage_id), target)
            .map_err(|e| match e {
                PipelineError::SnapshotNotFound(_) => PipelineError::SnapshotNotFound(stage_id.to_string()),
                other => other,
            })?;
        result.apply_context(&mut wf.context, mode);
        wf.log(
            LogLevel::Info,
            format!("Snapshot restored ({} error(s))", result.errors.len()),
            Some(stage_id),
            None,
        );
        info!(workflow_id, stage_id, complete = result.is_complete(), "Snapshot restored");
        Ok(result)
    }

    /// Drop a failed workflow from the registry.
    pub fn clear(&self, workflow_id: &str) -> Result<Workflow> {
        let mut registry = self.registry.lock();
        let run = registry
            .get(workflow_id)
            .ok_or_else(|| PipelineError::WorkflowNotFound(workflow_id.to_string()))?;
        let workflow = run.workflow.lock().clone();
        if !workflow.state.is_terminal() {
            return Err(PipelineError::InvalidState(format!(
                "workflow {workflow_id} is {} and cannot be cleared",
                workflow.status()
            )));
        }
        registry.remove(workflow_id);
        debug!(workflow_id, "Workflow cleared");
        Ok(workflow)
    }

    /// Cancel everything still active and delete all snapshots.
    pub fn shutdown(&self) -> Result<()> {
        info!("Pipeline engine shutting down...");
        for run in self.registry.lock().values() {
            run.control.cancel.cancel();
        }
        self.snapshots.cleanup_all()?;
        info!("Pipeline engine shutdown complete");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Current copy of a workflow from the registry, else its latest archive.
    pub fn get_workflow(&self, workflow_id: &str) -> Option<Workflow> {
        let run = self.registry.lock().get(workflow_id).cloned();
        match run {
            Some(run) => Some(run.workflow.lock().clone()),
            None => self.history.lock().find(workflow_id).map(|e| e.workflow.clone()),
        }
    }

    /// Registered workflows that have not finished.
    pub fn list_active(&self) -> Vec<Workflow> {
        let runs: Vec<Run> = self.registry.lock().values().cloned().collect();
        runs.iter()
            .map(|run| run.workflow.lock().clone())
            .filter(|wf| !wf.state.is_terminal())
            .collect()
    }

    /// Archived workflows, oldest first.
    pub fn get_history(&self) -> Vec<HistoryEntry> {
        self.history.lock().entries()
    }
}

fn snapshot_key(workflow_id: &str, stage_id: &str) -> String {
    format!("{workflow_id}/{stage_id}")
}

/// Owned copy of what a stage snapshot needs, taken under the workflow lock.
struct SnapshotCapture {
    key: String,
    stage_name: String,
    context: Context,
    files: Vec<PathBuf>,
    tables: Vec<String>,
}

impl SnapshotCapture {
    fn of(wf: &Workflow, index: usize) -> Self {
        let stage = &wf.stages[index];
        Self {
            key: snapshot_key(&wf.id, &stage.id),
            stage_name: stage.name.clone(),
            context: wf.context.clone(),
            files: stage.snapshot_files.clone(),
            tables: stage.snapshot_tables.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Stage, Step};
    use crate::step::NoopExecutor;

    fn quiet_config() -> PipelineConfig {
        PipelineConfig {
            enable_snapshots: false,
            retry_base_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_pipeline_config_defaults() {
        let config = PipelineConfig::default();
        assert!(config.enable_quality_gates);
        assert!(config.stop_on_gate_failure);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_base_delay, Duration::from_secs(1));
        assert_eq!(config.step_timeout, Duration::from_secs(300));
        assert_eq!(config.max_snapshots, 10);
        assert_eq!(config.max_history_entries, 100);
    }

    #[test]
    fn test_config_from_toml_sections() {
        let config = StagegateConfig::from_toml("[pipeline]\nmax_retries = 1\n[snapshots]\nmax_snapshots = 2\n").unwrap();
        let config = PipelineConfig::from_config(&config);
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.max_snapshots, 2);
        assert_eq!(config.retry_policy().max_attempts(), 2);
    }

    #[tokio::test]
    async fn test_execute_without_executor_fails() {
        let engine = PipelineEngine::new(quiet_config());
        let wf = Workflow::new("wf").with_stage(Stage::new("s", "S", StageType::Design).with_step(Step::new("a", "A")));
        let id = wf.id.clone();

        let err = engine.execute(wf).await.unwrap_err();
        assert!(matches!(err, PipelineError::NoExecutor(ref t) if t == "design"));

        let failed = engine.get_workflow(&id).unwrap();
        assert_eq!(failed.status(), WorkflowState::Failed);
        assert_eq!(failed.failed_stage().unwrap().id, "s");
    }

    #[tokio::test]
    async fn test_execute_rejects_started_workflow() {
        let engine = PipelineEngine::new(quiet_config());
        let mut wf = Workflow::new("wf");
        wf.state.start().unwrap();
        assert!(matches!(engine.execute(wf).await, Err(PipelineError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_empty_workflow_completes() {
        let engine = PipelineEngine::new(quiet_config());
        let done = engine.execute(Workflow::new("empty")).await.unwrap();
        assert_eq!(done.status(), WorkflowState::Completed);
        assert_eq!(engine.get_history().len(), 1);
        assert!(engine.list_active().is_empty());
    }

    #[tokio::test]
    async fn test_input_published_to_context() {
        let engine = PipelineEngine::new(quiet_config());
        engine.register_executor_for_all(Arc::new(NoopExecutor));
        let wf = Workflow::new("wf")
            .with_input("ticket", serde_json::json!("ABC-1"))
            .with_stage(Stage::new("s", "S", StageType::Analysis).with_step(Step::new("a", "A")));

        let done = engine.execute(wf).await.unwrap();
        assert_eq!(done.context[INPUT_KEY]["ticket"], "ABC-1");
    }

    #[tokio::test]
    async fn test_control_calls_on_unknown_workflow() {
        let engine = PipelineEngine::new(quiet_config());
        assert!(matches!(engine.pause("nope"), Err(PipelineError::WorkflowNotFound(_))));
        assert!(matches!(engine.resume("nope"), Err(PipelineError::WorkflowNotFound(_))));
        assert!(matches!(engine.cancel("nope", "x"), Err(PipelineError::WorkflowNotFound(_))));
        assert!(matches!(engine.retry("nope").await, Err(PipelineError::WorkflowNotFound(_))));
        assert!(matches!(engine.clear("nope"), Err(PipelineError::WorkflowNotFound(_))));
    }

    #[tokio::test]
    async fn test_clear_failed_workflow() {
        let engine = PipelineEngine::new(quiet_config());
        let wf = Workflow::new("wf").with_stage(Stage::new("s", "S", StageType::Review).with_step(Step::new("a", "A")));
        let id = wf.id.clone();
        engine.execute(wf).await.unwrap_err();

        let cleared = engine.clear(&id).unwrap();
        assert_eq!(cleared.status(), WorkflowState::Failed);
        // Still in history after leaving the registry
        assert_eq!(engine.get_workflow(&id).unwrap().status(), WorkflowState::Failed);
        assert!(matches!(engine.retry(&id).await, Err(PipelineError::WorkflowNotFound(_))));
    }

    #[test]
    fn test_snapshot_key() {
        assert_eq!(snapshot_key("wf", "stage"), "wf/stage");
    }
}
