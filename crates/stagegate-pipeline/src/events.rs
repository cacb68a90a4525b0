//! Lifecycle events broadcast by the engine.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::gate::GateReport;
use crate::model::WorkflowProgress;

/// Buffered events per subscriber before the slowest one starts lagging.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Event emitted while a workflow executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    WorkflowStart {
        workflow_id: String,
        title: String,
    },
    WorkflowProgress(WorkflowProgress),
    StageStart {
        workflow_id: String,
        stage_id: String,
        stage_index: usize,
    },
    StageComplete {
        workflow_id: String,
        stage_id: String,
    },
    GatePassed {
        workflow_id: String,
        stage_id: String,
        report: GateReport,
    },
    GateFailed {
        workflow_id: String,
        stage_id: String,
        report: GateReport,
    },
    WorkflowComplete {
        workflow_id: String,
    },
    WorkflowFailed {
        workflow_id: String,
        stage_id: Option<String>,
        error: String,
    },
    WorkflowPaused {
        workflow_id: String,
    },
    WorkflowResumed {
        workflow_id: String,
    },
    WorkflowCancelled {
        workflow_id: String,
        reason: String,
    },
}

impl PipelineEvent {
    /// Wire name, e.g. `stage:start`.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::WorkflowStart { .. } => "workflow:start",
            PipelineEvent::WorkflowProgress(_) => "workflow:progress",
            PipelineEvent::StageStart { .. } => "stage:start",
            PipelineEvent::StageComplete { .. } => "stage:complete",
            PipelineEvent::GatePassed { .. } => "gate:passed",
            PipelineEvent::GateFailed { .. } => "gate:failed",
            PipelineEvent::WorkflowComplete { .. } => "workflow:complete",
            PipelineEvent::WorkflowFailed { .. } => "workflow:failed",
            PipelineEvent::WorkflowPaused { .. } => "workflow:paused",
            PipelineEvent::WorkflowResumed { .. } => "workflow:resumed",
            PipelineEvent::WorkflowCancelled { .. } => "workflow:cancelled",
        }
    }

    pub fn workflow_id(&self) -> &str {
        match self {
            PipelineEvent::WorkflowProgress(p) => &p.workflow_id,
            PipelineEvent::WorkflowStart { workflow_id, .. }
            | PipelineEvent::StageStart { workflow_id, .. }
            | PipelineEvent::StageComplete { workflow_id, .. }
            | PipelineEvent::GatePassed { workflow_id, .. }
            | PipelineEvent::GateFailed { workflow_id, .. }
            | PipelineEvent::WorkflowComplete { workflow_id }
            | PipelineEvent::WorkflowFailed { workflow_id, .. }
            | PipelineEvent::WorkflowPaused { workflow_id }
            | PipelineEvent::WorkflowResumed { workflow_id }
            | PipelineEvent::WorkflowCancelled { workflow_id, .. } => workflow_id,
        }
    }

    /// Whether this event ends a run (complete, failed or cancelled).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::WorkflowComplete { .. }
                | PipelineEvent::WorkflowFailed { .. }
                | PipelineEvent::WorkflowCancelled { .. }
        )
    }
}

/// Fan-out of [`PipelineEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CHANNEL_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Send to current subscribers. Having none is not an error.
    pub fn emit(&self, event: PipelineEvent) {
        trace!(event = event.name(), workflow_id = event.workflow_id(), "Emitting event");
        let _ = self.tx.send(event);
    }
}
