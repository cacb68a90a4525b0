//! Workflow lifecycle state machine.
//!
//! ```text
//! idle ──start──▶ running ──complete──▶ completed
//!   │               │  ▲  ──fail──────▶ failed ──retry──▶ running
//!   │             pause resume
//!   │               ▼  │
//!   │              paused
//!   └──cancel── (idle | running | paused) ──▶ cancelled
//! ```
//!
//! Every accepted transition is appended to an in-memory history that starts
//! with a single `idle` entry. Rejected transitions leave both the state and
//! the history untouched.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Lifecycle state of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    /// Completed, failed and cancelled are sink states.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }

    /// Running or paused.
    pub fn is_active(self) -> bool {
        matches!(self, WorkflowState::Running | WorkflowState::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowState::Idle => "idle",
            WorkflowState::Running => "running",
            WorkflowState::Paused => "paused",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the transition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state; `None` only for the initial entry.
    pub from: Option<WorkflowState>,
    pub to: WorkflowState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Tracks one workflow's lifecycle state and its transition history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachine {
    state: WorkflowState,
    history: Vec<StateTransition>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Create a state machine in `idle` with its initial history entry.
    pub fn new() -> Self {
        Self {
            state: WorkflowState::Idle,
            history: vec![StateTransition {
                from: None,
                to: WorkflowState::Idle,
                timestamp: Utc::now(),
                reason: None,
            }],
        }
    }

    /// Current state.
    pub fn state(&self) -> WorkflowState {
        self.state
    }

    /// Full transition history, oldest first.
    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Most recent history entry.
    pub fn last_transition(&self) -> &StateTransition {
        // history always holds the initial entry
        &self.history[self.history.len() - 1]
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn can_start(&self) -> bool {
        self.state == WorkflowState::Idle
    }

    pub fn can_pause(&self) -> bool {
        self.state == WorkflowState::Running
    }

    pub fn can_resume(&self) -> bool {
        self.state == WorkflowState::Paused
    }

    pub fn can_cancel(&self) -> bool {
        matches!(
            self.state,
            WorkflowState::Idle | WorkflowState::Running | WorkflowState::Paused
        )
    }

    pub fn can_retry(&self) -> bool {
        self.state == WorkflowState::Failed
    }

    /// idle → running.
    ///
    /// Returns `Ok(false)` without recording anything when already running,
    /// so duplicate start calls are harmless.
    pub fn start(&mut self) -> Result<bool> {
        if self.state == WorkflowState::Running {
            return Ok(false);
        }
        self.transition(&[WorkflowState::Idle], WorkflowState::Running, None)?;
        Ok(true)
    }

    /// running → paused.
    pub fn pause(&mut self) -> Result<()> {
        self.transition(&[WorkflowState::Running], WorkflowState::Paused, None)
    }

    /// paused → running.
    pub fn resume(&mut self) -> Result<()> {
        self.transition(&[WorkflowState::Paused], WorkflowState::Running, None)
    }

    /// running → completed.
    pub fn complete(&mut self) -> Result<()> {
        self.transition(&[WorkflowState::Running], WorkflowState::Completed, None)
    }

    /// running → failed.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(
            &[WorkflowState::Running],
            WorkflowState::Failed,
            Some(reason.into()),
        )
    }

    /// idle | running | paused → cancelled.
    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<()> {
        self.transition(
            &[
                WorkflowState::Idle,
                WorkflowState::Running,
                WorkflowState::Paused,
            ],
            WorkflowState::Cancelled,
            Some(reason.into()),
        )
    }

    /// failed → running.
    pub fn retry(&mut self) -> Result<()> {
        self.transition(
            &[WorkflowState::Failed],
            WorkflowState::Running,
            Some("retry".to_string()),
        )
    }

    /// Serialize state and history to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Restore a state machine previously written by [`StateMachine::to_json`].
    ///
    /// The history must be non-empty and end in the recorded state.
    pub fn from_json(json: &str) -> Result<Self> {
        let machine: StateMachine = serde_json::from_str(json)?;
        match machine.history.last() {
            Some(last) if last.to == machine.state => Ok(machine),
            Some(last) => Err(PipelineError::InvalidState(format!(
                "history ends in '{}' but state is '{}'",
                last.to, machine.state
            ))),
            None => Err(PipelineError::InvalidState(
                "state machine history is empty".to_string(),
            )),
        }
    }

    fn transition(
        &mut self,
        allowed_from: &[WorkflowState],
        to: WorkflowState,
        reason: Option<String>,
    ) -> Result<()> {
        if !allowed_from.contains(&self.state) {
            return Err(PipelineError::InvalidStateTransition {
                from: self.state,
                to,
            });
        }
        self.history.push(StateTransition {
            from: Some(self.state),
            to,
            timestamp: Utc::now(),
            reason,
        });
        self.state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_idle_with_initial_entry() {
        let sm = StateMachine::new();
        assert_eq!(sm.state(), WorkflowState::Idle);
        assert_eq!(sm.history().len(), 1);
        assert_eq!(sm.history()[0].from, None);
        assert_eq!(sm.history()[0].to, WorkflowState::Idle);
        assert!(sm.can_start());
        assert!(!sm.is_terminal());
    }

    #[test]
    fn test_history_len_is_transitions_plus_one() {
        let mut sm = StateMachine::new();
        sm.start().unwrap();
        sm.pause().unwrap();
        sm.resume().unwrap();
        sm.pause().unwrap();
        sm.resume().unwrap();
        sm.complete().unwrap();
        assert_eq!(sm.history().len(), 7);
        assert_eq!(sm.state(), WorkflowState::Completed);
    }

    #[test]
    fn test_start_is_idempotent_when_running() {
        let mut sm = StateMachine::new();
        assert!(sm.start().unwrap());
        assert!(!sm.start().unwrap());
        assert_eq!(sm.history().len(), 2);
    }

    #[test]
    fn test_start_from_paused_rejected() {
        let mut sm = StateMachine::new();
        sm.start().unwrap();
        sm.pause().unwrap();
        assert!(sm.start().is_err());
        assert_eq!(sm.state(), WorkflowState::Paused);
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        for terminal in ["completed", "failed", "cancelled"] {
            let mut sm = StateMachine::new();
            sm.start().unwrap();
            match terminal {
                "completed" => sm.complete().unwrap(),
                "failed" => sm.fail("boom").unwrap(),
                _ => sm.cancel("stop").unwrap(),
            }
            let len = sm.history().len();
            let state = sm.state();

            assert!(sm.start().is_err());
            assert!(sm.pause().is_err());
            assert!(sm.resume().is_err());
            assert!(sm.complete().is_err());
            assert!(sm.fail("again").is_err());
            assert!(sm.cancel("again").is_err());

            assert_eq!(sm.state(), state);
            assert_eq!(sm.history().len(), len);
        }
    }

    #[test]
    fn test_invalid_transition_error_names_states() {
        let mut sm = StateMachine::new();
        match sm.pause().unwrap_err() {
            PipelineError::InvalidStateTransition { from, to } => {
                assert_eq!(from, WorkflowState::Idle);
                assert_eq!(to, WorkflowState::Paused);
            }
            other => panic!("Expected InvalidStateTransition, got: {other:?}"),
        }
    }

    #[test]
    fn test_fail_then_retry() {
        let mut sm = StateMachine::new();
        sm.start().unwrap();
        sm.fail("step exploded").unwrap();
        assert!(sm.can_retry());
        sm.retry().unwrap();
        assert_eq!(sm.state(), WorkflowState::Running);
        assert_eq!(sm.last_transition().from, Some(WorkflowState::Failed));
        // A second retry needs a second failure
        assert!(sm.retry().is_err());
    }

    #[test]
    fn test_retry_only_from_failed() {
        let mut sm = StateMachine::new();
        sm.start().unwrap();
        sm.complete().unwrap();
        assert!(sm.retry().is_err());
    }

    #[test]
    fn test_cancel_from_idle_and_paused() {
        let mut sm = StateMachine::new();
        sm.cancel("never started").unwrap();
        assert_eq!(sm.state(), WorkflowState::Cancelled);

        let mut sm = StateMachine::new();
        sm.start().unwrap();
        sm.pause().unwrap();
        sm.cancel("user").unwrap();
        assert_eq!(sm.state(), WorkflowState::Cancelled);
        assert_eq!(sm.last_transition().reason.as_deref(), Some("user"));
    }

    #[test]
    fn test_fail_records_reason() {
        let mut sm = StateMachine::new();
        sm.start().unwrap();
        sm.fail("disk full").unwrap();
        assert_eq!(sm.last_transition().reason.as_deref(), Some("disk full"));
    }

    #[test]
    fn test_json_roundtrip() {
        let mut sm = StateMachine::new();
        sm.start().unwrap();
        sm.pause().unwrap();

        let json = sm.to_json().unwrap();
        let restored = StateMachine::from_json(&json).unwrap();
        assert_eq!(restored.state(), WorkflowState::Paused);
        assert_eq!(restored.history(), sm.history());
    }

    #[test]
    fn test_from_json_rejects_inconsistent_history() {
        let mut sm = StateMachine::new();
        sm.start().unwrap();
        let json = sm.to_json().unwrap().replace("\"state\":\"running\"", "\"state\":\"paused\"");
        assert!(StateMachine::from_json(&json).is_err());
    }
}
