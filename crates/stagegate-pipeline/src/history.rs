//! Bounded archive of finished workflows.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::Workflow;
use crate::state::WorkflowState;

/// A workflow as it looked when it was archived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub archived_at: DateTime<Utc>,
    pub workflow: Workflow,
}

impl HistoryEntry {
    pub fn workflow_id(&self) -> &str {
        &self.workflow.id
    }

    pub fn state(&self) -> WorkflowState {
        self.workflow.status()
    }
}

/// FIFO history holding one entry per workflow id; the oldest entry is
/// evicted past `max_entries`.
#[derive(Debug, Clone)]
pub struct WorkflowHistory {
    entries: VecDeque<HistoryEntry>,
    max_entries: usize,
}

impl WorkflowHistory {
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            entries: VecDeque::with_capacity(max_entries.min(1024)),
            max_entries,
        }
    }

    /// Archive a copy of `workflow`, replacing any earlier archive of the
    /// same id. The replacement moves to the newest position.
    pub fn push(&mut self, workflow: Workflow) {
        self.entries.retain(|e| e.workflow_id() != workflow.id);
        self.entries.push_back(HistoryEntry {
            archived_at: Utc::now(),
            workflow,
        });
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    /// Entries, oldest first.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Archive of `workflow_id`, if still retained.
    pub fn find(&self, workflow_id: &str) -> Option<&HistoryEntry> {
        self.entries.iter().rev().find(|e| e.workflow_id() == workflow_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest() {
        let mut history = WorkflowHistory::new(2);
        for id in ["a", "b", "c"] {
            history.push(Workflow::with_id(id, id));
        }
        let ids: Vec<_> = history.entries().iter().map(|e| e.workflow_id().to_string()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(history.find("a").is_none());
    }

    #[test]
    fn test_rearchive_replaces_entry() {
        let mut history = WorkflowHistory::new(5);
        history.push(Workflow::with_id("w", "first"));
        history.push(Workflow::with_id("w", "second"));
        assert_eq!(history.find("w").unwrap().workflow.title, "second");
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_rearchive_moves_to_newest() {
        let mut history = WorkflowHistory::new(2);
        history.push(Workflow::with_id("a", "a1"));
        history.push(Workflow::with_id("b", "b"));
        history.push(Workflow::with_id("a", "a2"));
        history.push(Workflow::with_id("c", "c"));
        let ids: Vec<_> = history.entries().iter().map(|e| e.workflow_id().to_string()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(history.find("a").unwrap().workflow.title, "a2");
    }
}
