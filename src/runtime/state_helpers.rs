//! Read-only views derived from an execution's history.

use super::WorkflowStatus;
use crate::{ErrorDetails, Event, EventKind};

/// Summary of one execution's history.
#[derive(Debug, Clone, Default)]
pub struct HistoryManager {
    pub workflow_name: Option<String>,
    pub input: Option<String>,
    pub execution_id: u64,
    pub last_event_id: u64,
    pub is_completed: bool,
    pub is_failed: bool,
    pub is_cancelled: bool,
    pub is_continued_as_new: bool,
    pub cancel_requested: bool,
    terminal: Option<EventKind>,
}

impl HistoryManager {
    pub fn from_history(history: &[Event]) -> Self {
        let mut mgr = HistoryManager::default();
        for e in history {
            mgr.execution_id = e.execution_id;
            mgr.last_event_id = e.event_id;
            match &e.kind {
                EventKind::WorkflowStarted { name, input } => {
                    mgr.workflow_name = Some(name.clone());
                    mgr.input = Some(input.clone());
                }
                EventKind::WorkflowCancelRequested { .. } => mgr.cancel_requested = true,
                EventKind::WorkflowCompleted { .. } => mgr.is_completed = true,
                EventKind::WorkflowFailed { .. } => mgr.is_failed = true,
                EventKind::WorkflowCancelled { .. } => mgr.is_cancelled = true,
                EventKind::WorkflowContinuedAsNew { .. } => mgr.is_continued_as_new = true,
                _ => {}
            }
            if e.kind.is_terminal() {
                mgr.terminal = Some(e.kind.clone());
            }
        }
        mgr
    }

    pub fn is_empty(&self) -> bool {
        self.last_event_id == 0
    }

    /// Completed, Failed or Cancelled. Continue-as-new ends the execution but
    /// not the instance.
    pub fn is_instance_terminal(&self) -> bool {
        self.is_completed || self.is_failed || self.is_cancelled
    }

    pub fn is_execution_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn status(&self) -> WorkflowStatus {
        if self.is_empty() {
            return WorkflowStatus::NotFound;
        }
        match &self.terminal {
            None => WorkflowStatus::Running {
                execution_id: self.execution_id,
            },
            Some(EventKind::WorkflowCompleted { output }) => WorkflowStatus::Completed { output: output.clone() },
            Some(EventKind::WorkflowFailed { details }) => WorkflowStatus::Failed {
                details: details.clone(),
            },
            Some(EventKind::WorkflowCancelled { reason }) => WorkflowStatus::Cancelled { reason: reason.clone() },
            Some(EventKind::WorkflowContinuedAsNew { input }) => WorkflowStatus::ContinuedAsNew {
                execution_id: self.execution_id,
                input: input.clone(),
            },
            Some(other) => WorkflowStatus::Failed {
                details: ErrorDetails::Infrastructure {
                    operation: "status".to_string(),
                    message: format!("unexpected terminal event {}", other.name()),
                    retryable: false,
                },
            },
        }
    }

    /// Whether `source_event_id` names a scheduling event of the right kind.
    pub fn is_scheduled(history: &[Event], source_event_id: u64, activity: bool) -> bool {
        history.iter().any(|e| {
            e.event_id == source_event_id
                && match e.kind {
                    EventKind::ActivityScheduled { .. } => activity,
                    EventKind::TimerStarted { .. } => !activity,
                    _ => false,
                }
        })
    }

    pub fn is_resolved(history: &[Event], source_event_id: u64) -> bool {
        history.iter().any(|e| e.source_event_id() == Some(source_event_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(terminal: Option<EventKind>) -> Vec<Event> {
        let mut h = vec![Event::new(
            1,
            2,
            EventKind::WorkflowStarted {
                name: "Wf".into(),
                input: "in".into(),
            },
        )];
        h.push(Event::new(2, 2, EventKind::TimerStarted { fire_at_ms: 1 }));
        if let Some(kind) = terminal {
            h.push(Event::new(3, 2, kind));
        }
        h
    }

    #[test]
    fn test_status_from_history() {
        assert_eq!(HistoryManager::from_history(&[]).status(), WorkflowStatus::NotFound);
        assert_eq!(
            HistoryManager::from_history(&history(None)).status(),
            WorkflowStatus::Running { execution_id: 2 }
        );
        let done = HistoryManager::from_history(&history(Some(EventKind::WorkflowCompleted { output: "o".into() })));
        assert_eq!(done.status(), WorkflowStatus::Completed { output: "o".into() });
        assert!(done.is_instance_terminal());

        let can = HistoryManager::from_history(&history(Some(EventKind::WorkflowContinuedAsNew { input: "n".into() })));
        assert!(can.is_execution_terminal());
        assert!(!can.is_instance_terminal());
        assert_eq!(can.workflow_name.as_deref(), Some("Wf"));
    }

    #[test]
    fn test_scheduled_and_resolved_lookups() {
        let h = history(None);
        assert!(HistoryManager::is_scheduled(&h, 2, false));
        assert!(!HistoryManager::is_scheduled(&h, 2, true));
        assert!(!HistoryManager::is_resolved(&h, 2));
    }
}
