use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{debug, warn};

use super::WorkflowHandler;
use super::state_helpers::HistoryManager;
use crate::providers::WorkItem;
use crate::{Action, AppErrorKind, ErrorDetails, Event, EventKind};

/// Result of executing a workflow turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnResult {
    /// Suspended on at least one activity or timer
    Continue,
    Completed(String),
    Failed(ErrorDetails),
    ContinueAsNew { input: String },
    Cancelled(String),
}

/// Replays one execution's history plus newly delivered messages and runs the
/// workflow code forward until it suspends or finishes.
pub struct ReplayEngine {
    pub(crate) instance: String,
    pub(crate) execution_id: u64,
    /// Events generated during this run
    pub(crate) history_delta: Vec<Event>,
    /// Actions to dispatch after persistence
    pub(crate) pending_actions: Vec<Action>,
    /// History at start of run
    pub(crate) baseline_history: Vec<Event>,
    pub(crate) next_event_id: u64,
    /// Error that aborts the turn before workflow code runs
    pub(crate) abort_error: Option<ErrorDetails>,
}

impl ReplayEngine {
    pub fn new(instance: String, execution_id: u64, baseline_history: Vec<Event>) -> Self {
        let next_event_id = baseline_history
            .last()
            .map(|e| e.event_id + 1)
            .unwrap_or(crate::INITIAL_EVENT_ID);
        Self {
            instance,
            execution_id,
            history_delta: Vec::new(),
            pending_actions: Vec::new(),
            baseline_history,
            next_event_id,
            abort_error: None,
        }
    }

    fn push_event(&mut self, kind: EventKind) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        self.history_delta.push(Event::new(id, self.execution_id, kind));
        id
    }

    fn working_history(&self) -> Vec<Event> {
        self.baseline_history
            .iter()
            .chain(self.history_delta.iter())
            .cloned()
            .collect()
    }

    /// Record `WorkflowStarted` for a fresh execution.
    pub fn start_execution(&mut self, name: &str, input: &str) {
        debug_assert!(self.baseline_history.is_empty() && self.history_delta.is_empty());
        self.push_event(EventKind::WorkflowStarted {
            name: name.to_string(),
            input: input.to_string(),
        });
    }

    /// Stage 1: turn delivered messages into history events.
    ///
    /// Completions for other executions and duplicates are dropped. A
    /// completion whose kind disagrees with the event it points at aborts the
    /// turn as nondeterministic.
    pub fn prep_completions(&mut self, messages: Vec<WorkItem>) {
        debug!(
            target: "content_amplifier::replay",
            instance_id = %self.instance,
            execution_id = self.execution_id,
            message_count = messages.len(),
            "converting messages to events"
        );

        for msg in messages {
            let (execution_id, id, is_activity) = match &msg {
                WorkItem::ActivityCompleted { execution_id, id, .. } | WorkItem::ActivityFailed { execution_id, id, .. } => {
                    (*execution_id, *id, true)
                }
                WorkItem::TimerFired { execution_id, id, .. } => (*execution_id, *id, false),
                WorkItem::CancelInstance { reason, .. } => {
                    let requested = HistoryManager::from_history(&self.working_history()).cancel_requested;
                    if !requested {
                        self.push_event(EventKind::WorkflowCancelRequested { reason: reason.clone() });
                    }
                    continue;
                }
                // Start and continue-as-new are consumed by the dispatcher
                _ => continue,
            };

            if execution_id != self.execution_id {
                warn!(target: "content_amplifier::replay", instance_id = %self.instance, execution_id, current = self.execution_id, "ignoring completion from another execution");
                continue;
            }
            let history = self.working_history();
            if HistoryManager::is_resolved(&history, id) {
                warn!(target: "content_amplifier::replay", instance_id = %self.instance, source_event_id = id, "ignoring duplicate completion");
                continue;
            }
            if !HistoryManager::is_scheduled(&history, id, is_activity) {
                let known = history.iter().any(|e| e.event_id == id);
                if known {
                    self.abort_error = Some(ErrorDetails::nondeterminism(format!(
                        "completion kind does not match scheduled event {id}"
                    )));
                } else {
                    warn!(target: "content_amplifier::replay", instance_id = %self.instance, source_event_id = id, "ignoring completion for unknown event");
                }
                continue;
            }

            let kind = match msg {
                WorkItem::ActivityCompleted { result, .. } => EventKind::ActivityCompleted {
                    source_event_id: id,
                    result,
                },
                WorkItem::ActivityFailed { details, .. } => EventKind::ActivityFailed {
                    source_event_id: id,
                    details,
                },
                WorkItem::TimerFired { fire_at_ms, .. } => EventKind::TimerFired {
                    source_event_id: id,
                    fire_at_ms,
                },
                _ => continue,
            };
            self.push_event(kind);
        }
    }

    /// Stage 2: run the workflow once over the working history.
    pub fn execute_orchestration(&mut self, handler: Arc<dyn WorkflowHandler>, input: String) -> TurnResult {
        if let Some(err) = self.abort_error.clone() {
            return TurnResult::Failed(err);
        }

        let working_history = self.working_history();
        if let Some(reason) = working_history.iter().find_map(|e| match &e.kind {
            EventKind::WorkflowCancelRequested { reason } => Some(reason.clone()),
            _ => None,
        }) {
            return TurnResult::Cancelled(reason);
        }

        let working_len = working_history.len();
        let run_result = catch_unwind(AssertUnwindSafe(|| {
            crate::run_turn(&self.instance, self.execution_id, working_history, |ctx| {
                handler.invoke(ctx, input.clone())
            })
        }));

        let turn = match run_result {
            Ok(turn) => turn,
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "workflow panicked".to_string()
                };
                return TurnResult::Failed(ErrorDetails::Application {
                    kind: AppErrorKind::WorkflowFailed,
                    message: format!("workflow panicked: {msg}"),
                    retryable: false,
                });
            }
        };

        if let Some(msg) = turn.nondeterminism {
            warn!(target: "content_amplifier::replay", instance_id = %self.instance, execution_id = self.execution_id, error = %msg, "nondeterminism detected");
            return TurnResult::Failed(ErrorDetails::nondeterminism(msg));
        }

        let new_events: Vec<Event> = turn.history.into_iter().skip(working_len).collect();
        if let Some(last) = new_events.last() {
            self.next_event_id = last.event_id + 1;
        }
        self.history_delta.extend(new_events);

        match turn.output {
            Some(Ok(output)) => TurnResult::Completed(output),
            Some(Err(message)) => TurnResult::Failed(ErrorDetails::Application {
                kind: AppErrorKind::WorkflowFailed,
                message,
                retryable: false,
            }),
            None => {
                let can = turn.actions.iter().find_map(|a| match a {
                    Action::ContinueAsNew { input } => Some(input.clone()),
                    _ => None,
                });
                match can {
                    Some(input) => TurnResult::ContinueAsNew { input },
                    None => {
                        self.pending_actions = turn.actions;
                        TurnResult::Continue
                    }
                }
            }
        }
    }

    /// Append the terminal event for `result`, if any.
    pub fn record_result(&mut self, result: &TurnResult) {
        let kind = match result {
            TurnResult::Continue => return,
            TurnResult::Completed(output) => EventKind::WorkflowCompleted { output: output.clone() },
            TurnResult::Failed(details) => EventKind::WorkflowFailed {
                details: details.clone(),
            },
            TurnResult::ContinueAsNew { input } => EventKind::WorkflowContinuedAsNew { input: input.clone() },
            TurnResult::Cancelled(reason) => EventKind::WorkflowCancelled { reason: reason.clone() },
        };
        self.pending_actions.clear();
        self.push_event(kind);
    }

    pub fn history_delta(&self) -> &[Event] {
        &self.history_delta
    }

    pub fn pending_actions(&self) -> &[Action] {
        &self.pending_actions
    }
}
