//! History Log / Durable State Store.
//!
//! A provider owns three durable surfaces:
//!
//! - **History**: append-only events per `(instance, execution)`, with
//!   contiguous sequence numbers starting at 1.
//! - **Orchestrator queue**: messages that advance an instance (start,
//!   activity outcomes, fired timers, cancel, continue-as-new). Fetching locks
//!   the whole instance so at most one dispatcher replays it at a time.
//! - **Worker queue**: activity attempts. Each item is peek-locked by a single
//!   worker until it is acked, abandoned, or its lock expires.
//!
//! `ack_orchestration_item` and `ack_work_item` are atomic: history, outgoing
//! queue items, and removal of the consumed messages commit together or not at
//! all. That is the crash-recovery boundary for the runtime.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ErrorDetails, Event, EventKind};

pub mod error;
pub mod in_memory;
pub mod sqlite;

pub use error::ProviderError;

/// Dispatchable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkItem {
    StartWorkflow {
        instance: String,
        workflow: String,
        input: String,
    },
    /// Worker queue: run one activity attempt.
    ActivityExecute {
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
        attempt: u32,
        timeout_ms: Option<u64>,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        details: ErrorDetails,
    },
    /// Invisible on the orchestrator queue until `fire_at_ms`.
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    CancelInstance {
        instance: String,
        reason: String,
    },
    ContinueAsNew {
        instance: String,
        workflow: String,
        input: String,
    },
}

impl WorkItem {
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartWorkflow { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::CancelInstance { instance, .. }
            | WorkItem::ContinueAsNew { instance, .. } => instance,
        }
    }

    /// Earliest wall-clock time the item may be delivered.
    pub fn visible_at_ms(&self) -> Option<u64> {
        match self {
            WorkItem::TimerFired { fire_at_ms, .. } => Some(*fire_at_ms),
            _ => None,
        }
    }

    pub fn is_worker_item(&self) -> bool {
        matches!(self, WorkItem::ActivityExecute { .. })
    }
}

/// Locked batch of orchestrator messages for one instance.
#[derive(Debug, Clone)]
pub struct OrchestrationItem {
    pub instance: String,
    /// Empty when the instance has no history and no start message.
    pub workflow_name: String,
    /// Latest execution, or 1 for an instance with no history yet.
    pub execution_id: u64,
    /// History of `execution_id`.
    pub history: Vec<Event>,
    pub messages: Vec<WorkItem>,
    pub lock_token: String,
}

/// Events to append as part of an orchestration ack.
#[derive(Debug, Clone, Default)]
pub struct HistoryDelta {
    pub execution_id: u64,
    pub events: Vec<Event>,
}

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    // ---- History ----

    /// Append events to one execution; returns the last sequence number.
    ///
    /// Event ids must continue the execution without gaps. An execution that
    /// does not exist yet is created when the batch starts at event 1 with
    /// `WorkflowStarted`.
    async fn append(&self, instance: &str, execution_id: u64, events: Vec<Event>) -> Result<u64, ProviderError>;

    /// Full history of the latest execution, in sequence order.
    async fn read_all(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    async fn read_history_with_execution(&self, instance: &str, execution_id: u64)
    -> Result<Vec<Event>, ProviderError>;

    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError>;

    async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError>;

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError>;

    // ---- Orchestrator queue ----

    async fn enqueue_orchestrator_work(&self, item: WorkItem) -> Result<(), ProviderError>;

    /// Lock the next instance with visible messages, or `None` when idle.
    async fn fetch_orchestration_item(&self, lock_timeout: Duration)
    -> Result<Option<OrchestrationItem>, ProviderError>;

    /// Commit one turn atomically and release the instance lock.
    ///
    /// Fails with a permanent error if the lock is no longer held by
    /// `lock_token`; nothing is written in that case.
    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        delta: HistoryDelta,
        worker_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError>;

    /// Release the instance lock without consuming its messages.
    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>)
    -> Result<(), ProviderError>;

    // ---- Worker queue ----

    async fn fetch_work_item(&self, lock_timeout: Duration) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Remove the item and enqueue its outcome in one transaction. `None`
    /// drops the item without notifying the instance.
    async fn ack_work_item(&self, lock_token: &str, completion: Option<WorkItem>) -> Result<(), ProviderError>;

    async fn abandon_work_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError>;

    async fn renew_work_item_lock(&self, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError>;
}

/// Check that `events` continue an execution whose last event id is `last`.
pub(crate) fn validate_append(
    operation: &str,
    instance: &str,
    execution_id: u64,
    last: Option<u64>,
    events: &[Event],
) -> Result<(), ProviderError> {
    let Some(first) = events.first() else {
        return Ok(());
    };
    if last.is_none() && !matches!(first.kind, EventKind::WorkflowStarted { .. }) {
        return Err(ProviderError::permanent(
            operation,
            format!("execution {instance}#{execution_id} must start with WorkflowStarted"),
        ));
    }
    let mut expected = last.unwrap_or(0) + 1;
    for e in events {
        if e.event_id != expected {
            return Err(ProviderError::permanent(
                operation,
                format!(
                    "sequence violation for {instance}#{execution_id}: expected event {expected}, got {}",
                    e.event_id
                ),
            ));
        }
        if e.execution_id != execution_id {
            return Err(ProviderError::permanent(
                operation,
                format!(
                    "event {} belongs to execution {} but was appended to {execution_id}",
                    e.event_id, e.execution_id
                ),
            ));
        }
        expected += 1;
    }
    Ok(())
}
