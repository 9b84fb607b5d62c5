//! Orchestration dispatcher implementation for Runtime
//!
//! This module contains the orchestration dispatcher logic that:
//! - Spawns concurrent orchestration workers
//! - Fetches locked message batches from the orchestrator queue
//! - Replays the instance, runs one turn and commits it atomically

use std::sync::Arc;

use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use super::super::replay_engine::{ReplayEngine, TurnResult};
use super::super::{HistoryManager, Runtime};
use crate::providers::{HistoryDelta, OrchestrationItem, WorkItem};
use crate::{Action, ConfigErrorKind, ErrorDetails};

/// How a locked batch maps onto the instance's executions.
enum Plan {
    /// Run a turn of `execution_id`, starting it first when `start` is set.
    Run {
        workflow: String,
        execution_id: u64,
        baseline: Vec<crate::Event>,
        start: Option<String>,
    },
    /// Nothing to run; consume the messages.
    Drop(&'static str),
}

impl Runtime {
    /// Start the orchestration dispatcher with N concurrent workers
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        // Instance-level locking in the provider prevents concurrent turns of one instance
        let concurrency = self.options.orchestration_concurrency.max(1);

        tokio::spawn(async move {
            let mut workers = JoinSet::new();
            for worker_idx in 0..concurrency {
                let rt = Arc::clone(&self);
                let worker_id = format!("orch-{worker_idx}-{}", rt.runtime_id);
                workers.spawn(async move {
                    let mut backoff = rt.options.store_retry_initial_backoff;
                    while !rt.is_shutting_down() {
                        match rt
                            .history_store
                            .fetch_orchestration_item(rt.options.orchestrator_lock_timeout)
                            .await
                        {
                            Ok(Some(item)) => {
                                backoff = rt.options.store_retry_initial_backoff;
                                rt.process_orchestration_item(item, &worker_id).await;
                            }
                            Ok(None) => {
                                backoff = rt.options.store_retry_initial_backoff;
                                rt.idle(rt.options.dispatcher_idle_sleep).await;
                            }
                            Err(e) => {
                                backoff = rt
                                    .fetch_failed(&worker_id, "fetch_orchestration_item", &e, backoff)
                                    .await;
                            }
                        }
                    }
                    debug!(target: "content_amplifier::runtime", worker_id = %worker_id, "orchestration worker exiting");
                });
            }
            while workers.join_next().await.is_some() {}
        })
    }

    fn plan_turn(item: &OrchestrationItem) -> Plan {
        let mgr = HistoryManager::from_history(&item.history);

        if mgr.is_empty() {
            return item
                .messages
                .iter()
                .find_map(|m| match m {
                    WorkItem::StartWorkflow { workflow, input, .. } => Some(Plan::Run {
                        workflow: workflow.clone(),
                        execution_id: crate::INITIAL_EXECUTION_ID,
                        baseline: Vec::new(),
                        start: Some(input.clone()),
                    }),
                    _ => None,
                })
                .unwrap_or(Plan::Drop("no start message for new instance"));
        }

        if mgr.is_instance_terminal() {
            return Plan::Drop("instance is terminal");
        }

        if mgr.is_continued_as_new {
            return item
                .messages
                .iter()
                .find_map(|m| match m {
                    WorkItem::ContinueAsNew { workflow, input, .. } => Some(Plan::Run {
                        workflow: workflow.clone(),
                        execution_id: mgr.execution_id + 1,
                        baseline: Vec::new(),
                        start: Some(input.clone()),
                    }),
                    _ => None,
                })
                .unwrap_or(Plan::Drop("execution continued as new"));
        }

        match mgr.workflow_name {
            Some(workflow) => Plan::Run {
                workflow,
                execution_id: mgr.execution_id,
                baseline: item.history.clone(),
                start: None,
            },
            None => Plan::Drop("history has no WorkflowStarted"),
        }
    }

    async fn process_orchestration_item(&self, item: OrchestrationItem, worker_id: &str) {
        let instance = item.instance.clone();
        let lock_token = item.lock_token.clone();

        let (workflow, execution_id, baseline, start) = match Self::plan_turn(&item) {
            Plan::Run {
                workflow,
                execution_id,
                baseline,
                start,
            } => (workflow, execution_id, baseline, start),
            Plan::Drop(reason) => {
                debug!(
                    target: "content_amplifier::runtime",
                    instance_id = %instance,
                    message_count = item.messages.len(),
                    reason,
                    "dropping orchestrator messages"
                );
                self.commit_turn(&instance, &lock_token, HistoryDelta::default(), Vec::new(), Vec::new())
                    .await;
                return;
            }
        };

        let input = match &start {
            Some(input) => input.clone(),
            None => HistoryManager::from_history(&baseline).input.unwrap_or_default(),
        };
        let mut engine = ReplayEngine::new(instance.clone(), execution_id, baseline);
        if let Some(input) = &start {
            engine.start_execution(&workflow, input);
            info!(
                target: "content_amplifier::runtime",
                instance_id = %instance,
                execution_id,
                workflow_name = %workflow,
                worker_id = %worker_id,
                "workflow execution started"
            );
        }
        engine.prep_completions(item.messages);

        if engine.history_delta().is_empty() && engine.abort_error.is_none() {
            // Every message was a duplicate or stale.
            self.commit_turn(&instance, &lock_token, HistoryDelta::default(), Vec::new(), Vec::new())
                .await;
            return;
        }

        let result = match self.workflow_registry.resolve(&workflow) {
            Some(handler) => engine.execute_orchestration(handler, input),
            None => TurnResult::Failed(ErrorDetails::Configuration {
                kind: ConfigErrorKind::UnregisteredWorkflow,
                resource: workflow.clone(),
                message: None,
            }),
        };
        engine.record_result(&result);

        let mut worker_items = Vec::new();
        let mut orchestrator_items = Vec::new();
        for action in engine.pending_actions() {
            match action.clone() {
                Action::CallActivity {
                    scheduling_event_id,
                    name,
                    input,
                    attempt,
                    timeout,
                } => worker_items.push(WorkItem::ActivityExecute {
                    instance: instance.clone(),
                    execution_id,
                    id: scheduling_event_id,
                    name,
                    input,
                    attempt,
                    timeout_ms: timeout.map(|d| d.as_millis() as u64),
                }),
                Action::CreateTimer {
                    scheduling_event_id,
                    fire_at_ms,
                } => orchestrator_items.push(WorkItem::TimerFired {
                    instance: instance.clone(),
                    execution_id,
                    id: scheduling_event_id,
                    fire_at_ms,
                }),
                Action::ContinueAsNew { .. } => {}
            }
        }
        if let TurnResult::ContinueAsNew { input } = &result {
            orchestrator_items.push(WorkItem::ContinueAsNew {
                instance: instance.clone(),
                workflow: workflow.clone(),
                input: input.clone(),
            });
        }

        let delta = HistoryDelta {
            execution_id,
            events: engine.history_delta().to_vec(),
        };
        if !self
            .commit_turn(&instance, &lock_token, delta, worker_items, orchestrator_items)
            .await
        {
            return;
        }
        self.record_turn_outcome(&instance, execution_id, &workflow, &result);
    }

    /// Ack the turn, retrying while the store is unavailable. Abandons the
    /// batch if the ack fails for good so it is redelivered. Returns whether
    /// the turn was committed.
    async fn commit_turn(
        &self,
        instance: &str,
        lock_token: &str,
        delta: HistoryDelta,
        worker_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
    ) -> bool {
        let acked = self
            .with_store_retry("ack_orchestration_item", || {
                self.history_store.ack_orchestration_item(
                    lock_token,
                    delta.clone(),
                    worker_items.clone(),
                    orchestrator_items.clone(),
                )
            })
            .await;
        match acked {
            Ok(()) => true,
            Err(e) => {
                error!(target: "content_amplifier::runtime", instance_id = %instance, error = %e, "failed to commit orchestration turn");
                if let Err(e) = self.history_store.abandon_orchestration_item(lock_token, None).await {
                    debug!(target: "content_amplifier::runtime", instance_id = %instance, error = %e, "abandon after failed ack");
                }
                false
            }
        }
    }

    fn record_turn_outcome(&self, instance: &str, execution_id: u64, workflow: &str, result: &TurnResult) {
        match result {
            TurnResult::Continue => {}
            TurnResult::Completed(output) => {
                self.metrics.record_workflow_completion();
                info!(target: "content_amplifier::runtime", instance_id = %instance, execution_id, workflow_name = %workflow, output_size = output.len(), "workflow completed");
            }
            TurnResult::Failed(details) => {
                self.metrics.record_workflow_failure(details);
                error!(
                    target: "content_amplifier::runtime",
                    instance_id = %instance,
                    execution_id,
                    workflow_name = %workflow,
                    error_type = details.category(),
                    error = %details.display_message(),
                    "workflow failed"
                );
                self.cancel_in_flight(instance);
            }
            TurnResult::ContinueAsNew { .. } => {
                self.metrics.record_continue_as_new();
                info!(target: "content_amplifier::runtime", instance_id = %instance, execution_id, workflow_name = %workflow, "workflow continued as new");
                self.cancel_in_flight(instance);
            }
            TurnResult::Cancelled(reason) => {
                self.metrics.record_cancellation();
                info!(target: "content_amplifier::runtime", instance_id = %instance, execution_id, reason = %reason, "workflow cancelled");
                self.cancel_in_flight(instance);
            }
        }
    }
}
