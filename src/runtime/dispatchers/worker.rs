//! Worker (activity) dispatcher implementation for Runtime
//!
//! This module contains the worker dispatcher logic that:
//! - Spawns concurrent activity workers
//! - Fetches and executes activity work items under a renewed lock
//! - Acks each attempt together with its completion

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::super::{ActivityContext, ActivityError, HistoryManager, Runtime};
use crate::providers::{Provider, WorkItem};

/// Whether an activity attempt still belongs to a live execution.
enum Liveness {
    Live,
    Stale(&'static str),
}

impl Runtime {
    /// Start the worker dispatcher with N concurrent workers for executing activities
    pub(in crate::runtime) fn start_work_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        // Activities are independent work units that can run in parallel
        let concurrency = self.options.worker_concurrency.max(1);

        tokio::spawn(async move {
            let mut workers = JoinSet::new();
            for worker_idx in 0..concurrency {
                let rt = Arc::clone(&self);
                // Generate unique worker ID: work-{index}-{runtime_id}
                let worker_id = format!("work-{worker_idx}-{}", rt.runtime_id);
                workers.spawn(async move {
                    let mut backoff = rt.options.store_retry_initial_backoff;
                    while !rt.is_shutting_down() {
                        match rt.history_store.fetch_work_item(rt.options.worker_lock_timeout).await {
                            Ok(Some((item, token))) => {
                                backoff = rt.options.store_retry_initial_backoff;
                                rt.process_work_item(item, token, &worker_id).await;
                            }
                            Ok(None) => {
                                backoff = rt.options.store_retry_initial_backoff;
                                rt.idle(rt.options.dispatcher_idle_sleep).await;
                            }
                            Err(e) => backoff = rt.fetch_failed(&worker_id, "fetch_work_item", &e, backoff).await,
                        }
                    }
                    debug!(target: "content_amplifier::runtime", worker_id = %worker_id, "worker exiting");
                });
            }
            while workers.join_next().await.is_some() {}
        })
    }

    async fn process_work_item(&self, item: WorkItem, lock_token: String, worker_id: &str) {
        let (instance, execution_id, id, name, input, attempt, timeout_ms) = match item {
            WorkItem::ActivityExecute {
                instance,
                execution_id,
                id,
                name,
                input,
                attempt,
                timeout_ms,
            } => (instance, execution_id, id, name, input, attempt, timeout_ms),
            other => {
                warn!(target: "content_amplifier::runtime", worker_id = %worker_id, item = ?other, "unexpected item on worker queue");
                self.finish_work_item(&lock_token, None).await;
                return;
            }
        };

        match check_liveness(self.history_store.as_ref(), &instance, execution_id).await {
            Ok(Liveness::Live) => {}
            Ok(Liveness::Stale(reason)) => {
                debug!(target: "content_amplifier::runtime", instance_id = %instance, execution_id, activity_id = id, reason, "skipping activity");
                self.finish_work_item(&lock_token, None).await;
                return;
            }
            Err(e) => {
                warn!(target: "content_amplifier::runtime", instance_id = %instance, error = %e, "could not read instance state; abandoning activity");
                self.return_work_item(&lock_token, Some(self.options.store_retry_initial_backoff))
                    .await;
                return;
            }
        }

        let cancel = CancellationToken::new();
        let tracking_key = self.track_activity(&instance, cancel.clone());
        let renewal = spawn_lock_renewal_task(
            Arc::clone(&self.history_store),
            lock_token.clone(),
            self.options.worker_lock_timeout,
            self.options.worker_lock_renewal_buffer,
            instance.clone(),
            execution_id,
            cancel.clone(),
        );

        tracing::debug!(
            target: "content_amplifier::runtime",
            instance_id = %instance,
            execution_id,
            activity_name = %name,
            activity_id = id,
            attempt,
            worker_id = %worker_id,
            "activity started"
        );
        let start_time = Instant::now();
        let ctx = ActivityContext::new(instance.clone(), execution_id, id, name.clone(), attempt, cancel.clone());
        let outcome = self
            .activity_executor
            .execute(ctx, &name, input, timeout_ms.map(Duration::from_millis))
            .await;
        renewal.abort();
        self.untrack_activity(&instance, tracking_key);
        let duration_ms = start_time.elapsed().as_millis() as u64;

        let completion = match outcome {
            Ok(result) => {
                debug!(
                    target: "content_amplifier::runtime",
                    instance_id = %instance,
                    execution_id,
                    activity_name = %name,
                    activity_id = id,
                    worker_id = %worker_id,
                    outcome = "success",
                    duration_ms,
                    result_size = result.len(),
                    "activity completed"
                );
                self.metrics.record_activity_outcome(&Ok(result.clone()));
                WorkItem::ActivityCompleted {
                    instance,
                    execution_id,
                    id,
                    result,
                }
            }
            Err(ActivityError::Cancelled) if self.is_shutting_down() => {
                debug!(target: "content_amplifier::runtime", instance_id = %instance, activity_id = id, "activity interrupted by shutdown; returning to queue");
                self.return_work_item(&lock_token, None).await;
                return;
            }
            Err(ActivityError::Cancelled) => {
                debug!(target: "content_amplifier::runtime", instance_id = %instance, activity_id = id, "activity cancelled with its instance");
                self.finish_work_item(&lock_token, None).await;
                return;
            }
            Err(e) => {
                let details = e.to_error_details();
                warn!(
                    target: "content_amplifier::runtime",
                    instance_id = %instance,
                    execution_id,
                    activity_name = %name,
                    activity_id = id,
                    attempt,
                    worker_id = %worker_id,
                    outcome = details.category(),
                    duration_ms,
                    error = %details.display_message(),
                    "activity failed"
                );
                self.metrics.record_activity_outcome(&Err(details.clone()));
                WorkItem::ActivityFailed {
                    instance,
                    execution_id,
                    id,
                    details,
                }
            }
        };

        self.finish_work_item(&lock_token, Some(completion)).await;
    }

    /// Ack a work item, retrying while the store is unavailable. On a
    /// permanent failure the lock is left to expire so the attempt is
    /// redelivered.
    async fn finish_work_item(&self, lock_token: &str, completion: Option<WorkItem>) {
        let acked = self
            .with_store_retry("ack_work_item", || {
                self.history_store.ack_work_item(lock_token, completion.clone())
            })
            .await;
        if let Err(e) = acked {
            error!(target: "content_amplifier::runtime", lock_token = %lock_token, error = %e, "failed to ack work item");
        }
    }

    /// Unlock a work item without completing it.
    async fn return_work_item(&self, lock_token: &str, delay: Option<Duration>) {
        if let Err(e) = self.history_store.abandon_work_item(lock_token, delay).await {
            debug!(target: "content_amplifier::runtime", lock_token = %lock_token, error = %e, "abandon work item failed; lock will expire");
        }
    }
}

async fn check_liveness(
    store: &dyn Provider,
    instance: &str,
    execution_id: u64,
) -> Result<Liveness, crate::providers::ProviderError> {
    let latest = store.latest_execution_id(instance).await?;
    if latest != Some(execution_id) {
        return Ok(Liveness::Stale("execution superseded"));
    }
    let history = store.read_history_with_execution(instance, execution_id).await?;
    let mgr = HistoryManager::from_history(&history);
    if mgr.is_execution_terminal() {
        return Ok(Liveness::Stale("execution finished"));
    }
    if mgr.cancel_requested {
        return Ok(Liveness::Stale("cancellation requested"));
    }
    Ok(Liveness::Live)
}

/// Calculate the renewal interval based on lock timeout and buffer settings.
///
/// # Logic
/// - If timeout >= 15s: renew at (timeout - buffer)
/// - If timeout < 15s: renew at 0.5 * timeout (buffer ignored)
fn calculate_renewal_interval(lock_timeout: Duration, buffer: Duration) -> Duration {
    if lock_timeout >= Duration::from_secs(15) {
        lock_timeout.saturating_sub(buffer).max(Duration::from_secs(1))
    } else {
        (lock_timeout / 2).max(Duration::from_millis(10))
    }
}

/// Spawn a background task that keeps the work item locked while the
/// activity runs.
///
/// Each tick also checks the owning execution. If it has finished, moved on,
/// or been asked to cancel, the activity's token is cancelled so the body can
/// stop early. The task stops when renewal fails (the lock is gone) and is
/// aborted by the caller once the attempt returns.
fn spawn_lock_renewal_task(
    store: Arc<dyn Provider>,
    token: String,
    lock_timeout: Duration,
    buffer: Duration,
    instance: String,
    execution_id: u64,
    activity_cancel: CancellationToken,
) -> JoinHandle<()> {
    let renewal_interval = calculate_renewal_interval(lock_timeout, buffer);

    tracing::debug!(
        target: "content_amplifier::runtime::worker",
        lock_token = %token,
        lock_timeout_ms = lock_timeout.as_millis() as u64,
        renewal_interval_ms = renewal_interval.as_millis() as u64,
        "spawning lock renewal task"
    );

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(renewal_interval);
        interval.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = activity_cancel.cancelled() => break,
            }

            if let Ok(Liveness::Stale(reason)) = check_liveness(store.as_ref(), &instance, execution_id).await {
                tracing::debug!(
                    target: "content_amplifier::runtime::worker",
                    instance_id = %instance,
                    reason,
                    "cancelling activity of inactive execution"
                );
                activity_cancel.cancel();
                break;
            }

            match store.renew_work_item_lock(&token, lock_timeout).await {
                Ok(()) => {
                    tracing::trace!(target: "content_amplifier::runtime::worker", lock_token = %token, "lock renewed");
                }
                Err(e) => {
                    tracing::debug!(
                        target: "content_amplifier::runtime::worker",
                        lock_token = %token,
                        error = %e,
                        "failed to renew lock (may have been acked/abandoned)"
                    );
                    break;
                }
            }
        }
    })
}
