//! In-process runtime: dispatchers that drive workflows and activities off a
//! [`Provider`].
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::providers::{Provider, ProviderError};
use crate::{ErrorDetails, OrchestrationContext};

pub mod activity;
mod dispatchers;
pub mod observability;
pub mod registry;
pub mod replay_engine;
mod state_helpers;

pub use activity::{ActivityContext, ActivityError, ActivityExecutor, ActivityHandler, FnActivity};
pub use observability::{LogFormat, MetricsSnapshot, ObservabilityConfig, RuntimeMetrics, init_logging};
pub use registry::{ActivityRegistry, WorkflowRegistry};
pub use state_helpers::HistoryManager;

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Concurrent orchestration dispatchers. Each instance is still replayed
    /// by at most one of them at a time.
    pub orchestration_concurrency: usize,
    /// Concurrent activity workers.
    pub worker_concurrency: usize,
    /// Poll interval when queues are empty.
    pub dispatcher_idle_sleep: Duration,
    pub orchestrator_lock_timeout: Duration,
    pub worker_lock_timeout: Duration,
    /// Renew worker locks this long before they expire (lock timeouts >= 15s).
    pub worker_lock_renewal_buffer: Duration,
    /// First backoff after a retryable store error; doubles up to the max.
    pub store_retry_initial_backoff: Duration,
    pub store_retry_max_backoff: Duration,
    /// How long `shutdown` waits for in-flight work before aborting it.
    pub shutdown_grace: Duration,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            orchestration_concurrency: 2,
            worker_concurrency: 4,
            dispatcher_idle_sleep: Duration::from_millis(10),
            orchestrator_lock_timeout: Duration::from_secs(5),
            worker_lock_timeout: Duration::from_secs(30),
            worker_lock_renewal_buffer: Duration::from_secs(5),
            store_retry_initial_backoff: Duration::from_millis(50),
            store_retry_max_backoff: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Instance status derived from the latest execution's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowStatus {
    NotFound,
    Running { execution_id: u64 },
    /// The execution ended and the next one has not started yet.
    ContinuedAsNew { execution_id: u64, input: String },
    Completed { output: String },
    Failed { details: ErrorDetails },
    Cancelled { reason: String },
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed { .. } | WorkflowStatus::Failed { .. } | WorkflowStatus::Cancelled { .. }
        )
    }
}

/// Trait implemented by workflow handlers that can be invoked by the runtime.
#[async_trait]
pub trait WorkflowHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `WorkflowHandler`.
pub struct FnWorkflow<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> WorkflowHandler for FnWorkflow<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Runtime that executes workflows and activities and persists history via a
/// `Provider`.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn Provider>,
    workflow_registry: WorkflowRegistry,
    activity_executor: ActivityExecutor,
    options: RuntimeOptions,
    shutdown: CancellationToken,
    runtime_id: String,
    metrics: Arc<RuntimeMetrics>,
    /// Cancellation tokens of in-flight activity attempts, by instance.
    in_flight: std::sync::Mutex<HashMap<String, Vec<(u64, CancellationToken)>>>,
    next_tracking_key: AtomicU64,
}

impl Runtime {
    /// Start a runtime with default options.
    pub async fn start_with_store(
        history_store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        workflow_registry: WorkflowRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            history_store,
            activity_registry,
            workflow_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    pub async fn start_with_options(
        history_store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        workflow_registry: WorkflowRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        let runtime_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        info!(
            target: "content_amplifier::runtime",
            runtime_id = %runtime_id,
            provider = history_store.name(),
            workflows = ?workflow_registry.list_names(),
            activities = ?activity_registry.list_names(),
            orchestration_concurrency = options.orchestration_concurrency,
            worker_concurrency = options.worker_concurrency,
            "starting runtime"
        );

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            history_store,
            workflow_registry,
            activity_executor: ActivityExecutor::new(activity_registry),
            options,
            shutdown: CancellationToken::new(),
            runtime_id,
            metrics: Arc::new(RuntimeMetrics::default()),
            in_flight: std::sync::Mutex::new(HashMap::new()),
            next_tracking_key: AtomicU64::new(1),
        });

        let orch = runtime.clone().start_orchestration_dispatcher();
        let work = runtime.clone().start_work_dispatcher();
        runtime.joins.lock().await.extend([orch, work]);
        runtime
    }

    pub fn store(&self) -> Arc<dyn Provider> {
        self.history_store.clone()
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    /// Stop polling and let in-flight work finish within `shutdown_grace`.
    ///
    /// Activities still running after the grace period have their tokens
    /// cancelled; cooperative ones return their work item to the queue. Work
    /// that ignores the token is aborted after a further grace period and
    /// stays locked in the store until its lock expires.
    pub async fn shutdown(self: Arc<Self>) {
        info!(target: "content_amplifier::runtime", runtime_id = %self.runtime_id, "shutting down");
        self.shutdown.cancel();
        let mut joins = self.joins.lock().await;
        let handles: Vec<JoinHandle<()>> = joins.drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let grace = self.options.shutdown_grace;
        let mut all = std::pin::pin!(futures::future::join_all(handles));
        if tokio::time::timeout(grace, all.as_mut()).await.is_ok() {
            return;
        }

        warn!(target: "content_amplifier::runtime", grace_ms = grace.as_millis() as u64, "in-flight work did not finish in time; cancelling activities");
        self.cancel_all_in_flight();
        if tokio::time::timeout(grace, all.as_mut()).await.is_err() {
            warn!(target: "content_amplifier::runtime", "activities ignored cancellation; aborting");
            for a in aborts {
                a.abort();
            }
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Register an attempt's token so instance cancellation can reach it.
    /// Returns the key to pass to `untrack_activity`.
    pub(crate) fn track_activity(&self, instance: &str, token: CancellationToken) -> u64 {
        let key = self.next_tracking_key.fetch_add(1, Ordering::Relaxed);
        let mut map = self.in_flight.lock().expect("Mutex should not be poisoned");
        map.entry(instance.to_string()).or_default().push((key, token));
        key
    }

    pub(crate) fn untrack_activity(&self, instance: &str, key: u64) {
        let mut map = self.in_flight.lock().expect("Mutex should not be poisoned");
        if let Some(tokens) = map.get_mut(instance) {
            tokens.retain(|(k, _)| *k != key);
            if tokens.is_empty() {
                map.remove(instance);
            }
        }
    }

    /// Signal every in-flight activity of `instance` to stop.
    pub(crate) fn cancel_in_flight(&self, instance: &str) {
        let tokens = self
            .in_flight
            .lock()
            .expect("Mutex should not be poisoned")
            .remove(instance)
            .unwrap_or_default();
        if !tokens.is_empty() {
            debug!(target: "content_amplifier::runtime", instance_id = %instance, count = tokens.len(), "cancelling in-flight activities");
        }
        for (_, t) in tokens {
            t.cancel();
        }
    }

    fn cancel_all_in_flight(&self) {
        let all: Vec<CancellationToken> = self
            .in_flight
            .lock()
            .expect("Mutex should not be poisoned")
            .drain()
            .flat_map(|(_, v)| v.into_iter().map(|(_, t)| t))
            .collect();
        for t in all {
            t.cancel();
        }
    }

    /// Run a store operation, retrying retryable errors with exponential
    /// backoff until it succeeds, fails permanently, or shutdown begins.
    pub(crate) async fn with_store_retry<T, F, Fut>(&self, operation: &str, f: F) -> Result<T, ProviderError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let mut backoff = self.options.store_retry_initial_backoff;
        loop {
            match f().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && !self.is_shutting_down() => {
                    self.metrics.record_store_retry();
                    warn!(
                        target: "content_amplifier::runtime",
                        operation,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "store unavailable; retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.shutdown.cancelled() => return Err(e),
                    }
                    backoff = self.next_store_backoff(backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Double `current`, capped at `store_retry_max_backoff`.
    pub(crate) fn next_store_backoff(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.options.store_retry_max_backoff)
    }

    /// Back off after a failed queue fetch. Returns the delay for the next
    /// consecutive failure.
    pub(crate) async fn fetch_failed(
        &self,
        worker_id: &str,
        operation: &str,
        error: &ProviderError,
        backoff: Duration,
    ) -> Duration {
        self.metrics.record_store_retry();
        warn!(
            target: "content_amplifier::runtime",
            worker_id = %worker_id,
            operation,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "store unavailable; pausing dispatch"
        );
        self.idle(backoff).await;
        self.next_store_backoff(backoff)
    }

    /// Sleep for the idle interval, waking early on shutdown.
    pub(crate) async fn idle(&self, d: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(d) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}
