//! Provider wrapper that injects store failures.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use content_amplifier::Event;
use content_amplifier::providers::{HistoryDelta, OrchestrationItem, Provider, ProviderError, WorkItem};

/// Fails the next N orchestration acks, worker acks or worker fetches with a
/// retryable error, then delegates normally. Nothing is written by a failed
/// call.
pub struct FlakyProvider {
    inner: Arc<dyn Provider>,
    fail_orchestration_acks: AtomicU32,
    fail_work_acks: AtomicU32,
    fail_work_fetches: AtomicU32,
    failed_fetches: Mutex<Vec<Instant>>,
    injected: AtomicU32,
}

impl FlakyProvider {
    pub fn new(inner: Arc<dyn Provider>) -> Self {
        Self {
            inner,
            fail_orchestration_acks: AtomicU32::new(0),
            fail_work_acks: AtomicU32::new(0),
            fail_work_fetches: AtomicU32::new(0),
            failed_fetches: Mutex::new(Vec::new()),
            injected: AtomicU32::new(0),
        }
    }

    pub fn fail_next_orchestration_acks(&self, n: u32) {
        self.fail_orchestration_acks.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_work_acks(&self, n: u32) {
        self.fail_work_acks.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_work_fetches(&self, n: u32) {
        self.fail_work_fetches.store(n, Ordering::SeqCst);
    }

    /// When each injected fetch failure happened.
    pub fn failed_fetch_times(&self) -> Vec<Instant> {
        self.failed_fetches.lock().unwrap().clone()
    }

    /// Failures injected so far.
    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }

    fn take(&self, counter: &AtomicU32, operation: &str) -> Result<(), ProviderError> {
        let took = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(ProviderError::retryable(operation, "injected: database is locked"));
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for FlakyProvider {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn append(&self, instance: &str, execution_id: u64, events: Vec<Event>) -> Result<u64, ProviderError> {
        self.inner.append(instance, execution_id, events).await
    }

    async fn read_all(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        self.inner.read_all(instance).await
    }

    async fn read_history_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
    ) -> Result<Vec<Event>, ProviderError> {
        self.inner.read_history_with_execution(instance, execution_id).await
    }

    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError> {
        self.inner.latest_execution_id(instance).await
    }

    async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError> {
        self.inner.list_executions(instance).await
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        self.inner.list_instances().await
    }

    async fn enqueue_orchestrator_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        self.inner.enqueue_orchestrator_work(item).await
    }

    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<OrchestrationItem>, ProviderError> {
        self.inner.fetch_orchestration_item(lock_timeout).await
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        delta: HistoryDelta,
        worker_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError> {
        self.take(&self.fail_orchestration_acks, "ack_orchestration_item")?;
        self.inner
            .ack_orchestration_item(lock_token, delta, worker_items, orchestrator_items)
            .await
    }

    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        self.inner.abandon_orchestration_item(lock_token, delay).await
    }

    async fn fetch_work_item(&self, lock_timeout: Duration) -> Result<Option<(WorkItem, String)>, ProviderError> {
        if let Err(e) = self.take(&self.fail_work_fetches, "fetch_work_item") {
            self.failed_fetches.lock().unwrap().push(Instant::now());
            return Err(e);
        }
        self.inner.fetch_work_item(lock_timeout).await
    }

    async fn ack_work_item(&self, lock_token: &str, completion: Option<WorkItem>) -> Result<(), ProviderError> {
        self.take(&self.fail_work_acks, "ack_work_item")?;
        self.inner.ack_work_item(lock_token, completion).await
    }

    async fn abandon_work_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        self.inner.abandon_work_item(lock_token, delay).await
    }

    async fn renew_work_item_lock(&self, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        self.inner.renew_work_item_lock(lock_token, extend_for).await
    }
}
