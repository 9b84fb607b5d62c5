use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;

use super::{HistoryDelta, OrchestrationItem, Provider, ProviderError, WorkItem, validate_append};
use crate::{Event, EventKind, now_ms};

struct InstanceRecord {
    workflow_name: String,
    // execution_id n lives at index n - 1
    executions: Vec<Vec<Event>>,
}

struct OrchestratorMessage {
    id: u64,
    instance: String,
    item: WorkItem,
    visible_at: u64,
    lock_token: Option<String>,
}

struct InstanceLock {
    token: String,
    locked_until: u64,
}

struct WorkerEntry {
    id: u64,
    item: WorkItem,
    visible_at: u64,
    lock_token: Option<String>,
    locked_until: u64,
}

#[derive(Default)]
struct State {
    instances: HashMap<String, InstanceRecord>,
    orchestrator_q: Vec<OrchestratorMessage>,
    instance_locks: HashMap<String, InstanceLock>,
    worker_q: Vec<WorkerEntry>,
    next_id: u64,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn push_orchestrator(&mut self, item: WorkItem, delay: Option<Duration>) {
        let now = now_ms();
        let visible_at = match (item.visible_at_ms(), delay) {
            (Some(at), _) => at,
            (None, Some(d)) => now.saturating_add(d.as_millis() as u64),
            (None, None) => now,
        };
        let id = self.next_id();
        self.orchestrator_q.push(OrchestratorMessage {
            id,
            instance: item.instance().to_string(),
            item,
            visible_at,
            lock_token: None,
        });
    }

    fn push_worker(&mut self, item: WorkItem) {
        let id = self.next_id();
        self.worker_q.push(WorkerEntry {
            id,
            item,
            visible_at: now_ms(),
            lock_token: None,
            locked_until: 0,
        });
    }

    fn last_event_id(&self, instance: &str, execution_id: u64) -> Option<u64> {
        self.instances
            .get(instance)
            .and_then(|r| r.executions.get(execution_id.saturating_sub(1) as usize))
            .map(|h| h.last().map(|e| e.event_id).unwrap_or(0))
    }

    fn check_append(&self, operation: &str, instance: &str, execution_id: u64, events: &[Event]) -> Result<(), ProviderError> {
        let known = self.instances.get(instance).map(|r| r.executions.len() as u64).unwrap_or(0);
        if execution_id == 0 || execution_id > known + 1 {
            return Err(ProviderError::permanent(
                operation,
                format!("execution {instance}#{execution_id} does not follow execution {known}"),
            ));
        }
        let last = self.last_event_id(instance, execution_id);
        validate_append(operation, instance, execution_id, last, events)
    }

    // Callers run check_append first.
    fn apply_append(&mut self, instance: &str, execution_id: u64, events: Vec<Event>) -> u64 {
        let record = self.instances.entry(instance.to_string()).or_insert_with(|| InstanceRecord {
            workflow_name: String::new(),
            executions: Vec::new(),
        });
        if let Some(Event {
            kind: EventKind::WorkflowStarted { name, .. },
            ..
        }) = events.first()
        {
            record.workflow_name = name.clone();
        }
        let idx = execution_id.saturating_sub(1) as usize;
        if idx == record.executions.len() {
            record.executions.push(Vec::new());
        }
        let history = &mut record.executions[idx];
        history.extend(events);
        history.last().map(|e| e.event_id).unwrap_or(0)
    }

    fn holder_of(&self, lock_token: &str) -> Option<String> {
        self.instance_locks
            .iter()
            .find(|(_, l)| l.token == lock_token)
            .map(|(i, _)| i.clone())
    }
}

/// Process-local provider for tests and ephemeral runs. Every operation takes
/// one lock over the whole state, so multi-step operations are atomic.
#[derive(Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages and worker items still queued (test utility).
    pub async fn queue_depths(&self) -> (usize, usize) {
        let s = self.state.lock().await;
        (s.orchestrator_q.len(), s.worker_q.len())
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn append(&self, instance: &str, execution_id: u64, events: Vec<Event>) -> Result<u64, ProviderError> {
        let mut s = self.state.lock().await;
        s.check_append("append", instance, execution_id, &events)?;
        Ok(s.apply_append(instance, execution_id, events))
    }

    async fn read_all(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let s = self.state.lock().await;
        Ok(s
            .instances
            .get(instance)
            .and_then(|r| r.executions.last().cloned())
            .unwrap_or_default())
    }

    async fn read_history_with_execution(
        &self,
        instance: &str,
        execution_id: u64,
    ) -> Result<Vec<Event>, ProviderError> {
        let s = self.state.lock().await;
        Ok(s
            .instances
            .get(instance)
            .and_then(|r| r.executions.get(execution_id.saturating_sub(1) as usize).cloned())
            .unwrap_or_default())
    }

    async fn latest_execution_id(&self, instance: &str) -> Result<Option<u64>, ProviderError> {
        let s = self.state.lock().await;
        Ok(s
            .instances
            .get(instance)
            .map(|r| r.executions.len() as u64)
            .filter(|n| *n > 0))
    }

    async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ProviderError> {
        let s = self.state.lock().await;
        Ok(match s.instances.get(instance) {
            Some(r) => (1..=r.executions.len() as u64).collect(),
            None => Vec::new(),
        })
    }

    async fn list_instances(&self) -> Result<Vec<String>, ProviderError> {
        let s = self.state.lock().await;
        let mut ids: Vec<String> = s.instances.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn enqueue_orchestrator_work(&self, item: WorkItem) -> Result<(), ProviderError> {
        if item.is_worker_item() {
            return Err(ProviderError::permanent(
                "enqueue_orchestrator_work",
                "activity attempts belong on the worker queue",
            ));
        }
        self.state.lock().await.push_orchestrator(item, None);
        Ok(())
    }

    async fn fetch_orchestration_item(
        &self,
        lock_timeout: Duration,
    ) -> Result<Option<OrchestrationItem>, ProviderError> {
        let mut s = self.state.lock().await;
        let now = now_ms();
        let candidate = s
            .orchestrator_q
            .iter()
            .filter(|m| m.visible_at <= now)
            .filter(|m| match s.instance_locks.get(&m.instance) {
                Some(lock) => lock.locked_until <= now,
                None => true,
            })
            .min_by_key(|m| m.id)
            .map(|m| m.instance.clone());
        let Some(instance) = candidate else {
            return Ok(None);
        };

        let token = uuid::Uuid::new_v4().to_string();
        s.instance_locks.insert(
            instance.clone(),
            InstanceLock {
                token: token.clone(),
                locked_until: now.saturating_add(lock_timeout.as_millis() as u64),
            },
        );
        let mut messages = Vec::new();
        for m in s.orchestrator_q.iter_mut() {
            if m.instance == instance && m.visible_at <= now {
                m.lock_token = Some(token.clone());
                messages.push((m.id, m.item.clone()));
            }
        }
        messages.sort_by_key(|(id, _)| *id);
        let messages: Vec<WorkItem> = messages.into_iter().map(|(_, item)| item).collect();

        let (workflow_name, execution_id, history) = match s.instances.get(&instance) {
            Some(r) if !r.executions.is_empty() => (
                r.workflow_name.clone(),
                r.executions.len() as u64,
                r.executions.last().cloned().unwrap_or_default(),
            ),
            _ => {
                let name = messages
                    .iter()
                    .find_map(|m| match m {
                        WorkItem::StartWorkflow { workflow, .. } => Some(workflow.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                (name, crate::INITIAL_EXECUTION_ID, Vec::new())
            }
        };

        tracing::debug!(target: "content_amplifier::providers::in_memory", instance_id = %instance, message_count = messages.len(), "locked instance");
        Ok(Some(OrchestrationItem {
            instance,
            workflow_name,
            execution_id,
            history,
            messages,
            lock_token: token,
        }))
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        delta: HistoryDelta,
        worker_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
    ) -> Result<(), ProviderError> {
        let mut s = self.state.lock().await;
        let instance = s
            .holder_of(lock_token)
            .ok_or_else(|| ProviderError::permanent("ack_orchestration_item", "lock token not held"))?;
        if s.instance_locks.get(&instance).map(|l| l.locked_until).unwrap_or(0) <= now_ms() {
            return Err(ProviderError::permanent("ack_orchestration_item", "instance lock expired"));
        }
        if !delta.events.is_empty() {
            s.check_append("ack_orchestration_item", &instance, delta.execution_id, &delta.events)?;
            s.apply_append(&instance, delta.execution_id, delta.events);
        }
        for item in worker_items {
            s.push_worker(item);
        }
        for item in orchestrator_items {
            s.push_orchestrator(item, None);
        }
        s.orchestrator_q.retain(|m| m.lock_token.as_deref() != Some(lock_token));
        s.instance_locks.remove(&instance);
        Ok(())
    }

    async fn abandon_orchestration_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let mut s = self.state.lock().await;
        let Some(instance) = s.holder_of(lock_token) else {
            return Err(ProviderError::permanent("abandon_orchestration_item", "lock token not held"));
        };
        let visible_at = delay.map(|d| now_ms().saturating_add(d.as_millis() as u64));
        for m in s.orchestrator_q.iter_mut() {
            if m.lock_token.as_deref() == Some(lock_token) {
                m.lock_token = None;
                if let Some(at) = visible_at {
                    m.visible_at = at;
                }
            }
        }
        s.instance_locks.remove(&instance);
        Ok(())
    }

    async fn fetch_work_item(&self, lock_timeout: Duration) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let mut s = self.state.lock().await;
        let now = now_ms();
        let entry = s
            .worker_q
            .iter_mut()
            .filter(|w| w.visible_at <= now && (w.lock_token.is_none() || w.locked_until <= now))
            .min_by_key(|w| w.id);
        let Some(entry) = entry else {
            return Ok(None);
        };
        let token = uuid::Uuid::new_v4().to_string();
        entry.lock_token = Some(token.clone());
        entry.locked_until = now.saturating_add(lock_timeout.as_millis() as u64);
        Ok(Some((entry.item.clone(), token)))
    }

    async fn ack_work_item(&self, lock_token: &str, completion: Option<WorkItem>) -> Result<(), ProviderError> {
        let mut s = self.state.lock().await;
        let before = s.worker_q.len();
        s.worker_q.retain(|w| w.lock_token.as_deref() != Some(lock_token));
        if s.worker_q.len() == before {
            return Err(ProviderError::permanent("ack_work_item", "work item lock not held"));
        }
        if let Some(completion) = completion {
            s.push_orchestrator(completion, None);
        }
        Ok(())
    }

    async fn abandon_work_item(&self, lock_token: &str, delay: Option<Duration>) -> Result<(), ProviderError> {
        let mut s = self.state.lock().await;
        let entry = s
            .worker_q
            .iter_mut()
            .find(|w| w.lock_token.as_deref() == Some(lock_token))
            .ok_or_else(|| ProviderError::permanent("abandon_work_item", "work item lock not held"))?;
        entry.lock_token = None;
        entry.locked_until = 0;
        if let Some(d) = delay {
            entry.visible_at = now_ms().saturating_add(d.as_millis() as u64);
        }
        Ok(())
    }

    async fn renew_work_item_lock(&self, lock_token: &str, extend_for: Duration) -> Result<(), ProviderError> {
        let mut s = self.state.lock().await;
        let now = now_ms();
        let entry = s
            .worker_q
            .iter_mut()
            .find(|w| w.lock_token.as_deref() == Some(lock_token) && w.locked_until > now)
            .ok_or_else(|| ProviderError::permanent("renew_work_item_lock", "work item lock not held"))?;
        entry.locked_until = now.saturating_add(extend_for.as_millis() as u64);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(instance_input: &str) -> Event {
        Event::new(
            1,
            1,
            EventKind::WorkflowStarted {
                name: "Wf".into(),
                input: instance_input.into(),
            },
        )
    }

    fn start_item(instance: &str) -> WorkItem {
        WorkItem::StartWorkflow {
            instance: instance.into(),
            workflow: "Wf".into(),
            input: "".into(),
        }
    }

    #[tokio::test]
    async fn test_append_returns_sequence_numbers() {
        let store = InMemoryProvider::new();
        assert_eq!(store.append("i", 1, vec![started("")]).await.unwrap(), 1);
        let next = Event::new(2, 1, EventKind::TimerStarted { fire_at_ms: 0 });
        assert_eq!(store.append("i", 1, vec![next.clone()]).await.unwrap(), 2);
        assert!(store.append("i", 1, vec![next]).await.is_err());
        assert_eq!(store.read_all("i").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_instance_lock_is_exclusive() {
        let store = InMemoryProvider::new();
        store.enqueue_orchestrator_work(start_item("i")).await.unwrap();
        let item = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.workflow_name, "Wf");
        assert!(item.history.is_empty());

        store
            .enqueue_orchestrator_work(WorkItem::CancelInstance {
                instance: "i".into(),
                reason: "x".into(),
            })
            .await
            .unwrap();
        assert!(
            store
                .fetch_orchestration_item(Duration::from_secs(5))
                .await
                .unwrap()
                .is_none()
        );

        store
            .ack_orchestration_item(
                &item.lock_token,
                HistoryDelta {
                    execution_id: 1,
                    events: vec![started("")],
                },
                vec![],
                vec![],
            )
            .await
            .unwrap();
        let next = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.history.len(), 1);
        assert!(matches!(next.messages[0], WorkItem::CancelInstance { .. }));
    }

    #[tokio::test]
    async fn test_failed_ack_writes_nothing() {
        let store = InMemoryProvider::new();
        store.enqueue_orchestrator_work(start_item("i")).await.unwrap();
        let item = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        let bad = Event::new(2, 1, EventKind::TimerStarted { fire_at_ms: 0 });
        let worker = WorkItem::ActivityExecute {
            instance: "i".into(),
            execution_id: 1,
            id: 2,
            name: "A".into(),
            input: "".into(),
            attempt: 1,
            timeout_ms: None,
        };
        let err = store
            .ack_orchestration_item(
                &item.lock_token,
                HistoryDelta {
                    execution_id: 1,
                    events: vec![bad],
                },
                vec![worker],
                vec![],
            )
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(store.queue_depths().await, (1, 0));
        assert!(store.read_all("i").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abandon_makes_messages_visible_again() {
        let store = InMemoryProvider::new();
        store.enqueue_orchestrator_work(start_item("i")).await.unwrap();
        let item = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        store.abandon_orchestration_item(&item.lock_token, None).await.unwrap();
        let again = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_timer_messages_are_delayed() {
        let store = InMemoryProvider::new();
        store
            .enqueue_orchestrator_work(WorkItem::TimerFired {
                instance: "i".into(),
                execution_id: 1,
                id: 2,
                fire_at_ms: now_ms() + 60_000,
            })
            .await
            .unwrap();
        assert!(
            store
                .fetch_orchestration_item(Duration::from_secs(5))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_worker_queue_peek_lock() {
        let store = InMemoryProvider::new();
        store.enqueue_orchestrator_work(start_item("i")).await.unwrap();
        let item = store
            .fetch_orchestration_item(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        let worker = WorkItem::ActivityExecute {
            instance: "i".into(),
            execution_id: 1,
            id: 2,
            name: "A".into(),
            input: "".into(),
            attempt: 1,
            timeout_ms: None,
        };
        store
            .ack_orchestration_item(
                &item.lock_token,
                HistoryDelta {
                    execution_id: 1,
                    events: vec![started("")],
                },
                vec![worker.clone()],
                vec![],
            )
            .await
            .unwrap();

        let (got, token) = store.fetch_work_item(Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(got, worker);
        assert!(store.fetch_work_item(Duration::from_secs(30)).await.unwrap().is_none());
        store
            .renew_work_item_lock(&token, Duration::from_secs(30))
            .await
            .unwrap();
        store
            .ack_work_item(
                &token,
                Some(WorkItem::ActivityCompleted {
                    instance: "i".into(),
                    execution_id: 1,
                    id: 2,
                    result: "ok".into(),
                }),
            )
            .await
            .unwrap();
        assert_eq!(store.queue_depths().await, (1, 0));
        assert!(store.ack_work_item(&token, None).await.is_err());
    }
}
