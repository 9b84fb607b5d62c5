use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::_typed_codec::{Codec, Json};
use crate::providers::{Provider, ProviderError, WorkItem};
use crate::runtime::{HistoryManager, WorkflowStatus};
use crate::Event;

/// Errors returned by [`Client`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    Provider(ProviderError),
    InstanceAlreadyExists(String),
    NotFound(String),
    /// `wait_for_workflow` gave up before the instance became terminal.
    Timeout,
    InvalidInput(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Provider(e) => write!(f, "{e}"),
            ClientError::InstanceAlreadyExists(id) => write!(f, "instance '{id}' already exists"),
            ClientError::NotFound(id) => write!(f, "instance '{id}' not found"),
            ClientError::Timeout => write!(f, "timed out waiting for instance"),
            ClientError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<ProviderError> for ClientError {
    fn from(e: ProviderError) -> Self {
        ClientError::Provider(e)
    }
}

/// Thin client for control-plane operations.
///
/// The client never talks to a runtime directly. Every operation is either a
/// message on the orchestrator queue or a read of persisted history, so it works
/// from any process sharing the store.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Provider>,
}

impl Client {
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self { store }
    }

    /// Start a workflow instance with string input.
    ///
    /// Fails with `InstanceAlreadyExists` if the instance has history.
    pub async fn start_workflow(
        &self,
        instance: &str,
        workflow: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        if self.store.latest_execution_id(instance).await?.is_some() {
            return Err(ClientError::InstanceAlreadyExists(instance.to_string()));
        }
        let item = WorkItem::StartWorkflow {
            instance: instance.to_string(),
            workflow: workflow.to_string(),
            input: input.into(),
        };
        self.store.enqueue_orchestrator_work(item).await?;
        tracing::info!(target: "content_amplifier::client", instance_id = %instance, workflow_name = %workflow, "start requested");
        Ok(())
    }

    /// Start a workflow instance with typed input (serialized to JSON).
    pub async fn start_workflow_typed<In: Serialize>(
        &self,
        instance: &str,
        workflow: &str,
        input: In,
    ) -> Result<(), ClientError> {
        let payload = Json::encode(&input).map_err(|e| ClientError::InvalidInput(format!("encode: {e}")))?;
        self.start_workflow(instance, workflow, payload).await
    }

    /// Request cancellation. In-flight activities see their cancellation
    /// token fire and the instance ends as `Cancelled`.
    pub async fn cancel(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        if self.store.latest_execution_id(instance).await?.is_none() {
            return Err(ClientError::NotFound(instance.to_string()));
        }
        let item = WorkItem::CancelInstance {
            instance: instance.to_string(),
            reason: reason.into(),
        };
        self.store.enqueue_orchestrator_work(item).await?;
        Ok(())
    }

    /// Status of the latest execution.
    pub async fn status(&self, instance: &str) -> Result<WorkflowStatus, ClientError> {
        let history = self.store.read_all(instance).await?;
        Ok(HistoryManager::from_history(&history).status())
    }

    /// History of the latest execution.
    pub async fn read_history(&self, instance: &str) -> Result<Vec<Event>, ClientError> {
        Ok(self.store.read_all(instance).await?)
    }

    pub async fn read_execution_history(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ClientError> {
        Ok(self.store.read_history_with_execution(instance, execution_id).await?)
    }

    pub async fn list_executions(&self, instance: &str) -> Result<Vec<u64>, ClientError> {
        Ok(self.store.list_executions(instance).await?)
    }

    pub async fn list_instances(&self) -> Result<Vec<String>, ClientError> {
        Ok(self.store.list_instances().await?)
    }

    /// Poll until the instance is Completed, Failed or Cancelled.
    pub async fn wait_for_workflow(&self, instance: &str, timeout: Duration) -> Result<WorkflowStatus, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut delay = Duration::from_millis(5);
        loop {
            let status = self.status(instance).await?;
            if status.is_terminal() {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_millis(100));
        }
    }
}
