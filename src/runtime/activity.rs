//! Activity Executor: runs one attempt of a named activity under a deadline.
//!
//! The executor never retries. Retries are decided by the workflow through
//! [`crate::retry`] and each attempt arrives here as its own work item.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::registry::ActivityRegistry;
use crate::{AppErrorKind, ConfigErrorKind, ErrorDetails};

/// Outcome of a failed activity attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityError {
    /// The deadline expired. The body may still have side effects in flight.
    Timeout(Duration),
    ApplicationFailure { message: String, retryable: bool },
    /// The body observed its cancellation token and stopped.
    Cancelled,
    Unregistered(String),
}

impl ActivityError {
    pub fn transient(message: impl Into<String>) -> Self {
        ActivityError::ApplicationFailure {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn non_retryable(message: impl Into<String>) -> Self {
        ActivityError::ApplicationFailure {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn to_error_details(&self) -> ErrorDetails {
        match self {
            ActivityError::Timeout(limit) => ErrorDetails::Application {
                kind: AppErrorKind::ActivityTimeout,
                message: format!("activity exceeded {}ms", limit.as_millis()),
                retryable: true,
            },
            ActivityError::ApplicationFailure { message, retryable } => ErrorDetails::Application {
                kind: AppErrorKind::ActivityFailed,
                message: message.clone(),
                retryable: *retryable,
            },
            ActivityError::Cancelled => ErrorDetails::Application {
                kind: AppErrorKind::ActivityCancelled,
                message: "activity cancelled".to_string(),
                retryable: false,
            },
            ActivityError::Unregistered(name) => ErrorDetails::Configuration {
                kind: ConfigErrorKind::UnregisteredActivity,
                resource: name.clone(),
                message: None,
            },
        }
    }
}

impl std::fmt::Display for ActivityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityError::Timeout(d) => write!(f, "timed out after {d:?}"),
            ActivityError::ApplicationFailure { message, .. } => write!(f, "{message}"),
            ActivityError::Cancelled => write!(f, "cancelled"),
            ActivityError::Unregistered(name) => write!(f, "unregistered activity '{name}'"),
        }
    }
}

impl std::error::Error for ActivityError {}

/// Per-attempt context handed to activity bodies.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    instance_id: String,
    execution_id: u64,
    activity_id: u64,
    activity_name: String,
    attempt: u32,
    cancellation: CancellationToken,
}

impl ActivityContext {
    pub fn new(
        instance_id: impl Into<String>,
        execution_id: u64,
        activity_id: u64,
        activity_name: impl Into<String>,
        attempt: u32,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id,
            activity_id,
            activity_name: activity_name.into(),
            attempt,
            cancellation,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn execution_id(&self) -> u64 {
        self.execution_id
    }

    /// Event id of the `ActivityScheduled` event for this attempt.
    pub fn activity_id(&self) -> u64 {
        self.activity_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Fires on timeout, instance cancellation, or runtime shutdown.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Run `fut` unless the attempt is cancelled first.
    pub async fn run_cancellable<T, F>(&self, fut: F) -> Result<T, ActivityError>
    where
        F: std::future::Future<Output = T>,
    {
        tokio::select! {
            out = fut => Ok(out),
            _ = self.cancellation.cancelled() => Err(ActivityError::Cancelled),
        }
    }
}

/// Trait implemented by activity handlers that can be invoked by the runtime.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, ActivityError>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, ActivityError> {
        (self.0)(ctx, input).await
    }
}

#[derive(Clone)]
pub struct ActivityExecutor {
    registry: Arc<ActivityRegistry>,
}

impl ActivityExecutor {
    pub fn new(registry: Arc<ActivityRegistry>) -> Self {
        Self { registry }
    }

    /// Run one attempt of `name`.
    ///
    /// The body runs on its own task and races the deadline. On expiry the
    /// context's token is cancelled, the task is aborted at its next await
    /// point, and `Timeout` is returned. A panic in the body is reported as a
    /// retryable application failure.
    pub async fn execute(
        &self,
        ctx: ActivityContext,
        name: &str,
        input: String,
        timeout: Option<Duration>,
    ) -> Result<String, ActivityError> {
        let Some(handler) = self.registry.resolve(name) else {
            return Err(ActivityError::Unregistered(name.to_string()));
        };
        let token = ctx.cancellation.clone();
        let mut task = tokio::spawn(async move { handler.invoke(ctx, input).await });

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    token.cancel();
                    task.abort();
                    tracing::warn!(target: "content_amplifier::activity", activity_name = %name, timeout_ms = limit.as_millis() as u64, "activity timed out");
                    return Err(ActivityError::Timeout(limit));
                }
            },
            None => (&mut task).await,
        };

        match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => Err(ActivityError::transient(format!("activity '{name}' panicked"))),
            Err(_) => Err(ActivityError::Cancelled),
        }
    }
}
