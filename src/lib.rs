//! Durable workflow core with a content-change monitor built on top of it.
//!
//! Workflow logic is ordinary async Rust that schedules activities and timers
//! through an [`OrchestrationContext`]. Every decision and every outcome is
//! recorded as an append-only [`Event`]; after a restart the same code is
//! re-executed against the recorded history and already-completed steps
//! resolve from history instead of running again.
//!
//! - Data model: [`Event`], [`EventKind`], [`Action`], [`ErrorDetails`]
//! - Turn driver: [`run_turn`] (one deterministic evaluation of workflow code)
//! - Retry policy engine: [`retry`]
//! - Durable history and work queues: [`providers`]
//! - Activity executor, replay engine and dispatchers: [`runtime`]
//! - Control plane: [`Client`]
//! - The content amplifier workflow and its adapters: [`amplifier`]
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

pub mod amplifier;
pub mod client;
pub mod config;
pub mod futures;
pub mod providers;
pub mod retry;
pub mod runtime;

pub use client::{Client, ClientError};
pub use futures::{DurableFuture, DurableOutput};
pub use retry::{ActivityOptions, RetryDecision, RetryPolicy};
pub use runtime::registry::{ActivityRegistry, WorkflowRegistry};
pub use runtime::{ActivityContext, ActivityError, Runtime, RuntimeOptions, WorkflowStatus};

/// First execution of every instance.
pub const INITIAL_EXECUTION_ID: u64 = 1;
/// First event of every execution (always `WorkflowStarted`).
pub const INITIAL_EVENT_ID: u64 = 1;

// Internal codec utilities for typed I/O
pub(crate) mod _typed_codec {
    use serde::{Serialize, de::DeserializeOwned};

    pub trait Codec {
        fn encode<T: Serialize>(v: &T) -> Result<String, String>;
        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String>;
    }

    /// Plain `serde_json`; strings are stored quoted so every payload
    /// decodes back to exactly what was encoded.
    pub struct Json;

    impl Codec for Json {
        fn encode<T: Serialize>(v: &T) -> Result<String, String> {
            serde_json::to_string(v).map_err(|e| e.to_string())
        }

        fn decode<T: DeserializeOwned>(s: &str) -> Result<T, String> {
            serde_json::from_str(s).map_err(|e| e.to_string())
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Error taxonomy
// ============================================================================

/// Application-level failure kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AppErrorKind {
    /// Activity body returned an error (or panicked).
    ActivityFailed,
    /// Activity did not finish within its timeout.
    ActivityTimeout,
    /// Activity observed cancellation and stopped.
    ActivityCancelled,
    /// Workflow code returned an error or panicked.
    WorkflowFailed,
    /// Instance was cancelled on request.
    Cancelled,
}

/// Configuration failures: the code or registrations do not match the history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// Workflow code produced a different schedule than the recorded history.
    Nondeterminism,
    UnregisteredActivity,
    UnregisteredWorkflow,
}

/// Error payload stored in history and surfaced through status queries.
///
/// | category        | meaning                                       | retried?            |
/// |-----------------|-----------------------------------------------|---------------------|
/// | `Application`   | activity or workflow failure                  | when `retryable`    |
/// | `Configuration` | nondeterminism, missing registrations         | never (instance fails) |
/// | `Infrastructure`| store or runtime failure                      | when `retryable`    |
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorDetails {
    Application {
        kind: AppErrorKind,
        message: String,
        retryable: bool,
    },
    Configuration {
        kind: ConfigErrorKind,
        resource: String,
        message: Option<String>,
    },
    Infrastructure {
        operation: String,
        message: String,
        retryable: bool,
    },
}

impl ErrorDetails {
    pub fn category(&self) -> &'static str {
        match self {
            ErrorDetails::Application { .. } => "application",
            ErrorDetails::Configuration { .. } => "configuration",
            ErrorDetails::Infrastructure { .. } => "infrastructure",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorDetails::Application { retryable, .. } | ErrorDetails::Infrastructure { retryable, .. } => *retryable,
            ErrorDetails::Configuration { .. } => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ErrorDetails::Application {
                kind: AppErrorKind::ActivityTimeout,
                ..
            }
        )
    }

    pub fn is_nondeterminism(&self) -> bool {
        matches!(
            self,
            ErrorDetails::Configuration {
                kind: ConfigErrorKind::Nondeterminism,
                ..
            }
        )
    }

    /// Message without the category prefix.
    pub fn message(&self) -> String {
        match self {
            ErrorDetails::Application { message, .. } | ErrorDetails::Infrastructure { message, .. } => message.clone(),
            ErrorDetails::Configuration { resource, message, .. } => match message {
                Some(m) if resource.is_empty() => m.clone(),
                Some(m) => format!("{resource}: {m}"),
                None => resource.clone(),
            },
        }
    }

    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::Application { kind, message, .. } => match kind {
                AppErrorKind::ActivityTimeout => format!("timeout: {message}"),
                AppErrorKind::Cancelled | AppErrorKind::ActivityCancelled => format!("cancelled: {message}"),
                _ => message.clone(),
            },
            ErrorDetails::Configuration { kind, .. } => match kind {
                ConfigErrorKind::Nondeterminism => format!("nondeterministic: {}", self.message()),
                ConfigErrorKind::UnregisteredActivity => format!("unregistered activity: {}", self.message()),
                ConfigErrorKind::UnregisteredWorkflow => format!("unregistered workflow: {}", self.message()),
            },
            ErrorDetails::Infrastructure { operation, message, .. } => format!("infrastructure:{operation}: {message}"),
        }
    }

    pub(crate) fn nondeterminism(message: impl Into<String>) -> Self {
        ErrorDetails::Configuration {
            kind: ConfigErrorKind::Nondeterminism,
            resource: String::new(),
            message: Some(message.into()),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_message())
    }
}

impl std::error::Error for ErrorDetails {}

// ============================================================================
// History data model
// ============================================================================

/// One immutable history record. `event_id` is the per-execution sequence
/// number: strictly increasing, starting at [`INITIAL_EVENT_ID`], no gaps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub event_id: u64,
    pub execution_id: u64,
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

impl Event {
    pub fn new(event_id: u64, execution_id: u64, kind: EventKind) -> Self {
        Self {
            event_id,
            execution_id,
            timestamp_ms: now_ms(),
            kind,
        }
    }

    /// Id of the scheduling event a completion refers to.
    pub fn source_event_id(&self) -> Option<u64> {
        match &self.kind {
            EventKind::ActivityCompleted { source_event_id, .. }
            | EventKind::ActivityFailed { source_event_id, .. }
            | EventKind::TimerFired { source_event_id, .. } => Some(*source_event_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    /// First event of every execution.
    WorkflowStarted { name: String, input: String },
    /// One attempt of an activity was scheduled.
    ActivityScheduled {
        name: String,
        input: String,
        attempt: u32,
        timeout_ms: Option<u64>,
    },
    ActivityCompleted { source_event_id: u64, result: String },
    ActivityFailed { source_event_id: u64, details: ErrorDetails },
    /// Durable timer; `fire_at_ms` is wall-clock time recorded at scheduling.
    TimerStarted { fire_at_ms: u64 },
    TimerFired { source_event_id: u64, fire_at_ms: u64 },
    WorkflowCancelRequested { reason: String },
    WorkflowCompleted { output: String },
    WorkflowFailed { details: ErrorDetails },
    /// Terminal for this execution; the next execution starts from `input`.
    WorkflowContinuedAsNew { input: String },
    WorkflowCancelled { reason: String },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::WorkflowStarted { .. } => "WorkflowStarted",
            EventKind::ActivityScheduled { .. } => "ActivityScheduled",
            EventKind::ActivityCompleted { .. } => "ActivityCompleted",
            EventKind::ActivityFailed { .. } => "ActivityFailed",
            EventKind::TimerStarted { .. } => "TimerStarted",
            EventKind::TimerFired { .. } => "TimerFired",
            EventKind::WorkflowCancelRequested { .. } => "WorkflowCancelRequested",
            EventKind::WorkflowCompleted { .. } => "WorkflowCompleted",
            EventKind::WorkflowFailed { .. } => "WorkflowFailed",
            EventKind::WorkflowContinuedAsNew { .. } => "WorkflowContinuedAsNew",
            EventKind::WorkflowCancelled { .. } => "WorkflowCancelled",
        }
    }

    pub fn is_scheduling(&self) -> bool {
        matches!(self, EventKind::ActivityScheduled { .. } | EventKind::TimerStarted { .. })
    }

    /// Terminal for the execution it belongs to.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::WorkflowCompleted { .. }
                | EventKind::WorkflowFailed { .. }
                | EventKind::WorkflowContinuedAsNew { .. }
                | EventKind::WorkflowCancelled { .. }
        )
    }
}

/// Decisions produced by a turn. The dispatcher turns them into queue items
/// after the matching scheduling events are durably appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CallActivity {
        scheduling_event_id: u64,
        name: String,
        input: String,
        attempt: u32,
        timeout: Option<Duration>,
    },
    CreateTimer {
        scheduling_event_id: u64,
        fire_at_ms: u64,
    },
    ContinueAsNew {
        input: String,
    },
}

// ============================================================================
// Orchestration context
// ============================================================================

/// What a scheduling call expects to find at its position in history.
#[derive(Debug, Clone)]
pub(crate) enum ScheduleRequest<'a> {
    Activity { name: &'a str, input: &'a str, attempt: u32 },
    Timer,
}

impl std::fmt::Display for ScheduleRequest<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleRequest::Activity { name, input, attempt } => {
                write!(f, "ActivityScheduled('{name}','{input}',attempt={attempt})")
            }
            ScheduleRequest::Timer => write!(f, "TimerStarted"),
        }
    }
}

fn describe_scheduling(kind: &EventKind) -> String {
    match kind {
        EventKind::ActivityScheduled {
            name, input, attempt, ..
        } => format!("ActivityScheduled('{name}','{input}',attempt={attempt})"),
        other => other.name().to_string(),
    }
}

#[derive(Debug)]
pub(crate) struct CtxInner {
    pub(crate) instance_id: String,
    pub(crate) execution_id: u64,
    pub(crate) history: Vec<Event>,
    pub(crate) actions: Vec<Action>,
    pub(crate) next_event_id: u64,
    pub(crate) claimed_scheduling_events: HashSet<u64>,
    /// Scheduling events that were already in history when the turn began.
    pub(crate) recorded_schedule_count: usize,
    pub(crate) nondeterminism_error: Option<String>,
}

impl CtxInner {
    fn new(instance_id: String, execution_id: u64, history: Vec<Event>) -> Self {
        let next_event_id = history.last().map(|e| e.event_id + 1).unwrap_or(INITIAL_EVENT_ID);
        let recorded_schedule_count = history.iter().filter(|e| e.kind.is_scheduling()).count();
        Self {
            instance_id,
            execution_id,
            history,
            actions: Vec::new(),
            next_event_id,
            claimed_scheduling_events: HashSet::new(),
            recorded_schedule_count,
            nondeterminism_error: None,
        }
    }

    pub(crate) fn record_action(&mut self, a: Action) {
        self.actions.push(a);
    }

    pub(crate) fn push_event(&mut self, kind: EventKind) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        self.history.push(Event::new(id, self.execution_id, kind));
        id
    }

    /// Positional match of a scheduling call against history.
    ///
    /// Returns `Ok(Some(id))` when the next unclaimed scheduling event is this
    /// call, `Ok(None)` when history holds no more scheduling events (a new
    /// step), or `Err` when the recorded step at this position is different.
    pub(crate) fn claim_scheduling(&mut self, request: &ScheduleRequest<'_>) -> Result<Option<u64>, String> {
        let next = self
            .history
            .iter()
            .find(|e| e.kind.is_scheduling() && !self.claimed_scheduling_events.contains(&e.event_id));
        let Some(recorded) = next else {
            return Ok(None);
        };
        let matches = match (&recorded.kind, request) {
            (
                EventKind::ActivityScheduled {
                    name, input, attempt, ..
                },
                ScheduleRequest::Activity {
                    name: n,
                    input: i,
                    attempt: a,
                },
            ) => name == n && input == i && attempt == a,
            (EventKind::TimerStarted { .. }, ScheduleRequest::Timer) => true,
            _ => false,
        };
        if matches {
            let id = recorded.event_id;
            self.claimed_scheduling_events.insert(id);
            Ok(Some(id))
        } else {
            Err(format!(
                "schedule order mismatch at event {}: history has {} but workflow code requested {}",
                recorded.event_id,
                describe_scheduling(&recorded.kind),
                request
            ))
        }
    }

    pub(crate) fn is_replaying(&self) -> bool {
        self.claimed_scheduling_events.len() < self.recorded_schedule_count
    }

    fn unclaimed_scheduling_events(&self) -> Vec<u64> {
        self.history
            .iter()
            .filter(|e| e.kind.is_scheduling() && !self.claimed_scheduling_events.contains(&e.event_id))
            .map(|e| e.event_id)
            .collect()
    }
}

/// Handle given to workflow code. Its scheduling calls are the only effects a
/// workflow may perform; everything else must be a pure function of their
/// results and the workflow input.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub fn new(instance_id: impl Into<String>, execution_id: u64, history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance_id.into(), execution_id, history))),
        }
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<'_, CtxInner> {
        self.inner.lock().expect("orchestration context mutex poisoned")
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance_id.clone()
    }

    pub fn execution_id(&self) -> u64 {
        self.lock().execution_id
    }

    /// True while the code is re-executing steps that were already recorded.
    pub fn is_replaying(&self) -> bool {
        self.lock().is_replaying()
    }

    /// Schedule a single activity attempt with no timeout.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        self.schedule_activity_attempt(name, input, 1, None)
    }

    /// Schedule one attempt of an activity. Retry loops built on top of this
    /// must pass a distinct, deterministic `attempt` per try.
    pub fn schedule_activity_attempt(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        attempt: u32,
        timeout: Option<Duration>,
    ) -> DurableFuture {
        DurableFuture::activity(self.clone(), name.into(), input.into(), attempt, timeout)
    }

    /// Schedule an activity and retry it according to `options.retry_policy`.
    ///
    /// Each attempt is its own `ActivityScheduled` event; failed attempts are
    /// followed by a durable backoff timer, so a restart in the middle of a
    /// retry sequence resumes at the same attempt.
    pub async fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        options: &ActivityOptions,
    ) -> Result<String, ErrorDetails> {
        let name = name.into();
        let input = input.into();
        let mut attempt: u32 = 1;
        loop {
            let outcome = self
                .schedule_activity_attempt(name.clone(), input.clone(), attempt, options.timeout)
                .into_activity()
                .await;
            let details = match outcome {
                Ok(result) => return Ok(result),
                Err(details) => details,
            };
            match retry::next_action(&options.retry_policy, attempt, &details) {
                RetryDecision::Retry { after } => {
                    self.trace_warn(format!(
                        "activity '{name}' attempt {attempt} failed ({}); retrying in {after:?}",
                        details.display_message()
                    ));
                    self.schedule_timer(after).into_timer().await;
                    attempt += 1;
                }
                RetryDecision::GiveUp(final_error) => {
                    self.trace_error(format!(
                        "activity '{name}' gave up after attempt {attempt}: {}",
                        final_error.display_message()
                    ));
                    return Err(final_error);
                }
            }
        }
    }

    /// Typed variant of [`schedule_activity_with_retry`](Self::schedule_activity_with_retry).
    pub async fn schedule_activity_with_retry_typed<In, Out>(
        &self,
        name: impl Into<String>,
        input: &In,
        options: &ActivityOptions,
    ) -> Result<Out, ErrorDetails>
    where
        In: Serialize,
        Out: serde::de::DeserializeOwned,
    {
        use _typed_codec::Codec;
        let name = name.into();
        let payload = _typed_codec::Json::encode(input).map_err(|e| ErrorDetails::Application {
            kind: AppErrorKind::WorkflowFailed,
            message: format!("encode input for '{name}': {e}"),
            retryable: false,
        })?;
        let raw = self.schedule_activity_with_retry(name.clone(), payload, options).await?;
        _typed_codec::Json::decode::<Out>(&raw).map_err(|e| ErrorDetails::Application {
            kind: AppErrorKind::WorkflowFailed,
            message: format!("decode output of '{name}': {e}"),
            retryable: false,
        })
    }

    /// Durable sleep.
    pub fn schedule_timer(&self, delay: Duration) -> DurableFuture {
        DurableFuture::timer(self.clone(), delay)
    }

    /// End this execution and start a fresh one with `input` and empty history.
    ///
    /// The returned future never resolves; the turn ends with a
    /// `WorkflowContinuedAsNew` event instead.
    pub fn continue_as_new(&self, input: impl Into<String>) -> impl Future<Output = Result<String, String>> + Send {
        self.lock().record_action(Action::ContinueAsNew { input: input.into() });
        std::future::pending()
    }

    // Replay-safe logging: lines are emitted only on the first, live evaluation.
    pub fn trace_info(&self, message: impl Into<String>) {
        if !self.is_replaying() {
            tracing::info!(target: "content_amplifier::workflow", instance_id = %self.instance_id(), execution_id = self.execution_id(), "{}", message.into());
        }
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        if !self.is_replaying() {
            tracing::warn!(target: "content_amplifier::workflow", instance_id = %self.instance_id(), execution_id = self.execution_id(), "{}", message.into());
        }
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        if !self.is_replaying() {
            tracing::error!(target: "content_amplifier::workflow", instance_id = %self.instance_id(), execution_id = self.execution_id(), "{}", message.into());
        }
    }

    fn take_actions(&self) -> Vec<Action> {
        std::mem::take(&mut self.lock().actions)
    }
}

// ============================================================================
// Turn driver
// ============================================================================

/// Outcome of one deterministic evaluation of workflow code.
#[derive(Debug)]
pub struct TurnOutput<O> {
    /// Input history plus scheduling events created during this turn.
    pub history: Vec<Event>,
    /// New decisions, in the order the workflow made them.
    pub actions: Vec<Action>,
    /// Set when the workflow function returned.
    pub output: Option<O>,
    /// Set when the code diverged from the recorded history.
    pub nondeterminism: Option<String>,
}

/// Evaluate `orchestrator` once against `history`.
///
/// Recorded steps resolve from history; the first step with no recorded
/// outcome suspends the workflow. Calling this twice with the same history
/// yields the same actions.
pub fn run_turn<O, F>(
    instance_id: &str,
    execution_id: u64,
    history: Vec<Event>,
    orchestrator: impl FnOnce(OrchestrationContext) -> F,
) -> TurnOutput<O>
where
    F: Future<Output = O>,
{
    let ctx = OrchestrationContext::new(instance_id, execution_id, history);
    let mut fut = std::pin::pin!(orchestrator(ctx.clone()));
    let waker = ::futures::task::noop_waker();
    let mut cx = Context::from_waker(&waker);
    let polled = Pin::as_mut(&mut fut).poll(&mut cx);

    let actions = ctx.take_actions();
    let mut inner = ctx.lock();
    let mut nondeterminism = inner.nondeterminism_error.take();
    let output = match polled {
        Poll::Ready(out) => {
            let leftover = inner.unclaimed_scheduling_events();
            if nondeterminism.is_none() && !leftover.is_empty() {
                nondeterminism = Some(format!(
                    "workflow returned but history still holds {} scheduled step(s) it never requested (event ids {:?})",
                    leftover.len(),
                    leftover
                ));
            }
            Some(out)
        }
        Poll::Pending => None,
    };
    TurnOutput {
        history: std::mem::take(&mut inner.history),
        actions,
        output,
        nondeterminism,
    }
}
