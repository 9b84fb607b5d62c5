use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::{Action, ErrorDetails, EventKind, OrchestrationContext, ScheduleRequest, now_ms};

/// Resolved value of a [`DurableFuture`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    Activity(Result<String, ErrorDetails>),
    Timer,
}

pub(crate) enum Kind {
    Activity {
        name: String,
        input: String,
        attempt: u32,
        timeout: Option<Duration>,
    },
    Timer {
        delay: Duration,
    },
}

/// A scheduled step of a workflow.
///
/// The first poll claims the step's position in history: if the next recorded
/// scheduling event matches, the step adopts it; if history has no more
/// scheduling events, a new event and [`Action`] are recorded; otherwise the
/// turn is flagged nondeterministic and the future stays pending. Later polls
/// look for the completion whose `source_event_id` points at the claimed event.
pub struct DurableFuture {
    ctx: OrchestrationContext,
    kind: Kind,
    claimed_event_id: Option<u64>,
}

impl DurableFuture {
    pub(crate) fn activity(
        ctx: OrchestrationContext,
        name: String,
        input: String,
        attempt: u32,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            ctx,
            kind: Kind::Activity {
                name,
                input,
                attempt,
                timeout,
            },
            claimed_event_id: None,
        }
    }

    pub(crate) fn timer(ctx: OrchestrationContext, delay: Duration) -> Self {
        Self {
            ctx,
            kind: Kind::Timer { delay },
            claimed_event_id: None,
        }
    }

    /// Await as an activity result.
    pub fn into_activity(self) -> impl Future<Output = Result<String, ErrorDetails>> + Send {
        async move {
            match self.await {
                DurableOutput::Activity(r) => r,
                DurableOutput::Timer => Err(ErrorDetails::nondeterminism("timer awaited as activity")),
            }
        }
    }

    /// Await as a timer.
    pub fn into_timer(self) -> impl Future<Output = ()> + Send {
        async move {
            let _ = self.await;
        }
    }

    fn claim(&mut self) -> Option<u64> {
        let mut inner = self.ctx.lock();
        if inner.nondeterminism_error.is_some() {
            return None;
        }
        let request = match &self.kind {
            Kind::Activity { name, input, attempt, .. } => ScheduleRequest::Activity {
                name,
                input,
                attempt: *attempt,
            },
            Kind::Timer { .. } => ScheduleRequest::Timer,
        };
        match inner.claim_scheduling(&request) {
            Ok(Some(id)) => Some(id),
            Ok(None) => {
                let id = match &self.kind {
                    Kind::Activity {
                        name,
                        input,
                        attempt,
                        timeout,
                    } => {
                        let id = inner.push_event(EventKind::ActivityScheduled {
                            name: name.clone(),
                            input: input.clone(),
                            attempt: *attempt,
                            timeout_ms: timeout.map(|t| t.as_millis() as u64),
                        });
                        inner.record_action(Action::CallActivity {
                            scheduling_event_id: id,
                            name: name.clone(),
                            input: input.clone(),
                            attempt: *attempt,
                            timeout: *timeout,
                        });
                        id
                    }
                    Kind::Timer { delay } => {
                        let fire_at_ms = now_ms().saturating_add(delay.as_millis() as u64);
                        let id = inner.push_event(EventKind::TimerStarted { fire_at_ms });
                        inner.record_action(Action::CreateTimer {
                            scheduling_event_id: id,
                            fire_at_ms,
                        });
                        id
                    }
                };
                inner.claimed_scheduling_events.insert(id);
                Some(id)
            }
            Err(msg) => {
                inner.nondeterminism_error = Some(msg);
                None
            }
        }
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let id = match this.claimed_event_id {
            Some(id) => id,
            None => match this.claim() {
                Some(id) => {
                    this.claimed_event_id = Some(id);
                    id
                }
                None => return Poll::Pending,
            },
        };

        let inner = this.ctx.lock();
        let completion = inner
            .history
            .iter()
            .find(|e| e.source_event_id() == Some(id))
            .map(|e| e.kind.clone());
        match (completion, &this.kind) {
            (Some(EventKind::ActivityCompleted { result, .. }), Kind::Activity { .. }) => {
                Poll::Ready(DurableOutput::Activity(Ok(result)))
            }
            (Some(EventKind::ActivityFailed { details, .. }), Kind::Activity { .. }) => {
                Poll::Ready(DurableOutput::Activity(Err(details)))
            }
            (Some(EventKind::TimerFired { .. }), Kind::Timer { .. }) => Poll::Ready(DurableOutput::Timer),
            _ => Poll::Pending,
        }
    }
}
