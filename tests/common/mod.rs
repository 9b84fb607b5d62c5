// Not every test binary uses every helper.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use content_amplifier::Event;
use content_amplifier::amplifier::collaborators::keyword_channel;
use content_amplifier::amplifier::{
    ActivitySettings, AmplifierInput, Collaborators, ContentFetcher, DeliveryError, FetchError, LanguageModel,
    Notifier, SelectionError, SummarizationError,
};
use content_amplifier::providers::Provider;
use content_amplifier::providers::sqlite::SqliteProvider;
use content_amplifier::amplifier;
use content_amplifier::{Runtime, RuntimeOptions};
use tempfile::TempDir;

pub mod fault_injection;

pub async fn wait_for_history<F>(store: Arc<dyn Provider>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&Vec<Event>) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read_all(instance).await.unwrap_or_default();
        if predicate(&hist) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll `check` until it holds or `timeout_ms` passes.
pub async fn wait_until<F: Fn() -> bool>(check: F, timeout_ms: u64) -> bool {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while Instant::now() <= deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

pub async fn create_sqlite_store_disk() -> (Arc<SqliteProvider>, TempDir, String) {
    let td = tempfile::tempdir().unwrap();
    let db_path = td.path().join("test.db");
    std::fs::File::create(&db_path).unwrap();
    let db_url = format!("sqlite:{}", db_path.display());
    let store = Arc::new(SqliteProvider::new(&db_url).await.unwrap());
    (store, td, db_url)
}

/// Short sleeps and lock timeouts so tests run in milliseconds.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        dispatcher_idle_sleep: Duration::from_millis(2),
        orchestrator_lock_timeout: Duration::from_secs(2),
        worker_lock_timeout: Duration::from_secs(2),
        worker_lock_renewal_buffer: Duration::ZERO,
        store_retry_initial_backoff: Duration::from_millis(5),
        store_retry_max_backoff: Duration::from_millis(50),
        shutdown_grace: Duration::from_millis(500),
        ..RuntimeOptions::default()
    }
}

/// Workflow input with millisecond polling and retry intervals.
pub fn fast_input(url: &str, iterations_per_execution: u32) -> AmplifierInput {
    AmplifierInput {
        url: url.to_string(),
        poll_interval_ms: 20,
        iterations_per_execution,
        activity: ActivitySettings {
            timeout_ms: Some(5_000),
            initial_interval_ms: 10,
            backoff_coefficient: 2.0,
            maximum_interval_ms: 50,
            maximum_attempts: 3,
            non_retryable_error_types: Vec::new(),
            timeout_is_retryable: true,
        },
        state: Default::default(),
    }
}

/// One scripted fetch outcome.
#[derive(Clone, Debug)]
pub enum FetchStep {
    Content(&'static str),
    Fail(FetchError),
    /// Sleep this long before returning the content.
    Slow(Duration, &'static str),
}

/// Replays a script of fetch outcomes; the last step repeats forever.
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<FetchStep>>,
    calls: Mutex<usize>,
}

impl ScriptedFetcher {
    pub fn new(script: Vec<FetchStep>) -> Arc<Self> {
        assert!(!script.is_empty());
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }

    fn next_step(&self) -> FetchStep {
        *self.calls.lock().unwrap() += 1;
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap()
        } else {
            script.front().cloned().unwrap()
        }
    }
}

#[async_trait]
impl ContentFetcher for ScriptedFetcher {
    async fn fetch(&self, _url: &str) -> Result<String, FetchError> {
        match self.next_step() {
            FetchStep::Content(c) => Ok(c.to_string()),
            FetchStep::Fail(e) => Err(e),
            FetchStep::Slow(d, c) => {
                tokio::time::sleep(d).await;
                Ok(c.to_string())
            }
        }
    }
}

/// Summarizes as `summary:{prev}->{current}` (or always `fixed`) and records
/// every call.
#[derive(Default)]
pub struct RecordingLanguageModel {
    fixed: Option<String>,
    summarize_calls: Mutex<Vec<(String, String)>>,
    select_calls: Mutex<Vec<String>>,
}

impl RecordingLanguageModel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn returning(summary: &str) -> Arc<Self> {
        Arc::new(Self {
            fixed: Some(summary.to_string()),
            ..Self::default()
        })
    }

    pub fn summarize_calls(&self) -> Vec<(String, String)> {
        self.summarize_calls.lock().unwrap().clone()
    }

    pub fn select_calls(&self) -> Vec<String> {
        self.select_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for RecordingLanguageModel {
    async fn summarize(&self, previous: &str, current: &str) -> Result<String, SummarizationError> {
        self.summarize_calls
            .lock()
            .unwrap()
            .push((previous.to_string(), current.to_string()));
        Ok(self
            .fixed
            .clone()
            .unwrap_or_else(|| format!("summary:{previous}->{current}")))
    }

    async fn select_channel(&self, summary: &str) -> Result<String, SelectionError> {
        self.select_calls.lock().unwrap().push(summary.to_string());
        Ok(keyword_channel(summary).to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub channel: String,
    pub summary: String,
    pub idempotency_key: String,
}

#[derive(Default)]
pub struct RecordingNotifier {
    deliveries: Mutex<Vec<Delivery>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, channel: &str, summary: &str, idempotency_key: &str) -> Result<(), DeliveryError> {
        self.deliveries.lock().unwrap().push(Delivery {
            channel: channel.to_string(),
            summary: summary.to_string(),
            idempotency_key: idempotency_key.to_string(),
        });
        Ok(())
    }
}

pub fn collaborators(
    fetcher: Arc<ScriptedFetcher>,
    language_model: Arc<RecordingLanguageModel>,
    notifier: Arc<RecordingNotifier>,
) -> Collaborators {
    Collaborators {
        fetcher,
        language_model,
        notifier,
    }
}

/// Start a runtime that hosts the amplifier workflow and its activities.
pub async fn start_amplifier(store: Arc<dyn Provider>, collaborators: Collaborators) -> Arc<Runtime> {
    Runtime::start_with_options(
        store,
        Arc::new(amplifier::activity_registry(collaborators)),
        amplifier::workflow_registry(),
        fast_options(),
    )
    .await
}

/// Attempt numbers of every `activity` scheduling in `history`.
pub fn scheduled_attempts(history: &[Event], activity: &str) -> Vec<u32> {
    history
        .iter()
        .filter_map(|e| match &e.kind {
            content_amplifier::EventKind::ActivityScheduled { name, attempt, .. } if name == activity => Some(*attempt),
            _ => None,
        })
        .collect()
}

pub fn count_kind(history: &[Event], kind: &str) -> usize {
    history.iter().filter(|e| e.kind.name() == kind).count()
}
