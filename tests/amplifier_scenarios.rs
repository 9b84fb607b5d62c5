//! End-to-end runs of the content amplifier against scripted collaborators.

use std::sync::Arc;
use std::time::Duration;

use content_amplifier::amplifier::collaborators::{CHANNEL_GITHUB, keyword_channel};
use content_amplifier::amplifier::{self, FETCH_CONTENT, content_hash};
use content_amplifier::providers::Provider;
use content_amplifier::providers::in_memory::InMemoryProvider;
use content_amplifier::{Client, EventKind, WorkflowStatus};

mod common;
use common::{FetchStep, RecordingLanguageModel, RecordingNotifier, ScriptedFetcher};

const URL: &str = "http://docs.example.test/changelog";

#[tokio::test]
async fn unchanged_content_triggers_no_downstream_calls() {
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let fetcher = ScriptedFetcher::new(vec![FetchStep::Content("v1")]);
    let llm = RecordingLanguageModel::new();
    let notifier = RecordingNotifier::new();
    let rt = common::start_amplifier(
        store.clone(),
        common::collaborators(fetcher.clone(), llm.clone(), notifier.clone()),
    )
    .await;

    let mut input = common::fast_input(URL, 100);
    input.state.last_content = "v1".into();
    input.state.last_content_hash = content_hash("v1");
    let client = Client::new(store.clone());
    client
        .start_workflow_typed("scenario-a", amplifier::WORKFLOW_NAME, input)
        .await
        .unwrap();

    assert!(common::wait_until(|| fetcher.calls() >= 3, 5_000).await);
    assert!(llm.summarize_calls().is_empty());
    assert!(llm.select_calls().is_empty());
    assert!(notifier.deliveries().is_empty());
    assert!(matches!(
        client.status("scenario-a").await.unwrap(),
        WorkflowStatus::Running { execution_id: 1 }
    ));

    rt.shutdown().await;
}

#[tokio::test]
async fn repeated_content_after_first_change_is_not_reprocessed() {
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let fetcher = ScriptedFetcher::new(vec![FetchStep::Content("v1")]);
    let llm = RecordingLanguageModel::new();
    let notifier = RecordingNotifier::new();
    let rt = common::start_amplifier(
        store.clone(),
        common::collaborators(fetcher.clone(), llm.clone(), notifier.clone()),
    )
    .await;

    Client::new(store.clone())
        .start_workflow_typed("repeat", amplifier::WORKFLOW_NAME, common::fast_input(URL, 100))
        .await
        .unwrap();

    assert!(common::wait_until(|| fetcher.calls() >= 4, 5_000).await);
    // Only the first sighting differs from the empty initial state.
    assert_eq!(llm.summarize_calls(), vec![(String::new(), "v1".to_string())]);
    assert_eq!(notifier.deliveries().len(), 1);

    rt.shutdown().await;
}

#[tokio::test]
async fn changed_content_is_summarized_routed_and_promoted_once() {
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let fetcher = ScriptedFetcher::new(vec![
        FetchStep::Content("new api endpoint"),
        FetchStep::Content("new api endpoint, security fix"),
    ]);
    let llm = RecordingLanguageModel::new();
    let notifier = RecordingNotifier::new();
    let rt = common::start_amplifier(
        store.clone(),
        common::collaborators(fetcher.clone(), llm.clone(), notifier.clone()),
    )
    .await;

    Client::new(store.clone())
        .start_workflow_typed("scenario-b", amplifier::WORKFLOW_NAME, common::fast_input(URL, 100))
        .await
        .unwrap();

    assert!(common::wait_until(|| notifier.deliveries().len() >= 2, 5_000).await);
    // Let a few more unchanged polls go by.
    assert!(common::wait_until(|| fetcher.calls() >= 5, 5_000).await);

    let summaries = llm.summarize_calls();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0], (String::new(), "new api endpoint".to_string()));
    assert_eq!(summaries[1].0, "new api endpoint");

    let deliveries = notifier.deliveries();
    assert_eq!(deliveries.len(), 2);
    let first = &deliveries[0];
    assert_eq!(first.summary, "summary:->new api endpoint");
    assert_eq!(first.channel, CHANNEL_GITHUB);
    assert_eq!(llm.select_calls()[0], first.summary);
    assert_eq!(deliveries[1].channel, keyword_channel(&deliveries[1].summary));
    assert_ne!(first.idempotency_key, deliveries[1].idempotency_key);
    assert!(first.idempotency_key.starts_with("promote:scenario-b:"));

    rt.shutdown().await;
}

#[tokio::test]
async fn empty_summary_skips_routing_but_advances_state() {
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let fetcher = ScriptedFetcher::new(vec![FetchStep::Content("v1"), FetchStep::Content("v2")]);
    let llm = RecordingLanguageModel::returning("");
    let notifier = RecordingNotifier::new();
    let rt = common::start_amplifier(
        store.clone(),
        common::collaborators(fetcher.clone(), llm.clone(), notifier.clone()),
    )
    .await;

    Client::new(store.clone())
        .start_workflow_typed("scenario-c", amplifier::WORKFLOW_NAME, common::fast_input(URL, 100))
        .await
        .unwrap();

    assert!(common::wait_until(|| llm.summarize_calls().len() >= 2, 5_000).await);
    assert!(common::wait_until(|| fetcher.calls() >= 4, 5_000).await);

    let summaries = llm.summarize_calls();
    // The second diff starts from "v1", so state moved on without a promotion.
    assert_eq!(summaries[1], ("v1".to_string(), "v2".to_string()));
    assert_eq!(summaries.len(), 2);
    assert!(llm.select_calls().is_empty());
    assert!(notifier.deliveries().is_empty());

    rt.shutdown().await;
}

#[tokio::test]
async fn summary_that_looks_like_json_reaches_the_notifier_verbatim() {
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let fetcher = ScriptedFetcher::new(vec![FetchStep::Content("v1")]);
    let llm = RecordingLanguageModel::returning("\"\"");
    let notifier = RecordingNotifier::new();
    let rt = common::start_amplifier(
        store.clone(),
        common::collaborators(fetcher.clone(), llm.clone(), notifier.clone()),
    )
    .await;

    Client::new(store.clone())
        .start_workflow_typed("quoted", amplifier::WORKFLOW_NAME, common::fast_input(URL, 100))
        .await
        .unwrap();

    assert!(common::wait_until(|| notifier.deliveries().len() == 1, 5_000).await);
    assert_eq!(llm.select_calls(), vec!["\"\"".to_string()]);
    assert_eq!(notifier.deliveries()[0].summary, "\"\"");

    rt.shutdown().await;
}

#[tokio::test]
async fn fetch_timeouts_are_retried_until_success() {
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let fetcher = ScriptedFetcher::new(vec![
        FetchStep::Slow(Duration::from_secs(2), "v1"),
        FetchStep::Slow(Duration::from_secs(2), "v1"),
        FetchStep::Content("v1"),
    ]);
    let llm = RecordingLanguageModel::new();
    let notifier = RecordingNotifier::new();
    let rt = common::start_amplifier(
        store.clone(),
        common::collaborators(fetcher.clone(), llm.clone(), notifier.clone()),
    )
    .await;

    let mut input = common::fast_input(URL, 1);
    input.activity.timeout_ms = Some(100);
    let client = Client::new(store.clone());
    client
        .start_workflow_typed("scenario-d", amplifier::WORKFLOW_NAME, input)
        .await
        .unwrap();

    // One iteration per execution: execution 2 appears once the first poll
    // (including its retries) is done.
    let mut executions = Vec::new();
    for _ in 0..1000 {
        executions = client.list_executions("scenario-d").await.unwrap();
        if executions.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(executions.len() >= 2, "continue-as-new never happened");

    let first = client.read_execution_history("scenario-d", 1).await.unwrap();
    assert_eq!(common::scheduled_attempts(&first, FETCH_CONTENT), vec![1, 2, 3]);
    let timeouts = first
        .iter()
        .filter(|e| matches!(&e.kind, EventKind::ActivityFailed { details, .. } if details.is_timeout()))
        .count();
    assert_eq!(timeouts, 2);
    // Two backoff timers plus the poll interval.
    assert_eq!(common::count_kind(&first, "TimerFired"), 3);
    assert!(matches!(
        first.last().map(|e| &e.kind),
        Some(EventKind::WorkflowContinuedAsNew { .. })
    ));

    assert_eq!(llm.summarize_calls()[0], (String::new(), "v1".to_string()));
    assert_eq!(notifier.deliveries().len(), 1);

    rt.shutdown().await;
}
