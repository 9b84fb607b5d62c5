//! Replaying a finished instance must not run any of its activities again.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use content_amplifier::providers::Provider;
use content_amplifier::providers::in_memory::InMemoryProvider;
use content_amplifier::{
    ActivityContext, ActivityRegistry, Client, OrchestrationContext, Runtime, WorkflowRegistry, WorkflowStatus,
    run_turn,
};

mod common;

async fn two_echoes(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let first = ctx
        .schedule_activity("Echo", input)
        .into_activity()
        .await
        .map_err(|e| e.display_message())?;
    ctx.schedule_timer(Duration::from_millis(5)).into_timer().await;
    ctx.schedule_activity("Echo", format!("{first}+"))
        .into_activity()
        .await
        .map_err(|e| e.display_message())
}

fn counting_echo(calls: Arc<AtomicUsize>) -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("Echo", move |_ctx: ActivityContext, input: String| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(input)
            }
        })
        .build()
}

#[tokio::test]
async fn completed_history_replays_without_new_actions() {
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let rt1 = Runtime::start_with_options(
        store.clone(),
        Arc::new(counting_echo(calls.clone())),
        WorkflowRegistry::builder().register("TwoEchoes", two_echoes).build(),
        common::fast_options(),
    )
    .await;

    let client = Client::new(store.clone());
    client.start_workflow("replayed", "TwoEchoes", "hi").await.unwrap();
    assert_eq!(
        client.wait_for_workflow("replayed", Duration::from_secs(5)).await.unwrap(),
        WorkflowStatus::Completed { output: "hi+".into() }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    rt1.shutdown().await;

    // Every step resolves from history: no new decisions, same output.
    let history = client.read_history("replayed").await.unwrap();
    let turn = run_turn("replayed", 1, history.clone(), |ctx| two_echoes(ctx, "hi".into()));
    assert!(turn.nondeterminism.is_none(), "{:?}", turn.nondeterminism);
    assert!(turn.actions.is_empty(), "{:?}", turn.actions);
    assert_eq!(turn.output, Some(Ok("hi+".to_string())));
    assert_eq!(turn.history, history);

    // A fresh runtime on the same store leaves the finished instance alone.
    let rt2 = Runtime::start_with_options(
        store.clone(),
        Arc::new(counting_echo(calls.clone())),
        WorkflowRegistry::builder().register("TwoEchoes", two_echoes).build(),
        common::fast_options(),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(client.read_history("replayed").await.unwrap(), history);
    rt2.shutdown().await;
}
