use std::sync::Arc;
use std::time::Duration;

use content_amplifier::providers::Provider;
use content_amplifier::providers::in_memory::InMemoryProvider;
use content_amplifier::{
    ActivityContext, ActivityRegistry, Client, ErrorDetails, OrchestrationContext, Runtime, WorkflowRegistry,
    WorkflowStatus,
};

mod common;

fn activities() -> Arc<ActivityRegistry> {
    Arc::new(
        ActivityRegistry::builder()
            .register("A", |_ctx: ActivityContext, input: String| async move { Ok(format!("a:{input}")) })
            .register("B", |_ctx: ActivityContext, input: String| async move { Ok(format!("b:{input}")) })
            .build(),
    )
}

async fn a_then_sleep(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let a = ctx
        .schedule_activity("A", input)
        .into_activity()
        .await
        .map_err(|e| e.display_message())?;
    ctx.schedule_timer(Duration::from_millis(300)).into_timer().await;
    Ok(a)
}

async fn b_then_sleep(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let b = ctx
        .schedule_activity("B", input)
        .into_activity()
        .await
        .map_err(|e| e.display_message())?;
    ctx.schedule_timer(Duration::from_millis(300)).into_timer().await;
    Ok(b)
}

#[tokio::test]
async fn code_swap_mid_flight_fails_with_nondeterminism() {
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());

    let v1 = WorkflowRegistry::builder().register("Swap", a_then_sleep).build();
    let rt1 = Runtime::start_with_options(store.clone(), activities(), v1, common::fast_options()).await;
    let client = Client::new(store.clone());
    client.start_workflow("swap", "Swap", "x").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            "swap",
            |h| common::count_kind(h, "TimerStarted") == 1,
            5_000
        )
        .await
    );
    rt1.shutdown().await;

    // Same name, different first step.
    let v2 = WorkflowRegistry::builder().register("Swap", b_then_sleep).build();
    let rt2 = Runtime::start_with_options(store.clone(), activities(), v2, common::fast_options()).await;

    match client.wait_for_workflow("swap", Duration::from_secs(5)).await.unwrap() {
        WorkflowStatus::Failed { details } => {
            assert!(details.is_nondeterminism(), "{details}");
            assert!(matches!(details, ErrorDetails::Configuration { .. }));
        }
        other => panic!("expected nondeterminism failure, got {other:?}"),
    }
    assert_eq!(rt2.metrics_snapshot().nondeterminism_failures, 1);
    rt2.shutdown().await;
}

#[tokio::test]
async fn unchanged_code_replays_cleanly_after_restart() {
    let store: Arc<dyn Provider> = Arc::new(InMemoryProvider::new());

    let rt1 = Runtime::start_with_options(
        store.clone(),
        activities(),
        WorkflowRegistry::builder().register("Same", a_then_sleep).build(),
        common::fast_options(),
    )
    .await;
    let client = Client::new(store.clone());
    client.start_workflow("same", "Same", "x").await.unwrap();
    assert!(
        common::wait_for_history(
            store.clone(),
            "same",
            |h| common::count_kind(h, "TimerStarted") == 1,
            5_000
        )
        .await
    );
    rt1.shutdown().await;

    let rt2 = Runtime::start_with_options(
        store.clone(),
        activities(),
        WorkflowRegistry::builder().register("Same", a_then_sleep).build(),
        common::fast_options(),
    )
    .await;
    assert_eq!(
        client.wait_for_workflow("same", Duration::from_secs(5)).await.unwrap(),
        WorkflowStatus::Completed { output: "a:x".into() }
    );
    rt2.shutdown().await;
}
