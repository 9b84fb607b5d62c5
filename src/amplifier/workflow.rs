use std::time::Duration;

use super::{
    AmplifierInput, ContentDiffInput, FETCH_CONTENT, PROMOTE_CONTENT, PromoteContentInput, SELECT_PROMOTION_CHANNEL,
    SUMMARIZE_CONTENT_DIFF, content_hash,
};
use crate::OrchestrationContext;

/// Poll loop: fetch, compare, summarize, route, promote, sleep.
///
/// After `iterations_per_execution` polls the execution continues as new with
/// only the last seen content and its hash, which keeps history bounded. A
/// step that exhausts its retries fails the instance.
pub async fn content_amplifier(ctx: OrchestrationContext, input: AmplifierInput) -> Result<String, String> {
    let options = input.activity.to_options();
    let poll_interval = Duration::from_millis(input.poll_interval_ms);
    let mut state = input.state.clone();

    ctx.trace_info(format!("monitoring {} (execution {})", input.url, ctx.execution_id()));

    for _ in 0..input.iterations_per_execution.max(1) {
        let content = ctx
            .schedule_activity_with_retry(FETCH_CONTENT, input.url.clone(), &options)
            .await
            .map_err(|e| e.display_message())?;

        let hash = content_hash(&content);
        if hash != state.last_content_hash {
            ctx.trace_info("content has changed, processing update");
            let diff = ContentDiffInput {
                prev_content: state.last_content.clone(),
                current_content: content.clone(),
            };
            let summary: String = ctx
                .schedule_activity_with_retry_typed(SUMMARIZE_CONTENT_DIFF, &diff, &options)
                .await
                .map_err(|e| e.display_message())?;

            if summary.is_empty() {
                ctx.trace_info("empty summary, nothing to promote");
            } else {
                ctx.trace_info(format!("summary: {summary}"));
                let channel = ctx
                    .schedule_activity_with_retry(SELECT_PROMOTION_CHANNEL, summary.clone(), &options)
                    .await
                    .map_err(|e| e.display_message())?;
                let promotion = PromoteContentInput { summary, channel };
                ctx.schedule_activity_with_retry_typed::<_, ()>(PROMOTE_CONTENT, &promotion, &options)
                    .await
                    .map_err(|e| e.display_message())?;
            }

            state.last_content_hash = hash;
            state.last_content = content;
        } else {
            ctx.trace_info("no content changes detected");
        }

        ctx.schedule_timer(poll_interval).into_timer().await;
    }

    let next = AmplifierInput { state, ..input };
    let encoded = serde_json::to_string(&next).map_err(|e| format!("encode next input: {e}"))?;
    ctx.continue_as_new(encoded).await
}
