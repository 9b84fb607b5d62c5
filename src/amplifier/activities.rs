use sha2::{Digest, Sha256};

use super::{
    Collaborators, ContentDiffInput, FETCH_CONTENT, PROMOTE_CONTENT, PromoteContentInput, SELECT_PROMOTION_CHANNEL,
    SUMMARIZE_CONTENT_DIFF,
};
use crate::runtime::ActivityContext;
use crate::runtime::registry::ActivityRegistryBuilder;

/// Key shared by every attempt of one promotion. The summary embeds what
/// changed, so distinct changes get distinct keys.
pub(crate) fn promotion_key(instance: &str, input: &PromoteContentInput) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.channel.as_bytes());
    hasher.update([0u8]);
    hasher.update(input.summary.as_bytes());
    format!("promote:{instance}:{}", hex::encode(&hasher.finalize()[..16]))
}

pub(super) fn register(builder: ActivityRegistryBuilder, collaborators: Collaborators) -> ActivityRegistryBuilder {
    let fetcher = collaborators.fetcher;
    let language_model = collaborators.language_model;
    let selector = language_model.clone();
    let notifier = collaborators.notifier;

    builder
        .register(FETCH_CONTENT, move |ctx: ActivityContext, url: String| {
            let fetcher = fetcher.clone();
            async move {
                tracing::info!(target: "content_amplifier::activity", instance_id = %ctx.instance_id(), attempt = ctx.attempt(), url = %url, "fetching content");
                let body = ctx.run_cancellable(fetcher.fetch(&url)).await??;
                Ok(body)
            }
        })
        .register_typed(SUMMARIZE_CONTENT_DIFF, move |ctx: ActivityContext, input: ContentDiffInput| {
            let language_model = language_model.clone();
            async move {
                tracing::info!(target: "content_amplifier::activity", instance_id = %ctx.instance_id(), "summarizing content differences");
                let summary = ctx
                    .run_cancellable(language_model.summarize(&input.prev_content, &input.current_content))
                    .await??;
                Ok(summary)
            }
        })
        .register(SELECT_PROMOTION_CHANNEL, move |ctx: ActivityContext, summary: String| {
            let selector = selector.clone();
            async move {
                tracing::info!(target: "content_amplifier::activity", instance_id = %ctx.instance_id(), "selecting promotion channel");
                let channel = ctx.run_cancellable(selector.select_channel(&summary)).await??;
                Ok(channel)
            }
        })
        .register_typed(PROMOTE_CONTENT, move |ctx: ActivityContext, input: PromoteContentInput| {
            let notifier = notifier.clone();
            async move {
                let key = promotion_key(ctx.instance_id(), &input);
                tracing::info!(target: "content_amplifier::activity", instance_id = %ctx.instance_id(), channel = %input.channel, idempotency_key = %key, "promoting content");
                ctx.run_cancellable(notifier.notify(&input.channel, &input.summary, &key))
                    .await??;
                Ok(())
            }
        })
}
