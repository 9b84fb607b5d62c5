//! content-amplifier: watch a URL and promote summaries of its changes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use content_amplifier::amplifier::fetch::HttpFetcher;
use content_amplifier::amplifier::llm::{HttpLanguageModel, HttpLanguageModelConfig, MockLanguageModel};
use content_amplifier::amplifier::notify::{ConsoleNotifier, WebhookNotifier};
use content_amplifier::amplifier::{self, Collaborators, LanguageModel, Notifier};
use content_amplifier::config::{AppConfig, LlmBackend, NotifyBackend};
use content_amplifier::providers::sqlite::SqliteProvider;
use content_amplifier::runtime::init_logging;
use content_amplifier::{Client, ClientError, Runtime, WorkflowStatus};

#[derive(Debug, Parser)]
#[command(name = "content-amplifier", version, about = "Durable content-change monitor")]
struct Cli {
    /// TOML config file
    #[arg(short, long, env = "AMPLIFIER_CONFIG")]
    config: Option<PathBuf>,

    /// URL to monitor (overrides config and AMPLIFIER_URL)
    #[arg(long)]
    url: Option<String>,

    /// Workflow instance id (overrides config)
    #[arg(long)]
    instance: Option<String>,
}

fn build_collaborators(config: &AppConfig) -> anyhow::Result<Collaborators> {
    let http_timeout = config.activity.to_options().timeout.unwrap_or(Duration::from_secs(30));

    let language_model: Arc<dyn LanguageModel> = match config.llm.backend {
        LlmBackend::Mock => Arc::new(MockLanguageModel),
        LlmBackend::Http => Arc::new(HttpLanguageModel::new(HttpLanguageModelConfig {
            endpoint: config.llm.endpoint.clone(),
            model: config.llm.model.clone(),
            api_key: std::env::var(&config.llm.api_key_env).ok(),
            timeout: http_timeout,
            ..HttpLanguageModelConfig::default()
        })
        .map_err(anyhow::Error::msg)
        .context("building language model client")?),
    };

    let notifier: Arc<dyn Notifier> = match (&config.notify.backend, &config.notify.webhook_url) {
        (NotifyBackend::Webhook, Some(url)) => Arc::new(
            WebhookNotifier::new(url.clone(), http_timeout).context("building webhook notifier")?,
        ),
        _ => Arc::new(ConsoleNotifier),
    };

    Ok(Collaborators {
        fetcher: Arc::new(HttpFetcher::new(http_timeout).context("building content fetcher")?),
        language_model,
        notifier,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(url) = cli.url {
        config.monitor.url = url;
    }
    if let Some(instance) = cli.instance {
        config.monitor.instance_id = instance;
    }

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("{e}");
    }

    let store = Arc::new(
        SqliteProvider::new(&config.store.database_url)
            .await
            .with_context(|| format!("opening store {}", config.store.database_url))?,
    );
    let activities = Arc::new(amplifier::activity_registry(
        build_collaborators(&config).context("building collaborators")?,
    ));
    let runtime = Runtime::start_with_options(
        store.clone(),
        activities,
        amplifier::workflow_registry(),
        config.runtime_options(),
    )
    .await;

    let client = Client::new(store.clone());
    let instance = config.monitor.instance_id.clone();
    match client.status(&instance).await.context("reading instance status")? {
        WorkflowStatus::NotFound => {
            match client
                .start_workflow_typed(&instance, amplifier::WORKFLOW_NAME, config.amplifier_input())
                .await
            {
                Ok(()) | Err(ClientError::InstanceAlreadyExists(_)) => {}
                Err(e) => return Err(e).context("starting monitor instance"),
            }
            info!(instance_id = %instance, url = %config.monitor.url, "monitor started");
        }
        status if status.is_terminal() => {
            error!(instance_id = %instance, ?status, "monitor instance already finished; use a new --instance id");
        }
        status => info!(instance_id = %instance, ?status, "resuming monitor"),
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("ctrl-c received, shutting down");
    runtime.shutdown().await;
    store.close().await;
    Ok(())
}
