//! Signup Relay Consumer - notification side of the pipeline.
//!
//! This binary:
//! 1. Subscribes to the signup subscription
//! 2. Decodes each message and sends its notification
//! 3. Acknowledges only after the notification succeeded; failed ones are
//!    handed back to the channel for redelivery
//!
//! Exits non-zero if the subscription is lost so the supervisor restarts it.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay::config::ChannelBackend;
use relay::shutdown::cancel_on_signal;
use relay::{channel_from_config, notifier_from_config, Config, Consumer, ConsumerSettings};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("consumer_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        project_id = %config.project_id,
        subscription_id = %config.subscription_id,
        dead_letter_topic_id = ?config.dead_letter_topic_id,
        notifier = ?config.notifier,
        concurrency = config.worker_concurrency,
        redelivery_delay_ms = config.redelivery_delay_ms,
        "config_loaded"
    );

    if config.channel_backend == ChannelBackend::Memory {
        tracing::warn!("consumer_memory_backend_has_no_publishers");
    }

    let channel = channel_from_config(&config);
    let notifier = notifier_from_config(&config).context("Failed to configure notifier")?;
    let consumer = Consumer::new(
        Arc::clone(&channel),
        notifier,
        ConsumerSettings::from_config(&config),
    );

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());

    let result = consumer.run(cancel).await;
    channel.close().await;
    result.context("Consumer failed")?;

    info!("consumer_shutdown_complete");
    Ok(())
}
