//! Signup Relay - HTTP intake and notification consumer in one process.
//!
//! Accepts signups on `POST /signup`, publishes them to the channel, and runs
//! the consumer loop that sends one notification per signup and acknowledges
//! it afterwards. The consumer starts at boot unless `CONSUMER_AUTOSTART` is
//! off, in which case `/notification` starts it.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay::shutdown::shutdown_signal;
use relay::web::{router, AppState};
use relay::{
    channel_from_config, notifier_from_config, Config, Consumer, ConsumerSettings,
    ConsumerSwitch, SignupPublisher,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("relay_starting");

    // Load configuration from environment
    let config = Arc::new(Config::from_env());
    info!(
        port = config.port,
        project_id = %config.project_id,
        topic_id = %config.topic_id,
        subscription_id = %config.subscription_id,
        dead_letter_topic_id = ?config.dead_letter_topic_id,
        channel_backend = ?config.channel_backend,
        notifier = ?config.notifier,
        notify_to_fixed = config.notify_to.is_some(),
        concurrency = config.worker_concurrency,
        consumer_autostart = config.consumer_autostart,
        "config_loaded"
    );

    let channel = channel_from_config(&config);
    let notifier = notifier_from_config(&config).context("Failed to configure notifier")?;

    let publisher = SignupPublisher::new(Arc::clone(&channel), config.topic_id.clone());
    let consumer = Consumer::new(
        Arc::clone(&channel),
        Arc::clone(&notifier),
        ConsumerSettings::from_config(&config),
    );

    let cancel = CancellationToken::new();
    let switch = Arc::new(ConsumerSwitch::new(consumer, cancel.clone()));
    if config.consumer_autostart {
        switch.start();
    }

    let state = AppState::new(Arc::clone(&config), publisher)
        .with_consumer(Arc::clone(&switch))
        .with_notifier(notifier);
    let app = router(state);

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "relay_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("relay_shutting_down");
            cancel.cancel();
        })
        .await
        .context("Server error")?;

    // Let in-flight notifications finish, then release the broker connection
    switch.stop().await;
    channel.close().await;

    info!("relay_shutdown_complete");

    Ok(())
}
