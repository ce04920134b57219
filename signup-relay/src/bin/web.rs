//! Signup Relay Web Server - publish path only.
//!
//! This binary:
//! - Accepts signups on `POST /signup`
//! - Publishes them to the signup topic
//! - Returns 200 as soon as the channel has accepted the message
//! - Checks the notification sink on `/sendEmail`
//!
//! Signup notifications are sent by `relay-consumer`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay::shutdown::shutdown_signal;
use relay::web::{router, AppState};
use relay::{channel_from_config, notifier_from_config, Config, SignupPublisher};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    // Load configuration
    let config = Arc::new(Config::from_env());
    info!(
        port = config.port,
        project_id = %config.project_id,
        topic_id = %config.topic_id,
        channel_backend = ?config.channel_backend,
        "config_loaded"
    );

    let channel = channel_from_config(&config);
    let publisher = SignupPublisher::new(Arc::clone(&channel), config.topic_id.clone());
    info!(topic = %publisher.topic(), "signup_publisher_created");

    let notifier = notifier_from_config(&config).context("Failed to configure notifier")?;

    // Build the router
    let app = router(AppState::new(Arc::clone(&config), publisher).with_notifier(notifier));

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            info!("web_server_shutting_down");
        })
        .await
        .context("Server error")?;

    // Close channel connection
    channel.close().await;

    info!("web_server_shutdown_complete");

    Ok(())
}
