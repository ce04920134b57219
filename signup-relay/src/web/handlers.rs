//! HTTP endpoint handlers.
//!
//! The signup handler only parses the body and publishes it; it answers as
//! soon as the channel has accepted the message. Notification happens later,
//! in the consumer.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::consumer::{ConsumerStatus, ConsumerSwitch};
use crate::notify::Notifier;
use crate::publisher::{PublishError, SignupPublisher};
use crate::queue::SignupRecord;
use crate::Config;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub publisher: SignupPublisher,
    /// Present when this process also runs the consumer loop
    pub consumer: Option<Arc<ConsumerSwitch>>,
    /// Sink exercised by `/sendEmail`
    pub notifier: Option<Arc<dyn Notifier>>,
}

impl AppState {
    pub fn new(config: Arc<Config>, publisher: SignupPublisher) -> Self {
        Self {
            config,
            publisher,
            consumer: None,
            notifier: None,
        }
    }

    pub fn with_consumer(mut self, consumer: Arc<ConsumerSwitch>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer: Option<&'static str>,
}

/// Health check endpoint.
///
/// Reports the consumer loop when this process hosts one, and turns 503 once
/// that loop has died so an orchestrator can notice.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let Some(consumer) = state.consumer.as_ref() else {
        return (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                consumer: None,
            }),
        );
    };

    let status = consumer.status();
    let (code, label) = match status {
        ConsumerStatus::Failed => (StatusCode::SERVICE_UNAVAILABLE, "degraded"),
        _ => (StatusCode::OK, "ok"),
    };
    (
        code,
        Json(HealthResponse {
            status: label,
            consumer: Some(status.as_str()),
        }),
    )
}

/// Greeting on the root path.
pub async fn hello(State(state): State<AppState>) -> String {
    format!("Hello {}!\n", state.config.name)
}

// =============================================================================
// Signup
// =============================================================================

/// Signup response.
#[derive(Debug, Serialize)]
pub struct SignupResponse {
    pub status: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl SignupResponse {
    fn error(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            status: "error",
            message: message.into(),
            message_id: None,
        })
    }
}

/// Signup endpoint.
///
/// This endpoint:
/// 1. Parses the JSON body (400 if malformed, nothing is published)
/// 2. Publishes the record to the signup topic
/// 3. Returns 200 once the channel has accepted it, 500 if it has not
///
/// The body is taken as raw bytes so every parse failure maps to 400.
pub async fn signup(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let record: SignupRecord = match serde_json::from_slice(&body) {
        Ok(record) => record,
        Err(e) => {
            warn!(body_length = body.len(), error = %e, "signup_invalid_json");
            return (
                StatusCode::BAD_REQUEST,
                SignupResponse::error("Invalid JSON format"),
            );
        }
    };

    info!(
        signup_id = record.id,
        username = %record.username,
        email = %record.email,
        "signup_received"
    );

    match state.publisher.publish_signup(&record).await {
        Ok(message_id) => (
            StatusCode::OK,
            Json(SignupResponse {
                status: "success",
                message: "Data received successfully".to_string(),
                message_id: Some(message_id),
            }),
        ),
        Err(PublishError::Encode(e)) => {
            warn!(signup_id = record.id, error = %e, "signup_encode_failed");
            (
                StatusCode::BAD_REQUEST,
                SignupResponse::error("Signup could not be encoded"),
            )
        }
        Err(PublishError::Channel(e)) => {
            error!(signup_id = record.id, error = %e, "signup_publish_failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                SignupResponse::error("Signup could not be queued"),
            )
        }
    }
}

// =============================================================================
// Notification trigger
// =============================================================================

/// Consumer status response.
#[derive(Debug, Serialize)]
pub struct NotificationResponse {
    pub status: &'static str,
}

/// Make sure the consumer loop is running.
///
/// Idempotent: 202 when this call started the loop, 200 when it was already
/// running, 503 in a process that does not host a consumer or is shutting
/// down.
pub async fn notification(State(state): State<AppState>) -> impl IntoResponse {
    let Some(consumer) = state.consumer.as_ref() else {
        warn!("notification_consumer_disabled");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(NotificationResponse { status: "disabled" }),
        );
    };

    if consumer.start() {
        info!("notification_consumer_started");
        (
            StatusCode::ACCEPTED,
            Json(NotificationResponse { status: "started" }),
        )
    } else if consumer.is_running() {
        (
            StatusCode::OK,
            Json(NotificationResponse { status: "running" }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(NotificationResponse { status: "stopped" }),
        )
    }
}

// =============================================================================
// Notification sink check
// =============================================================================

/// Sink check response.
#[derive(Debug, Serialize)]
pub struct SendEmailResponse {
    pub status: &'static str,
    pub message: String,
}

/// Send one test notification through the configured sink.
///
/// Goes to `NOTIFY_TO`, or back to `NOTIFY_FROM` when no operator address is
/// set. Returns 200 once the sink accepted it and 502 with the sink's error
/// otherwise. Nothing touches the channel.
pub async fn send_email(State(state): State<AppState>) -> impl IntoResponse {
    let Some(notifier) = state.notifier.as_ref() else {
        warn!("send_email_notifier_disabled");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(SendEmailResponse {
                status: "disabled",
                message: "No notifier configured in this process".to_string(),
            }),
        );
    };

    let config = &state.config;
    let address = config.notify_to.as_deref().unwrap_or(&config.notify_from);
    let record = SignupRecord::new(0, address, "relay-check", "");

    match notifier.notify(&record).await {
        Ok(()) => {
            info!(to = %address, "send_email_succeeded");
            (
                StatusCode::OK,
                Json(SendEmailResponse {
                    status: "success",
                    message: "Email sent successfully".to_string(),
                }),
            )
        }
        Err(e) => {
            error!(to = %address, error = %e, "send_email_failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(SendEmailResponse {
                    status: "error",
                    message: e.to_string(),
                }),
            )
        }
    }
}
