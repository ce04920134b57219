//! Web server module for signup intake.
//!
//! This module provides a thin HTTP layer that:
//! - Accepts `POST /signup` and publishes the record to the channel
//! - Returns as soon as the channel has accepted it
//! - Exposes `/notification` to start the consumer loop on demand
//! - Exposes `/sendEmail` to check the notification sink
//!
//! Notification happens in the consumer, never on the request path.

pub mod handlers;

pub use handlers::{
    health, hello, notification, send_email, signup, AppState, HealthResponse,
    NotificationResponse, SendEmailResponse, SignupResponse,
};

use axum::{
    http::{header, Method},
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/", get(hello))
        .route("/health", get(health))
        .route("/signup", post(signup))
        .route("/notification", get(notification).post(notification))
        .route("/sendEmail", get(send_email).post(send_email))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
