//! Mailgun HTTP API notifier.
//!
//! Sends through `POST {MAILGUN_API_BASE}/v3/{MAILGUN_DOMAIN}/messages` with
//! basic auth (`api`, `MAILGUN_API_KEY`) and a form-encoded body.
//! Reference: https://documentation.mailgun.com/docs/mailgun/api-reference/openapi-final/tag/Messages/

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::info;

use super::{Notifier, NotifyError, NotifySettings};
use crate::config::Config;
use crate::queue::SignupRecord;

pub struct MailgunNotifier {
    client: Client,
    endpoint: String,
    api_key: String,
    settings: NotifySettings,
}

impl MailgunNotifier {
    pub fn from_config(config: &Config) -> Result<Self, NotifyError> {
        let api_key = config
            .mailgun_api_key
            .clone()
            .ok_or(NotifyError::MissingConfig("MAILGUN_API_KEY"))?;
        let domain = config
            .mailgun_domain
            .as_deref()
            .ok_or(NotifyError::MissingConfig("MAILGUN_DOMAIN"))?;

        Self::new(
            &config.mailgun_api_base,
            domain,
            api_key,
            NotifySettings::from_config(config),
        )
    }

    pub fn new(
        api_base: &str,
        domain: &str,
        api_key: String,
        settings: NotifySettings,
    ) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let endpoint = format!("{}/v3/{}/messages", api_base.trim_end_matches('/'), domain);
        info!(endpoint = %endpoint, "mailgun_notifier_configured");

        Ok(Self {
            client,
            endpoint,
            api_key,
            settings,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Notifier for MailgunNotifier {
    async fn notify(&self, record: &SignupRecord) -> Result<(), NotifyError> {
        let to = self.settings.recipient(record);
        let body = self.settings.body(record);
        let form = [
            ("from", self.settings.from.as_str()),
            ("to", to),
            ("subject", self.settings.subject.as_str()),
            ("text", body.as_str()),
        ];

        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth("api", Some(&self.api_key))
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NotifyError::Timeout(self.settings.timeout)
                } else {
                    NotifyError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            info!(
                signup_id = record.id,
                to = %to,
                status = status.as_u16(),
                "mailgun_notification_sent"
            );
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(NotifyError::Auth(text)),
            _ => Err(NotifyError::Rejected {
                status: status.as_u16(),
                body: text,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use axum::{extract::State, http::HeaderMap, routing::post, Form, Router};
    use tokio::net::TcpListener;

    type Captured = Arc<Mutex<Vec<(Option<String>, HashMap<String, String>)>>>;

    async fn spawn_sink(status: axum::http::StatusCode) -> (String, Captured) {
        let captured: Captured = Arc::default();
        let app = Router::new()
            .route(
                "/v3/mg.example.com/messages",
                post(
                    move |State(captured): State<Captured>,
                          headers: HeaderMap,
                          Form(form): Form<HashMap<String, String>>| async move {
                        let auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        captured.lock().unwrap().push((auth, form));
                        status
                    },
                ),
            )
            .with_state(Arc::clone(&captured));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}", addr), captured)
    }

    fn settings() -> NotifySettings {
        NotifySettings {
            from: "relay@mg.example.com".to_string(),
            to: None,
            subject: "New signup".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_missing_config() {
        let config = Config {
            mailgun_domain: Some("mg.example.com".to_string()),
            ..Config::default()
        };
        assert!(matches!(
            MailgunNotifier::from_config(&config),
            Err(NotifyError::MissingConfig("MAILGUN_API_KEY"))
        ));
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let notifier =
            MailgunNotifier::new("https://api.eu.mailgun.net/", "mg.example.com", "key".into(), settings())
                .unwrap();
        assert_eq!(
            notifier.endpoint(),
            "https://api.eu.mailgun.net/v3/mg.example.com/messages"
        );
    }

    #[tokio::test]
    async fn test_notify_posts_form() {
        let (base, captured) = spawn_sink(axum::http::StatusCode::OK).await;
        let notifier = MailgunNotifier::new(&base, "mg.example.com", "key-123".into(), settings()).unwrap();

        notifier
            .notify(&SignupRecord::new(5, "a@b.com", "alice", "hunter2"))
            .await
            .unwrap();

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        let (auth, form) = &captured[0];
        assert!(auth.as_deref().unwrap_or_default().starts_with("Basic "));
        assert_eq!(form["to"], "a@b.com");
        assert_eq!(form["from"], "relay@mg.example.com");
        assert!(form["text"].contains("Username: alice"));
        assert!(!form["text"].contains("hunter2"));
    }

    #[tokio::test]
    async fn test_notify_maps_auth_failure() {
        let (base, _) = spawn_sink(axum::http::StatusCode::UNAUTHORIZED).await;
        let notifier = MailgunNotifier::new(&base, "mg.example.com", "bad".into(), settings()).unwrap();

        let result = notifier
            .notify(&SignupRecord::new(5, "a@b.com", "alice", "x"))
            .await;
        assert!(matches!(result, Err(NotifyError::Auth(_))));
    }

    #[tokio::test]
    async fn test_notify_maps_server_error() {
        let (base, _) = spawn_sink(axum::http::StatusCode::SERVICE_UNAVAILABLE).await;
        let notifier = MailgunNotifier::new(&base, "mg.example.com", "key".into(), settings()).unwrap();

        let result = notifier
            .notify(&SignupRecord::new(5, "a@b.com", "alice", "x"))
            .await;
        assert!(matches!(result, Err(NotifyError::Rejected { status: 503, .. })));
    }
}
