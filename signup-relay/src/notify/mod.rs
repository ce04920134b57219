//! Notification sinks.
//!
//! A [`Notifier`] sends one notification for one decoded signup. Sends are
//! bounded by a timeout and never retried here; a failed send leaves the
//! message unacknowledged and the channel's redelivery acts as the retry.
//! Failures that no retry can fix are flagged by [`NotifyError::is_permanent`]
//! and settled like undecodable messages.
//!
//! ## Sinks
//!
//! | `NOTIFIER` | Sink |
//! |------------|------|
//! | `smtp`     | [`SmtpNotifier`], SMTP relay via lettre |
//! | `mailgun`  | [`MailgunNotifier`], Mailgun messages API |
//! | `log`      | [`LogNotifier`], structured log line only |

pub mod log;
pub mod mailgun;
pub mod smtp;

pub use self::log::LogNotifier;
pub use mailgun::MailgunNotifier;
pub use smtp::SmtpNotifier;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{Config, NotifierKind};
use crate::queue::SignupRecord;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("missing required config: {0}")]
    MissingConfig(&'static str),

    #[error("invalid email address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("failed to build message: {0}")]
    Build(String),

    #[error("authentication rejected by notification sink: {0}")]
    Auth(String),

    #[error("notification timed out after {0:?}")]
    Timeout(Duration),

    #[error("notification sink rejected the message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("notification transport error: {0}")]
    Transport(String),
}

impl NotifyError {
    /// Whether retrying the same record can never succeed.
    ///
    /// Bad addresses, unbuildable messages and 4xx rejections (other than
    /// 408 and 429) fail identically on every delivery. Timeouts, transport
    /// errors, auth failures and 5xx are worth another attempt.
    pub fn is_permanent(&self) -> bool {
        match self {
            NotifyError::InvalidAddress { .. } | NotifyError::Build(_) => true,
            NotifyError::Rejected { status, .. } => {
                (400..500).contains(status) && *status != 408 && *status != 429
            }
            NotifyError::MissingConfig(_)
            | NotifyError::Auth(_)
            | NotifyError::Timeout(_)
            | NotifyError::Transport(_) => false,
        }
    }
}

/// Sends a notification for a decoded signup.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, record: &SignupRecord) -> Result<(), NotifyError>;
}

/// Addressing and wording shared by every sink.
#[derive(Debug, Clone)]
pub struct NotifySettings {
    pub from: String,
    /// Fixed operator recipient; `None` notifies the signup's own address
    pub to: Option<String>,
    pub subject: String,
    pub timeout: Duration,
}

impl NotifySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            from: config.notify_from.clone(),
            to: config.notify_to.clone(),
            subject: config.notify_subject.clone(),
            timeout: config.notify_timeout(),
        }
    }

    pub fn recipient<'a>(&'a self, record: &'a SignupRecord) -> &'a str {
        self.to.as_deref().unwrap_or(&record.email)
    }

    /// Plain-text body. The password is deliberately absent.
    pub fn body(&self, record: &SignupRecord) -> String {
        format!(
            "New signup received.\n\nID: {}\nUsername: {}\nEmail: {}\n",
            record.id, record.username, record.email
        )
    }
}

/// Build the sink selected by `NOTIFIER`.
pub fn notifier_from_config(config: &Config) -> Result<Arc<dyn Notifier>, NotifyError> {
    let notifier: Arc<dyn Notifier> = match config.notifier {
        NotifierKind::Smtp => Arc::new(SmtpNotifier::from_config(config)?),
        NotifierKind::Mailgun => Arc::new(MailgunNotifier::from_config(config)?),
        NotifierKind::Log => Arc::new(LogNotifier::new(NotifySettings::from_config(config))),
    };
    Ok(notifier)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(to: Option<&str>) -> NotifySettings {
        NotifySettings {
            from: "relay@example.com".to_string(),
            to: to.map(str::to_string),
            subject: "New signup".to_string(),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_recipient_defaults_to_signup_address() {
        let record = SignupRecord::new(1, "a@b.com", "alice", "x");
        assert_eq!(settings(None).recipient(&record), "a@b.com");
    }

    #[test]
    fn test_recipient_uses_fixed_operator_address() {
        let record = SignupRecord::new(1, "a@b.com", "alice", "x");
        assert_eq!(settings(Some("ops@example.com")).recipient(&record), "ops@example.com");
    }

    #[test]
    fn test_body_omits_password() {
        let record = SignupRecord::new(9, "a@b.com", "alice", "hunter2");
        let body = settings(None).body(&record);

        assert!(body.contains("ID: 9"));
        assert!(body.contains("Username: alice"));
        assert!(!body.contains("hunter2"));
    }

    #[test]
    fn test_permanent_failures() {
        let invalid = NotifyError::InvalidAddress {
            address: "nope".to_string(),
            reason: "missing @".to_string(),
        };
        let rejected = |status| NotifyError::Rejected {
            status,
            body: String::new(),
        };

        assert!(invalid.is_permanent());
        assert!(NotifyError::Build("no body".to_string()).is_permanent());
        assert!(rejected(400).is_permanent());
        assert!(rejected(422).is_permanent());

        assert!(!rejected(408).is_permanent());
        assert!(!rejected(429).is_permanent());
        assert!(!rejected(503).is_permanent());
        assert!(!NotifyError::Auth("bad key".to_string()).is_permanent());
        assert!(!NotifyError::Timeout(Duration::from_secs(1)).is_permanent());
        assert!(!NotifyError::Transport("refused".to_string()).is_permanent());
    }

    #[test]
    fn test_smtp_without_host_is_rejected() {
        let config = Config {
            notifier: NotifierKind::Smtp,
            ..Config::default()
        };
        assert!(matches!(
            notifier_from_config(&config),
            Err(NotifyError::MissingConfig("SMTP_HOST"))
        ));
    }

    #[test]
    fn test_log_notifier_from_default_config() {
        assert!(notifier_from_config(&Config::default()).is_ok());
    }
}
