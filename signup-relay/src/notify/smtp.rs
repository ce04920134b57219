//! SMTP notifier built on lettre.
//!
//! Reads its relay settings from the `SMTP_*` variables:
//!
//! | Variable | Required | Description |
//! |----------|----------|-------------|
//! | `SMTP_HOST` | Yes | SMTP server hostname |
//! | `SMTP_PORT` | No | Port (default: 587) |
//! | `SMTP_USER` | No | Username for authentication |
//! | `SMTP_PASSWORD` | No | Password for authentication |
//! | `SMTP_TLS` | No | `starttls` (default), `tls`, or `none` |

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::{info, warn};

use super::{Notifier, NotifyError, NotifySettings};
use crate::config::{Config, SmtpTls};
use crate::queue::SignupRecord;

pub struct SmtpNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    settings: NotifySettings,
    from: Mailbox,
}

impl SmtpNotifier {
    /// Build the relay transport. Nothing is sent or connected yet.
    pub fn from_config(config: &Config) -> Result<Self, NotifyError> {
        let host = config
            .smtp_host
            .as_deref()
            .ok_or(NotifyError::MissingConfig("SMTP_HOST"))?;

        let builder = match config.smtp_tls {
            SmtpTls::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| NotifyError::Transport(e.to_string()))?,
            SmtpTls::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|e| NotifyError::Transport(e.to_string()))?,
            SmtpTls::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
        };

        let settings = NotifySettings::from_config(config);
        let mut builder = builder
            .port(config.smtp_port)
            .timeout(Some(settings.timeout));

        match (&config.smtp_user, &config.smtp_password) {
            (Some(user), Some(password)) => {
                builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
            }
            (Some(_), None) | (None, Some(_)) => {
                warn!("smtp_credentials_incomplete");
            }
            (None, None) => {}
        }

        let from = parse_mailbox(&settings.from)?;

        info!(
            host = %host,
            port = config.smtp_port,
            tls = ?config.smtp_tls,
            authenticated = config.smtp_user.is_some() && config.smtp_password.is_some(),
            "smtp_notifier_configured"
        );

        Ok(Self {
            transport: builder.build(),
            settings,
            from,
        })
    }

    /// Compose the email for `record`.
    pub fn message(&self, record: &SignupRecord) -> Result<Message, NotifyError> {
        let to = parse_mailbox(self.settings.recipient(record))?;

        Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(self.settings.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(self.settings.body(record))
            .map_err(|e| NotifyError::Build(e.to_string()))
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, NotifyError> {
    address
        .parse::<Mailbox>()
        .map_err(|e| NotifyError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

#[async_trait]
impl Notifier for SmtpNotifier {
    async fn notify(&self, record: &SignupRecord) -> Result<(), NotifyError> {
        let message = self.message(record)?;

        let response = tokio::time::timeout(self.settings.timeout, self.transport.send(message))
            .await
            .map_err(|_| NotifyError::Timeout(self.settings.timeout))?
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        info!(
            signup_id = record.id,
            to = %self.settings.recipient(record),
            code = %response.code(),
            "smtp_notification_sent"
        );

        Ok(())
    }
}
