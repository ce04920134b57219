//! Log-only notifier for local runs without a mail sink.

use async_trait::async_trait;
use tracing::info;

use super::{Notifier, NotifyError, NotifySettings};
use crate::queue::SignupRecord;

pub struct LogNotifier {
    settings: NotifySettings,
}

impl LogNotifier {
    pub fn new(settings: NotifySettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, record: &SignupRecord) -> Result<(), NotifyError> {
        info!(
            from = %self.settings.from,
            to = %self.settings.recipient(record),
            subject = %self.settings.subject,
            signup_id = record.id,
            username = %record.username,
            "notification_logged"
        );
        Ok(())
    }
}
