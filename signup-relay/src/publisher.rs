//! Signup publisher.
//!
//! Encodes a [`SignupRecord`] and hands it to the channel. A successful return
//! means the channel accepted the message; it says nothing about whether the
//! notification has been sent.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::queue::{codec, Channel, ChannelError, CodecError, MessageId, SignupRecord};

#[derive(Debug, Error)]
pub enum PublishError {
    /// The record could not be encoded (client-side problem).
    #[error(transparent)]
    Encode(#[from] CodecError),

    /// The channel did not accept the message (infrastructure problem).
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Publishes signups to one topic. Cheap to clone and share across requests.
#[derive(Clone)]
pub struct SignupPublisher {
    channel: Arc<dyn Channel>,
    topic: String,
}

impl SignupPublisher {
    pub fn new(channel: Arc<dyn Channel>, topic: impl Into<String>) -> Self {
        Self {
            channel,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Encode `record` and publish it. No retries: the caller decides whether
    /// to resubmit.
    pub async fn publish_signup(&self, record: &SignupRecord) -> Result<MessageId, PublishError> {
        let payload = codec::encode(record)?;
        let body_length = payload.len();

        match self.channel.publish(&self.topic, payload).await {
            Ok(message_id) => {
                info!(
                    topic = %self.topic,
                    message_id = %message_id,
                    signup_id = record.id,
                    username = %record.username,
                    body_length = body_length,
                    "signup_published"
                );
                Ok(message_id)
            }
            Err(e) => {
                warn!(
                    topic = %self.topic,
                    signup_id = record.id,
                    error = %e,
                    "signup_publish_failed"
                );
                Err(e.into())
            }
        }
    }
}
