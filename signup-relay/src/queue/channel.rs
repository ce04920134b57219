//! Publish/subscribe channel abstraction.
//!
//! A [`Channel`] publishes payloads to a topic and hands out a stream of
//! [`Delivery`] values for a subscription. Every delivery must be settled
//! through its acknowledgment handle; a delivery that is dropped unsettled is
//! redelivered by the transport.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use super::types::{ChannelMessage, MessageId};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel unavailable: {0}")]
    Unavailable(String),

    #[error("publish to {topic} was rejected by the broker")]
    Rejected { topic: String },

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("unknown subscription: {0}")]
    UnknownSubscription(String),

    #[error("acknowledgment failed: {0}")]
    Ack(String),

    #[error(transparent)]
    Amqp(#[from] lapin::Error),
}

/// Stream of deliveries for one subscription.
pub type Deliveries = BoxStream<'static, Result<Delivery, ChannelError>>;

/// Transport-side handle that settles one delivered message.
#[async_trait]
pub trait Acknowledger: Send {
    /// Remove the message from the subscription permanently.
    async fn ack(self: Box<Self>) -> Result<(), ChannelError>;

    /// Give the message back. With `requeue` it is redelivered, without it the
    /// transport discards or dead-letters it.
    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), ChannelError>;
}

/// A delivered message together with its acknowledgment handle.
pub struct Delivery {
    pub message: ChannelMessage,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(message: ChannelMessage, acker: Box<dyn Acknowledger>) -> Self {
        Self { message, acker }
    }

    /// Split into the message and its handle, so the message can be borrowed
    /// while the handle is settled later.
    pub fn into_parts(self) -> (ChannelMessage, Box<dyn Acknowledger>) {
        (self.message, self.acker)
    }
}

/// Publish/subscribe transport shared by the publisher and the consumer loop.
///
/// Implementations are cheap to share behind an `Arc` and safe to call
/// concurrently.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Hand `payload` to the transport for `topic`.
    ///
    /// Returns once the transport has accepted the message, not once any
    /// subscriber has received it.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<MessageId, ChannelError>;

    /// Start receiving from `subscription`.
    ///
    /// The stream ends only when the transport connection is lost for good.
    async fn subscribe(&self, subscription: &str) -> Result<Deliveries, ChannelError>;

    /// Release transport resources.
    async fn close(&self) {}
}
