//! Process-local channel.
//!
//! Mirrors the delivery semantics of the broker closely enough to exercise the
//! consumer loop without one: topics fan out to bound subscriptions, competing
//! subscribers share a subscription queue, nacked or dropped deliveries come
//! back with a higher attempt count, and rejected ones are kept as dead
//! letters. A subscription can be closed to end its open delivery streams, as
//! a broker does when it cancels a consumer. Nothing survives the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::channel::{Acknowledger, Channel, ChannelError, Deliveries, Delivery};
use super::types::{ChannelMessage, MessageId};
use crate::Config;

#[derive(Clone, Default)]
pub struct MemoryChannel {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    unavailable: AtomicBool,
    next_id: AtomicU64,
}

#[derive(Default)]
struct State {
    routes: HashMap<String, Vec<String>>,
    queues: HashMap<String, Arc<SubscriptionQueue>>,
    published: HashMap<String, Vec<ChannelMessage>>,
}

struct SubscriptionQueue {
    tx: mpsc::UnboundedSender<ChannelMessage>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelMessage>>,
    ledger: Mutex<Ledger>,
    /// Cancelled by `close_subscription`; replaced so later subscribes work
    session: Mutex<CancellationToken>,
}

#[derive(Default)]
struct Ledger {
    /// Published or requeued but not yet settled
    outstanding: usize,
    acked: Vec<MessageId>,
    dead_letters: Vec<ChannelMessage>,
}

impl SubscriptionQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            ledger: Mutex::new(Ledger::default()),
            session: Mutex::new(CancellationToken::new()),
        }
    }

    fn redeliver(&self, mut message: ChannelMessage) {
        message.redelivered = true;
        message.delivery_attempt = Some(message.delivery_attempt.unwrap_or(1) + 1);
        debug!(message_id = %message.id, attempt = ?message.delivery_attempt, "memory_channel_redeliver");
        // The queue owns its receiver, so the send only fails once it is gone.
        let _ = self.tx.send(message);
    }
}

/// Recover the guard from a poisoned lock; the tables stay consistent because
/// every critical section is a handful of infallible collection updates.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel with the configured topic routed to the configured subscription.
    pub fn from_config(config: &Config) -> Self {
        let channel = Self::new();
        channel.bind(&config.topic_id, &config.subscription_id);
        channel
    }

    /// Route messages published on `topic` to `subscription`, creating the
    /// subscription if needed.
    pub fn bind(&self, topic: &str, subscription: &str) {
        let mut state = lock(&self.inner.state);
        state
            .queues
            .entry(subscription.to_string())
            .or_insert_with(|| Arc::new(SubscriptionQueue::new()));
        let subs = state.routes.entry(topic.to_string()).or_default();
        if !subs.iter().any(|s| s == subscription) {
            subs.push(subscription.to_string());
        }
    }

    /// Simulate a transport outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    /// End every open delivery stream on `subscription`. Queued and unsettled
    /// messages stay put and are delivered to the next subscriber.
    pub fn close_subscription(&self, subscription: &str) {
        if let Some(queue) = self.queue(subscription) {
            let previous = std::mem::take(&mut *lock(&queue.session));
            previous.cancel();
            info!(subscription = %subscription, "memory_channel_subscription_closed");
        }
    }

    /// Every message accepted on `topic`, in publish order.
    pub fn published(&self, topic: &str) -> Vec<ChannelMessage> {
        lock(&self.inner.state)
            .published
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Ids acknowledged on `subscription`, in ack order.
    pub fn acked(&self, subscription: &str) -> Vec<MessageId> {
        self.with_ledger(subscription, |l| l.acked.clone())
            .unwrap_or_default()
    }

    /// Messages rejected without requeue on `subscription`.
    pub fn dead_letters(&self, subscription: &str) -> Vec<ChannelMessage> {
        self.with_ledger(subscription, |l| l.dead_letters.clone())
            .unwrap_or_default()
    }

    /// Messages queued or in flight on `subscription` that are not yet settled.
    pub fn outstanding(&self, subscription: &str) -> usize {
        self.with_ledger(subscription, |l| l.outstanding)
            .unwrap_or_default()
    }

    fn queue(&self, subscription: &str) -> Option<Arc<SubscriptionQueue>> {
        lock(&self.inner.state).queues.get(subscription).cloned()
    }

    fn with_ledger<R>(&self, subscription: &str, f: impl FnOnce(&Ledger) -> R) -> Option<R> {
        self.queue(subscription).map(|q| f(&lock(&q.ledger)))
    }

    fn ensure_available(&self) -> Result<(), ChannelError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(ChannelError::Unavailable("memory channel is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<MessageId, ChannelError> {
        self.ensure_available()?;

        let seq = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let message = ChannelMessage {
            id: format!("mem-{}", seq),
            data: payload,
            redelivered: false,
            delivery_attempt: Some(1),
        };

        let mut state = lock(&self.inner.state);
        let subscriptions = state
            .routes
            .get(topic)
            .cloned()
            .ok_or_else(|| ChannelError::UnknownTopic(topic.to_string()))?;

        for name in &subscriptions {
            if let Some(queue) = state.queues.get(name) {
                lock(&queue.ledger).outstanding += 1;
                let _ = queue.tx.send(message.clone());
            }
        }
        state
            .published
            .entry(topic.to_string())
            .or_default()
            .push(message.clone());

        Ok(message.id)
    }

    async fn subscribe(&self, subscription: &str) -> Result<Deliveries, ChannelError> {
        self.ensure_available()?;

        let queue = self
            .queue(subscription)
            .ok_or_else(|| ChannelError::UnknownSubscription(subscription.to_string()))?;

        let session = lock(&queue.session).clone();
        let deliveries = stream::unfold((queue, session), |(queue, session)| async move {
            let message = {
                let mut rx = queue.rx.lock().await;
                tokio::select! {
                    biased;
                    _ = session.cancelled() => None,
                    message = rx.recv() => message,
                }
            }?;
            let acker = MemoryAcker {
                queue: Arc::clone(&queue),
                message: Some(message.clone()),
            };
            Some((Ok(Delivery::new(message, Box::new(acker))), (queue, session)))
        });

        Ok(deliveries.boxed())
    }
}

struct MemoryAcker {
    queue: Arc<SubscriptionQueue>,
    /// Taken once the delivery is settled
    message: Option<ChannelMessage>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(mut self: Box<Self>) -> Result<(), ChannelError> {
        if let Some(message) = self.message.take() {
            let mut ledger = lock(&self.queue.ledger);
            ledger.outstanding = ledger.outstanding.saturating_sub(1);
            ledger.acked.push(message.id);
        }
        Ok(())
    }

    async fn nack(mut self: Box<Self>, requeue: bool) -> Result<(), ChannelError> {
        if let Some(message) = self.message.take() {
            if requeue {
                self.queue.redeliver(message);
            } else {
                let mut ledger = lock(&self.queue.ledger);
                ledger.outstanding = ledger.outstanding.saturating_sub(1);
                ledger.dead_letters.push(message);
            }
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(message) = self.message.take() {
            self.queue.redeliver(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next(deliveries: &mut Deliveries) -> Delivery {
        deliveries.next().await.unwrap().unwrap()
    }

    fn bound() -> MemoryChannel {
        let channel = MemoryChannel::new();
        channel.bind("signups", "mailer");
        channel
    }

    #[tokio::test]
    async fn test_publish_reaches_bound_subscription() {
        let channel = bound();
        let id = channel.publish("signups", b"payload".to_vec()).await.unwrap();

        let mut deliveries = channel.subscribe("mailer").await.unwrap();
        let delivery = next(&mut deliveries).await;

        assert_eq!(delivery.message.id, id);
        assert_eq!(delivery.message.data, b"payload");
        assert!(!delivery.message.redelivered);
        assert_eq!(delivery.message.delivery_attempt, Some(1));
        assert_eq!(channel.outstanding("mailer"), 1);
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_every_subscription() {
        let channel = bound();
        channel.bind("signups", "audit");

        channel.publish("signups", b"x".to_vec()).await.unwrap();

        assert_eq!(channel.outstanding("mailer"), 1);
        assert_eq!(channel.outstanding("audit"), 1);
        assert_eq!(channel.published("signups").len(), 1);
    }

    #[tokio::test]
    async fn test_ack_settles_message() {
        let channel = bound();
        let id = channel.publish("signups", b"x".to_vec()).await.unwrap();
        let mut deliveries = channel.subscribe("mailer").await.unwrap();

        let (_, acker) = next(&mut deliveries).await.into_parts();
        acker.ack().await.unwrap();

        assert_eq!(channel.acked("mailer"), vec![id]);
        assert_eq!(channel.outstanding("mailer"), 0);
    }

    #[tokio::test]
    async fn test_nack_requeue_redelivers_with_next_attempt() {
        let channel = bound();
        let id = channel.publish("signups", b"x".to_vec()).await.unwrap();
        let mut deliveries = channel.subscribe("mailer").await.unwrap();

        let (_, acker) = next(&mut deliveries).await.into_parts();
        acker.nack(true).await.unwrap();

        let again = next(&mut deliveries).await;
        assert_eq!(again.message.id, id);
        assert!(again.message.redelivered);
        assert_eq!(again.message.delivery_attempt, Some(2));
        assert!(channel.acked("mailer").is_empty());
    }

    #[tokio::test]
    async fn test_dropped_delivery_is_redelivered() {
        let channel = bound();
        channel.publish("signups", b"x".to_vec()).await.unwrap();
        let mut deliveries = channel.subscribe("mailer").await.unwrap();

        drop(next(&mut deliveries).await);

        let again = next(&mut deliveries).await;
        assert!(again.message.redelivered);
        assert_eq!(channel.outstanding("mailer"), 1);
    }

    #[tokio::test]
    async fn test_nack_without_requeue_dead_letters() {
        let channel = bound();
        channel.publish("signups", b"x".to_vec()).await.unwrap();
        let mut deliveries = channel.subscribe("mailer").await.unwrap();

        let (_, acker) = next(&mut deliveries).await.into_parts();
        acker.nack(false).await.unwrap();

        assert_eq!(channel.dead_letters("mailer").len(), 1);
        assert_eq!(channel.outstanding("mailer"), 0);
    }

    #[tokio::test]
    async fn test_close_subscription_ends_stream_and_keeps_messages() {
        let channel = bound();
        let mut deliveries = channel.subscribe("mailer").await.unwrap();

        channel.close_subscription("mailer");
        assert!(deliveries.next().await.is_none());

        let id = channel.publish("signups", b"x".to_vec()).await.unwrap();
        let mut reopened = channel.subscribe("mailer").await.unwrap();
        assert_eq!(next(&mut reopened).await.message.id, id);
    }

    #[tokio::test]
    async fn test_unknown_topic_and_subscription() {
        let channel = bound();

        assert!(matches!(
            channel.publish("nowhere", Vec::new()).await,
            Err(ChannelError::UnknownTopic(_))
        ));
        assert!(matches!(
            channel.subscribe("nobody").await,
            Err(ChannelError::UnknownSubscription(_))
        ));
    }

    #[tokio::test]
    async fn test_outage_rejects_publish() {
        let channel = bound();
        channel.set_available(false);

        assert!(matches!(
            channel.publish("signups", Vec::new()).await,
            Err(ChannelError::Unavailable(_))
        ));
        assert!(channel.published("signups").is_empty());

        channel.set_available(true);
        assert!(channel.publish("signups", Vec::new()).await.is_ok());
    }
}
