//! Signup consumer loop.
//!
//! This module receives signup messages from the subscription, spawns one
//! bounded task per delivery, and settles each delivery only after its
//! notification has been attempted:
//!
//! ```text
//! Received → Decoding → Notifying → Acknowledged
//!               │           ├─ transient ─→ Redeliverable (nack + requeue)
//!               │           └─ permanent ─┐
//!               └─ undecodable ───────────┴→ Discarded (ack) | DeadLettered (nack, no requeue)
//! ```
//!
//! Delivery is at-least-once. There is no deduplication: if an ack is lost or
//! races with a redelivery, the same signup is notified more than once.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::notify::Notifier;
use crate::queue::{codec, Acknowledger, Channel, ChannelError, ChannelMessage, Delivery};

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("failed to subscribe to {subscription}: {source}")]
    Subscribe {
        subscription: String,
        #[source]
        source: ChannelError,
    },

    #[error("subscription {0} was closed by the transport")]
    StreamClosed(String),
}

/// What happens to a message that can never be processed: undecodable, or
/// rejected permanently by the notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoisonPolicy {
    /// Acknowledge it so it is not redelivered forever.
    Acknowledge,
    /// Reject it without requeue so the broker routes it to the dead-letter topic.
    DeadLetter,
}

/// How a single delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acknowledged,
    /// Notification failed, or the ack did not reach the transport.
    Redeliverable,
    /// Unprocessable and acknowledged.
    Discarded,
    /// Unprocessable and rejected to the dead-letter topic.
    DeadLettered,
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub subscription: String,
    /// Maximum deliveries in flight
    pub concurrency: usize,
    /// Hold time before a failed delivery is requeued
    pub redelivery_delay: Duration,
    /// How long shutdown waits for in-flight deliveries
    pub shutdown_grace: Duration,
    pub poison: PoisonPolicy,
}

impl ConsumerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            subscription: config.subscription_id.clone(),
            concurrency: config.worker_concurrency.max(1),
            redelivery_delay: config.redelivery_delay(),
            shutdown_grace: config.shutdown_grace(),
            poison: if config.dead_letter_topic_id.is_some() {
                PoisonPolicy::DeadLetter
            } else {
                PoisonPolicy::Acknowledge
            },
        }
    }
}

/// Receives signups and triggers one notification per message.
#[derive(Clone)]
pub struct Consumer {
    channel: Arc<dyn Channel>,
    notifier: Arc<dyn Notifier>,
    settings: Arc<ConsumerSettings>,
}

impl Consumer {
    pub fn new(
        channel: Arc<dyn Channel>,
        notifier: Arc<dyn Notifier>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            channel,
            notifier,
            settings: Arc::new(settings),
        }
    }

    /// Run the consumer loop until `cancel` fires.
    ///
    /// This function:
    /// 1. Subscribes to the configured subscription
    /// 2. Waits for a free concurrency permit, then for the next delivery
    /// 3. Spawns a task that owns the delivery through ack/nack
    /// 4. On cancellation stops receiving and waits for in-flight tasks up to
    ///    the shutdown grace period
    ///
    /// Returns `Ok` after cancellation, or an error if the subscription could
    /// not be opened or was closed by the transport.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ConsumerError> {
        let subscription = self.settings.subscription.clone();

        let mut deliveries = self.channel.subscribe(&subscription).await.map_err(|source| {
            ConsumerError::Subscribe {
                subscription: subscription.clone(),
                source,
            }
        })?;

        let permits = Arc::new(Semaphore::new(self.settings.concurrency));
        let tracker = TaskTracker::new();

        info!(
            subscription = %subscription,
            concurrency = self.settings.concurrency,
            poison_policy = ?self.settings.poison,
            "consumer_ready"
        );

        let result = loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                delivery = deliveries.next() => match delivery {
                    Some(Ok(delivery)) => {
                        info!(
                            subscription = %subscription,
                            message_id = %delivery.message.id,
                            redelivered = delivery.message.redelivered,
                            delivery_attempt = ?delivery.message.delivery_attempt,
                            "consumer_message_received"
                        );

                        let consumer = self.clone();
                        tracker.spawn(async move {
                            consumer.process(delivery).await;
                            drop(permit);
                        });
                    }
                    Some(Err(e)) => {
                        error!(subscription = %subscription, error = %e, "consumer_delivery_error");
                    }
                    None => {
                        warn!(subscription = %subscription, "consumer_stream_closed");
                        break Err(ConsumerError::StreamClosed(subscription.clone()));
                    }
                },
            }
        };

        info!(subscription = %subscription, in_flight = tracker.len(), "consumer_stopping");
        drop(deliveries);
        self.drain(tracker).await;

        result
    }

    /// Wait for in-flight deliveries, giving up after the grace period. Tasks
    /// still running afterwards never settle their delivery, so the transport
    /// redelivers those messages.
    async fn drain(&self, tracker: TaskTracker) {
        tracker.close();
        let grace = self.settings.shutdown_grace;

        match tokio::time::timeout(grace, tracker.wait()).await {
            Ok(()) => info!("consumer_shutdown_complete"),
            Err(_) => warn!(
                grace_ms = grace.as_millis() as u64,
                in_flight = tracker.len(),
                "consumer_shutdown_grace_exceeded"
            ),
        }
    }

    /// Take one delivery through decode, notify and settle.
    ///
    /// Errors are contained here: every failure is logged and turned into an
    /// [`Outcome`], nothing propagates to the loop.
    pub async fn process(&self, delivery: Delivery) -> Outcome {
        let (message, acker) = delivery.into_parts();

        let record = match codec::decode(&message.data) {
            Ok(record) => record,
            Err(e) => {
                error!(
                    message_id = %message.id,
                    body_length = message.data.len(),
                    error = %e,
                    "consumer_message_undecodable"
                );

                return self.settle_unprocessable(&message, acker).await;
            }
        };

        debug!(
            message_id = %message.id,
            signup_id = record.id,
            username = %record.username,
            "consumer_notifying"
        );

        match self.notifier.notify(&record).await {
            Ok(()) => match acker.ack().await {
                Ok(()) => {
                    info!(
                        message_id = %message.id,
                        signup_id = record.id,
                        delivery_attempt = ?message.delivery_attempt,
                        "consumer_message_acked"
                    );
                    Outcome::Acknowledged
                }
                Err(e) => {
                    error!(message_id = %message.id, error = %e, "consumer_ack_failed");
                    Outcome::Redeliverable
                }
            },
            Err(e) if e.is_permanent() => {
                error!(
                    message_id = %message.id,
                    signup_id = record.id,
                    error = %e,
                    "consumer_notify_rejected"
                );
                self.settle_unprocessable(&message, acker).await
            }
            Err(e) => {
                warn!(
                    message_id = %message.id,
                    signup_id = record.id,
                    delivery_attempt = ?message.delivery_attempt,
                    redelivery_delay_ms = self.settings.redelivery_delay.as_millis() as u64,
                    error = %e,
                    "consumer_notify_failed"
                );

                if !self.settings.redelivery_delay.is_zero() {
                    tokio::time::sleep(self.settings.redelivery_delay).await;
                }

                if let Err(e) = acker.nack(true).await {
                    error!(message_id = %message.id, error = %e, "consumer_nack_failed");
                }
                Outcome::Redeliverable
            }
        }
    }

    /// Settle a message that no redelivery can fix, per the poison policy.
    async fn settle_unprocessable(
        &self,
        message: &ChannelMessage,
        acker: Box<dyn Acknowledger>,
    ) -> Outcome {
        match self.settings.poison {
            PoisonPolicy::Acknowledge => match acker.ack().await {
                Ok(()) => Outcome::Discarded,
                Err(e) => {
                    error!(message_id = %message.id, error = %e, "consumer_ack_failed");
                    Outcome::Redeliverable
                }
            },
            PoisonPolicy::DeadLetter => match acker.nack(false).await {
                Ok(()) => {
                    warn!(message_id = %message.id, "consumer_message_dead_lettered");
                    Outcome::DeadLettered
                }
                Err(e) => {
                    error!(message_id = %message.id, error = %e, "consumer_nack_failed");
                    Outcome::Redeliverable
                }
            },
        }
    }
}

/// Lifecycle of the loop behind a [`ConsumerSwitch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerStatus {
    /// Never started
    Idle = 0,
    Running = 1,
    /// Exited with an error, for example a lost subscription
    Failed = 2,
    /// Cancelled by shutdown
    Stopped = 3,
}

impl ConsumerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConsumerStatus::Idle => "idle",
            ConsumerStatus::Running => "running",
            ConsumerStatus::Failed => "failed",
            ConsumerStatus::Stopped => "stopped",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConsumerStatus::Running,
            2 => ConsumerStatus::Failed,
            3 => ConsumerStatus::Stopped,
            _ => ConsumerStatus::Idle,
        }
    }
}

/// Starts the consumer loop on demand and at most once at a time.
///
/// Backs both boot-time startup and the `/notification` trigger. If the loop
/// exits with an error it reports [`ConsumerStatus::Failed`] and can be
/// started again.
pub struct ConsumerSwitch {
    consumer: Consumer,
    cancel: CancellationToken,
    tracker: TaskTracker,
    status: Arc<AtomicU8>,
}

impl ConsumerSwitch {
    pub fn new(consumer: Consumer, cancel: CancellationToken) -> Self {
        Self {
            consumer,
            cancel,
            tracker: TaskTracker::new(),
            status: Arc::new(AtomicU8::new(ConsumerStatus::Idle as u8)),
        }
    }

    /// Start the loop unless it is already running. Returns `true` if this
    /// call started it.
    pub fn start(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let previous = self
            .status
            .swap(ConsumerStatus::Running as u8, Ordering::SeqCst);
        if ConsumerStatus::from_u8(previous) == ConsumerStatus::Running {
            return false;
        }

        let consumer = self.consumer.clone();
        let cancel = self.cancel.clone();
        let status = Arc::clone(&self.status);

        self.tracker.spawn(async move {
            let next = match consumer.run(cancel).await {
                Ok(()) => {
                    info!("consumer_stopped");
                    ConsumerStatus::Stopped
                }
                Err(e) => {
                    error!(error = %e, "consumer_failed");
                    ConsumerStatus::Failed
                }
            };
            status.store(next as u8, Ordering::SeqCst);
        });

        true
    }

    pub fn status(&self) -> ConsumerStatus {
        ConsumerStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.status() == ConsumerStatus::Running
    }

    /// Cancel the loop and wait for it to drain.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        if self.status() == ConsumerStatus::Idle {
            self.status
                .store(ConsumerStatus::Stopped as u8, Ordering::SeqCst);
        }
    }
}
