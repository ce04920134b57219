//! RabbitMQ channel using lapin.
//!
//! Topics map to durable fanout exchanges and subscriptions to durable queues
//! bound to them, both namespaced by the project id (`<project>.<name>`).
//! Both sides declare the whole topology, so a signup published before any
//! consumer has started is retained by its subscription queue.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::channel::{Acknowledger, Channel, ChannelError, Deliveries, Delivery};
use super::types::{ChannelMessage, MessageId};
use crate::Config;

/// Header set by RabbitMQ quorum queues with the number of earlier deliveries.
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// Exchange/queue layout declared on connect.
#[derive(Debug, Clone)]
pub struct Topology {
    pub namespace: String,
    /// (topic, subscription) pairs
    pub routes: Vec<(String, String)>,
    pub dead_letter_topic: Option<String>,
}

impl Topology {
    pub fn from_config(config: &Config) -> Self {
        Self {
            namespace: config.project_id.clone(),
            routes: vec![(config.topic_id.clone(), config.subscription_id.clone())],
            dead_letter_topic: config.dead_letter_topic_id.clone(),
        }
    }

    /// Broker-side name for a topic or subscription.
    pub fn qualify(&self, name: &str) -> String {
        format!("{}.{}", self.namespace, name)
    }
}

/// AMQP channel with lazy connection management.
///
/// The publishing side keeps one persistent connection and confirm-mode
/// channel, reconnecting when the channel is found closed. Each subscription
/// gets its own channel with a prefetch limit.
#[derive(Clone)]
pub struct AmqpChannel {
    inner: Arc<AmqpInner>,
}

struct AmqpInner {
    url: String,
    topology: Topology,
    prefetch: u16,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<lapin::Channel>>,
    consumers: Mutex<Vec<lapin::Channel>>,
}

impl AmqpChannel {
    pub fn new(url: String, topology: Topology, prefetch: u16) -> Self {
        Self {
            inner: Arc::new(AmqpInner {
                url,
                topology,
                prefetch,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
                consumers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let prefetch = u16::try_from(config.worker_concurrency).unwrap_or(u16::MAX);
        Self::new(config.cloudamqp_url.clone(), Topology::from_config(config), prefetch)
    }

    /// Ensure we have a valid connection and publishing channel.
    async fn ensure_connected(&self) -> Result<lapin::Channel, ChannelError> {
        {
            let channel = self.inner.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Double-check after acquiring write lock
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        info!("rabbitmq_connecting");

        let conn = Connection::connect(&self.inner.url, ConnectionProperties::default())
            .await
            .map_err(|e| ChannelError::Unavailable(e.to_string()))?;

        info!("rabbitmq_connected");

        let ch = conn.create_channel().await?;
        ch.confirm_select(ConfirmSelectOptions::default()).await?;
        self.declare_topology(&ch).await?;

        *connection = Some(conn);
        *channel = Some(ch.clone());

        Ok(ch)
    }

    /// Declare exchanges, queues and bindings (idempotent).
    async fn declare_topology(&self, ch: &lapin::Channel) -> Result<(), ChannelError> {
        let topology = &self.inner.topology;
        let mut queue_args = FieldTable::default();

        if let Some(dead_letter) = &topology.dead_letter_topic {
            let name = topology.qualify(dead_letter);
            ch.exchange_declare(&name, ExchangeKind::Fanout, durable_exchange(), FieldTable::default())
                .await?;
            ch.queue_declare(&name, durable_queue(), FieldTable::default())
                .await?;
            ch.queue_bind(&name, &name, "", QueueBindOptions::default(), FieldTable::default())
                .await?;
            queue_args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(name.clone().into()),
            );
            info!(exchange = %name, "rabbitmq_dead_letter_declared");
        }

        for (topic, subscription) in &topology.routes {
            let exchange = topology.qualify(topic);
            let queue = topology.qualify(subscription);

            ch.exchange_declare(&exchange, ExchangeKind::Fanout, durable_exchange(), FieldTable::default())
                .await?;
            ch.queue_declare(&queue, durable_queue(), queue_args.clone())
                .await?;
            ch.queue_bind(&queue, &exchange, "", QueueBindOptions::default(), FieldTable::default())
                .await?;

            info!(exchange = %exchange, queue = %queue, "rabbitmq_topology_declared");
        }

        Ok(())
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<MessageId, ChannelError> {
        let channel = self.ensure_connected().await?;
        let exchange = self.inner.topology.qualify(topic);
        let message_id = Uuid::new_v4().to_string();

        let confirmation = channel
            .basic_publish(
                &exchange,
                "",
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into())
                    .with_message_id(message_id.clone().into()),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            warn!(exchange = %exchange, message_id = %message_id, "rabbitmq_publish_nacked");
            return Err(ChannelError::Rejected {
                topic: topic.to_string(),
            });
        }

        info!(
            exchange = %exchange,
            message_id = %message_id,
            body_length = payload.len(),
            "rabbitmq_published"
        );

        Ok(message_id)
    }

    async fn subscribe(&self, subscription: &str) -> Result<Deliveries, ChannelError> {
        self.ensure_connected().await?;

        let ch = {
            let connection = self.inner.connection.read().await;
            let conn = connection
                .as_ref()
                .ok_or_else(|| ChannelError::Unavailable("connection closed".to_string()))?;
            conn.create_channel().await?
        };

        ch.basic_qos(self.inner.prefetch, BasicQosOptions::default())
            .await?;

        let queue = self.inner.topology.qualify(subscription);
        let consumer_tag = format!("signup-relay-{}", Uuid::new_v4());
        let consumer = ch
            .basic_consume(
                &queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            queue = %queue,
            prefetch_count = self.inner.prefetch,
            "rabbitmq_consumer_started"
        );

        // Keep the consuming channel alive for as long as the client is, and
        // drop the ones a lost subscription left behind.
        let mut consumers = self.inner.consumers.lock().await;
        let pruned = retain_connected(&mut *consumers, |c| c.status().connected());
        if pruned > 0 {
            debug!(pruned, "rabbitmq_consumer_channels_pruned");
        }
        consumers.push(ch);
        drop(consumers);

        let deliveries = consumer.map(|result| result.map(into_delivery).map_err(ChannelError::from));
        Ok(deliveries.boxed())
    }

    /// Close the connection gracefully.
    async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        for ch in self.inner.consumers.lock().await.drain(..) {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_consumer_channel_close_error");
            }
        }

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_closed");
    }
}

fn durable_exchange() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

fn durable_queue() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let lapin::message::Delivery {
        delivery_tag,
        redelivered,
        properties,
        data,
        acker,
        ..
    } = delivery;

    let id = properties
        .message_id()
        .as_ref()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("tag-{}", delivery_tag));

    let delivery_attempt = match properties.headers().as_ref().and_then(delivery_count) {
        Some(previous) => Some(previous.saturating_add(1)),
        None if !redelivered => Some(1),
        None => None,
    };

    let message = ChannelMessage {
        id,
        data,
        redelivered,
        delivery_attempt,
    };

    Delivery::new(message, Box::new(AmqpAcker { acker }))
}

fn delivery_count(headers: &FieldTable) -> Option<u32> {
    let (_, value) = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)?;

    match value {
        AMQPValue::ShortShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::ShortUInt(n) => Some(u32::from(*n)),
        AMQPValue::LongUInt(n) => Some(*n),
        AMQPValue::ShortShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::ShortInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
        AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
        _ => None,
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<(), ChannelError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| ChannelError::Ack(e.to_string()))
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<(), ChannelError> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| ChannelError::Ack(e.to_string()))
    }
}

/// Keep only the channels `is_connected` accepts; returns how many were dropped.
fn retain_connected<T>(channels: &mut Vec<T>, is_connected: impl Fn(&T) -> bool) -> usize {
    let before = channels.len();
    channels.retain(|c| is_connected(c));
    before - channels.len()
}
