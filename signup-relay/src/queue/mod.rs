//! Queue module for channel operations.
//!
//! This module provides:
//! - The signup record and channel message types
//! - The record codec
//! - The [`Channel`] abstraction with RabbitMQ and in-memory transports
//!
//! ## Architecture
//!
//! ```text
//! Web Server → <project>.<topic> exchange → <project>.<subscription> queue → Consumer
//! ```

pub mod amqp;
pub mod channel;
pub mod codec;
pub mod memory;
pub mod types;

pub use amqp::{AmqpChannel, Topology};
pub use channel::{Acknowledger, Channel, ChannelError, Deliveries, Delivery};
pub use codec::CodecError;
pub use memory::MemoryChannel;
pub use types::{ChannelMessage, MessageId, SignupRecord};

use std::sync::Arc;

use crate::config::{ChannelBackend, Config};

/// Build the channel selected by `CHANNEL_BACKEND`.
pub fn channel_from_config(config: &Config) -> Arc<dyn Channel> {
    match config.channel_backend {
        ChannelBackend::Amqp => Arc::new(AmqpChannel::from_config(config)),
        ChannelBackend::Memory => Arc::new(MemoryChannel::from_config(config)),
    }
}
