//! Signup Relay - asynchronous signup notification pipeline.
//!
//! This library provides shared modules for the three binaries:
//! - `signup-relay`: HTTP intake and consumer loop in one process
//! - `relay-web`: HTTP intake only
//! - `relay-consumer`: consumer loop only
//!
//! ## Architecture
//!
//! ```text
//! POST /signup → SignupPublisher → channel topic → subscription → Consumer → Notifier → ack
//! ```
//!
//! The HTTP caller gets its answer once the channel has accepted the signup.
//! The consumer acknowledges a message only after its notification succeeded,
//! so delivery is at-least-once and a signup can be notified more than once.

pub mod config;
pub mod consumer;
pub mod notify;
pub mod publisher;
pub mod queue;
pub mod shutdown;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use consumer::{
    Consumer, ConsumerError, ConsumerSettings, ConsumerStatus, ConsumerSwitch, Outcome,
};
pub use notify::{notifier_from_config, Notifier, NotifyError};
pub use publisher::{PublishError, SignupPublisher};
pub use queue::{channel_from_config, Channel, ChannelError, ChannelMessage, SignupRecord};
pub use web::AppState;
