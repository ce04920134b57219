//! Message types carried by the signup channel.
//!
//! This module defines:
//! - [`SignupRecord`]: the unit of work, as submitted to `POST /signup`
//! - [`ChannelMessage`]: the transport envelope around one encoded record

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transport-assigned message identifier.
pub type MessageId = String;

/// A signup submitted over HTTP and relayed through the channel.
///
/// Records are never mutated by the pipeline; they are only encoded and
/// decoded. The password is treated as opaque and is redacted from `Debug`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignupRecord {
    /// Caller-assigned identifier (zero when the caller has none)
    #[serde(default)]
    pub id: i64,
    pub email: String,
    pub username: String,
    pub password: String,
}

impl SignupRecord {
    pub fn new(
        id: i64,
        email: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            id,
            email: email.into(),
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for SignupRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignupRecord")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One delivered message: an encoded [`SignupRecord`] plus transport metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub id: MessageId,
    /// Encoded record, see [`crate::queue::codec`]
    pub data: Vec<u8>,
    /// Whether the transport has delivered this message before
    pub redelivered: bool,
    /// 1-based delivery attempt, when the transport reports one
    pub delivery_attempt: Option<u32>,
}
