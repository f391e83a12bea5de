//! Distributed cache fan-out.
//!
//! The Cache-Update Consumer does not write cache entries itself: it
//! publishes a versioned [`CacheMessage`] on a channel and every cache node
//! subscribed to that channel applies it, keeping the highest version per
//! key.
//!
//! ```text
//!                                   ┌──▶ CacheNode "a" (last-writer-wins)
//!  CacheUpdateHandler ──publish──▶ channel
//!                                   └──▶ CacheNode "b" (last-writer-wins)
//! ```
//!
//! Publishing is fire-and-forget. A successful publish means every node
//! listening at that moment received the message, not that it was applied
//! before the next read; readers must tolerate a short propagation delay.

mod handler;
mod node;
mod pubsub;

pub use handler::{cache_key, CacheUpdateHandler};
pub use node::{
    ApplyOutcome, CacheEntry, CacheNode, CacheNodeListener, ListenerStats, DEFAULT_MAX_ENTRIES,
    DEFAULT_TTL,
};
pub use pubsub::InMemoryPubSub;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::MalformedEvent;
use crate::error::SinkError;

/// Channel name the original deployment published cache updates on.
pub const DEFAULT_CHANNEL: &str = "channel1";

/// Update carried on the cache channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMessage {
    pub key: String,
    pub value: serde_json::Value,
    /// Nodes keep the highest `(version, sequence)` seen per key.
    pub version: u64,
    /// Source sequence number; orders updates that share a version.
    #[serde(default)]
    pub sequence: u64,
}

impl CacheMessage {
    pub fn new(key: impl Into<String>, value: serde_json::Value, version: u64) -> Self {
        Self {
            key: key.into(),
            value,
            version,
            sequence: 0,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Ordering key used for last-writer-wins.
    pub fn order(&self) -> (u64, u64) {
        (self.version, self.sequence)
    }

    pub fn to_json(&self) -> Result<String, SinkError> {
        serde_json::to_string(self).map_err(|e| SinkError::Rejected(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, MalformedEvent> {
        serde_json::from_str(raw)
            .map_err(|e| MalformedEvent::new(format!("invalid cache message: {}", e)))
    }
}

/// Publish side of the cache channel.
pub trait CachePublisher: Send + Sync {
    /// Publish a message. Returns how many subscribers received it.
    fn publish(
        &self,
        channel: &str,
        message: &CacheMessage,
        timeout: Duration,
    ) -> Result<usize, SinkError>;
}

impl<T: CachePublisher + ?Sized> CachePublisher for Arc<T> {
    fn publish(
        &self,
        channel: &str,
        message: &CacheMessage,
        timeout: Duration,
    ) -> Result<usize, SinkError> {
        (**self).publish(channel, message, timeout)
    }
}
