//! Service-tier producer.
//!
//! The service tier accepts tracking requests and emits each one twice: as a
//! binary entity mutation on the event stream (for the durable store) and
//! as a JSON mutation on the cache-invalidation stream (for the cache
//! channel). Both copies carry the same version and are keyed by the entity
//! key, so all updates to one entity land on one partition, in order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::cache::cache_key;
use crate::codec::{encode_mutation, CodecError, EntityMutation, PayloadFormat};
use crate::stream::{PartitionId, SequenceNumber, StreamError, StreamProducer};

/// Tracking request accepted by the service tier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingMessage {
    pub program_id: String,
    pub checksum: String,
    pub customer_id: i64,
    pub user_agent: String,
    pub program_name: String,
    pub customer_name: String,
    pub is_valid: bool,
    pub message_id: String,
}

impl TrackingMessage {
    /// The entity mutation this message produces: keyed by
    /// (`program_id`, `customer_id`), the other fields as attributes.
    pub fn to_mutation(&self, version: u64) -> EntityMutation {
        EntityMutation::new(self.program_id.clone(), self.customer_id)
            .with_attribute("checksum", self.checksum.clone())
            .with_attribute("userAgent", self.user_agent.clone())
            .with_attribute("programName", self.program_name.clone())
            .with_attribute("customerName", self.customer_name.clone())
            .with_attribute("isValid", self.is_valid.to_string())
            .with_attribute("messageId", self.message_id.clone())
            .with_version(version)
    }
}

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Where the two copies of one message landed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Produced {
    pub version: u64,
    pub event: (PartitionId, SequenceNumber),
    pub cache: (PartitionId, SequenceNumber),
}

/// Emits mutations onto the event stream and the cache-invalidation stream.
pub struct TrackingProducer {
    stream: Arc<dyn StreamProducer>,
    event_stream: String,
    cache_stream: String,
    event_format: PayloadFormat,
    cache_format: PayloadFormat,
    last_version: AtomicU64,
}

impl TrackingProducer {
    pub fn new(
        stream: Arc<dyn StreamProducer>,
        event_stream: impl Into<String>,
        cache_stream: impl Into<String>,
    ) -> Self {
        Self {
            stream,
            event_stream: event_stream.into(),
            cache_stream: cache_stream.into(),
            event_format: PayloadFormat::Bitcode,
            cache_format: PayloadFormat::Json,
            last_version: AtomicU64::new(0),
        }
    }

    pub fn with_event_format(mut self, format: PayloadFormat) -> Self {
        self.event_format = format;
        self
    }

    pub fn with_cache_format(mut self, format: PayloadFormat) -> Self {
        self.cache_format = format;
        self
    }

    /// Next version: wall-clock milliseconds, bumped when needed so versions
    /// from this producer strictly increase.
    pub fn next_version(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let previous = self
            .last_version
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }

    pub fn send(&self, message: &TrackingMessage) -> Result<Produced, ProducerError> {
        self.send_mutation(message.to_mutation(self.next_version()))
    }

    /// Emit a mutation onto both streams. Mutations without a version are
    /// stamped with [`next_version`](Self::next_version).
    pub fn send_mutation(&self, mut mutation: EntityMutation) -> Result<Produced, ProducerError> {
        let version = match mutation.version {
            Some(version) => version,
            None => {
                let version = self.next_version();
                mutation.version = Some(version);
                version
            }
        };
        let partition_key = cache_key(&mutation.id, mutation.customer_id);

        let event = self.stream.put_record(
            &self.event_stream,
            &partition_key,
            encode_mutation(&mutation, self.event_format)?,
        )?;
        let cache = self.stream.put_record(
            &self.cache_stream,
            &partition_key,
            encode_mutation(&mutation, self.cache_format)?,
        )?;

        debug!(
            key = %partition_key,
            version,
            event_partition = %event.0,
            event_sequence = %event.1,
            "mutation produced"
        );
        Ok(Produced {
            version,
            event,
            cache,
        })
    }
}
