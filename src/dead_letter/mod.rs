//! Dead-letter sink.
//!
//! Events that can never be applied (undecodable payloads, writes the
//! backend rejects, or events an operator chose to skip) are preserved here
//! with the reason they failed, so the partition can move past them.
//!
//! Sinks are deduplicated by event identity: a redelivered poison event is
//! recorded once no matter how often the consumer meets it.

mod file;
mod in_memory;

pub use file::JsonLinesDeadLetterSink;
pub use in_memory::InMemoryDeadLetterSink;

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::error::SinkError;
use crate::stream::{Event, PartitionId, SequenceNumber};

/// One unprocessable event and why it failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub consumer: String,
    pub stream_id: String,
    pub partition: PartitionId,
    pub sequence_number: SequenceNumber,
    pub partition_key: String,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    pub reason: String,
    pub failed_at: SystemTime,
}

impl DeadLetter {
    pub fn from_event(consumer: &str, event: &Event, reason: impl Into<String>) -> Self {
        Self {
            consumer: consumer.to_string(),
            stream_id: event.stream_id.clone(),
            partition: event.partition,
            sequence_number: event.sequence_number,
            partition_key: event.partition_key.clone(),
            payload: event.payload.clone(),
            reason: reason.into(),
            failed_at: SystemTime::now(),
        }
    }

    /// Dedup identity: `consumer/stream/partition/sequence`.
    pub fn event_id(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.consumer, self.stream_id, self.partition, self.sequence_number
        )
    }
}

/// Append-only store of dead letters.
pub trait DeadLetterSink: Send + Sync {
    /// Record a dead letter. Returns `false` when this event was already
    /// recorded for the same consumer.
    fn send(&self, letter: DeadLetter) -> Result<bool, SinkError>;

    /// Every recorded dead letter, oldest first.
    fn list(&self) -> Result<Vec<DeadLetter>, SinkError>;

    /// Dead letters of one consumer partition, oldest first.
    fn list_partition(
        &self,
        consumer: &str,
        partition: PartitionId,
    ) -> Result<Vec<DeadLetter>, SinkError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|l| l.consumer == consumer && l.partition == partition)
            .collect())
    }

    /// Remove and return the dead letters of one consumer partition, once an
    /// operator has dealt with them.
    fn drain(&self, consumer: &str, partition: PartitionId) -> Result<Vec<DeadLetter>, SinkError>;
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
