//! Partitioned event streams.
//!
//! A stream is an append-only log split into partitions. Each partition is
//! ordered by [`SequenceNumber`]; there is no ordering across partitions.
//! Events are evicted once they fall out of the retention window, whether or
//! not anyone consumed them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐  put_record   ┌──────────────────────────────┐
//! │  Service tier        │ ────────────▶ │  EventStream                 │
//! │  (StreamProducer)    │               │  partition 0: 1 2 3 4 ...    │
//! └──────────────────────┘               │  partition 1: 1 2 ...        │
//!                                        └──────────────────────────────┘
//!                                                     │ get_records
//!                                                     ▼
//!                                        ┌──────────────────────────────┐
//!                                        │  StreamConsumption (poll)    │
//!                                        └──────────────────────────────┘
//! ```
//!
//! [`InMemoryStream`] is included; managed services (Kinesis, Kafka, ...)
//! plug in by implementing [`EventStream`] and [`StreamProducer`].

mod in_memory;

pub use in_memory::InMemoryStream;

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of one partition (shard) of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of an event inside its partition. Strictly increasing per
/// partition, comparable, never reused.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    pub fn value(self) -> u64 {
        self.0
    }

    /// The following sequence number; `None` past `u64::MAX`.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(SequenceNumber)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A record read from a stream partition. Immutable once appended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub stream_id: String,
    pub partition: PartitionId,
    /// Key the producer used to route the record to its partition.
    pub partition_key: String,
    pub sequence_number: SequenceNumber,
    /// Encoded payload (see [`crate::codec::PayloadFormat`]).
    pub payload: Vec<u8>,
    pub produced_at: SystemTime,
}

impl Event {
    /// Get the payload as a string (if valid UTF-8).
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Production time in milliseconds since the Unix epoch.
    pub fn produced_at_millis(&self) -> u64 {
        self.produced_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Stable identity of this event: `stream/partition/sequence`.
    pub fn event_id(&self) -> String {
        format!(
            "{}/{}/{}",
            self.stream_id, self.partition, self.sequence_number
        )
    }
}

/// Where a read starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "sequence", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StartingPosition {
    /// The oldest record still retained.
    TrimHorizon,
    /// The first record strictly after the given sequence number.
    AfterSequence(SequenceNumber),
}

impl StartingPosition {
    /// Resume after a checkpoint, or from the oldest record on a cold start.
    pub fn from_checkpoint(checkpoint: Option<SequenceNumber>) -> Self {
        match checkpoint {
            Some(sequence) => StartingPosition::AfterSequence(sequence),
            None => StartingPosition::TrimHorizon,
        }
    }

    /// The last sequence number this position has already moved past.
    pub fn after(&self) -> Option<SequenceNumber> {
        match self {
            StartingPosition::TrimHorizon => None,
            StartingPosition::AfterSequence(sequence) => Some(*sequence),
        }
    }
}

impl fmt::Display for StartingPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartingPosition::TrimHorizon => write!(f, "TRIM_HORIZON"),
            StartingPosition::AfterSequence(sequence) => write!(f, "AFTER_SEQUENCE({})", sequence),
        }
    }
}

/// One page returned by [`EventStream::get_records`].
#[derive(Clone, Debug)]
pub struct RecordBatch {
    /// Records in sequence-number order.
    pub events: Vec<Event>,
    /// Position to pass to the next `get_records` call.
    pub next_position: StartingPosition,
    /// True when the page reached the end of the retained log.
    pub at_tip: bool,
}

/// Error type for stream reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The stream backend could not be reached.
    #[error("stream unavailable: {0}")]
    Unavailable(String),
    /// The read did not complete within its timeout.
    #[error("stream call timed out after {0:?}")]
    Timeout(Duration),
    #[error("unknown stream: {0}")]
    UnknownStream(String),
    #[error("unknown partition {partition} on stream {stream_id}")]
    UnknownPartition {
        stream_id: String,
        partition: PartitionId,
    },
    /// The requested position has already been evicted by retention.
    #[error(
        "records after {requested} on partition {partition} have expired; oldest retained is {oldest}"
    )]
    RetentionExceeded {
        partition: PartitionId,
        requested: SequenceNumber,
        oldest: SequenceNumber,
    },
    /// The requested position lies beyond anything the partition produced.
    #[error("position {requested} on partition {partition} is beyond the latest record {latest}")]
    PositionBeyondTip {
        partition: PartitionId,
        requested: SequenceNumber,
        latest: SequenceNumber,
    },
}

impl StreamError {
    /// Whether retrying the same read may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StreamError::Unavailable(_) | StreamError::Timeout(_))
    }
}

/// Read side of a partitioned stream.
pub trait EventStream: Send + Sync {
    /// List the partitions of a stream.
    fn list_shards(&self, stream_id: &str) -> Result<Vec<PartitionId>, StreamError>;

    /// Read up to `limit` records starting at `position`.
    ///
    /// Blocks for at most `timeout` waiting for records when none are
    /// available yet; an empty page is a valid answer.
    fn get_records(
        &self,
        stream_id: &str,
        partition: PartitionId,
        position: &StartingPosition,
        limit: usize,
        timeout: Duration,
    ) -> Result<RecordBatch, StreamError>;
}

/// Write side of a partitioned stream, used by the service tier.
pub trait StreamProducer: Send + Sync {
    /// Append a record, routing it to a partition by `partition_key`.
    fn put_record(
        &self,
        stream_id: &str,
        partition_key: &str,
        payload: Vec<u8>,
    ) -> Result<(PartitionId, SequenceNumber), StreamError>;
}
