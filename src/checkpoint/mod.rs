//! Consumer checkpoints.
//!
//! A checkpoint is the durable bookmark of one consumer on one partition:
//! the last sequence number whose effects are known to be applied. It is
//! keyed by (consumer, stream, partition), read at the start of every cycle
//! and written strictly after the writes it covers, so any worker can pick a
//! partition up from it.
//!
//! Checkpoints only move forward. [`CheckpointStore::save`] refuses a
//! regression with [`CheckpointError::Regression`]; moving backwards is an
//! explicit operator action through [`CheckpointStore::reset`].

mod file;
mod in_memory;
mod store;

pub use file::FileCheckpointStore;
pub use in_memory::InMemoryCheckpointStore;
pub use store::CheckpointStore;

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stream::{PartitionId, SequenceNumber};

/// Identity of one checkpoint.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub consumer: String,
    pub stream_id: String,
    pub partition: PartitionId,
}

impl CheckpointKey {
    pub fn new(
        consumer: impl Into<String>,
        stream_id: impl Into<String>,
        partition: PartitionId,
    ) -> Self {
        Self {
            consumer: consumer.into(),
            stream_id: stream_id.into(),
            partition,
        }
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.consumer, self.stream_id, self.partition)
    }
}

/// A persisted checkpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerCheckpoint {
    pub consumer: String,
    pub stream_id: String,
    pub partition: PartitionId,
    /// Last processed sequence number; `None` after a reset to the trim horizon.
    pub sequence_number: Option<SequenceNumber>,
    pub updated_at: SystemTime,
}

impl ConsumerCheckpoint {
    pub fn new(key: &CheckpointKey, sequence_number: Option<SequenceNumber>) -> Self {
        Self {
            consumer: key.consumer.clone(),
            stream_id: key.stream_id.clone(),
            partition: key.partition,
            sequence_number,
            updated_at: SystemTime::now(),
        }
    }

    pub fn key(&self) -> CheckpointKey {
        CheckpointKey::new(self.consumer.clone(), self.stream_id.clone(), self.partition)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    /// A save would move the checkpoint backwards.
    #[error("checkpoint {key} would regress from {stored} to {attempted}")]
    Regression {
        key: CheckpointKey,
        stored: SequenceNumber,
        attempted: SequenceNumber,
    },
    #[error("checkpoint storage error: {0}")]
    Storage(String),
    #[error("checkpoint serialization error: {0}")]
    Serde(String),
}

impl CheckpointError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CheckpointError::Storage(_))
    }
}

/// Shared forward-only rule for every store.
fn check_forward(
    key: &CheckpointKey,
    stored: Option<&ConsumerCheckpoint>,
    attempted: SequenceNumber,
) -> Result<(), CheckpointError> {
    match stored.and_then(|c| c.sequence_number) {
        Some(stored) if attempted < stored => Err(CheckpointError::Regression {
            key: key.clone(),
            stored,
            attempted,
        }),
        _ => Ok(()),
    }
}
