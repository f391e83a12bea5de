//! Shared stream-consumption framework.
//!
//! Both downstream materializations (the durable store and the cache
//! channel) are driven by the same machinery; they differ only in their
//! [`EventHandler`].
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────── ConsumerGroup ──────────────────────────────┐
//! │  worker thread / partition 0        worker thread / partition 1   ...     │
//! │  ┌──────────────────────────────┐   ┌──────────────────────────────┐      │
//! │  │ PartitionConsumer            │   │ PartitionConsumer            │      │
//! │  │  1. load checkpoint          │   │                              │      │
//! │  │  2. poll (lazy, in order)    │   │                              │      │
//! │  │  3. decode ─▶ dead letter    │   │                              │      │
//! │  │  4. apply  ─▶ retry/backoff  │   │                              │      │
//! │  │  5. checkpoint last applied  │   │                              │      │
//! │  └──────────────────────────────┘   └──────────────────────────────┘      │
//! └───────────────────────────────────────────────────────────────────────────┘
//!            │                 │                  │
//!            ▼                 ▼                  ▼
//!      CheckpointStore   DeadLetterSink       AlertSink
//! ```
//!
//! Events of one partition are applied strictly in sequence order, one at a
//! time. Partitions share nothing but the collaborators, so a halted
//! partition never holds up the others.
//!
//! ## Failure handling
//!
//! | Failure                  | Handling                                              |
//! |--------------------------|-------------------------------------------------------|
//! | transient I/O            | retried with backoff from a per-batch budget          |
//! | malformed payload        | dead-lettered, consumption continues                  |
//! | budget exhausted         | progress so far checkpointed, partition `HALTED`      |
//! | position regression      | partition `HALTED`                                    |
//! | retention overtook us    | partition `HALTED`, data-loss alert                   |

mod framework;
mod group;
mod handler;
mod partition;
mod retry;
mod state;

pub use framework::{Poll, StreamConsumption};
pub use group::{ConsumerGroup, GroupStats, PartitionStatus};
pub use handler::{Delivery, EventHandler};
pub use partition::{
    BatchReport, ConsumerSettings, CycleOutcome, PartitionConsumer, PartitionStats, Remediation,
};
pub use retry::{RetryBudget, RetryPolicy};
pub use state::{HaltKind, HaltReason, PartitionState};

use thiserror::Error;

use crate::checkpoint::{CheckpointError, CheckpointKey};
use crate::codec::MalformedEvent;
use crate::error::SinkError;
use crate::stream::{PartitionId, SequenceNumber, StreamError};

/// Errors of a partition consumer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsumerError {
    /// A stream, store, cache or checkpoint call failed in a way that may
    /// succeed later.
    #[error("{operation} failed: {message}")]
    TransientIo {
        operation: &'static str,
        message: String,
    },
    #[error(transparent)]
    Malformed(#[from] MalformedEvent),
    /// The observed or stored position went backwards.
    #[error("checkpoint conflict on {stream_id}/{partition}: {detail}")]
    CheckpointConflict {
        stream_id: String,
        partition: PartitionId,
        detail: String,
    },
    /// The position to resume from has expired from the stream.
    #[error("events after {requested:?} on {stream_id}/{partition} expired; oldest retained is {oldest}")]
    RetentionExceeded {
        stream_id: String,
        partition: PartitionId,
        requested: Option<SequenceNumber>,
        oldest: SequenceNumber,
    },
    #[error("partition {partition} is halted: {reason}")]
    Halted {
        partition: PartitionId,
        reason: HaltReason,
    },
    #[error("dead-letter sink failed: {0}")]
    DeadLetter(SinkError),
    #[error("invalid remediation: {0}")]
    InvalidRemediation(String),
}

impl ConsumerError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ConsumerError::TransientIo { .. } => true,
            ConsumerError::DeadLetter(e) => e.is_transient(),
            _ => false,
        }
    }

    pub(crate) fn from_stream(
        stream_id: &str,
        partition: PartitionId,
        operation: &'static str,
        err: StreamError,
    ) -> Self {
        match err {
            StreamError::RetentionExceeded {
                requested, oldest, ..
            } => ConsumerError::RetentionExceeded {
                stream_id: stream_id.to_string(),
                partition,
                requested: Some(requested),
                oldest,
            },
            StreamError::PositionBeyondTip { .. } => ConsumerError::CheckpointConflict {
                stream_id: stream_id.to_string(),
                partition,
                detail: err.to_string(),
            },
            // Unknown streams are retried: they may be provisioned after
            // the consumers start.
            other => ConsumerError::TransientIo {
                operation,
                message: other.to_string(),
            },
        }
    }

    pub(crate) fn from_checkpoint(key: &CheckpointKey, err: CheckpointError) -> Self {
        if err.is_transient() {
            ConsumerError::TransientIo {
                operation: "checkpoint",
                message: err.to_string(),
            }
        } else {
            ConsumerError::CheckpointConflict {
                stream_id: key.stream_id.clone(),
                partition: key.partition,
                detail: err.to_string(),
            }
        }
    }
}
