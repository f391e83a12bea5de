use crate::stream::SequenceNumber;

use super::{CheckpointError, CheckpointKey, ConsumerCheckpoint};

/// Durable storage for consumer checkpoints.
pub trait CheckpointStore: Send + Sync {
    /// Load a checkpoint. `None` means the consumer never committed on this
    /// partition (cold start).
    fn load(&self, key: &CheckpointKey) -> Result<Option<ConsumerCheckpoint>, CheckpointError>;

    /// Advance a checkpoint. Saving the stored value again is a no-op;
    /// saving a lower value fails with [`CheckpointError::Regression`].
    fn save(
        &self,
        key: &CheckpointKey,
        sequence: SequenceNumber,
    ) -> Result<ConsumerCheckpoint, CheckpointError>;

    /// Operator override: set the checkpoint to any value, including
    /// backwards or back to the trim horizon (`None`).
    fn reset(
        &self,
        key: &CheckpointKey,
        sequence: Option<SequenceNumber>,
    ) -> Result<ConsumerCheckpoint, CheckpointError>;

    /// All checkpoints of a consumer, ordered by stream and partition.
    fn list(&self, consumer: &str) -> Result<Vec<ConsumerCheckpoint>, CheckpointError>;
}
