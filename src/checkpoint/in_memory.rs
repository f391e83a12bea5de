use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::stream::SequenceNumber;

use super::store::CheckpointStore;
use super::{check_forward, CheckpointError, CheckpointKey, ConsumerCheckpoint};

/// In-memory checkpoint store backed by `Arc<RwLock<BTreeMap>>`.
///
/// Clone-friendly (cloning shares the same underlying storage), so a test
/// can restart a consumer against the checkpoints its predecessor wrote.
#[derive(Clone, Default)]
pub struct InMemoryCheckpointStore {
    storage: Arc<RwLock<BTreeMap<CheckpointKey, ConsumerCheckpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for InMemoryCheckpointStore {
    fn load(&self, key: &CheckpointKey) -> Result<Option<ConsumerCheckpoint>, CheckpointError> {
        let storage = self
            .storage
            .read()
            .map_err(|_| CheckpointError::Storage("lock poisoned".into()))?;
        Ok(storage.get(key).cloned())
    }

    fn save(
        &self,
        key: &CheckpointKey,
        sequence: SequenceNumber,
    ) -> Result<ConsumerCheckpoint, CheckpointError> {
        let mut storage = self
            .storage
            .write()
            .map_err(|_| CheckpointError::Storage("lock poisoned".into()))?;
        let stored = storage.get(key);
        check_forward(key, stored, sequence)?;
        if let Some(existing) = stored.filter(|c| c.sequence_number == Some(sequence)) {
            return Ok(existing.clone());
        }
        let checkpoint = ConsumerCheckpoint::new(key, Some(sequence));
        storage.insert(key.clone(), checkpoint.clone());
        Ok(checkpoint)
    }

    fn reset(
        &self,
        key: &CheckpointKey,
        sequence: Option<SequenceNumber>,
    ) -> Result<ConsumerCheckpoint, CheckpointError> {
        let mut storage = self
            .storage
            .write()
            .map_err(|_| CheckpointError::Storage("lock poisoned".into()))?;
        let checkpoint = ConsumerCheckpoint::new(key, sequence);
        storage.insert(key.clone(), checkpoint.clone());
        Ok(checkpoint)
    }

    fn list(&self, consumer: &str) -> Result<Vec<ConsumerCheckpoint>, CheckpointError> {
        let storage = self
            .storage
            .read()
            .map_err(|_| CheckpointError::Storage("lock poisoned".into()))?;
        Ok(storage
            .values()
            .filter(|c| c.consumer == consumer)
            .cloned()
            .collect())
    }
}
