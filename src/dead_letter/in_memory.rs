use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use crate::error::SinkError;
use crate::stream::PartitionId;

use super::{DeadLetter, DeadLetterSink};

#[derive(Default)]
struct Letters {
    ordered: Vec<DeadLetter>,
    seen: HashSet<String>,
}

/// In-memory dead-letter sink. Clones share the same storage.
#[derive(Clone, Default)]
pub struct InMemoryDeadLetterSink {
    letters: Arc<RwLock<Letters>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.letters.read().map(|l| l.ordered.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeadLetterSink for InMemoryDeadLetterSink {
    fn send(&self, letter: DeadLetter) -> Result<bool, SinkError> {
        let mut letters = self
            .letters
            .write()
            .map_err(|_| SinkError::Storage("lock poisoned".into()))?;
        if !letters.seen.insert(letter.event_id()) {
            return Ok(false);
        }
        letters.ordered.push(letter);
        Ok(true)
    }

    fn list(&self) -> Result<Vec<DeadLetter>, SinkError> {
        let letters = self
            .letters
            .read()
            .map_err(|_| SinkError::Storage("lock poisoned".into()))?;
        Ok(letters.ordered.clone())
    }

    fn drain(&self, consumer: &str, partition: PartitionId) -> Result<Vec<DeadLetter>, SinkError> {
        let mut letters = self
            .letters
            .write()
            .map_err(|_| SinkError::Storage("lock poisoned".into()))?;
        let (drained, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut letters.ordered)
            .into_iter()
            .partition(|l| l.consumer == consumer && l.partition == partition);
        letters.ordered = kept;
        // Drained ids stay in `seen`: a drained poison event that is
        // redelivered is not recorded a second time.
        Ok(drained)
    }
}
