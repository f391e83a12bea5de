//! Idempotency markers.
//!
//! Every write made on behalf of an event carries the marker of that event.
//! A sink compares the incoming marker with the one stored alongside the
//! current value and skips writes that do not supersede it, so re-delivering
//! an already-applied prefix of a partition changes nothing.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::stream::{Event, PartitionId, SequenceNumber};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyMarker {
    pub stream_id: String,
    pub partition: PartitionId,
    pub sequence: SequenceNumber,
}

impl IdempotencyMarker {
    pub fn new(stream_id: impl Into<String>, partition: PartitionId, sequence: SequenceNumber) -> Self {
        Self {
            stream_id: stream_id.into(),
            partition,
            sequence,
        }
    }

    pub fn for_event(event: &Event) -> Self {
        Self::new(event.stream_id.clone(), event.partition, event.sequence_number)
    }

    pub fn event_id(&self) -> String {
        self.to_string()
    }

    /// Whether a write carrying `self` should replace a value last written
    /// under `previous`.
    ///
    /// Within one partition only a strictly newer sequence wins; replays of
    /// the same or older events are duplicates. Markers from another stream
    /// or partition are not comparable and always win, leaving the per-key
    /// ordering to the producer's partitioning.
    pub fn supersedes(&self, previous: Option<&IdempotencyMarker>) -> bool {
        match previous {
            None => true,
            Some(prev) if prev.stream_id != self.stream_id || prev.partition != self.partition => {
                true
            }
            Some(prev) => self.sequence > prev.sequence,
        }
    }
}

impl fmt::Display for IdempotencyMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.stream_id, self.partition, self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(partition: u32, sequence: u64) -> IdempotencyMarker {
        IdempotencyMarker::new("events", PartitionId(partition), SequenceNumber(sequence))
    }

    #[test]
    fn newer_sequence_supersedes() {
        assert!(marker(0, 2).supersedes(Some(&marker(0, 1))));
        assert!(marker(0, 1).supersedes(None));
    }

    #[test]
    fn replay_is_a_duplicate() {
        assert!(!marker(0, 2).supersedes(Some(&marker(0, 2))));
        assert!(!marker(0, 1).supersedes(Some(&marker(0, 2))));
    }

    #[test]
    fn other_partition_always_supersedes() {
        assert!(marker(1, 1).supersedes(Some(&marker(0, 9))));
    }

    #[test]
    fn event_id_matches_event() {
        assert_eq!(marker(3, 11).event_id(), "events/3/11");
    }
}
