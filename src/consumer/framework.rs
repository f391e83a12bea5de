use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::checkpoint::{CheckpointKey, CheckpointStore, ConsumerCheckpoint};
use crate::dead_letter::{DeadLetter, DeadLetterSink};
use crate::stream::{Event, EventStream, PartitionId, SequenceNumber, StartingPosition};

use super::ConsumerError;

/// Default number of records fetched per `get_records` call.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Read/checkpoint/dead-letter plumbing shared by every consumer.
///
/// Cheap to clone; clones share the collaborators.
#[derive(Clone)]
pub struct StreamConsumption {
    stream: Arc<dyn EventStream>,
    checkpoints: Arc<dyn CheckpointStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
    page_size: usize,
}

impl StreamConsumption {
    pub fn new(
        stream: Arc<dyn EventStream>,
        checkpoints: Arc<dyn CheckpointStore>,
        dead_letters: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            stream,
            checkpoints,
            dead_letters,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Set the maximum number of records fetched per stream call.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn stream(&self) -> &Arc<dyn EventStream> {
        &self.stream
    }

    pub fn checkpoints(&self) -> &Arc<dyn CheckpointStore> {
        &self.checkpoints
    }

    pub fn dead_letters(&self) -> &Arc<dyn DeadLetterSink> {
        &self.dead_letters
    }

    pub fn shards(&self, stream_id: &str) -> Result<Vec<PartitionId>, ConsumerError> {
        self.stream.list_shards(stream_id).map_err(|e| {
            ConsumerError::from_stream(stream_id, PartitionId(0), "list_shards", e)
        })
    }

    /// Read events of one partition, starting strictly after `from`.
    ///
    /// The returned sequence is lazy (pages are fetched as it is consumed),
    /// finite (at most `max_batch` events, never past the end of the
    /// retained log) and restartable: polling again from the position of
    /// the last consumed event yields the rest without gaps. Only the first
    /// fetch waits up to `timeout` for new records.
    pub fn poll(
        &self,
        stream_id: &str,
        partition: PartitionId,
        from: StartingPosition,
        max_batch: usize,
        timeout: Duration,
    ) -> Poll {
        Poll {
            stream: Arc::clone(&self.stream),
            stream_id: stream_id.to_string(),
            partition,
            position: from,
            last_seen: from.after(),
            remaining: max_batch,
            page_size: self.page_size,
            timeout,
            buffer: VecDeque::new(),
            fetched: false,
            at_tip: false,
            done: false,
        }
    }

    /// Last committed sequence number; `None` on a cold start.
    pub fn load_checkpoint(
        &self,
        key: &CheckpointKey,
    ) -> Result<Option<SequenceNumber>, ConsumerError> {
        self.checkpoints
            .load(key)
            .map(|c| c.and_then(|c| c.sequence_number))
            .map_err(|e| ConsumerError::from_checkpoint(key, e))
    }

    /// Commit `sequence` as processed. Moving backwards is a
    /// [`ConsumerError::CheckpointConflict`].
    pub fn checkpoint(
        &self,
        key: &CheckpointKey,
        sequence: SequenceNumber,
    ) -> Result<ConsumerCheckpoint, ConsumerError> {
        let checkpoint = self
            .checkpoints
            .save(key, sequence)
            .map_err(|e| ConsumerError::from_checkpoint(key, e))?;
        debug!(checkpoint = %key, sequence = %sequence, "checkpoint committed");
        Ok(checkpoint)
    }

    /// Operator override of a checkpoint.
    pub fn reset_checkpoint(
        &self,
        key: &CheckpointKey,
        sequence: Option<SequenceNumber>,
    ) -> Result<ConsumerCheckpoint, ConsumerError> {
        let checkpoint = self
            .checkpoints
            .reset(key, sequence)
            .map_err(|e| ConsumerError::from_checkpoint(key, e))?;
        warn!(checkpoint = %key, sequence = ?sequence, "checkpoint reset");
        Ok(checkpoint)
    }

    /// Record an unprocessable event. Returns `false` if it was already
    /// recorded for this consumer.
    pub fn dead_letter(
        &self,
        consumer: &str,
        event: &Event,
        reason: &str,
    ) -> Result<bool, ConsumerError> {
        let recorded = self
            .dead_letters
            .send(DeadLetter::from_event(consumer, event, reason))
            .map_err(ConsumerError::DeadLetter)?;
        if recorded {
            warn!(
                consumer = %consumer,
                event = %event.event_id(),
                reason = %reason,
                "event dead-lettered"
            );
        } else {
            debug!(consumer = %consumer, event = %event.event_id(), "event already dead-lettered");
        }
        Ok(recorded)
    }
}

/// Lazy, finite sequence of events returned by [`StreamConsumption::poll`].
///
/// Yields events in strictly increasing sequence order. A read failure or a
/// position that fails to move forward ends the sequence with an error.
pub struct Poll {
    stream: Arc<dyn EventStream>,
    stream_id: String,
    partition: PartitionId,
    position: StartingPosition,
    last_seen: Option<SequenceNumber>,
    remaining: usize,
    page_size: usize,
    timeout: Duration,
    buffer: VecDeque<Event>,
    fetched: bool,
    at_tip: bool,
    done: bool,
}

impl Poll {
    /// Whether the sequence reached the end of the retained log. Only
    /// meaningful once the sequence is exhausted.
    pub fn at_tip(&self) -> bool {
        self.at_tip && self.buffer.is_empty()
    }

    /// Position after the last event handed out.
    pub fn position(&self) -> StartingPosition {
        StartingPosition::from_checkpoint(self.last_seen)
    }

    fn fetch(&mut self) -> Result<(), ConsumerError> {
        let timeout = if self.fetched {
            Duration::ZERO
        } else {
            self.timeout
        };
        let limit = self.remaining.min(self.page_size);
        let batch = self
            .stream
            .get_records(&self.stream_id, self.partition, &self.position, limit, timeout)
            .map_err(|e| {
                ConsumerError::from_stream(&self.stream_id, self.partition, "get_records", e)
            })?;
        self.fetched = true;
        self.at_tip = batch.at_tip;
        self.position = batch.next_position;
        self.buffer.extend(batch.events);
        Ok(())
    }

    fn conflict(&mut self, detail: String) -> ConsumerError {
        self.done = true;
        ConsumerError::CheckpointConflict {
            stream_id: self.stream_id.clone(),
            partition: self.partition,
            detail,
        }
    }
}

impl Iterator for Poll {
    type Item = Result<Event, ConsumerError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.remaining == 0 {
            return None;
        }

        if self.buffer.is_empty() {
            if self.fetched && self.at_tip {
                self.done = true;
                return None;
            }
            if let Err(e) = self.fetch() {
                self.done = true;
                return Some(Err(e));
            }
        }

        let Some(event) = self.buffer.pop_front() else {
            self.done = true;
            return None;
        };

        if event.partition != self.partition {
            let detail = format!(
                "read event {} while polling partition {}",
                event.event_id(),
                self.partition
            );
            return Some(Err(self.conflict(detail)));
        }
        if let Some(last) = self.last_seen {
            if event.sequence_number <= last {
                let detail = format!(
                    "sequence went from {} to {}",
                    last, event.sequence_number
                );
                return Some(Err(self.conflict(detail)));
            }
        }

        self.last_seen = Some(event.sequence_number);
        self.remaining -= 1;
        Some(Ok(event))
    }
}
