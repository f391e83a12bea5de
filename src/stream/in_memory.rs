//! In-memory partitioned stream for testing and single-process scenarios.
//!
//! Implements both [`EventStream`] and [`StreamProducer`], useful for:
//! - Unit and integration testing without a managed stream service
//! - Single-process deployments
//! - Reproducing retention and outage scenarios deterministically

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use super::{
    Event, EventStream, PartitionId, RecordBatch, SequenceNumber, StartingPosition, StreamError,
    StreamProducer,
};

/// Default retention window, matching a freshly provisioned managed stream.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

struct PartitionLog {
    events: VecDeque<Event>,
    next_sequence: u64,
}

impl PartitionLog {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
            next_sequence: 1,
        }
    }

    /// Sequence number of the oldest retained record, or of the next record
    /// to be written when everything has been evicted.
    fn first_retained(&self) -> u64 {
        self.events
            .front()
            .map(|e| e.sequence_number.0)
            .unwrap_or(self.next_sequence)
    }
}

#[derive(Default)]
struct Faults {
    unavailable: bool,
    failing_reads: usize,
}

/// In-memory partitioned stream.
///
/// Features:
/// - Thread-safe (clones share the same log)
/// - Sequence numbers start at 1 and increase by one per partition
/// - Records older than the retention window are evicted by [`expire`](Self::expire)
/// - Read outages can be injected for failure testing
///
/// ## Example
///
/// ```
/// use std::time::Duration;
/// use reactive_pipeline::stream::{EventStream, InMemoryStream, PartitionId, StartingPosition};
///
/// let stream = InMemoryStream::new();
/// stream.create_stream("events", 2).unwrap();
/// stream.append("events", PartitionId(0), "A", b"{}".to_vec()).unwrap();
///
/// let batch = stream
///     .get_records("events", PartitionId(0), &StartingPosition::TrimHorizon, 10, Duration::ZERO)
///     .unwrap();
/// assert_eq!(batch.events.len(), 1);
/// assert!(batch.at_tip);
/// ```
#[derive(Clone)]
pub struct InMemoryStream {
    streams: Arc<RwLock<HashMap<String, Vec<PartitionLog>>>>,
    retention: Duration,
    faults: Arc<Mutex<Faults>>,
}

impl Default for InMemoryStream {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStream {
    /// Create an empty stream registry with the default retention window.
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }

    /// Create an empty stream registry with a custom retention window.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            retention,
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Create a stream with `partitions` partitions. Recreating an existing
    /// stream is a no-op.
    pub fn create_stream(&self, stream_id: &str, partitions: u32) -> Result<(), StreamError> {
        let mut streams = self
            .streams
            .write()
            .map_err(|_| StreamError::Unavailable("stream registry lock poisoned".into()))?;
        streams
            .entry(stream_id.to_string())
            .or_insert_with(|| (0..partitions.max(1)).map(|_| PartitionLog::new()).collect());
        Ok(())
    }

    /// Append a record to an explicit partition, stamped with the current time.
    pub fn append(
        &self,
        stream_id: &str,
        partition: PartitionId,
        partition_key: &str,
        payload: Vec<u8>,
    ) -> Result<SequenceNumber, StreamError> {
        self.append_at(stream_id, partition, partition_key, payload, SystemTime::now())
    }

    /// Append a record with an explicit production time.
    pub fn append_at(
        &self,
        stream_id: &str,
        partition: PartitionId,
        partition_key: &str,
        payload: Vec<u8>,
        produced_at: SystemTime,
    ) -> Result<SequenceNumber, StreamError> {
        let mut streams = self
            .streams
            .write()
            .map_err(|_| StreamError::Unavailable("stream registry lock poisoned".into()))?;
        let log = partition_mut(&mut streams, stream_id, partition)?;

        let sequence_number = SequenceNumber(log.next_sequence);
        log.next_sequence += 1;
        log.events.push_back(Event {
            stream_id: stream_id.to_string(),
            partition,
            partition_key: partition_key.to_string(),
            sequence_number,
            payload,
            produced_at,
        });
        Ok(sequence_number)
    }

    /// Evict every record whose retention window has elapsed at `now`.
    /// Returns the number of evicted records.
    pub fn expire(&self, now: SystemTime) -> Result<usize, StreamError> {
        let mut streams = self
            .streams
            .write()
            .map_err(|_| StreamError::Unavailable("stream registry lock poisoned".into()))?;
        let mut evicted = 0;
        for partitions in streams.values_mut() {
            for log in partitions.iter_mut() {
                while let Some(front) = log.events.front() {
                    let expires_at = front.produced_at + self.retention;
                    if expires_at > now {
                        break;
                    }
                    log.events.pop_front();
                    evicted += 1;
                }
            }
        }
        Ok(evicted)
    }

    /// Snapshot of the retained records of one partition.
    pub fn events(&self, stream_id: &str, partition: PartitionId) -> Vec<Event> {
        self.streams
            .read()
            .ok()
            .and_then(|streams| {
                streams
                    .get(stream_id)
                    .and_then(|partitions| partitions.get(partition.0 as usize))
                    .map(|log| log.events.iter().cloned().collect())
            })
            .unwrap_or_default()
    }

    /// Number of retained records in one partition.
    pub fn len(&self, stream_id: &str, partition: PartitionId) -> usize {
        self.events(stream_id, partition).len()
    }

    /// Make every read fail with `Unavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.unavailable = unavailable;
        }
    }

    /// Fail the next `count` reads with `Unavailable`.
    pub fn fail_next_reads(&self, count: usize) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.failing_reads = count;
        }
    }

    fn check_read_faults(&self) -> Result<(), StreamError> {
        let mut faults = self
            .faults
            .lock()
            .map_err(|_| StreamError::Unavailable("fault state lock poisoned".into()))?;
        if faults.unavailable {
            return Err(StreamError::Unavailable("stream is unreachable".into()));
        }
        if faults.failing_reads > 0 {
            faults.failing_reads -= 1;
            return Err(StreamError::Unavailable("injected read failure".into()));
        }
        Ok(())
    }

    fn read_page(
        &self,
        stream_id: &str,
        partition: PartitionId,
        position: &StartingPosition,
        limit: usize,
    ) -> Result<RecordBatch, StreamError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| StreamError::Unavailable("stream registry lock poisoned".into()))?;
        let log = streams
            .get(stream_id)
            .ok_or_else(|| StreamError::UnknownStream(stream_id.to_string()))?
            .get(partition.0 as usize)
            .ok_or_else(|| StreamError::UnknownPartition {
                stream_id: stream_id.to_string(),
                partition,
            })?;

        let first_wanted = match position {
            StartingPosition::TrimHorizon => log.first_retained(),
            StartingPosition::AfterSequence(after) => {
                let latest = SequenceNumber(log.next_sequence - 1);
                let wanted = match after.next() {
                    Some(wanted) if wanted.0 <= log.next_sequence => wanted.0,
                    _ => {
                        return Err(StreamError::PositionBeyondTip {
                            partition,
                            requested: *after,
                            latest,
                        })
                    }
                };
                if wanted < log.first_retained() {
                    return Err(StreamError::RetentionExceeded {
                        partition,
                        requested: *after,
                        oldest: SequenceNumber(log.first_retained()),
                    });
                }
                wanted
            }
        };

        let events: Vec<Event> = log
            .events
            .iter()
            .skip_while(|e| e.sequence_number.0 < first_wanted)
            .take(limit)
            .cloned()
            .collect();

        let next_position = events
            .last()
            .map(|e| StartingPosition::AfterSequence(e.sequence_number))
            .unwrap_or(*position);
        let at_tip = events
            .last()
            .map(|e| e.sequence_number.0 >= log.next_sequence - 1)
            .unwrap_or(true);

        Ok(RecordBatch {
            events,
            next_position,
            at_tip,
        })
    }
}

fn partition_mut<'a>(
    streams: &'a mut HashMap<String, Vec<PartitionLog>>,
    stream_id: &str,
    partition: PartitionId,
) -> Result<&'a mut PartitionLog, StreamError> {
    streams
        .get_mut(stream_id)
        .ok_or_else(|| StreamError::UnknownStream(stream_id.to_string()))?
        .get_mut(partition.0 as usize)
        .ok_or_else(|| StreamError::UnknownPartition {
            stream_id: stream_id.to_string(),
            partition,
        })
}

/// FNV-1a; stable across processes so a key always lands on the same partition.
fn partition_for_key(partition_key: &str, partitions: usize) -> PartitionId {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in partition_key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    PartitionId((hash % partitions.max(1) as u64) as u32)
}

impl EventStream for InMemoryStream {
    fn list_shards(&self, stream_id: &str) -> Result<Vec<PartitionId>, StreamError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| StreamError::Unavailable("stream registry lock poisoned".into()))?;
        let partitions = streams
            .get(stream_id)
            .ok_or_else(|| StreamError::UnknownStream(stream_id.to_string()))?;
        Ok((0..partitions.len() as u32).map(PartitionId).collect())
    }

    fn get_records(
        &self,
        stream_id: &str,
        partition: PartitionId,
        position: &StartingPosition,
        limit: usize,
        timeout: Duration,
    ) -> Result<RecordBatch, StreamError> {
        self.check_read_faults()?;
        let deadline = Instant::now() + timeout;

        loop {
            let batch = self.read_page(stream_id, partition, position, limit)?;
            if !batch.events.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            // Small sleep to avoid busy-waiting
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl StreamProducer for InMemoryStream {
    fn put_record(
        &self,
        stream_id: &str,
        partition_key: &str,
        payload: Vec<u8>,
    ) -> Result<(PartitionId, SequenceNumber), StreamError> {
        let partitions = self.list_shards(stream_id)?.len();
        let partition = partition_for_key(partition_key, partitions);
        let sequence = self.append(stream_id, partition, partition_key, payload)?;
        Ok((partition, sequence))
    }
}
