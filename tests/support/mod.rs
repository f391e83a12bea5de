//! Shared fixtures for the pipeline integration tests.
//!
//! Every collaborator is an in-memory reference implementation, cloned so a
//! test can inject faults and inspect state while consumers run.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use reactive_pipeline::codec::encode_mutation;
use reactive_pipeline::{
    CacheUpdateHandler, ConsumerSettings, EntityMutation, InMemoryAlertSink,
    InMemoryCheckpointStore, InMemoryDeadLetterSink, InMemoryPubSub, InMemoryStream,
    InMemoryTable, PartitionConsumer, PartitionId, PayloadFormat, RetryPolicy, SequenceNumber,
    StoreUpdateHandler, StreamConsumption,
};

pub const EVENTS: &str = "reactive-system-event-stream";
pub const CACHE_UPDATES: &str = "reactive-system-redis-update-stream";
pub const TABLE: &str = "ProgramTable";
pub const CHANNEL: &str = "channel1";

pub fn mutation(id: &str, customer_id: i64, attrs: &[(&str, &str)]) -> EntityMutation {
    attrs
        .iter()
        .fold(EntityMutation::new(id, customer_id), |m, (k, v)| {
            m.with_attribute(*k, *v)
        })
}

pub fn payload(mutation: &EntityMutation, format: PayloadFormat) -> Vec<u8> {
    encode_mutation(mutation, format).unwrap()
}

/// In-memory pipeline collaborators shared by a test and its consumers.
#[derive(Clone)]
pub struct Harness {
    pub stream: InMemoryStream,
    pub table: InMemoryTable,
    pub pubsub: InMemoryPubSub,
    pub checkpoints: InMemoryCheckpointStore,
    pub dead_letters: InMemoryDeadLetterSink,
    pub alerts: InMemoryAlertSink,
}

impl Harness {
    pub fn new(partitions: u32) -> Self {
        let stream = InMemoryStream::new();
        stream.create_stream(EVENTS, partitions).unwrap();
        stream.create_stream(CACHE_UPDATES, partitions).unwrap();
        Self {
            stream,
            table: InMemoryTable::new(),
            pubsub: InMemoryPubSub::new(),
            checkpoints: InMemoryCheckpointStore::new(),
            dead_letters: InMemoryDeadLetterSink::new(),
            alerts: InMemoryAlertSink::new(),
        }
    }

    /// Append a JSON-encoded mutation to a partition of the event stream.
    pub fn append_event(&self, partition: u32, mutation: &EntityMutation) -> SequenceNumber {
        self.append(EVENTS, partition, mutation)
    }

    pub fn append_cache_update(&self, partition: u32, mutation: &EntityMutation) -> SequenceNumber {
        self.append(CACHE_UPDATES, partition, mutation)
    }

    fn append(&self, stream: &str, partition: u32, mutation: &EntityMutation) -> SequenceNumber {
        let key = format!("{}:{}", mutation.id, mutation.customer_id);
        self.stream
            .append(
                stream,
                PartitionId(partition),
                &key,
                payload(mutation, PayloadFormat::Json),
            )
            .unwrap()
    }

    pub fn consumption(&self) -> StreamConsumption {
        StreamConsumption::new(
            Arc::new(self.stream.clone()),
            Arc::new(self.checkpoints.clone()),
            Arc::new(self.dead_letters.clone()),
        )
    }

    pub fn settings(&self, consumer: &str, stream: &str, max_attempts: u32) -> ConsumerSettings {
        ConsumerSettings::new(consumer, stream)
            .with_poll_timeout(Duration::ZERO)
            .with_retry(
                RetryPolicy::default()
                    .with_max_attempts(max_attempts)
                    .with_initial_backoff(Duration::from_millis(1))
                    .with_max_backoff(Duration::from_millis(4)),
            )
    }

    pub fn store_consumer(
        &self,
        partition: u32,
        max_attempts: u32,
    ) -> PartitionConsumer<StoreUpdateHandler> {
        PartitionConsumer::new(
            StoreUpdateHandler::new(Arc::new(self.table.clone()), TABLE),
            self.consumption(),
            Arc::new(self.alerts.clone()),
            self.settings("store-updater", EVENTS, max_attempts),
            PartitionId(partition),
        )
    }

    pub fn cache_consumer(
        &self,
        partition: u32,
        max_attempts: u32,
    ) -> PartitionConsumer<CacheUpdateHandler> {
        PartitionConsumer::new(
            CacheUpdateHandler::new(Arc::new(self.pubsub.clone())).with_channel(CHANNEL),
            self.consumption(),
            Arc::new(self.alerts.clone()),
            self.settings("cache-updater", CACHE_UPDATES, max_attempts),
            PartitionId(partition),
        )
    }
}

/// Poll `condition` until it holds or five seconds pass.
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}
