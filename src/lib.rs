//! Event-driven cache-consistency pipeline.
//!
//! Writes flow from partitioned event streams into two independent
//! materializations, a durable key-sorted table and a versioned cache
//! channel, with at-least-once delivery and idempotent application.
//! See [`consumer`] for the shared consumption machinery and [`pipeline`]
//! for the assembled system.

pub mod alert;
pub mod cache;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod error;
#[cfg(feature = "http")]
pub mod http;
pub mod idempotency;
pub mod pipeline;
pub mod producer;
pub mod store;
pub mod stream;
pub mod telemetry;

pub use alert::{Alert, AlertKind, AlertSink, InMemoryAlertSink, LogAlertSink};
#[cfg(feature = "emitter")]
pub use alert::EmitterAlertSink;
pub use cache::{
    cache_key, ApplyOutcome, CacheMessage, CacheNode, CacheNodeListener, CachePublisher,
    CacheUpdateHandler, InMemoryPubSub,
};
pub use checkpoint::{
    CheckpointError, CheckpointKey, CheckpointStore, ConsumerCheckpoint, FileCheckpointStore,
    InMemoryCheckpointStore,
};
pub use codec::{EntityMutation, MalformedEvent, PayloadFormat};
pub use config::{load_config, PipelineConfig};
pub use consumer::{
    ConsumerError, ConsumerGroup, ConsumerSettings, CycleOutcome, Delivery, EventHandler,
    PartitionConsumer, PartitionState, Remediation, RetryPolicy, StreamConsumption,
};
pub use dead_letter::{DeadLetter, DeadLetterSink, InMemoryDeadLetterSink, JsonLinesDeadLetterSink};
pub use error::{Error, Result, SinkError};
pub use idempotency::IdempotencyMarker;
pub use pipeline::{Pipeline, PipelineHandle, PipelineStats};
pub use producer::{TrackingMessage, TrackingProducer};
pub use store::{DurableStore, InMemoryTable, RecordKey, StoreRecord, StoreUpdateHandler};
pub use stream::{
    Event, EventStream, InMemoryStream, PartitionId, SequenceNumber, StartingPosition,
    StreamError, StreamProducer,
};

// Re-export the EventEmitter from the event_emitter_rs crate
#[cfg(feature = "emitter")]
pub use event_emitter_rs::EventEmitter;
