//! Wiring of both consumers.
//!
//! ```text
//!  TrackingProducer ──▶ event stream ──▶ [store-updater group] ──▶ DurableStore
//!                  └──▶ cache stream ──▶ [cache-updater group] ──▶ CachePublisher ──▶ CacheNode(s)
//! ```
//!
//! The two groups share the checkpoint store, the dead-letter sink and the
//! alert sink; their checkpoints never collide because every key carries
//! the consumer name.

use std::sync::Arc;

use tracing::info;

use crate::alert::{AlertSink, LogAlertSink};
use crate::cache::{CachePublisher, CacheUpdateHandler};
use crate::checkpoint::{
    CheckpointStore, ConsumerCheckpoint, FileCheckpointStore, InMemoryCheckpointStore,
};
use crate::config::PipelineConfig;
use crate::consumer::{
    ConsumerGroup, GroupStats, PartitionState, PartitionStatus, Remediation, StreamConsumption,
};
use crate::dead_letter::{
    DeadLetter, DeadLetterSink, InMemoryDeadLetterSink, JsonLinesDeadLetterSink,
};
use crate::error::{Error, Result};
use crate::store::{DurableStore, StoreUpdateHandler};
use crate::stream::{EventStream, PartitionId};

/// Builder for a running pipeline.
///
/// The stream, the durable store and the cache publisher are required.
/// Checkpoints and dead letters default to files when the configuration
/// names a location and to memory otherwise; alerts default to the log.
pub struct Pipeline {
    config: PipelineConfig,
    stream: Option<Arc<dyn EventStream>>,
    store: Option<Arc<dyn DurableStore>>,
    publisher: Option<Arc<dyn CachePublisher>>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    alerts: Option<Arc<dyn AlertSink>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            stream: None,
            store: None,
            publisher: None,
            checkpoints: None,
            dead_letters: None,
            alerts: None,
        }
    }

    pub fn with_stream(mut self, stream: Arc<dyn EventStream>) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn CachePublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn with_dead_letters(mut self, dead_letters: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(dead_letters);
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validate the configuration and spawn both consumer groups.
    pub fn start(self) -> Result<PipelineHandle> {
        self.config.validate()?;

        let stream = self.stream.ok_or(Error::MissingCollaborator("event stream"))?;
        let store = self.store.ok_or(Error::MissingCollaborator("durable store"))?;
        let publisher = self
            .publisher
            .ok_or(Error::MissingCollaborator("cache publisher"))?;

        let checkpoints: Arc<dyn CheckpointStore> =
            match (self.checkpoints, &self.config.checkpoint.dir) {
                (Some(checkpoints), _) => checkpoints,
                (None, Some(dir)) => Arc::new(FileCheckpointStore::open(dir)?),
                (None, None) => Arc::new(InMemoryCheckpointStore::new()),
            };
        let dead_letters: Arc<dyn DeadLetterSink> =
            match (self.dead_letters, &self.config.dead_letter.path) {
                (Some(sink), _) => sink,
                (None, Some(path)) => Arc::new(JsonLinesDeadLetterSink::open(path)?),
                (None, None) => Arc::new(InMemoryDeadLetterSink::new()),
            };
        let alerts: Arc<dyn AlertSink> = self.alerts.unwrap_or_else(|| Arc::new(LogAlertSink));

        let consumption = StreamConsumption::new(
            stream,
            Arc::clone(&checkpoints),
            Arc::clone(&dead_letters),
        )
        .with_page_size(self.config.consumer.page_size);

        let table = self.config.event_stream.table.clone();
        let event_format = self.config.event_stream.format;
        let store_group = ConsumerGroup::spawn(
            consumption.clone(),
            self.config.store_settings(),
            Arc::clone(&alerts),
            |_partition| {
                StoreUpdateHandler::new(Arc::clone(&store), table.clone()).with_format(event_format)
            },
        )?;

        let channel = self.config.cache_stream.channel.clone();
        let cache_format = self.config.cache_stream.format;
        let cache_group = ConsumerGroup::spawn(
            consumption,
            self.config.cache_settings(),
            alerts,
            |_partition| {
                CacheUpdateHandler::new(Arc::clone(&publisher))
                    .with_channel(channel.clone())
                    .with_format(cache_format)
            },
        )?;

        info!(
            event_stream = %self.config.event_stream.stream_id,
            cache_stream = %self.config.cache_stream.stream_id,
            "pipeline started"
        );

        Ok(PipelineHandle {
            config: self.config,
            store_group,
            cache_group,
            checkpoints,
            dead_letters,
        })
    }
}

/// Final statistics of both consumer groups.
#[derive(Clone, Debug, Default)]
pub struct PipelineStats {
    pub store: GroupStats,
    pub cache: GroupStats,
}

/// A running pipeline. Dropping it signals both groups to stop.
pub struct PipelineHandle {
    config: PipelineConfig,
    store_group: ConsumerGroup,
    cache_group: ConsumerGroup,
    checkpoints: Arc<dyn CheckpointStore>,
    dead_letters: Arc<dyn DeadLetterSink>,
}

impl PipelineHandle {
    /// The validated configuration the pipeline runs with.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store_group(&self) -> &ConsumerGroup {
        &self.store_group
    }

    pub fn cache_group(&self) -> &ConsumerGroup {
        &self.cache_group
    }

    /// The group running under `consumer`.
    pub fn group(&self, consumer: &str) -> Result<&ConsumerGroup> {
        [&self.store_group, &self.cache_group]
            .into_iter()
            .find(|group| group.consumer() == consumer)
            .ok_or_else(|| Error::UnknownConsumer(consumer.to_string()))
    }

    /// Status of every partition of both consumers.
    pub fn status(&self) -> Vec<PartitionStatus> {
        let mut status = self.store_group.status();
        status.extend(self.cache_group.status());
        status
    }

    /// Whether no partition of either consumer is halted.
    pub fn is_healthy(&self) -> bool {
        self.store_group.is_healthy() && self.cache_group.is_healthy()
    }

    pub fn remediate(
        &self,
        consumer: &str,
        partition: PartitionId,
        remediation: Remediation,
    ) -> Result<PartitionState> {
        Ok(self.group(consumer)?.remediate(partition, remediation)?)
    }

    pub fn checkpoints(&self, consumer: &str) -> Result<Vec<ConsumerCheckpoint>> {
        self.group(consumer)?;
        Ok(self.checkpoints.list(consumer)?)
    }

    pub fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.dead_letters.list()?)
    }

    /// Remove and return the dead letters of one partition, once an operator
    /// has dealt with them.
    pub fn drain_dead_letters(
        &self,
        consumer: &str,
        partition: PartitionId,
    ) -> Result<Vec<DeadLetter>> {
        self.group(consumer)?;
        Ok(self.dead_letters.drain(consumer, partition)?)
    }

    /// Stop both groups after their in-flight batches.
    pub fn stop(&self) -> PipelineStats {
        self.store_group.signal_stop();
        self.cache_group.signal_stop();
        PipelineStats {
            store: self.store_group.stop(),
            cache: self.cache_group.stop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::cache::{CacheNode, CacheNodeListener, InMemoryPubSub};
    use crate::codec::PayloadFormat;
    use crate::producer::{TrackingMessage, TrackingProducer};
    use crate::store::{InMemoryTable, RecordKey};
    use crate::stream::InMemoryStream;

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.consumer.poll_timeout_ms = 20;
        config.retry.initial_backoff_ms = 1;
        config.retry.max_backoff_ms = 5;
        config
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn missing_collaborators_are_reported() {
        let result = Pipeline::new(config()).start();
        assert!(matches!(result, Err(Error::MissingCollaborator("event stream"))));
    }

    #[test]
    fn produced_messages_reach_store_and_cache() {
        let config = config();
        let stream = InMemoryStream::new();
        stream.create_stream(&config.event_stream.stream_id, 2).unwrap();
        stream.create_stream(&config.cache_stream.stream_id, 2).unwrap();
        let table = InMemoryTable::new();
        let pubsub = InMemoryPubSub::new();
        let node = CacheNode::from_config("node-a", &config.cache_node);
        let listener =
            CacheNodeListener::spawn(node.clone(), pubsub.subscribe(&config.cache_stream.channel));

        let handle = Pipeline::new(config.clone())
            .with_stream(Arc::new(stream.clone()))
            .with_store(Arc::new(table.clone()))
            .with_publisher(Arc::new(pubsub.clone()))
            .start()
            .unwrap();

        let producer = TrackingProducer::new(
            Arc::new(stream.clone()),
            config.event_stream.stream_id.clone(),
            config.cache_stream.stream_id.clone(),
        )
        .with_event_format(PayloadFormat::Bitcode);
        let produced = producer
            .send(&TrackingMessage {
                program_id: "P".into(),
                checksum: "c".into(),
                customer_id: 7,
                user_agent: "ua".into(),
                program_name: "pn".into(),
                customer_name: "cn".into(),
                is_valid: true,
                message_id: "m".into(),
            })
            .unwrap();

        let key = RecordKey::new("P", 7);
        assert!(wait_for(|| table
            .get_item(&config.event_stream.table, &key)
            .ok()
            .flatten()
            .is_some()));
        assert!(wait_for(|| node.version("P:7") == Some(produced.version)));

        assert!(handle.is_healthy());
        assert_eq!(handle.status().len(), 4);
        assert!(matches!(
            handle.remediate("nobody", PartitionId(0), Remediation::Retry),
            Err(Error::UnknownConsumer(_))
        ));

        let stats = handle.stop();
        assert_eq!(stats.store.events_applied(), 1);
        assert_eq!(stats.cache.events_applied(), 1);
        listener.stop();
    }
}
