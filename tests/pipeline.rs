//! The assembled pipeline: producer, both consumer groups, durable
//! checkpoints and dead letters, cache nodes.

mod support;

use std::sync::Arc;

use reactive_pipeline::{
    AlertKind, CacheNode, CacheNodeListener, DurableStore, InMemoryAlertSink, InMemoryPubSub,
    InMemoryStream, InMemoryTable, PartitionId, PartitionState, Pipeline, PipelineConfig,
    RecordKey, Remediation, TrackingMessage, TrackingProducer,
};

use support::{wait_for, CACHE_UPDATES, CHANNEL, EVENTS, TABLE};

fn config(dir: &std::path::Path) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.consumer.poll_timeout_ms = 20;
    config.retry.max_attempts = 3;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 4;
    config.checkpoint.dir = Some(dir.join("checkpoints"));
    config.dead_letter.path = Some(dir.join("dead-letters.jsonl"));
    config
}

fn tracking(program: &str, customer_id: i64) -> TrackingMessage {
    TrackingMessage {
        program_id: program.into(),
        checksum: "0f3a".into(),
        customer_id,
        user_agent: "curl/8".into(),
        program_name: "Reporting".into(),
        customer_name: "Acme".into(),
        is_valid: true,
        message_id: format!("msg-{}-{}", program, customer_id),
    }
}

struct World {
    stream: InMemoryStream,
    table: InMemoryTable,
    pubsub: InMemoryPubSub,
    alerts: InMemoryAlertSink,
    producer: TrackingProducer,
}

impl World {
    fn new(partitions: u32) -> Self {
        let stream = InMemoryStream::new();
        stream.create_stream(EVENTS, partitions).unwrap();
        stream.create_stream(CACHE_UPDATES, partitions).unwrap();
        let producer = TrackingProducer::new(Arc::new(stream.clone()), EVENTS, CACHE_UPDATES);
        Self {
            stream,
            table: InMemoryTable::new(),
            pubsub: InMemoryPubSub::new(),
            alerts: InMemoryAlertSink::new(),
            producer,
        }
    }

    fn pipeline(&self, config: PipelineConfig) -> Pipeline {
        Pipeline::new(config)
            .with_stream(Arc::new(self.stream.clone()))
            .with_store(Arc::new(self.table.clone()))
            .with_publisher(Arc::new(self.pubsub.clone()))
            .with_alerts(Arc::new(self.alerts.clone()))
    }
}

#[test]
fn restart_resumes_from_persisted_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new(2);
    let node = CacheNode::from_config("node-a", &config(dir.path()).cache_node);
    let listener = CacheNodeListener::spawn(node.clone(), world.pubsub.subscribe(CHANNEL));

    let handle = world.pipeline(config(dir.path())).start().unwrap();
    let mut versions = Vec::new();
    for i in 0..5 {
        versions.push(world.producer.send(&tracking(&format!("P{}", i), 1)).unwrap().version);
    }
    assert!(wait_for(|| world.table.len(TABLE) == 5));
    assert!(wait_for(|| (0..5).all(|i| node.version(&format!("P{}:1", i)) == Some(versions[i]))));
    let first = handle.stop();
    assert_eq!(first.store.events_applied(), 5);
    assert_eq!(first.cache.events_applied(), 5);
    drop(handle);

    // A fresh pipeline over the same checkpoint directory picks up where the
    // first one stopped.
    let handle = world.pipeline(config(dir.path())).start().unwrap();
    world.producer.send(&tracking("P5", 1)).unwrap();
    assert!(wait_for(|| world.table.len(TABLE) == 6));
    assert!(wait_for(|| node.version("P5:1").is_some()));

    let checkpoints = handle.checkpoints("store-updater").unwrap();
    assert!(!checkpoints.is_empty());
    let second = handle.stop();
    assert_eq!(second.store.events_applied(), 1);
    assert_eq!(
        second
            .store
            .partitions
            .values()
            .map(|stats| stats.duplicates)
            .sum::<u64>(),
        0
    );
    listener.stop();
}

#[test]
fn halted_store_partition_is_remediated_through_the_handle() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new(1);
    let node = CacheNode::from_config("node-a", &config(dir.path()).cache_node);
    let listener = CacheNodeListener::spawn(node.clone(), world.pubsub.subscribe(CHANNEL));
    world.table.block_key(RecordKey::new("P", 7));

    let handle = world.pipeline(config(dir.path())).start().unwrap();
    let produced = world.producer.send(&tracking("P", 7)).unwrap();

    assert!(wait_for(|| !handle.is_healthy()));
    let halted = handle
        .store_group()
        .partition_status(PartitionId(0))
        .unwrap();
    assert!(halted.state.is_halted());
    assert_eq!(halted.checkpoint, None);
    assert!(!world.alerts.of_kind(AlertKind::PartitionHalted).is_empty());

    // The cache side is independent and carries on.
    assert!(wait_for(|| node.version("P:7") == Some(produced.version)));
    assert!(handle.cache_group().is_healthy());

    world.table.unblock_key(&RecordKey::new("P", 7));
    assert_eq!(
        handle
            .remediate("store-updater", PartitionId(0), Remediation::Retry)
            .unwrap(),
        PartitionState::CatchingUp
    );
    assert!(wait_for(|| world
        .table
        .get_item(TABLE, &RecordKey::new("P", 7))
        .unwrap()
        .is_some()));
    assert!(wait_for(|| handle.is_healthy()));

    handle.stop();
    listener.stop();
}

#[test]
fn dead_letters_survive_in_the_configured_file() {
    let dir = tempfile::tempdir().unwrap();
    let world = World::new(1);
    world
        .stream
        .append(EVENTS, PartitionId(0), "junk", vec![0xde, 0xad])
        .unwrap();
    world.producer.send(&tracking("P", 1)).unwrap();

    let handle = world.pipeline(config(dir.path())).start().unwrap();
    assert!(wait_for(|| world.table.len(TABLE) == 1));
    assert!(wait_for(|| handle.dead_letters().unwrap().len() == 1));
    handle.stop();
    drop(handle);

    let contents = std::fs::read_to_string(dir.path().join("dead-letters.jsonl")).unwrap();
    assert_eq!(contents.lines().count(), 1);

    let handle = world.pipeline(config(dir.path())).start().unwrap();
    assert_eq!(handle.dead_letters().unwrap().len(), 1);
    let drained = handle
        .drain_dead_letters("store-updater", PartitionId(0))
        .unwrap();
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].payload, vec![0xde, 0xad]);
    assert!(handle.dead_letters().unwrap().is_empty());
    handle.stop();
}

#[test]
fn invalid_config_is_rejected_at_start() {
    let world = World::new(1);
    let mut config = PipelineConfig::default();
    config.consumer.max_batch = 0;
    assert!(matches!(
        world.pipeline(config).start(),
        Err(reactive_pipeline::Error::Config(_))
    ));
}
