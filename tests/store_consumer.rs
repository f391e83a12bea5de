//! Store-Update Consumer: ordered, idempotent upserts into the durable table.

mod support;

use std::time::{Duration, SystemTime};

use reactive_pipeline::consumer::HaltKind;
use reactive_pipeline::{
    AlertKind, CheckpointKey, CheckpointStore, CycleOutcome, DeadLetterSink, DurableStore,
    EntityMutation, InMemoryStream, PartitionId, PartitionState, PayloadFormat, RecordKey,
    Remediation, SequenceNumber,
};

use support::{mutation, Harness, EVENTS, TABLE};

fn record_status(harness: &Harness, id: &str, customer_id: i64) -> Option<String> {
    harness
        .table
        .get_item(TABLE, &RecordKey::new(id, customer_id))
        .unwrap()
        .and_then(|record| record.attribute("status").map(str::to_string))
}

#[test]
fn last_write_wins_and_checkpoint_follows() {
    let harness = Harness::new(1);
    harness.append_event(0, &mutation("A", 1, &[("status", "new")]));
    harness.append_event(0, &mutation("A", 1, &[("status", "done")]));

    let mut consumer = harness.store_consumer(0, 3);
    assert_eq!(consumer.run_until_idle().unwrap(), CycleOutcome::Idle);

    assert_eq!(harness.table.len(TABLE), 1);
    assert_eq!(record_status(&harness, "A", 1).as_deref(), Some("done"));
    assert_eq!(consumer.checkpoint().unwrap(), Some(SequenceNumber(2)));
    assert_eq!(consumer.state(), &PartitionState::SteadyState);
}

#[test]
fn replaying_a_prefix_changes_nothing() {
    let harness = Harness::new(1);
    harness.append_event(0, &mutation("A", 1, &[("status", "new")]));
    harness.append_event(0, &mutation("B", 1, &[("status", "new")]));
    harness.append_event(0, &mutation("A", 1, &[("status", "done")]));

    let mut consumer = harness.store_consumer(0, 3);
    consumer.run_until_idle().unwrap();
    let before = harness.table.records(TABLE);
    let writes = harness.table.write_log().len();

    consumer
        .remediate(Remediation::ResetCheckpoint { sequence: None })
        .unwrap();
    match consumer.run_once().unwrap() {
        CycleOutcome::Applied(report) => {
            assert_eq!(report.applied, 0);
            assert_eq!(report.duplicates, 3);
            assert_eq!(report.checkpoint, Some(SequenceNumber(3)));
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let after = harness.table.records(TABLE);
    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(after.iter()) {
        assert_eq!(b.key(), a.key());
        assert_eq!(b.attributes, a.attributes);
        assert_eq!(b.marker, a.marker);
    }
    assert_eq!(harness.table.write_log().len(), writes);
}

#[test]
fn writes_are_applied_in_sequence_order() {
    let harness = Harness::new(1);
    for i in 0..20 {
        harness.append_event(0, &mutation(&format!("E{}", i % 4), 1, &[("n", &i.to_string())]));
    }
    let mut consumer = harness.store_consumer(0, 3);
    consumer.run_until_idle().unwrap();

    let sequences: Vec<u64> = harness
        .table
        .write_log()
        .into_iter()
        .filter_map(|(_, marker)| marker.map(|m| m.sequence.value()))
        .collect();
    let mut sorted = sequences.clone();
    sorted.sort_unstable();
    assert_eq!(sequences, sorted);
    assert_eq!(sequences.len(), 20);
}

#[test]
fn restart_after_lost_checkpoint_is_safe() {
    let harness = Harness::new(1);
    harness.append_event(0, &mutation("A", 1, &[("status", "new")]));
    harness.append_event(0, &mutation("A", 1, &[("status", "done")]));
    harness.append_event(0, &mutation("C", 9, &[("status", "new")]));

    let mut first = harness.store_consumer(0, 3);
    first.run_until_idle().unwrap();
    let before = harness.table.records(TABLE);

    // The writes landed but the last checkpoint did not.
    let key = CheckpointKey::new("store-updater", EVENTS, PartitionId(0));
    harness.checkpoints.reset(&key, Some(SequenceNumber(1))).unwrap();
    drop(first);

    let mut second = harness.store_consumer(0, 3);
    second.run_until_idle().unwrap();

    let after = harness.table.records(TABLE);
    assert_eq!(
        before.iter().map(|r| (r.key(), r.attributes.clone())).collect::<Vec<_>>(),
        after.iter().map(|r| (r.key(), r.attributes.clone())).collect::<Vec<_>>(),
    );
    assert_eq!(second.checkpoint().unwrap(), Some(SequenceNumber(3)));
    assert_eq!(second.stats().duplicates, 2);
}

#[test]
fn malformed_event_is_dead_lettered_exactly_once() {
    let harness = Harness::new(1);
    harness.append_event(0, &mutation("A", 1, &[("status", "new")]));
    harness
        .stream
        .append(EVENTS, PartitionId(0), "A:1", b"{not json".to_vec())
        .unwrap();
    harness.append_event(0, &mutation("A", 1, &[("status", "done")]));

    let mut consumer = harness.store_consumer(0, 3);
    consumer.run_until_idle().unwrap();
    assert_eq!(record_status(&harness, "A", 1).as_deref(), Some("done"));
    assert_eq!(consumer.checkpoint().unwrap(), Some(SequenceNumber(3)));

    // A replay meets the same malformed event again.
    consumer
        .remediate(Remediation::ResetCheckpoint { sequence: None })
        .unwrap();
    consumer.run_until_idle().unwrap();

    let letters = harness.dead_letters.list().unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].sequence_number, SequenceNumber(2));
    assert_eq!(letters[0].payload, b"{not json".to_vec());
}

#[test]
fn exhausted_retries_halt_before_the_failing_event() {
    let harness = Harness::new(3);
    for i in 1..=4 {
        harness.append_event(2, &mutation(&format!("K{}", i), 1, &[("status", "new")]));
    }
    harness.append_event(2, &mutation("X", 1, &[("status", "new")]));
    harness.append_event(2, &mutation("K6", 1, &[("status", "new")]));
    harness.table.block_key(RecordKey::new("X", 1));

    let mut consumer = harness.store_consumer(2, 3);
    let reason = match consumer.run_once().unwrap() {
        CycleOutcome::Halted(reason) => reason,
        other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(reason.kind, HaltKind::RetriesExhausted);
    assert_eq!(reason.sequence, Some(SequenceNumber(5)));
    assert_eq!(consumer.checkpoint().unwrap(), Some(SequenceNumber(4)));
    assert!(consumer.state().is_halted());
    assert_eq!(harness.alerts.of_kind(AlertKind::PartitionHalted).len(), 1);

    // Halted: nothing at or after seq 5 is applied, however often we poll.
    assert!(matches!(consumer.run_once().unwrap(), CycleOutcome::Halted(_)));
    assert!(record_status(&harness, "X", 1).is_none());
    assert!(record_status(&harness, "K6", 1).is_none());

    harness.table.unblock_key(&RecordKey::new("X", 1));
    assert_eq!(
        consumer.remediate(Remediation::Retry).unwrap(),
        PartitionState::CatchingUp
    );
    consumer.run_until_idle().unwrap();
    assert_eq!(consumer.checkpoint().unwrap(), Some(SequenceNumber(6)));
    assert_eq!(record_status(&harness, "X", 1).as_deref(), Some("new"));
}

#[test]
fn skip_to_dead_letter_moves_past_the_stuck_event() {
    let harness = Harness::new(1);
    harness.append_event(0, &mutation("X", 1, &[("status", "new")]));
    harness.append_event(0, &mutation("Y", 1, &[("status", "new")]));
    harness.table.block_key(RecordKey::new("X", 1));

    let mut consumer = harness.store_consumer(0, 2);
    assert!(matches!(consumer.run_once().unwrap(), CycleOutcome::Halted(_)));
    assert_eq!(consumer.checkpoint().unwrap(), None);

    consumer.remediate(Remediation::SkipToDeadLetter).unwrap();
    consumer.run_until_idle().unwrap();

    assert_eq!(consumer.checkpoint().unwrap(), Some(SequenceNumber(2)));
    assert!(record_status(&harness, "X", 1).is_none());
    assert_eq!(record_status(&harness, "Y", 1).as_deref(), Some("new"));
    let letters = harness.dead_letters.list().unwrap();
    assert_eq!(letters.len(), 1);
    assert!(letters[0].reason.starts_with("skipped by operator"));
}

#[test]
fn transient_failures_within_budget_are_absorbed() {
    let harness = Harness::new(1);
    harness.append_event(0, &mutation("A", 1, &[("status", "new")]));
    harness.table.fail_next_puts(2);

    let mut consumer = harness.store_consumer(0, 5);
    match consumer.run_once().unwrap() {
        CycleOutcome::Applied(report) => {
            assert_eq!(report.applied, 1);
            assert_eq!(report.retries, 2);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(harness.alerts.alerts().is_empty());
}

#[test]
fn one_halted_partition_does_not_block_another() {
    let harness = Harness::new(2);
    harness.append_event(0, &mutation("X", 1, &[("status", "new")]));
    harness.append_event(1, &mutation("Y", 1, &[("status", "new")]));
    harness.table.block_key(RecordKey::new("X", 1));

    let mut p0 = harness.store_consumer(0, 2);
    let mut p1 = harness.store_consumer(1, 2);
    assert!(matches!(p0.run_once().unwrap(), CycleOutcome::Halted(_)));
    assert!(matches!(p1.run_once().unwrap(), CycleOutcome::Applied(_)));
    assert_eq!(record_status(&harness, "Y", 1).as_deref(), Some("new"));
}

#[test]
fn expired_checkpoint_requires_acknowledging_data_loss() {
    let mut harness = Harness::new(1);
    harness.stream = InMemoryStream::with_retention(Duration::from_secs(60));
    harness.stream.create_stream(EVENTS, 1).unwrap();

    let now = SystemTime::now();
    let old = now - Duration::from_secs(120);
    let json = |m: EntityMutation| support::payload(&m, PayloadFormat::Json);
    for (id, at) in [("A", old), ("B", old), ("C", old), ("D", now)] {
        harness
            .stream
            .append_at(EVENTS, PartitionId(0), id, json(mutation(id, 1, &[])), at)
            .unwrap();
        if id == "A" {
            harness.store_consumer(0, 2).run_until_idle().unwrap();
        }
    }
    assert_eq!(harness.stream.expire(now).unwrap(), 3);

    let mut consumer = harness.store_consumer(0, 2);
    let reason = match consumer.run_once().unwrap() {
        CycleOutcome::Halted(reason) => reason,
        other => panic!("unexpected outcome {:?}", other),
    };
    assert_eq!(reason.kind, HaltKind::RetentionExceeded);
    assert_eq!(harness.alerts.of_kind(AlertKind::DataLoss).len(), 1);
    assert!(consumer.remediate(Remediation::SkipToDeadLetter).is_err());

    consumer.remediate(Remediation::AcknowledgeDataLoss).unwrap();
    consumer.run_until_idle().unwrap();
    assert_eq!(consumer.checkpoint().unwrap(), Some(SequenceNumber(4)));
    assert_eq!(harness.table.len(TABLE), 2);
}
