//! One worker thread per partition.

use std::collections::BTreeMap;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::alert::{Alert, AlertKind, AlertSink};
use crate::stream::{PartitionId, SequenceNumber};

use super::framework::StreamConsumption;
use super::handler::EventHandler;
use super::partition::{
    ConsumerSettings, CycleOutcome, PartitionConsumer, PartitionStats, Remediation,
};
use super::state::PartitionState;
use super::ConsumerError;

/// How often a halted worker wakes up to refresh its status.
const HALTED_WAIT: Duration = Duration::from_millis(100);

/// How long an operator call waits for a busy worker to answer.
const REMEDIATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Observable status of one partition worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PartitionStatus {
    pub consumer: String,
    pub stream_id: String,
    pub partition: PartitionId,
    pub state: PartitionState,
    pub checkpoint: Option<SequenceNumber>,
    /// Failed cycles in a row; reset by the next successful cycle.
    pub consecutive_failures: u32,
    pub stats: PartitionStats,
}

/// Final statistics of a stopped group, per partition.
#[derive(Clone, Debug, Default)]
pub struct GroupStats {
    pub partitions: BTreeMap<PartitionId, PartitionStats>,
}

impl GroupStats {
    pub fn events_applied(&self) -> u64 {
        self.partitions.values().map(|s| s.events_applied).sum()
    }

    pub fn dead_lettered(&self) -> u64 {
        self.partitions.values().map(|s| s.dead_lettered).sum()
    }
}

type RemediationReply = Sender<Result<PartitionState, ConsumerError>>;

enum Control {
    Stop,
    Remediate(Remediation, RemediationReply),
}

struct Worker {
    partition: PartitionId,
    control_tx: Sender<Control>,
    handle: Option<JoinHandle<PartitionStats>>,
}

type StatusBoard = Arc<RwLock<BTreeMap<PartitionId, PartitionStatus>>>;

/// All partitions of one stream, consumed by one named consumer.
///
/// Each partition gets its own thread running a [`PartitionConsumer`], so
/// events of one partition are applied strictly in order while partitions
/// progress independently. Stop requests are only observed between cycles:
/// an in-flight batch always finishes and checkpoints first.
///
/// ## Example
///
/// ```ignore
/// let group = ConsumerGroup::spawn(
///     consumption,
///     ConsumerSettings::new("store-updater", "reactive-system-event-stream"),
///     Arc::new(LogAlertSink),
///     |_partition| StoreUpdateHandler::new(store.clone(), "ProgramTable"),
/// )?;
///
/// // ... later, an operator clears a halt
/// group.remediate(PartitionId(2), Remediation::Retry)?;
///
/// let stats = group.stop();
/// println!("applied {} events", stats.events_applied());
/// ```
pub struct ConsumerGroup {
    consumer: String,
    stream_id: String,
    workers: Mutex<Vec<Worker>>,
    status: StatusBoard,
}

impl ConsumerGroup {
    /// Start one worker per partition of `settings.stream_id`.
    pub fn spawn<H, F>(
        consumption: StreamConsumption,
        settings: ConsumerSettings,
        alerts: Arc<dyn AlertSink>,
        make_handler: F,
    ) -> Result<Self, ConsumerError>
    where
        H: EventHandler + 'static,
        F: Fn(PartitionId) -> H,
    {
        let partitions = consumption.shards(&settings.stream_id)?;
        let status: StatusBoard = Arc::new(RwLock::new(BTreeMap::new()));
        let mut workers = Vec::with_capacity(partitions.len());

        for partition in partitions {
            let consumer = PartitionConsumer::new(
                make_handler(partition),
                consumption.clone(),
                Arc::clone(&alerts),
                settings.clone(),
                partition,
            );
            let (control_tx, control_rx) = channel();
            let board = Arc::clone(&status);
            let alerts = Arc::clone(&alerts);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", settings.consumer, partition))
                .spawn(move || run_worker(consumer, control_rx, board, alerts))
                .map_err(|e| ConsumerError::TransientIo {
                    operation: "spawn",
                    message: e.to_string(),
                })?;
            workers.push(Worker {
                partition,
                control_tx,
                handle: Some(handle),
            });
        }

        info!(
            consumer = %settings.consumer,
            stream = %settings.stream_id,
            partitions = workers.len(),
            "consumer group started"
        );

        Ok(Self {
            consumer: settings.consumer,
            stream_id: settings.stream_id,
            workers: Mutex::new(workers),
            status,
        })
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Latest status of every partition, ordered by partition.
    pub fn status(&self) -> Vec<PartitionStatus> {
        self.status
            .read()
            .map(|board| board.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn partition_status(&self, partition: PartitionId) -> Option<PartitionStatus> {
        self.status
            .read()
            .ok()
            .and_then(|board| board.get(&partition).cloned())
    }

    /// Whether no partition is halted.
    pub fn is_healthy(&self) -> bool {
        self.status().iter().all(|s| !s.state.is_halted())
    }

    /// Hand an operator remediation to a partition's worker and wait for it
    /// to be applied.
    pub fn remediate(
        &self,
        partition: PartitionId,
        remediation: Remediation,
    ) -> Result<PartitionState, ConsumerError> {
        let (reply_tx, reply_rx) = channel();
        {
            let workers = self.workers.lock().map_err(|_| ConsumerError::TransientIo {
                operation: "remediate",
                message: "worker registry lock poisoned".into(),
            })?;
            let worker = workers
                .iter()
                .find(|w| w.partition == partition)
                .ok_or_else(|| {
                    ConsumerError::InvalidRemediation(format!(
                        "{} has no partition {}",
                        self.consumer, partition
                    ))
                })?;
            worker
                .control_tx
                .send(Control::Remediate(remediation, reply_tx))
                .map_err(|_| ConsumerError::InvalidRemediation(format!(
                    "worker for partition {} has stopped",
                    partition
                )))?;
        }

        reply_rx
            .recv_timeout(REMEDIATE_TIMEOUT)
            .map_err(|_| ConsumerError::TransientIo {
                operation: "remediate",
                message: format!("partition {} worker did not answer", partition),
            })?
    }

    /// Signal every worker to stop without waiting.
    pub fn signal_stop(&self) {
        if let Ok(workers) = self.workers.lock() {
            for worker in workers.iter() {
                let _ = worker.control_tx.send(Control::Stop);
            }
        }
    }

    /// Stop every worker after its in-flight batch and wait for them.
    /// Returns per-partition statistics.
    pub fn stop(&self) -> GroupStats {
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => return GroupStats::default(),
        };
        for worker in &workers {
            let _ = worker.control_tx.send(Control::Stop);
        }

        let mut stats = GroupStats::default();
        for mut worker in workers {
            if let Some(handle) = worker.handle.take() {
                let partition_stats = handle.join().unwrap_or_else(|_| {
                    error!(
                        consumer = %self.consumer,
                        partition = %worker.partition,
                        "partition worker panicked"
                    );
                    PartitionStats::default()
                });
                stats.partitions.insert(worker.partition, partition_stats);
            }
        }
        info!(
            consumer = %self.consumer,
            applied = stats.events_applied(),
            "consumer group stopped"
        );
        stats
    }
}

impl Drop for ConsumerGroup {
    fn drop(&mut self) {
        self.signal_stop();
        // Don't join on drop - let the threads finish their batch naturally
    }
}

fn publish_status<H: EventHandler>(
    board: &StatusBoard,
    consumer: &PartitionConsumer<H>,
    consecutive_failures: u32,
) {
    let status = PartitionStatus {
        consumer: consumer.settings().consumer.clone(),
        stream_id: consumer.settings().stream_id.clone(),
        partition: consumer.partition(),
        state: consumer.state().clone(),
        checkpoint: consumer.committed(),
        consecutive_failures,
        stats: consumer.stats().clone(),
    };
    if let Ok(mut board) = board.write() {
        board.insert(consumer.partition(), status);
    }
}

fn run_worker<H: EventHandler>(
    mut consumer: PartitionConsumer<H>,
    control_rx: Receiver<Control>,
    board: StatusBoard,
    alerts: Arc<dyn AlertSink>,
) -> PartitionStats {
    let mut failures: u32 = 0;
    let mut delay = Duration::ZERO;

    loop {
        publish_status(&board, &consumer, failures);

        let wait = if consumer.state().is_halted() {
            Some(HALTED_WAIT)
        } else if delay > Duration::ZERO {
            Some(delay)
        } else {
            None
        };
        let control = match wait {
            Some(wait) => match control_rx.recv_timeout(wait) {
                Ok(control) => Some(control),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match control_rx.try_recv() {
                Ok(control) => Some(control),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => break,
            },
        };

        match control {
            Some(Control::Stop) => break,
            Some(Control::Remediate(remediation, reply)) => {
                let result = consumer.remediate(remediation);
                if result.is_ok() {
                    failures = 0;
                    delay = Duration::ZERO;
                }
                let _ = reply.send(result);
                continue;
            }
            None => {}
        }

        if consumer.state().is_halted() {
            continue;
        }

        match consumer.run_once() {
            Ok(CycleOutcome::Halted(_)) => {}
            Ok(_) => {
                failures = 0;
                delay = Duration::ZERO;
            }
            Err(err) => {
                failures += 1;
                let retry = &consumer.settings().retry;
                delay = retry.backoff(failures);
                if failures == retry.max_attempts {
                    warn!(
                        consumer = %consumer.settings().consumer,
                        partition = %consumer.partition(),
                        failures,
                        error = %err,
                        "partition is not making progress"
                    );
                    alerts.raise(
                        &Alert::new(
                            AlertKind::DeliveryStalled,
                            consumer.settings().consumer.clone(),
                            consumer.settings().stream_id.clone(),
                            consumer.partition(),
                            err.to_string(),
                        )
                        .with_sequence(consumer.committed().and_then(SequenceNumber::next)),
                    );
                }
            }
        }
    }

    publish_status(&board, &consumer, failures);
    consumer.stats().clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    use crate::alert::InMemoryAlertSink;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::codec::MalformedEvent;
    use crate::consumer::{Delivery, RetryPolicy};
    use crate::dead_letter::InMemoryDeadLetterSink;
    use crate::error::SinkError;
    use crate::stream::{Event, InMemoryStream};

    struct Toggle {
        down: Arc<AtomicBool>,
    }

    impl EventHandler for Toggle {
        type Mutation = ();

        fn decode(&self, _event: &Event) -> Result<(), MalformedEvent> {
            Ok(())
        }

        fn apply(&self, _event: &Event, _m: &(), _timeout: Duration) -> Result<Delivery, SinkError> {
            if self.down.load(Ordering::SeqCst) {
                Err(SinkError::Unavailable("down".into()))
            } else {
                Ok(Delivery::Applied)
            }
        }
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
    fn halted_worker_resumes_after_remediation() {
        let stream = InMemoryStream::new();
        stream.create_stream("events", 2).unwrap();
        for p in 0..2 {
            stream.append("events", PartitionId(p), "k", vec![1]).unwrap();
        }
        let down = Arc::new(AtomicBool::new(true));
        let consumption = StreamConsumption::new(
            Arc::new(stream.clone()),
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(InMemoryDeadLetterSink::new()),
        );
        let settings = ConsumerSettings::new("toggle", "events")
            .with_poll_timeout(Duration::from_millis(5))
            .with_retry(
                RetryPolicy::default()
                    .with_max_attempts(2)
                    .with_initial_backoff(Duration::from_millis(1)),
            );
        let alerts = InMemoryAlertSink::new();
        let flag = Arc::clone(&down);
        let group = ConsumerGroup::spawn(consumption, settings, Arc::new(alerts.clone()), move |_| {
            Toggle {
                down: Arc::clone(&flag),
            }
        })
        .unwrap();

        assert!(wait_for(|| group.status().iter().filter(|s| s.state.is_halted()).count() == 2));
        assert!(!group.is_healthy());

        down.store(false, Ordering::SeqCst);
        let state = group.remediate(PartitionId(1), Remediation::Retry).unwrap();
        assert_eq!(state, PartitionState::CatchingUp);
        assert!(wait_for(|| group
            .partition_status(PartitionId(1))
            .map(|s| s.checkpoint == Some(SequenceNumber(1)))
            .unwrap_or(false)));
        // The other partition stays halted.
        assert!(group
            .partition_status(PartitionId(0))
            .map(|s| s.state.is_halted())
            .unwrap_or(false));

        let stats = group.stop();
        assert_eq!(stats.partitions.len(), 2);
        assert_eq!(stats.events_applied(), 1);
    }

    #[test]
    fn remediating_unknown_partition_fails() {
        let stream = InMemoryStream::new();
        stream.create_stream("events", 1).unwrap();
        let consumption = StreamConsumption::new(
            Arc::new(stream),
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(InMemoryDeadLetterSink::new()),
        );
        let group = ConsumerGroup::spawn(
            consumption,
            ConsumerSettings::new("toggle", "events").with_poll_timeout(Duration::from_millis(5)),
            Arc::new(InMemoryAlertSink::new()),
            |_| Toggle {
                down: Arc::new(AtomicBool::new(false)),
            },
        )
        .unwrap();

        assert!(matches!(
            group.remediate(PartitionId(9), Remediation::Retry),
            Err(ConsumerError::InvalidRemediation(_))
        ));
        group.stop();
    }
}
