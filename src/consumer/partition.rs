use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::alert::{Alert, AlertKind, AlertSink};
use crate::checkpoint::CheckpointKey;
use crate::error::SinkError;
use crate::stream::{Event, PartitionId, SequenceNumber, StartingPosition};

use super::framework::StreamConsumption;
use super::handler::{Delivery, EventHandler};
use super::retry::{RetryBudget, RetryPolicy};
use super::state::{HaltKind, HaltReason, PartitionState};
use super::ConsumerError;

/// Settings shared by every partition of one consumer.
#[derive(Clone, Debug)]
pub struct ConsumerSettings {
    /// Consumer name; part of every checkpoint and dead-letter key.
    pub consumer: String,
    pub stream_id: String,
    /// Maximum events applied per cycle.
    pub max_batch: usize,
    /// How long a read waits for new records before returning empty.
    pub poll_timeout: Duration,
    /// Timeout handed to every sink call.
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ConsumerSettings {
    pub fn new(consumer: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
            stream_id: stream_id.into(),
            max_batch: 100,
            poll_timeout: Duration::from_secs(1),
            call_timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Result of one successfully applied batch.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Checkpoint the batch started from.
    pub from: Option<SequenceNumber>,
    /// Checkpoint committed at the end of the batch.
    pub checkpoint: Option<SequenceNumber>,
    pub applied: usize,
    pub duplicates: usize,
    pub dead_lettered: usize,
    /// Transient failures that were retried.
    pub retries: u32,
}

impl BatchReport {
    /// Events the batch moved past, whatever happened to them.
    pub fn handled(&self) -> usize {
        self.applied + self.duplicates + self.dead_lettered
    }
}

/// What one [`PartitionConsumer::run_once`] call did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No new events.
    Idle,
    Applied(BatchReport),
    /// The partition is halted, either by this cycle or before it.
    Halted(HaltReason),
}

/// Running totals of one partition consumer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PartitionStats {
    pub cycles: u64,
    pub events_applied: u64,
    pub duplicates: u64,
    pub dead_lettered: u64,
    pub retries: u64,
    pub halts: u64,
    pub last_error: Option<String>,
}

impl PartitionStats {
    fn record(&mut self, report: &BatchReport) {
        self.events_applied += report.applied as u64;
        self.duplicates += report.duplicates as u64;
        self.dead_lettered += report.dead_lettered as u64;
        self.retries += u64::from(report.retries);
    }
}

/// Operator actions that take a partition out of `HALTED`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Remediation {
    /// Resume from the current checkpoint, retrying the event that failed.
    Retry,
    /// Move the checkpoint (backwards to replay, forwards to skip, `None`
    /// for the oldest retained event) and resume.
    ResetCheckpoint {
        #[serde(default)]
        sequence: Option<SequenceNumber>,
    },
    /// Dead-letter the event the partition is stuck on and resume after it.
    SkipToDeadLetter,
    /// Accept that expired events are lost and resume from the oldest
    /// retained event.
    AcknowledgeDataLoss,
}

impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remediation::Retry => write!(f, "retry"),
            Remediation::ResetCheckpoint { sequence: Some(s) } => write!(f, "reset checkpoint to {}", s),
            Remediation::ResetCheckpoint { sequence: None } => write!(f, "reset checkpoint to trim horizon"),
            Remediation::SkipToDeadLetter => write!(f, "skip to dead letter"),
            Remediation::AcknowledgeDataLoss => write!(f, "acknowledge data loss"),
        }
    }
}

enum Step {
    Applied,
    Duplicate,
    DeadLettered,
}

/// Consumes one partition of one stream for one consumer.
///
/// Every cycle reads the checkpoint from the store, polls a bounded batch
/// after it, applies the events one by one in sequence order and commits
/// the last handled sequence number strictly after its write. Nothing is
/// cached between cycles except the state machine, so another instance can
/// take the partition over at any cycle boundary.
pub struct PartitionConsumer<H: EventHandler> {
    handler: H,
    consumption: StreamConsumption,
    alerts: Arc<dyn AlertSink>,
    settings: ConsumerSettings,
    key: CheckpointKey,
    state: PartitionState,
    committed: Option<SequenceNumber>,
    stats: PartitionStats,
}

impl<H: EventHandler> PartitionConsumer<H> {
    pub fn new(
        handler: H,
        consumption: StreamConsumption,
        alerts: Arc<dyn AlertSink>,
        settings: ConsumerSettings,
        partition: PartitionId,
    ) -> Self {
        let key = CheckpointKey::new(
            settings.consumer.clone(),
            settings.stream_id.clone(),
            partition,
        );
        Self {
            handler,
            consumption,
            alerts,
            settings,
            key,
            state: PartitionState::ColdStart,
            committed: None,
            stats: PartitionStats::default(),
        }
    }

    pub fn key(&self) -> &CheckpointKey {
        &self.key
    }

    pub fn partition(&self) -> PartitionId {
        self.key.partition
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    pub fn state(&self) -> &PartitionState {
        &self.state
    }

    pub fn stats(&self) -> &PartitionStats {
        &self.stats
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Checkpoint as last read or written by this consumer.
    pub fn committed(&self) -> Option<SequenceNumber> {
        self.committed
    }

    /// Checkpoint as currently stored.
    pub fn checkpoint(&self) -> Result<Option<SequenceNumber>, ConsumerError> {
        self.consumption.load_checkpoint(&self.key)
    }

    /// Run one poll → apply → checkpoint cycle.
    ///
    /// Transient failures that outlive the cycle are returned as errors and
    /// leave the partition where it was; fatal ones halt the partition and
    /// are reported as [`CycleOutcome::Halted`].
    pub fn run_once(&mut self) -> Result<CycleOutcome, ConsumerError> {
        if let Some(reason) = self.state.halt_reason() {
            return Ok(CycleOutcome::Halted(reason.clone()));
        }
        self.stats.cycles += 1;

        match self.cycle() {
            Ok(outcome) => {
                self.stats.last_error = None;
                Ok(outcome)
            }
            Err(err) if err.is_transient() => {
                warn!(
                    consumer = %self.settings.consumer,
                    stream = %self.settings.stream_id,
                    partition = %self.key.partition,
                    error = %err,
                    "consumer cycle failed"
                );
                self.stats.last_error = Some(err.to_string());
                Err(err)
            }
            Err(err) => {
                self.stats.last_error = Some(err.to_string());
                let reason = match &err {
                    ConsumerError::RetentionExceeded { oldest, .. } => HaltReason::new(
                        HaltKind::RetentionExceeded,
                        Some(*oldest),
                        err.to_string(),
                    ),
                    ConsumerError::CheckpointConflict { .. } => {
                        HaltReason::new(HaltKind::CheckpointConflict, None, err.to_string())
                    }
                    _ => HaltReason::new(HaltKind::RetriesExhausted, None, err.to_string()),
                };
                Ok(self.halt(reason))
            }
        }
    }

    /// Run cycles until the partition is idle or halted.
    pub fn run_until_idle(&mut self) -> Result<CycleOutcome, ConsumerError> {
        loop {
            match self.run_once()? {
                CycleOutcome::Applied(_) => continue,
                outcome => return Ok(outcome),
            }
        }
    }

    fn cycle(&mut self) -> Result<CycleOutcome, ConsumerError> {
        let stored = self.consumption.load_checkpoint(&self.key)?;
        if self.state == PartitionState::ColdStart {
            info!(
                consumer = %self.settings.consumer,
                stream = %self.settings.stream_id,
                partition = %self.key.partition,
                from = %StartingPosition::from_checkpoint(stored),
                "partition consumer starting"
            );
        }
        self.committed = stored;

        let mut poll = self.consumption.poll(
            &self.settings.stream_id,
            self.key.partition,
            StartingPosition::from_checkpoint(stored),
            self.settings.max_batch,
            self.settings.poll_timeout,
        );
        let mut budget = self.settings.retry.budget();
        let mut report = BatchReport {
            from: stored,
            ..BatchReport::default()
        };
        let mut last_handled: Option<SequenceNumber> = None;

        for item in poll.by_ref() {
            let event = match item {
                Ok(event) => event,
                Err(err) => {
                    self.commit(last_handled, &mut report)?;
                    return Err(err);
                }
            };

            match self.process_event(&event, &mut budget, &mut report.retries) {
                Ok(Step::Applied) => report.applied += 1,
                Ok(Step::Duplicate) => report.duplicates += 1,
                Ok(Step::DeadLettered) => report.dead_lettered += 1,
                Err(message) => {
                    self.commit(last_handled, &mut report)?;
                    return Ok(self.halt(HaltReason::new(
                        HaltKind::RetriesExhausted,
                        Some(event.sequence_number),
                        message,
                    )));
                }
            }
            last_handled = Some(event.sequence_number);
        }

        if last_handled.is_none() {
            self.state = self.state.advance(true);
            return Ok(CycleOutcome::Idle);
        }

        self.commit(last_handled, &mut report)?;
        let previous = self.state.name();
        self.state = self.state.advance(poll.at_tip());
        if previous != self.state.name() {
            info!(
                consumer = %self.settings.consumer,
                partition = %self.key.partition,
                from = previous,
                to = self.state.name(),
                "partition state changed"
            );
        }
        debug!(
            consumer = %self.settings.consumer,
            partition = %self.key.partition,
            applied = report.applied,
            duplicates = report.duplicates,
            dead_lettered = report.dead_lettered,
            checkpoint = ?report.checkpoint,
            "batch applied"
        );
        Ok(CycleOutcome::Applied(report))
    }

    /// Commit progress and fold it into the running totals.
    fn commit(
        &mut self,
        last_handled: Option<SequenceNumber>,
        report: &mut BatchReport,
    ) -> Result<(), ConsumerError> {
        self.stats.record(report);
        if let Some(sequence) = last_handled {
            self.consumption.checkpoint(&self.key, sequence)?;
            self.committed = Some(sequence);
            report.checkpoint = Some(sequence);
        }
        Ok(())
    }

    /// Apply one event. `Err` carries the failure message once the batch's
    /// retry budget is spent.
    fn process_event(
        &self,
        event: &Event,
        budget: &mut RetryBudget,
        retries: &mut u32,
    ) -> Result<Step, String> {
        let delivery = match self.handler.decode(event) {
            Err(malformed) => Err(malformed.to_string()),
            Ok(mutation) => loop {
                match self
                    .handler
                    .apply(event, &mutation, self.settings.call_timeout)
                {
                    Ok(delivery) => break Ok(delivery),
                    Err(SinkError::Rejected(reason)) => {
                        break Err(format!("rejected by sink: {}", reason))
                    }
                    Err(err) => self.back_off(event, "apply", &err, budget, retries)?,
                }
            },
        };

        match delivery {
            Ok(Delivery::Applied) => Ok(Step::Applied),
            Ok(Delivery::Duplicate) => Ok(Step::Duplicate),
            Err(reason) => loop {
                match self
                    .consumption
                    .dead_letter(&self.settings.consumer, event, &reason)
                {
                    Ok(_) => break Ok(Step::DeadLettered),
                    Err(err) => self.back_off(event, "dead_letter", &err, budget, retries)?,
                }
            },
        }
    }

    fn back_off(
        &self,
        event: &Event,
        operation: &'static str,
        err: &dyn fmt::Display,
        budget: &mut RetryBudget,
        retries: &mut u32,
    ) -> Result<(), String> {
        *retries += 1;
        match budget.record_failure() {
            Some(delay) => {
                let backoff_ms = delay.as_millis() as u64;
                warn!(
                    consumer = %self.settings.consumer,
                    partition = %self.key.partition,
                    sequence = %event.sequence_number,
                    operation,
                    attempt = budget.failures(),
                    backoff_ms,
                    error = %err,
                    "transient failure, retrying"
                );
                thread::sleep(delay);
                Ok(())
            }
            None => Err(format!(
                "{} failed after {} attempts: {}",
                operation,
                budget.failures(),
                err
            )),
        }
    }

    fn halt(&mut self, reason: HaltReason) -> CycleOutcome {
        error!(
            consumer = %self.settings.consumer,
            stream = %self.settings.stream_id,
            partition = %self.key.partition,
            checkpoint = ?self.committed,
            reason = %reason,
            "partition halted"
        );
        self.stats.halts += 1;

        let kind = match reason.kind {
            HaltKind::RetentionExceeded => AlertKind::DataLoss,
            _ => AlertKind::PartitionHalted,
        };
        self.alerts.raise(
            &Alert::new(
                kind,
                self.settings.consumer.clone(),
                self.settings.stream_id.clone(),
                self.key.partition,
                reason.message.clone(),
            )
            .with_sequence(reason.sequence),
        );

        self.state = PartitionState::Halted {
            reason: reason.clone(),
        };
        CycleOutcome::Halted(reason)
    }

    /// Apply an operator remediation and return the new state.
    ///
    /// `ResetCheckpoint` is accepted in any state; every other action
    /// requires a halted partition whose halt it addresses.
    pub fn remediate(&mut self, remediation: Remediation) -> Result<PartitionState, ConsumerError> {
        let reason = self.state.halt_reason().cloned();
        match (&remediation, reason) {
            (Remediation::ResetCheckpoint { sequence }, _) => {
                self.consumption.reset_checkpoint(&self.key, *sequence)?;
                self.committed = *sequence;
            }
            (_, None) => {
                return Err(ConsumerError::InvalidRemediation(format!(
                    "{} requested but partition {} is {}",
                    remediation, self.key.partition, self.state
                )))
            }
            (Remediation::Retry, Some(_)) => {}
            (Remediation::SkipToDeadLetter, Some(reason)) => self.skip_to_dead_letter(&reason)?,
            (Remediation::AcknowledgeDataLoss, Some(reason)) => {
                if reason.kind != HaltKind::RetentionExceeded {
                    return Err(ConsumerError::InvalidRemediation(format!(
                        "partition {} did not lose data: {}",
                        self.key.partition, reason
                    )));
                }
                self.consumption.reset_checkpoint(&self.key, None)?;
                self.committed = None;
            }
        }

        info!(
            consumer = %self.settings.consumer,
            partition = %self.key.partition,
            action = %remediation,
            "partition remediated"
        );
        self.state = PartitionState::CatchingUp;
        Ok(self.state.clone())
    }

    fn skip_to_dead_letter(&mut self, reason: &HaltReason) -> Result<(), ConsumerError> {
        let Some(stuck) = reason.sequence.filter(|_| reason.kind == HaltKind::RetriesExhausted)
        else {
            return Err(ConsumerError::InvalidRemediation(format!(
                "partition {} is not stuck on an event: {}",
                self.key.partition, reason
            )));
        };

        let stored = self.consumption.load_checkpoint(&self.key)?;
        let event = self
            .consumption
            .poll(
                &self.settings.stream_id,
                self.key.partition,
                StartingPosition::from_checkpoint(stored),
                1,
                Duration::ZERO,
            )
            .next()
            .transpose()?
            .filter(|event| event.sequence_number == stuck)
            .ok_or_else(|| {
                ConsumerError::InvalidRemediation(format!(
                    "event {} is no longer next on partition {}",
                    stuck, self.key.partition
                ))
            })?;

        let note = format!("skipped by operator: {}", reason.message);
        self.consumption
            .dead_letter(&self.settings.consumer, &event, &note)?;
        self.consumption.checkpoint(&self.key, stuck)?;
        self.committed = Some(stuck);
        self.stats.dead_lettered += 1;
        Ok(())
    }
}
