//! Operator alerts.
//!
//! Raised when a partition halts, when retention overtakes a consumer
//! (data loss), or when a consumer keeps failing to reach its collaborators.
//! Delivery is best effort; the halted state itself stays observable through
//! the consumer status.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::error;

#[cfg(feature = "emitter")]
use crate::EventEmitter;

use crate::stream::{PartitionId, SequenceNumber};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A partition stopped advancing and needs remediation.
    PartitionHalted,
    /// Unconsumed events expired from the stream.
    DataLoss,
    /// Reads or writes keep failing; the partition is not halted but is not
    /// making progress either.
    DeliveryStalled,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::PartitionHalted => "partition_halted",
            AlertKind::DataLoss => "data_loss",
            AlertKind::DeliveryStalled => "delivery_stalled",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub consumer: String,
    pub stream_id: String,
    pub partition: PartitionId,
    /// The event the partition is stuck on, when known.
    pub sequence: Option<SequenceNumber>,
    pub message: String,
    pub raised_at: SystemTime,
}

impl Alert {
    pub fn new(
        kind: AlertKind,
        consumer: impl Into<String>,
        stream_id: impl Into<String>,
        partition: PartitionId,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            consumer: consumer.into(),
            stream_id: stream_id.into(),
            partition,
            sequence: None,
            message: message.into(),
            raised_at: SystemTime::now(),
        }
    }

    pub fn with_sequence(mut self, sequence: Option<SequenceNumber>) -> Self {
        self.sequence = sequence;
        self
    }
}

/// Operator channel for alerts.
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: &Alert);
}

impl<T: AlertSink + ?Sized> AlertSink for Arc<T> {
    fn raise(&self, alert: &Alert) {
        (**self).raise(alert)
    }
}

/// Writes alerts to the `tracing` error log.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn raise(&self, alert: &Alert) {
        error!(
            alert = %alert.kind,
            consumer = %alert.consumer,
            stream = %alert.stream_id,
            partition = %alert.partition,
            sequence = ?alert.sequence,
            "{}",
            alert.message
        );
    }
}

/// Keeps raised alerts in memory. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct InMemoryAlertSink {
    alerts: Arc<Mutex<Vec<Alert>>>,
}

impl InMemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn of_kind(&self, kind: AlertKind) -> Vec<Alert> {
        self.alerts()
            .into_iter()
            .filter(|a| a.kind == kind)
            .collect()
    }
}

impl AlertSink for InMemoryAlertSink {
    fn raise(&self, alert: &Alert) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert.clone());
        }
    }
}

/// Emits alerts via an EventEmitter for in-process subscribers, under the
/// alert kind (`"partition_halted"`, ...) with the JSON alert as payload.
/// Requires the `emitter` feature to be enabled.
#[cfg(feature = "emitter")]
pub struct EmitterAlertSink {
    emitter: Mutex<EventEmitter>,
}

#[cfg(feature = "emitter")]
impl EmitterAlertSink {
    pub fn new(emitter: EventEmitter) -> Self {
        Self {
            emitter: Mutex::new(emitter),
        }
    }
}

#[cfg(feature = "emitter")]
impl AlertSink for EmitterAlertSink {
    fn raise(&self, alert: &Alert) {
        let payload = match serde_json::to_string(alert) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to serialize alert");
                return;
            }
        };
        match self.emitter.lock() {
            Ok(mut emitter) => {
                emitter.emit(alert.kind.as_str(), payload);
            }
            Err(_) => error!(alert = %alert.kind, "alert emitter lock poisoned"),
        }
    }
}
