use std::fmt;

use serde::{Deserialize, Serialize};

use crate::stream::SequenceNumber;

/// Lifecycle of one (consumer, partition) pair.
///
/// ```text
/// COLD_START ──▶ CATCHING_UP ──▶ STEADY_STATE
///      │              │   ▲            │
///      │              │   └────────────┤ (fell behind)
///      └──────────────┴────────────────┴──▶ HALTED ──(remediation)──▶ CATCHING_UP
/// ```
///
/// `HALTED` is terminal until an operator remediates the partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartitionState {
    /// No checkpoint has been read yet.
    ColdStart,
    /// Reading a backlog; the last page did not reach the end of the log.
    CatchingUp,
    /// Caught up with the end of the log.
    SteadyState,
    Halted { reason: HaltReason },
}

impl PartitionState {
    /// Transition after a successful cycle. A halted partition stays halted.
    pub fn advance(&self, at_tip: bool) -> PartitionState {
        match self {
            PartitionState::Halted { .. } => self.clone(),
            _ if at_tip => PartitionState::SteadyState,
            _ => PartitionState::CatchingUp,
        }
    }

    pub fn is_halted(&self) -> bool {
        matches!(self, PartitionState::Halted { .. })
    }

    pub fn halt_reason(&self) -> Option<&HaltReason> {
        match self {
            PartitionState::Halted { reason } => Some(reason),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PartitionState::ColdStart => "COLD_START",
            PartitionState::CatchingUp => "CATCHING_UP",
            PartitionState::SteadyState => "STEADY_STATE",
            PartitionState::Halted { .. } => "HALTED",
        }
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltKind {
    /// Transient failures used up the batch's retry budget.
    RetriesExhausted,
    /// The observed or stored position went backwards.
    CheckpointConflict,
    /// The checkpoint points at records already evicted from the stream.
    RetentionExceeded,
}

/// Why a partition halted, and where.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HaltReason {
    pub kind: HaltKind,
    /// The event the partition is stuck on, when there is one.
    pub sequence: Option<SequenceNumber>,
    pub message: String,
}

impl HaltReason {
    pub fn new(kind: HaltKind, sequence: Option<SequenceNumber>, message: impl Into<String>) -> Self {
        Self {
            kind,
            sequence,
            message: message.into(),
        }
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sequence {
            Some(sequence) => write!(f, "{:?} at {}: {}", self.kind, sequence, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}
