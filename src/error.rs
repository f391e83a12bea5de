//! Crate-level error types.
//!
//! Each boundary has its own error enum (`StreamError`, `CheckpointError`,
//! `SinkError`, `ConsumerError`, ...). [`Error`] aggregates them for callers
//! that wire the whole pipeline together.

use std::time::Duration;

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::consumer::ConsumerError;
use crate::producer::ProducerError;
use crate::stream::StreamError;

/// Failure reported by a write-side collaborator: the durable store, the
/// cache channel or the dead-letter sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// The backend could not be reached.
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    /// The call did not complete within its timeout.
    #[error("sink call timed out after {0:?}")]
    Timeout(Duration),
    /// The backend refused this particular write; retrying will not help.
    #[error("write rejected: {0}")]
    Rejected(String),
    /// Local storage failure (I/O, poisoned lock, corrupt file).
    #[error("sink storage error: {0}")]
    Storage(String),
}

impl SinkError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, SinkError::Rejected(_))
    }
}

/// Top-level error for pipeline assembly and operator calls.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Producer(#[from] ProducerError),
    #[error("unknown consumer: {0}")]
    UnknownConsumer(String),
    #[error("pipeline is missing its {0}")]
    MissingCollaborator(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
