use std::time::Duration;

use crate::codec::MalformedEvent;
use crate::error::SinkError;
use crate::stream::Event;

/// What a sink did with a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// The write took effect.
    Applied,
    /// The sink had already seen this event; nothing changed.
    Duplicate,
}

/// The consumer-specific half of a partition consumer: how to decode an
/// event and where to apply it.
///
/// `decode` failures are routed to the dead-letter sink. `apply` failures
/// are retried when [`SinkError::is_transient`], dead-lettered when the sink
/// rejected the write.
pub trait EventHandler: Send + Sync {
    type Mutation: Send;

    fn decode(&self, event: &Event) -> Result<Self::Mutation, MalformedEvent>;

    /// Apply a decoded mutation. Must be idempotent: applying the same event
    /// twice leaves the sink as applying it once.
    fn apply(
        &self,
        event: &Event,
        mutation: &Self::Mutation,
        timeout: Duration,
    ) -> Result<Delivery, SinkError>;
}
