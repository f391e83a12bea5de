use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::debug;

use crate::codec::{decode_mutation, EntityMutation, MalformedEvent, PayloadFormat};
use crate::consumer::{Delivery, EventHandler};
use crate::error::SinkError;
use crate::stream::Event;

use super::{CacheMessage, CachePublisher, DEFAULT_CHANNEL};

/// Cache key of an entity: `"{id}:{customer_id}"`.
pub fn cache_key(id: &str, customer_id: i64) -> String {
    format!("{}:{}", id, customer_id)
}

/// The Cache-Update Consumer: turns entity mutations from the
/// cache-invalidation stream into versioned messages on the cache channel.
///
/// The version is the producer's when present, the event's production time
/// in milliseconds otherwise, so redelivered events always carry the version
/// they were first published with. The event's sequence number travels with
/// it and orders updates of one key that share a version.
#[derive(Clone)]
pub struct CacheUpdateHandler {
    publisher: Arc<dyn CachePublisher>,
    channel: String,
    format: PayloadFormat,
}

impl CacheUpdateHandler {
    pub fn new(publisher: Arc<dyn CachePublisher>) -> Self {
        Self {
            publisher,
            channel: DEFAULT_CHANNEL.to_string(),
            format: PayloadFormat::Json,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_format(mut self, format: PayloadFormat) -> Self {
        self.format = format;
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// The message published for a mutation carried by `event`.
    pub fn message_for(&self, event: &Event, mutation: &EntityMutation) -> CacheMessage {
        let version = mutation
            .version
            .unwrap_or_else(|| event.produced_at_millis());
        CacheMessage::new(
            cache_key(&mutation.id, mutation.customer_id),
            json!({
                "id": mutation.id,
                "customerId": mutation.customer_id,
                "attrs": mutation.attributes,
            }),
            version,
        )
        .with_sequence(event.sequence_number.value())
    }
}

impl EventHandler for CacheUpdateHandler {
    type Mutation = EntityMutation;

    fn decode(&self, event: &Event) -> Result<EntityMutation, MalformedEvent> {
        decode_mutation(&event.payload, self.format)
    }

    fn apply(
        &self,
        event: &Event,
        mutation: &EntityMutation,
        timeout: Duration,
    ) -> Result<Delivery, SinkError> {
        let message = self.message_for(event, mutation);
        let receivers = self.publisher.publish(&self.channel, &message, timeout)?;
        debug!(
            channel = %self.channel,
            key = %message.key,
            version = message.version,
            receivers,
            event = %event.event_id(),
            "cache update published"
        );
        Ok(Delivery::Applied)
    }
}
