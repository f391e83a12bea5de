use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::debug;

use crate::codec::{decode_mutation, EntityMutation, MalformedEvent, PayloadFormat};
use crate::consumer::{Delivery, EventHandler};
use crate::error::SinkError;
use crate::idempotency::IdempotencyMarker;
use crate::stream::Event;

use super::{DurableStore, PutOutcome, StoreRecord};

/// The Store-Update Consumer: applies entity mutations from the event
/// stream to the durable table as idempotent upserts.
#[derive(Clone)]
pub struct StoreUpdateHandler {
    store: Arc<dyn DurableStore>,
    table: String,
    format: PayloadFormat,
}

impl StoreUpdateHandler {
    pub fn new(store: Arc<dyn DurableStore>, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
            format: PayloadFormat::default(),
        }
    }

    pub fn with_format(mut self, format: PayloadFormat) -> Self {
        self.format = format;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl EventHandler for StoreUpdateHandler {
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
        let record = StoreRecord {
            id: mutation.id.clone(),
            customer_id: mutation.customer_id,
            attributes: mutation.attributes.clone(),
            marker: Some(IdempotencyMarker::for_event(event)),
            updated_at: SystemTime::now(),
        };

        match self.store.put_item(&self.table, &record, timeout)? {
            PutOutcome::Applied => Ok(Delivery::Applied),
            PutOutcome::Duplicate => {
                debug!(
                    table = %self.table,
                    key = %record.key(),
                    event = %event.event_id(),
                    "duplicate delivery skipped"
                );
                Ok(Delivery::Duplicate)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode_mutation;
    use crate::store::{InMemoryTable, RecordKey};
    use crate::stream::{PartitionId, SequenceNumber};

    fn event(seq: u64, payload: Vec<u8>) -> Event {
        Event {
            stream_id: "events".into(),
            partition: PartitionId(0),
            partition_key: "A:1".into(),
            sequence_number: SequenceNumber(seq),
            payload,
            produced_at: SystemTime::now(),
        }
    }

    #[test]
    fn applies_bitcode_mutation_once() {
        let table = InMemoryTable::new();
        let handler = StoreUpdateHandler::new(Arc::new(table.clone()), "ProgramTable")
            .with_format(PayloadFormat::Bitcode);
        let mutation = EntityMutation::new("A", 1).with_attribute("status", "new");
        let e = event(1, encode_mutation(&mutation, PayloadFormat::Bitcode).unwrap());

        let decoded = handler.decode(&e).unwrap();
        let timeout = Duration::from_secs(1);
        assert_eq!(handler.apply(&e, &decoded, timeout).unwrap(), Delivery::Applied);
        assert_eq!(handler.apply(&e, &decoded, timeout).unwrap(), Delivery::Duplicate);

        let stored = table
            .get_item("ProgramTable", &RecordKey::new("A", 1))
            .unwrap()
            .unwrap();
        assert_eq!(stored.attribute("status"), Some("new"));
        assert_eq!(stored.marker.unwrap().sequence, SequenceNumber(1));
    }

    #[test]
    fn json_is_the_default_format() {
        let handler = StoreUpdateHandler::new(Arc::new(InMemoryTable::new()), "ProgramTable");
        let e = event(1, br#"{"id":"A","customerId":1,"attrs":{}}"#.to_vec());
        assert!(handler.decode(&e).is_ok());
        assert!(handler.decode(&event(2, b"\x00\x01".to_vec())).is_err());
    }
}
