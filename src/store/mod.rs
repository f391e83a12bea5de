//! Durable store: the key-sorted table the Store-Update Consumer maintains.
//!
//! Records are addressed by (`id`, `customer_id`), a string partition key
//! and a numeric sort key. Every write is an upsert conditioned on the
//! [`IdempotencyMarker`] stored with the record, which makes redelivered
//! events no-ops.
//!
//! ```text
//!  event stream ──▶ StoreUpdateHandler ──put_item(if marker supersedes)──▶ DurableStore
//! ```

mod handler;
mod in_memory;

pub use handler::StoreUpdateHandler;
pub use in_memory::InMemoryTable;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::error::SinkError;
use crate::idempotency::IdempotencyMarker;

/// Primary key of a [`StoreRecord`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordKey {
    pub id: String,
    pub customer_id: i64,
}

impl RecordKey {
    pub fn new(id: impl Into<String>, customer_id: i64) -> Self {
        Self {
            id: id.into(),
            customer_id,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.customer_id)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreRecord {
    pub id: String,
    pub customer_id: i64,
    pub attributes: BTreeMap<String, String>,
    /// The event that last wrote this record.
    pub marker: Option<IdempotencyMarker>,
    pub updated_at: SystemTime,
}

impl StoreRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.id.clone(), self.customer_id)
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    Applied,
    /// The stored record was written by the same or a later event.
    Duplicate,
}

/// Write interface of the durable table.
pub trait DurableStore: Send + Sync {
    /// Upsert a record, replacing all its attributes, unless the stored
    /// record's marker is not superseded by `record.marker`.
    fn put_item(
        &self,
        table: &str,
        record: &StoreRecord,
        timeout: Duration,
    ) -> Result<PutOutcome, SinkError>;

    fn get_item(&self, table: &str, key: &RecordKey) -> Result<Option<StoreRecord>, SinkError>;
}

impl<T: DurableStore + ?Sized> DurableStore for Arc<T> {
    fn put_item(
        &self,
        table: &str,
        record: &StoreRecord,
        timeout: Duration,
    ) -> Result<PutOutcome, SinkError> {
        (**self).put_item(table, record, timeout)
    }

    fn get_item(&self, table: &str, key: &RecordKey) -> Result<Option<StoreRecord>, SinkError> {
        (**self).get_item(table, key)
    }
}
