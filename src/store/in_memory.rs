use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::error::SinkError;
use crate::idempotency::IdempotencyMarker;

use super::{DurableStore, PutOutcome, RecordKey, StoreRecord};

#[derive(Default)]
struct Faults {
    unavailable: bool,
    failing_puts: usize,
    blocked: HashSet<RecordKey>,
}

type Tables = HashMap<String, BTreeMap<RecordKey, StoreRecord>>;

/// In-memory durable store: one key-sorted map per table.
///
/// Clone-friendly (cloning shares the same underlying storage). Faults can
/// be injected per call or per key to exercise retry and halt paths.
#[derive(Clone, Default)]
pub struct InMemoryTable {
    tables: Arc<RwLock<Tables>>,
    faults: Arc<Mutex<Faults>>,
    writes: Arc<Mutex<Vec<(RecordKey, Option<IdempotencyMarker>)>>>,
}

impl InMemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record of a table, in key order.
    pub fn records(&self, table: &str) -> Vec<StoreRecord> {
        self.tables
            .read()
            .ok()
            .and_then(|tables| tables.get(table).map(|t| t.values().cloned().collect()))
            .unwrap_or_default()
    }

    pub fn len(&self, table: &str) -> usize {
        self.records(table).len()
    }

    /// Effective writes in the order they happened (duplicates excluded).
    pub fn write_log(&self) -> Vec<(RecordKey, Option<IdempotencyMarker>)> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.unavailable = unavailable;
        }
    }

    /// Fail the next `count` puts with `Unavailable`.
    pub fn fail_next_puts(&self, count: usize) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.failing_puts = count;
        }
    }

    /// Fail every put on `key` until [`unblock_key`](Self::unblock_key).
    pub fn block_key(&self, key: RecordKey) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.blocked.insert(key);
        }
    }

    pub fn unblock_key(&self, key: &RecordKey) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.blocked.remove(key);
        }
    }

    fn check_faults(&self, key: &RecordKey) -> Result<(), SinkError> {
        let mut faults = self
            .faults
            .lock()
            .map_err(|_| SinkError::Storage("lock poisoned".into()))?;
        if faults.unavailable {
            return Err(SinkError::Unavailable("table is unreachable".into()));
        }
        if faults.blocked.contains(key) {
            return Err(SinkError::Unavailable(format!("partition for {} is throttled", key)));
        }
        if faults.failing_puts > 0 {
            faults.failing_puts -= 1;
            return Err(SinkError::Unavailable("injected put failure".into()));
        }
        Ok(())
    }
}

impl DurableStore for InMemoryTable {
    fn put_item(
        &self,
        table: &str,
        record: &StoreRecord,
        _timeout: Duration,
    ) -> Result<PutOutcome, SinkError> {
        let key = record.key();
        self.check_faults(&key)?;
        if key.id.is_empty() {
            return Err(SinkError::Rejected("partition key id must not be empty".into()));
        }

        let mut tables = self
            .tables
            .write()
            .map_err(|_| SinkError::Storage("lock poisoned".into()))?;
        let rows = tables.entry(table.to_string()).or_default();

        if let (Some(stored), Some(incoming)) = (rows.get(&key), record.marker.as_ref()) {
            if !incoming.supersedes(stored.marker.as_ref()) {
                return Ok(PutOutcome::Duplicate);
            }
        }

        rows.insert(key.clone(), record.clone());
        if let Ok(mut writes) = self.writes.lock() {
            writes.push((key, record.marker.clone()));
        }
        Ok(PutOutcome::Applied)
    }

    fn get_item(&self, table: &str, key: &RecordKey) -> Result<Option<StoreRecord>, SinkError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| SinkError::Storage("lock poisoned".into()))?;
        Ok(tables.get(table).and_then(|rows| rows.get(key)).cloned())
    }
}
