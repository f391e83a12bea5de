use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use super::CacheMessage;
use crate::config::CacheNodeConfig;

/// Default capacity of a cache node.
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

/// Default expire-after-write window.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

/// What a node did with an incoming update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// The node holds a newer version; the update was discarded.
    Stale,
    /// The node already holds this version.
    Duplicate,
    /// The node's entries are unusable (a writer panicked); nothing was applied.
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    pub version: u64,
    pub sequence: u64,
    pub written_at: Instant,
}

struct Entries {
    by_key: HashMap<String, (CacheEntry, u64)>,
    // write counter -> key, oldest write first
    write_order: BTreeMap<u64, String>,
    next_write: u64,
}

impl Entries {
    fn remove(&mut self, key: &str) {
        if let Some((_, write)) = self.by_key.remove(key) {
            self.write_order.remove(&write);
        }
    }

    fn expire(&mut self, now: Instant, ttl: Duration) -> usize {
        let mut expired = 0;
        while let Some((&write, key)) = self.write_order.iter().next() {
            let fresh = self
                .by_key
                .get(key)
                .map(|(entry, _)| now.duration_since(entry.written_at) < ttl)
                .unwrap_or(false);
            if fresh {
                break;
            }
            if let Some(key) = self.write_order.remove(&write) {
                self.by_key.remove(&key);
            }
            expired += 1;
        }
        expired
    }
}

/// One replica of the distributed cache.
///
/// Keeps the highest version per key (last-writer-wins), at most
/// `max_entries` entries (the oldest write is evicted first) and drops
/// entries `ttl` after they were written. Clones share the same entries.
#[derive(Clone)]
pub struct CacheNode {
    name: String,
    entries: Arc<RwLock<Entries>>,
    max_entries: usize,
    ttl: Duration,
}

impl CacheNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Arc::new(RwLock::new(Entries {
                by_key: HashMap::new(),
                write_order: BTreeMap::new(),
                next_write: 0,
            })),
            max_entries: DEFAULT_MAX_ENTRIES,
            ttl: DEFAULT_TTL,
        }
    }

    /// A node sized and timed by `config`.
    pub fn from_config(name: impl Into<String>, config: &CacheNodeConfig) -> Self {
        Self::new(name)
            .with_max_entries(config.max_entries)
            .with_ttl(config.ttl())
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Apply an update unless the node holds the same or a newer
    /// `(version, sequence)` for its key.
    pub fn apply(&self, message: &CacheMessage) -> ApplyOutcome {
        let Ok(mut entries) = self.entries.write() else {
            error!(node = %self.name, key = %message.key, "cache node lock poisoned");
            return ApplyOutcome::Failed;
        };
        let now = Instant::now();
        entries.expire(now, self.ttl);

        if let Some((current, _)) = entries.by_key.get(&message.key) {
            let current_order = (current.version, current.sequence);
            if message.order() < current_order {
                debug!(
                    node = %self.name,
                    key = %message.key,
                    current = ?current_order,
                    incoming = ?message.order(),
                    "stale cache update discarded"
                );
                return ApplyOutcome::Stale;
            }
            if message.order() == current_order {
                return ApplyOutcome::Duplicate;
            }
        }

        entries.remove(&message.key);
        let write = entries.next_write;
        entries.next_write += 1;
        entries.write_order.insert(write, message.key.clone());
        entries.by_key.insert(
            message.key.clone(),
            (
                CacheEntry {
                    value: message.value.clone(),
                    version: message.version,
                    sequence: message.sequence,
                    written_at: now,
                },
                write,
            ),
        );

        while entries.by_key.len() > self.max_entries {
            let Some((_, oldest)) = entries.write_order.pop_first() else {
                break;
            };
            entries.by_key.remove(&oldest);
        }
        ApplyOutcome::Applied
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let entries = self.entries.read().ok()?;
        entries
            .by_key
            .get(key)
            .map(|(entry, _)| entry)
            .filter(|entry| entry.written_at.elapsed() < self.ttl)
            .cloned()
    }

    pub fn version(&self, key: &str) -> Option<u64> {
        self.get(key).map(|entry| entry.version)
    }

    /// Live entries (expired ones excluded).
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .map(|entries| {
                entries
                    .by_key
                    .values()
                    .filter(|(entry, _)| entry.written_at.elapsed() < self.ttl)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry.
    pub fn purge(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.by_key.clear();
            entries.write_order.clear();
        }
    }
}

/// Counters of a [`CacheNodeListener`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ListenerStats {
    pub applied: usize,
    pub stale: usize,
    pub duplicates: usize,
    pub invalid: usize,
    pub failed: usize,
}

/// A background thread that feeds a channel subscription into a
/// [`CacheNode`].
pub struct CacheNodeListener {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<ListenerStats>>,
}

impl CacheNodeListener {
    /// Spawn a listener applying every message received on `subscription`.
    pub fn spawn(node: CacheNode, subscription: Receiver<String>) -> Self {
        let (stop_tx, stop_rx) = channel();

        let handle = thread::spawn(move || {
            let mut stats = ListenerStats::default();

            loop {
                match stop_rx.try_recv() {
                    Ok(()) | Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => {}
                }

                let raw = match subscription.recv_timeout(Duration::from_millis(10)) {
                    Ok(raw) => raw,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };

                match CacheMessage::from_json(&raw) {
                    Ok(message) => match node.apply(&message) {
                        ApplyOutcome::Applied => stats.applied += 1,
                        ApplyOutcome::Stale => stats.stale += 1,
                        ApplyOutcome::Duplicate => stats.duplicates += 1,
                        ApplyOutcome::Failed => stats.failed += 1,
                    },
                    Err(e) => {
                        warn!(node = %node.name(), error = %e, "ignoring cache message");
                        stats.invalid += 1;
                    }
                }
            }

            stats
        });

        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Signal the listener to stop and wait for it to finish.
    pub fn stop(mut self) -> ListenerStats {
        let _ = self.stop_tx.send(());
        self.handle
            .take()
            .map(|handle| handle.join().unwrap_or_default())
            .unwrap_or_default()
    }
}

impl Drop for CacheNodeListener {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}
