use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::stream::SequenceNumber;

use super::store::CheckpointStore;
use super::{check_forward, CheckpointError, CheckpointKey, ConsumerCheckpoint};

/// Checkpoint store keeping one JSON file per checkpoint in a directory.
///
/// Writes go to a temporary file that is renamed over the previous version,
/// so a crash leaves either the old or the new checkpoint, never a torn one.
pub struct FileCheckpointStore {
    dir: PathBuf,
    // Serializes read-check-write sequences within this process.
    write_lock: Mutex<()>,
}

impl FileCheckpointStore {
    /// Open (and create if needed) a checkpoint directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            CheckpointError::Storage(format!("cannot create {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &CheckpointKey) -> PathBuf {
        let name = format!(
            "{}__{}__{}.json",
            encode_part(&key.consumer),
            encode_part(&key.stream_id),
            key.partition
        );
        self.dir.join(name)
    }

    fn read_file(path: &Path) -> Result<Option<ConsumerCheckpoint>, CheckpointError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CheckpointError::Storage(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| CheckpointError::Serde(format!("{}: {}", path.display(), e)))
    }

    fn write_file(&self, key: &CheckpointKey, checkpoint: &ConsumerCheckpoint) -> Result<(), CheckpointError> {
        let path = self.path_for(key);
        let content = serde_json::to_string_pretty(checkpoint)
            .map_err(|e| CheckpointError::Serde(e.to_string()))?;

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, content).map_err(|e| {
            CheckpointError::Storage(format!("cannot write {}: {}", tmp_path.display(), e))
        })?;
        fs::rename(&tmp_path, &path).map_err(|e| {
            CheckpointError::Storage(format!("cannot replace {}: {}", path.display(), e))
        })?;

        debug!(checkpoint = %key, sequence = ?checkpoint.sequence_number, "checkpoint file written");
        Ok(())
    }
}

/// Percent-encode every byte outside `[A-Za-z0-9.-]`, so distinct names
/// never share a file and `__` only ever appears as the separator.
fn encode_part(part: &str) -> String {
    let mut encoded = String::with_capacity(part.len());
    for byte in part.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'.' {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self, key: &CheckpointKey) -> Result<Option<ConsumerCheckpoint>, CheckpointError> {
        Self::read_file(&self.path_for(key))
    }

    fn save(
        &self,
        key: &CheckpointKey,
        sequence: SequenceNumber,
    ) -> Result<ConsumerCheckpoint, CheckpointError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| CheckpointError::Storage("lock poisoned".into()))?;
        let stored = Self::read_file(&self.path_for(key))?;
        check_forward(key, stored.as_ref(), sequence)?;
        if let Some(existing) = stored.filter(|c| c.sequence_number == Some(sequence)) {
            return Ok(existing);
        }
        let checkpoint = ConsumerCheckpoint::new(key, Some(sequence));
        self.write_file(key, &checkpoint)?;
        Ok(checkpoint)
    }

    fn reset(
        &self,
        key: &CheckpointKey,
        sequence: Option<SequenceNumber>,
    ) -> Result<ConsumerCheckpoint, CheckpointError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| CheckpointError::Storage("lock poisoned".into()))?;
        let checkpoint = ConsumerCheckpoint::new(key, sequence);
        self.write_file(key, &checkpoint)?;
        Ok(checkpoint)
    }

    fn list(&self, consumer: &str) -> Result<Vec<ConsumerCheckpoint>, CheckpointError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| {
            CheckpointError::Storage(format!("cannot list {}: {}", self.dir.display(), e))
        })?;

        let mut checkpoints = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| CheckpointError::Storage(e.to_string()))?
                .path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(checkpoint) = Self::read_file(&path)? {
                if checkpoint.consumer == consumer {
                    checkpoints.push(checkpoint);
                }
            }
        }
        checkpoints.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(checkpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::PartitionId;

    fn key(partition: u32) -> CheckpointKey {
        CheckpointKey::new("store-updater", "reactive-system-event-stream", PartitionId(partition))
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileCheckpointStore::open(dir.path()).unwrap();
            store.save(&key(0), SequenceNumber(7)).unwrap();
        }
        let reopened = FileCheckpointStore::open(dir.path()).unwrap();
        let loaded = reopened.load(&key(0)).unwrap().unwrap();
        assert_eq!(loaded.sequence_number, Some(SequenceNumber(7)));
        assert_eq!(loaded.key(), key(0));
    }

    #[test]
    fn regression_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).unwrap();
        store.save(&key(0), SequenceNumber(7)).unwrap();
        assert!(matches!(
            store.save(&key(0), SequenceNumber(6)),
            Err(CheckpointError::Regression { .. })
        ));
        store.reset(&key(0), Some(SequenceNumber(2))).unwrap();
        assert_eq!(
            store.load(&key(0)).unwrap().unwrap().sequence_number,
            Some(SequenceNumber(2))
        );
    }

    #[test]
    fn list_returns_only_consumer_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).unwrap();
        store.save(&key(2), SequenceNumber(1)).unwrap();
        store.save(&key(0), SequenceNumber(1)).unwrap();
        store
            .save(
                &CheckpointKey::new("cache-updater", "redis", PartitionId(0)),
                SequenceNumber(1),
            )
            .unwrap();

        let listed = store.list("store-updater").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].partition, PartitionId(0));
        assert_eq!(listed[1].partition, PartitionId(2));
    }

    #[test]
    fn similar_names_do_not_share_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).unwrap();
        let slash = CheckpointKey::new("a/b", "events", PartitionId(0));
        let underscore = CheckpointKey::new("a_b", "events", PartitionId(0));
        let split = CheckpointKey::new("a", "b__events", PartitionId(0));

        store.save(&slash, SequenceNumber(1)).unwrap();
        store.save(&underscore, SequenceNumber(5)).unwrap();
        store.save(&split, SequenceNumber(9)).unwrap();

        assert_eq!(store.load(&slash).unwrap().unwrap().sequence_number, Some(SequenceNumber(1)));
        assert_eq!(store.load(&underscore).unwrap().unwrap().sequence_number, Some(SequenceNumber(5)));
        assert_eq!(store.load(&split).unwrap().unwrap().sequence_number, Some(SequenceNumber(9)));
        assert_eq!(encode_part("a/b_c"), "a%2Fb%5Fc");
    }

    #[test]
    fn corrupt_file_is_a_serde_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::open(dir.path()).unwrap();
        fs::write(store.path_for(&key(0)), "{not json").unwrap();
        assert!(matches!(
            store.load(&key(0)),
            Err(CheckpointError::Serde(_))
        ));
    }
}
