use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

use crate::error::SinkError;
use crate::stream::PartitionId;

use super::{DeadLetter, DeadLetterSink};

/// Dead-letter sink appending one JSON document per line to a file.
///
/// The set of recorded event ids is rebuilt from the file on open, so
/// deduplication survives restarts. A last line left incomplete by a crash
/// mid-append is dropped on open.
pub struct JsonLinesDeadLetterSink {
    path: PathBuf,
    seen: Mutex<HashSet<String>>,
}

impl JsonLinesDeadLetterSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| storage(parent, e))?;
        }
        let (letters, torn_tail) = read_letters(&path)?;
        if torn_tail {
            warn!(path = %path.display(), "dropping incomplete last dead letter");
            write_letters(&path, &letters)?;
        }
        let seen = letters.iter().map(DeadLetter::event_id).collect();
        Ok(Self {
            path,
            seen: Mutex::new(seen),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn storage(path: &Path, e: std::io::Error) -> SinkError {
    SinkError::Storage(format!("{}: {}", path.display(), e))
}

/// Letters stored in `path`, and whether an unterminated last line had to
/// be skipped.
fn read_letters(path: &Path) -> Result<(Vec<DeadLetter>, bool), SinkError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok((Vec::new(), false)),
        Err(e) => return Err(storage(path, e)),
    };
    let terminated = content.is_empty() || content.ends_with('\n');
    let lines: Vec<&str> = content.lines().collect();

    let mut letters = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(letter) => letters.push(letter),
            Err(_) if !terminated && i + 1 == lines.len() => return Ok((letters, true)),
            Err(e) => return Err(SinkError::Storage(format!("{}: {}", path.display(), e))),
        }
    }
    Ok((letters, false))
}

fn write_letters(path: &Path, letters: &[DeadLetter]) -> Result<(), SinkError> {
    let mut content = String::new();
    for letter in letters {
        let line =
            serde_json::to_string(letter).map_err(|e| SinkError::Storage(e.to_string()))?;
        content.push_str(&line);
        content.push('\n');
    }
    let tmp_path = path.with_extension("jsonl.tmp");
    fs::write(&tmp_path, content).map_err(|e| storage(&tmp_path, e))?;
    fs::rename(&tmp_path, path).map_err(|e| storage(path, e))
}

impl DeadLetterSink for JsonLinesDeadLetterSink {
    fn send(&self, letter: DeadLetter) -> Result<bool, SinkError> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| SinkError::Storage("lock poisoned".into()))?;
        let id = letter.event_id();
        if seen.contains(&id) {
            return Ok(false);
        }

        let mut line =
            serde_json::to_string(&letter).map_err(|e| SinkError::Storage(e.to_string()))?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| storage(&self.path, e))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| storage(&self.path, e))?;

        seen.insert(id);
        Ok(true)
    }

    fn list(&self) -> Result<Vec<DeadLetter>, SinkError> {
        let _seen = self
            .seen
            .lock()
            .map_err(|_| SinkError::Storage("lock poisoned".into()))?;
        Ok(read_letters(&self.path)?.0)
    }

    fn drain(&self, consumer: &str, partition: PartitionId) -> Result<Vec<DeadLetter>, SinkError> {
        let _seen = self
            .seen
            .lock()
            .map_err(|_| SinkError::Storage("lock poisoned".into()))?;
        let (drained, kept): (Vec<_>, Vec<_>) = read_letters(&self.path)?
            .0
            .into_iter()
            .partition(|l| l.consumer == consumer && l.partition == partition);
        if !drained.is_empty() {
            write_letters(&self.path, &kept)?;
        }
        Ok(drained)
    }
}
