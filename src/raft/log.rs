use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::LogError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub command: Vec<u8>,
}

impl LogEntry {
    pub fn new(term: u64, command: impl Into<Vec<u8>>) -> Self {
        Self {
            term,
            command: command.into(),
        }
    }
}

/// The replicated log as seen by the consensus core.
///
/// Index 0 is a sentinel with term 0, so an empty log has `last_index() == 0`
/// and the first real entry lives at index 1. Mutation (`append`, `truncate`)
/// is only performed while the node's state lock is held.
#[async_trait]
pub trait RaftLog: Send + Sync {
    async fn last_index(&self) -> Result<u64, LogError>;

    async fn last_term(&self) -> Result<u64, LogError>;

    async fn term_at(&self, index: u64) -> Result<Option<u64>, LogError>;

    async fn entry(&self, index: u64) -> Result<Option<LogEntry>, LogError>;

    /// Entries in `[start, end)`; `end = None` reads to the tail.
    async fn entries(&self, start: u64, end: Option<u64>) -> Result<Vec<LogEntry>, LogError>;

    /// Appends one entry and returns its index.
    async fn append(&self, entry: LogEntry) -> Result<u64, LogError>;

    /// Discards every entry after `index`.
    async fn truncate(&self, index: u64) -> Result<(), LogError>;
}

#[derive(Debug)]
struct Entries {
    entries: Vec<LogEntry>,
}

impl Entries {
    fn new() -> Self {
        Self {
            entries: vec![LogEntry::new(0, Vec::new())],
        }
    }

    fn from_vec(mut entries: Vec<LogEntry>) -> Self {
        if entries.is_empty() {
            entries.push(LogEntry::new(0, Vec::new()));
        }
        Self { entries }
    }

    fn last_index(&self) -> u64 {
        self.entries.len() as u64 - 1
    }

    fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.entries.get(index as usize).map(|e| e.term)
    }

    fn entry(&self, index: u64) -> Option<LogEntry> {
        self.entries.get(index as usize).cloned()
    }

    fn range(&self, start: u64, end: Option<u64>) -> Vec<LogEntry> {
        let len = self.entries.len() as u64;
        let end = end.unwrap_or(len).min(len);
        if start >= end {
            return Vec::new();
        }
        self.entries[start as usize..end as usize].to_vec()
    }

    fn push(&mut self, entry: LogEntry) -> u64 {
        self.entries.push(entry);
        self.last_index()
    }

    /// Returns whether anything was removed.
    fn truncate(&mut self, index: u64) -> bool {
        if index >= self.last_index() {
            return false;
        }
        self.entries.truncate(index as usize + 1);
        true
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Volatile log, used by tests and the in-process simulator.
#[derive(Debug)]
pub struct MemLog {
    inner: Mutex<Entries>,
}

impl MemLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Entries::new()),
        }
    }

    pub fn with_entries(entries: impl IntoIterator<Item = LogEntry>) -> Self {
        let mut inner = Entries::new();
        for entry in entries {
            inner.push(entry);
        }
        Self {
            inner: Mutex::new(inner),
        }
    }
}

impl Default for MemLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RaftLog for MemLog {
    async fn last_index(&self) -> Result<u64, LogError> {
        Ok(locked(&self.inner).last_index())
    }

    async fn last_term(&self) -> Result<u64, LogError> {
        Ok(locked(&self.inner).last_term())
    }

    async fn term_at(&self, index: u64) -> Result<Option<u64>, LogError> {
        Ok(locked(&self.inner).term_at(index))
    }

    async fn entry(&self, index: u64) -> Result<Option<LogEntry>, LogError> {
        Ok(locked(&self.inner).entry(index))
    }

    async fn entries(&self, start: u64, end: Option<u64>) -> Result<Vec<LogEntry>, LogError> {
        Ok(locked(&self.inner).range(start, end))
    }

    async fn append(&self, entry: LogEntry) -> Result<u64, LogError> {
        Ok(locked(&self.inner).push(entry))
    }

    async fn truncate(&self, index: u64) -> Result<(), LogError> {
        locked(&self.inner).truncate(index);
        Ok(())
    }
}

/// Durable log stored as a bincode blob under `<data_dir>/raft/log.bin`.
pub struct FileLog {
    inner: Mutex<Entries>,
    log_file: PathBuf,
}

impl FileLog {
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, LogError> {
        let log_dir = data_dir.as_ref().join("raft");
        if !log_dir.exists() {
            std::fs::create_dir_all(&log_dir)?;
        }

        let log_file = log_dir.join("log.bin");
        let entries = if log_file.exists() {
            load_from_disk(&log_file)?
        } else {
            Vec::new()
        };

        Ok(Self {
            inner: Mutex::new(Entries::from_vec(entries)),
            log_file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.log_file
    }

    fn save_to_disk(&self, entries: &Entries) -> Result<(), LogError> {
        let encoded = bincode::serde::encode_to_vec(&entries.entries, bincode::config::standard())
            .map_err(|e| LogError::Serialization(e.to_string()))?;

        let mut file = File::create(&self.log_file)?;
        file.write_all(&encoded)?;
        file.sync_data()?;

        Ok(())
    }
}

fn load_from_disk(path: &Path) -> Result<Vec<LogEntry>, LogError> {
    let mut file = File::open(path)?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;

    if buffer.is_empty() {
        return Ok(Vec::new());
    }

    let (entries, _): (Vec<LogEntry>, usize) =
        bincode::serde::decode_from_slice(&buffer, bincode::config::standard())
            .map_err(|e| LogError::Serialization(e.to_string()))?;

    Ok(entries)
}

#[async_trait]
impl RaftLog for FileLog {
    async fn last_index(&self) -> Result<u64, LogError> {
        Ok(locked(&self.inner).last_index())
    }

    async fn last_term(&self) -> Result<u64, LogError> {
        Ok(locked(&self.inner).last_term())
    }

    async fn term_at(&self, index: u64) -> Result<Option<u64>, LogError> {
        Ok(locked(&self.inner).term_at(index))
    }

    async fn entry(&self, index: u64) -> Result<Option<LogEntry>, LogError> {
        Ok(locked(&self.inner).entry(index))
    }

    async fn entries(&self, start: u64, end: Option<u64>) -> Result<Vec<LogEntry>, LogError> {
        Ok(locked(&self.inner).range(start, end))
    }

    async fn append(&self, entry: LogEntry) -> Result<u64, LogError> {
        let mut inner = locked(&self.inner);
        let index = inner.push(entry);
        if let Err(e) = self.save_to_disk(&inner) {
            // Keep memory and disk in step when the write fails.
            inner.truncate(index - 1);
            return Err(e);
        }
        Ok(index)
    }

    async fn truncate(&self, index: u64) -> Result<(), LogError> {
        let mut inner = locked(&self.inner);
        if inner.truncate(index) {
            self.save_to_disk(&inner)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn new_log_has_only_the_sentinel() {
        let log = MemLog::new();

        // Index 0 always exists with term 0.
        assert_eq!(log.last_index().await.unwrap(), 0);
        assert_eq!(log.last_term().await.unwrap(), 0);
        assert_eq!(log.term_at(0).await.unwrap(), Some(0));
        assert_eq!(log.term_at(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn append_and_persist_entries_across_restarts() {
        let tmp = tempdir().expect("tempdir");

        {
            let log = FileLog::open(tmp.path()).expect("open");
            let idx1 = log.append(LogEntry::new(1, b"cmd1".to_vec())).await.expect("append 1");
            let idx2 = log.append(LogEntry::new(2, b"cmd2".to_vec())).await.expect("append 2");

            assert_eq!(idx1, 1);
            assert_eq!(idx2, 2);
            assert_eq!(log.last_index().await.unwrap(), 2);
            assert!(log.path().ends_with("raft/log.bin"));
        }

        // A fresh instance over the same directory sees the persisted entries.
        let log = FileLog::open(tmp.path()).expect("reopen");
        assert_eq!(log.last_index().await.unwrap(), 2);
        assert_eq!(log.last_term().await.unwrap(), 2);
        assert_eq!(log.term_at(1).await.unwrap(), Some(1));

        let entries = log.entries(1, None).await.expect("entries");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].command, b"cmd1".to_vec());
        assert_eq!(entries[1].term, 2);
    }

    #[tokio::test]
    async fn truncate_discards_tail_and_rewrites_file() {
        let tmp = tempdir().expect("tempdir");

        let log = FileLog::open(tmp.path()).expect("open");
        for term in 1..=3u64 {
            log.append(LogEntry::new(term, vec![])).await.expect("append");
        }

        log.truncate(1).await.expect("truncate");
        assert_eq!(log.last_index().await.unwrap(), 1);
        assert_eq!(log.term_at(1).await.unwrap(), Some(1));

        // Truncating past the tail is a no-op.
        log.truncate(10).await.expect("truncate past tail");
        assert_eq!(log.last_index().await.unwrap(), 1);

        // Truncating to the sentinel clears every real entry.
        log.truncate(0).await.expect("truncate all");
        drop(log);
        let log = FileLog::open(tmp.path()).expect("reopen");
        assert_eq!(log.last_index().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn entries_clamps_range() {
        let log = MemLog::with_entries((1..=4).map(|t| LogEntry::new(t, vec![t as u8])));

        assert_eq!(log.entries(2, Some(4)).await.unwrap().len(), 2);
        assert_eq!(log.entries(3, Some(100)).await.unwrap().len(), 2);
        assert!(log.entries(5, None).await.unwrap().is_empty());
        assert!(log.entries(3, Some(2)).await.unwrap().is_empty());
        assert_eq!(log.entry(4).await.unwrap(), Some(LogEntry::new(4, vec![4])));
    }
}
