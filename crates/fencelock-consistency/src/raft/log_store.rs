// In-memory Raft log
// Append-only, indexable and truncatable sequence of entries guarded by a read-write lock.
// Index 0 is the logical origin: it holds no entry and has term 0.

use parking_lot::RwLock;
use tracing::debug;

use super::request::{LogEntry, RaftLogError};

/// Thread-safe Raft log
///
/// Readers (replication senders) share the read lock; appends and
/// truncations take the write lock, so every operation is linearizable.
#[derive(Debug, Default)]
pub struct RaftLog {
    /// `entries[i]` holds index `i + 1`
    entries: RwLock<Vec<LogEntry>>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one entry; its index must be exactly `last_index + 1`
    pub fn append(&self, entry: LogEntry) -> Result<u64, RaftLogError> {
        let mut entries = self.entries.write();
        let expected = entries.len() as u64 + 1;
        if entry.index != expected {
            return Err(RaftLogError::NonContiguousAppend {
                expected,
                actual: entry.index,
            });
        }
        entries.push(entry);
        Ok(expected)
    }

    /// Append a contiguous batch atomically
    pub fn append_all(&self, batch: Vec<LogEntry>) -> Result<(), RaftLogError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut entries = self.entries.write();
        let mut expected = entries.len() as u64 + 1;
        for entry in &batch {
            if entry.index != expected {
                return Err(RaftLogError::NonContiguousAppend {
                    expected,
                    actual: entry.index,
                });
            }
            expected += 1;
        }
        debug!("Appended {} log entries", batch.len());
        entries.extend(batch);
        Ok(())
    }

    pub fn get(&self, index: u64) -> Option<LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.read().get((index - 1) as usize).cloned()
    }

    /// Entries from `index` to the end of the log
    pub fn get_from(&self, index: u64) -> Vec<LogEntry> {
        let entries = self.entries.read();
        let start = index.max(1) as usize - 1;
        if start >= entries.len() {
            return Vec::new();
        }
        entries[start..].to_vec()
    }

    /// Entries in `[start, end)`, clipped to the log
    pub fn get_range(&self, start: u64, end: u64) -> Vec<LogEntry> {
        let entries = self.entries.read();
        let start = start.max(1) as usize - 1;
        let end = (end.max(1) as usize - 1).min(entries.len());
        if start >= end {
            return Vec::new();
        }
        entries[start..end].to_vec()
    }

    /// Drop `index` and everything after it
    pub fn truncate_from(&self, index: u64) {
        let mut entries = self.entries.write();
        let keep = index.max(1) as usize - 1;
        if keep < entries.len() {
            debug!(
                from = index,
                dropped = entries.len() - keep,
                "Truncating conflicting log suffix"
            );
            entries.truncate(keep);
        }
    }

    pub fn last_index(&self) -> u64 {
        self.entries.read().len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.read().last().map(|e| e.term).unwrap_or(0)
    }

    /// Last index and term read under a single lock acquisition
    pub fn last_index_and_term(&self) -> (u64, u64) {
        let entries = self.entries.read();
        (
            entries.len() as u64,
            entries.last().map(|e| e.term).unwrap_or(0),
        )
    }

    /// Term of the entry at `index`; `Some(0)` for the origin, `None` past the end
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.entries.read().get((index - 1) as usize).map(|e| e.term)
    }

    /// Whether the log holds an entry at `index` with `term` (always true for index 0)
    pub fn contains_entry(&self, index: u64, term: u64) -> bool {
        self.term_at(index) == Some(term)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
