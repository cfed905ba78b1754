// Raft log entry and lock command types
// These are the application-level commands that go through Raft consensus

use serde::{Deserialize, Serialize};

use crate::lock::Lock;

/// Kind of operation carried by a log entry
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    /// No-operation, appended by a new leader
    Noop,
    /// Acquire a distributed lock
    AcquireLock,
    /// Release a distributed lock
    ReleaseLock,
    /// Extend a held lock
    ExtendLock,
}

impl EntryType {
    /// Get the operation type as a string for logging
    pub fn op_type(&self) -> &'static str {
        match self {
            EntryType::Noop => "NOOP",
            EntryType::AcquireLock => "ACQUIRE_LOCK",
            EntryType::ReleaseLock => "RELEASE_LOCK",
            EntryType::ExtendLock => "EXTEND_LOCK",
        }
    }
}

/// A single entry of the replicated log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// 1-based position in the log
    pub index: u64,
    /// Term of the leader that appended the entry
    pub term: u64,
    pub entry_type: EntryType,
    /// Encoded [`LockCommand`] (empty for NOOP)
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, entry_type: EntryType, payload: Vec<u8>) -> Self {
        Self {
            index,
            term,
            entry_type,
            payload,
        }
    }

    pub fn noop(index: u64, term: u64) -> Self {
        Self::new(index, term, EntryType::Noop, Vec::new())
    }
}

/// Payload of ACQUIRE/RELEASE/EXTEND entries and of cross-region notifications
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockCommand {
    pub lock_id: String,
    pub client_id: String,
    pub region_id: String,
    pub fencing_token: u64,
    pub timeout_ms: u64,
    /// Expiration timestamp (Unix millis)
    pub expires_at: i64,
}

impl LockCommand {
    pub fn encode(&self) -> Result<Vec<u8>, RaftLogError> {
        serde_json::to_vec(self).map_err(|e| RaftLogError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, RaftLogError> {
        serde_json::from_slice(bytes).map_err(|e| RaftLogError::Codec(e.to_string()))
    }

    /// Acquisition time derived from the command, identical on every replica
    pub fn acquired_at(&self) -> i64 {
        self.expires_at - self.timeout_ms as i64
    }
}

/// Result of applying one committed entry to the lock store
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Noop,
    Acquired(Lock),
    Released(Lock),
    Extended(Lock),
}

impl ApplyOutcome {
    pub fn lock(&self) -> Option<&Lock> {
        match self {
            ApplyOutcome::Noop => None,
            ApplyOutcome::Acquired(lock)
            | ApplyOutcome::Released(lock)
            | ApplyOutcome::Extended(lock) => Some(lock),
        }
    }

    pub fn into_lock(self) -> Option<Lock> {
        match self {
            ApplyOutcome::Noop => None,
            ApplyOutcome::Acquired(lock)
            | ApplyOutcome::Released(lock)
            | ApplyOutcome::Extended(lock) => Some(lock),
        }
    }
}

/// Log invariant and codec failures
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RaftLogError {
    #[error("non-contiguous append: expected index {expected}, got {actual}")]
    NonContiguousAppend { expected: u64, actual: u64 },

    #[error("refusing to truncate committed index {index} (commit index {commit_index})")]
    TruncateCommitted { index: u64, commit_index: u64 },

    #[error("command codec error: {0}")]
    Codec(String),
}
