// Raft state machine implementation
// Applies committed log entries to the lock store in index order

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use fencelock_common::LockError;
use tracing::{debug, error, warn};

use super::request::{ApplyOutcome, EntryType, LockCommand, LogEntry};
use crate::lock::LockStore;

/// Lock state machine for Raft
///
/// Replays are idempotent: entries at or below `last_applied` are skipped.
pub struct RaftStateMachine {
    store: Arc<LockStore>,
    last_applied: AtomicU64,
}

impl RaftStateMachine {
    pub fn new(store: Arc<LockStore>) -> Self {
        Self {
            store,
            last_applied: AtomicU64::new(0),
        }
    }

    pub fn store(&self) -> &Arc<LockStore> {
        &self.store
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied.load(Ordering::Acquire)
    }

    /// Apply one committed entry and hand its result to `callback`
    ///
    /// Returns `false` when the entry was already applied; the callback is
    /// not invoked in that case. Callers must apply entries one at a time in
    /// index order.
    pub fn apply<F>(&self, entry: &LogEntry, callback: F) -> bool
    where
        F: FnOnce(Result<ApplyOutcome, LockError>),
    {
        if entry.index <= self.last_applied() {
            debug!(index = entry.index, "Skipping already applied entry");
            return false;
        }

        let result = self.dispatch(entry);
        if let Err(e) = &result {
            // Lock conflicts are legitimate outcomes of a committed command
            debug!(
                index = entry.index,
                op = entry.entry_type.op_type(),
                status = %e.status(),
                "Committed entry rejected by lock store: {}",
                e
            );
        }

        self.last_applied.store(entry.index, Ordering::Release);
        callback(result);
        true
    }

    fn dispatch(&self, entry: &LogEntry) -> Result<ApplyOutcome, LockError> {
        if entry.entry_type == EntryType::Noop {
            return Ok(ApplyOutcome::Noop);
        }

        let cmd = LockCommand::decode(&entry.payload).map_err(|e| {
            error!(
                index = entry.index,
                op = entry.entry_type.op_type(),
                "Failed to decode committed command: {}",
                e
            );
            LockError::Internal(e.to_string())
        })?;

        match entry.entry_type {
            EntryType::AcquireLock => self
                .store
                .acquire_with_token(
                    &cmd.lock_id,
                    &cmd.client_id,
                    &cmd.region_id,
                    cmd.fencing_token,
                    cmd.acquired_at(),
                    cmd.expires_at,
                )
                .map(ApplyOutcome::Acquired),
            EntryType::ReleaseLock => self
                .store
                .release_by_token(&cmd.lock_id, cmd.fencing_token)
                .map(ApplyOutcome::Released),
            EntryType::ExtendLock => self
                .store
                .extend(&cmd.lock_id, cmd.fencing_token, cmd.expires_at)
                .map(ApplyOutcome::Extended),
            EntryType::Noop => {
                warn!(index = entry.index, "Unreachable NOOP dispatch");
                Ok(ApplyOutcome::Noop)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use fencelock_common::{LockStatus, current_timestamp_ms};

    use super::*;
    use crate::lock::FencingTokenGenerator;

    fn state_machine() -> RaftStateMachine {
        let store = LockStore::new("eu", Arc::new(FencingTokenGenerator::new()));
        RaftStateMachine::new(Arc::new(store))
    }

    fn command_entry(index: u64, entry_type: EntryType, client: &str, token: u64) -> LogEntry {
        let now = current_timestamp_ms();
        let cmd = LockCommand {
            lock_id: "L1".to_string(),
            client_id: client.to_string(),
            region_id: "eu".to_string(),
            fencing_token: token,
            timeout_ms: 5000,
            expires_at: now + 5000,
        };
        LogEntry::new(index, 1, entry_type, cmd.encode().unwrap())
    }

    fn apply(sm: &RaftStateMachine, entry: &LogEntry) -> Option<Result<ApplyOutcome, LockError>> {
        let mut seen = None;
        sm.apply(entry, |r| seen = Some(r));
        seen
    }

    #[test]
    fn test_apply_acquire_then_release() {
        let sm = state_machine();
        assert_eq!(apply(&sm, &LogEntry::noop(1, 1)), Some(Ok(ApplyOutcome::Noop)));

        let acquired = apply(&sm, &command_entry(2, EntryType::AcquireLock, "c1", 1))
            .unwrap()
            .unwrap();
        assert_eq!(acquired.lock().unwrap().holder_id, "c1");
        assert_eq!(sm.store().get_lock("L1").unwrap().fencing_token, 1);

        let released = apply(&sm, &command_entry(3, EntryType::ReleaseLock, "c1", 1)).unwrap();
        assert!(matches!(released, Ok(ApplyOutcome::Released(_))));
        assert!(sm.store().get_lock("L1").is_none());
        assert_eq!(sm.last_applied(), 3);
    }

    #[test]
    fn test_replay_is_skipped() {
        let sm = state_machine();
        let entry = command_entry(1, EntryType::AcquireLock, "c1", 1);
        assert!(apply(&sm, &entry).is_some());
        assert!(apply(&sm, &entry).is_none());
        assert_eq!(sm.store().stats().total_acquisitions, 1);
    }

    #[test]
    fn test_conflicting_acquire_reports_holder() {
        let sm = state_machine();
        apply(&sm, &command_entry(1, EntryType::AcquireLock, "c1", 1));
        let err = apply(&sm, &command_entry(2, EntryType::AcquireLock, "c2", 2))
            .unwrap()
            .unwrap_err();
        assert_eq!(err.status(), LockStatus::AlreadyLocked);
        assert_eq!(sm.last_applied(), 2);
    }

    #[test]
    fn test_reissued_token_fails_after_release() {
        let sm = state_machine();
        apply(&sm, &command_entry(1, EntryType::AcquireLock, "c1", 1));
        apply(&sm, &command_entry(2, EntryType::ReleaseLock, "c1", 1));

        let err = apply(&sm, &command_entry(3, EntryType::AcquireLock, "c2", 1))
            .unwrap()
            .unwrap_err();
        assert_eq!(err.status(), LockStatus::InvalidToken);
        assert!(sm.store().get_lock("L1").is_none());
        assert_eq!(sm.last_applied(), 3);
    }

    #[test]
    fn test_undecodable_payload_still_advances() {
        let sm = state_machine();
        let entry = LogEntry::new(1, 1, EntryType::AcquireLock, b"garbage".to_vec());
        let result = apply(&sm, &entry).unwrap();
        assert_eq!(result.unwrap_err().status(), LockStatus::Error);
        assert_eq!(sm.last_applied(), 1);
    }

    #[test]
    fn test_extend_entry() {
        let sm = state_machine();
        apply(&sm, &command_entry(1, EntryType::AcquireLock, "c1", 1));
        let extended = apply(&sm, &command_entry(2, EntryType::ExtendLock, "c1", 1))
            .unwrap()
            .unwrap();
        assert!(matches!(extended, ApplyOutcome::Extended(ref l) if l.fencing_token == 1));
    }
}
