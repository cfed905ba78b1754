// Lock operation metrics recorded through the `metrics` facade
// Descriptions are registered by the server at startup

use std::time::Instant;

use fencelock_common::{LockError, LockStatus};

pub const LOCK_OPERATIONS_TOTAL: &str = "fencelock_lock_operations_total";
pub const LOCK_OPERATION_DURATION_SECONDS: &str = "fencelock_lock_operation_duration_seconds";
pub const ACTIVE_LOCKS: &str = "fencelock_active_locks";
pub const RAFT_TERM: &str = "fencelock_raft_term";
pub const RAFT_COMMIT_INDEX: &str = "fencelock_raft_commit_index";
pub const RAFT_PROPOSALS_TOTAL: &str = "fencelock_raft_proposals_total";
pub const QUORUM_ROUNDS_TOTAL: &str = "fencelock_quorum_rounds_total";
pub const PENDING_VOTES: &str = "fencelock_pending_votes";

/// Count one lock operation by outcome and record its latency
pub fn record_lock_operation<T>(op: &'static str, result: &Result<T, LockError>, started: Instant) {
    let status = match result {
        Ok(_) => LockStatus::Ok,
        Err(e) => e.status(),
    };
    metrics::counter!(LOCK_OPERATIONS_TOTAL, "op" => op, "status" => status.as_str())
        .increment(1);
    metrics::histogram!(LOCK_OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}
