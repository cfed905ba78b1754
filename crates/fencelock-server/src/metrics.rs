// Metric descriptions for the lock service
// Values are recorded by the core crates through the `metrics` facade

use fencelock_core::metrics::{
    ACTIVE_LOCKS, LOCK_OPERATION_DURATION_SECONDS, LOCK_OPERATIONS_TOTAL, PENDING_VOTES,
    QUORUM_ROUNDS_TOTAL, RAFT_COMMIT_INDEX, RAFT_PROPOSALS_TOTAL, RAFT_TERM,
};
use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};

/// Initialize all metric descriptions
/// Should be called once at startup
pub fn init_metrics() {
    // Lock operations
    describe_counter!(
        LOCK_OPERATIONS_TOTAL,
        "Total number of lock operations by operation and status"
    );
    describe_histogram!(
        LOCK_OPERATION_DURATION_SECONDS,
        Unit::Seconds,
        "Lock operation duration in seconds"
    );
    describe_gauge!(ACTIVE_LOCKS, "Current number of live locks");

    // Raft
    describe_gauge!(RAFT_TERM, "Current Raft term");
    describe_gauge!(RAFT_COMMIT_INDEX, "Highest committed Raft log index");
    describe_counter!(
        RAFT_PROPOSALS_TOTAL,
        "Total number of Raft proposals by entry type"
    );

    // Cross-region quorum
    describe_counter!(
        QUORUM_ROUNDS_TOTAL,
        "Total number of cross-region quorum rounds by outcome"
    );
    describe_gauge!(PENDING_VOTES, "Current number of provisional vote reservations");

    tracing::info!("Metrics initialized");
}
