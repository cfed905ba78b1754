// Raft consensus module for Fencelock regions
// Provides a single, replicated view of lock state inside one region

pub mod config;
pub mod log_store;
pub mod network;
pub mod node;
pub mod request;
pub mod state_machine;
pub mod types;

// Re-export commonly used types
pub use config::RaftConfig;
pub use log_store::RaftLog;
pub use network::{
    AppendEntriesRequest, AppendEntriesResponse, LocalRaftNetwork, RaftTransport, VoteRequest,
    VoteResponse,
};
pub use node::{CommitHandle, RaftNode};
pub use request::{ApplyOutcome, EntryType, LockCommand, LogEntry, RaftLogError};
pub use state_machine::RaftStateMachine;
pub use types::{NodeId, RaftMetrics, ServerState, majority};
