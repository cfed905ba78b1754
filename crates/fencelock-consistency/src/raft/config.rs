// Raft configuration
// Provides timing settings for elections, heartbeats and replication RPCs

use std::time::Duration;

use rand::Rng;

/// Configuration for Raft consensus protocol
#[derive(Clone, Debug)]
pub struct RaftConfig {
    /// Election timeout base in milliseconds (default: 1500ms)
    /// If a follower doesn't hear from leader within base + jitter, it starts an election
    pub election_timeout_ms: u64,

    /// Upper bound of the random jitter added to the election timeout (default: 1500ms)
    pub election_jitter_ms: u64,

    /// Heartbeat interval in milliseconds (default: 500ms)
    /// Leader sends heartbeats at this interval
    pub heartbeat_interval_ms: u64,

    /// RequestVote RPC timeout in milliseconds (default: 2000ms)
    pub vote_rpc_timeout_ms: u64,

    /// AppendEntries RPC timeout in milliseconds (default: 2000ms)
    pub append_rpc_timeout_ms: u64,

    /// Maximum entries per append request (default: 300)
    pub max_payload_entries: u64,

    /// How long a submitted entry may wait for commit before the caller sees a timeout (default: 5000ms)
    pub commit_timeout_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_ms: 1500,
            election_jitter_ms: 1500,
            heartbeat_interval_ms: 500,
            vote_rpc_timeout_ms: 2000,
            append_rpc_timeout_ms: 2000,
            max_payload_entries: 300,
            commit_timeout_ms: 5000,
        }
    }
}

impl RaftConfig {
    /// Get election timeout base as Duration
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    /// Election timeout base plus a fresh random jitter
    pub fn random_election_timeout(&self) -> Duration {
        let jitter = if self.election_jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.election_jitter_ms)
        };
        Duration::from_millis(self.election_timeout_ms + jitter)
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn vote_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.vote_rpc_timeout_ms)
    }

    pub fn append_rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.append_rpc_timeout_ms)
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }
}
