// Node configuration and the request/response types exchanged with clients and peer regions

use std::time::Duration;

use fencelock_common::{DEFAULT_REGION, LockError, LockStatus};
use fencelock_consistency::raft::RaftConfig;
use fencelock_consistency::{Lock, NodeId};
use serde::{Deserialize, Serialize};

// ==================== Configuration ====================

/// Cross-region quorum settings
#[derive(Clone, Debug)]
pub struct QuorumConfig {
    /// Votes required, counting this region's own vote
    pub quorum_size: usize,
    /// Upper bound for a whole quorum round (default: 30s)
    pub quorum_timeout_ms: u64,
    /// Deadline for one peer region's vote (default: 5s)
    pub vote_timeout_ms: u64,
    /// Lifetime of a provisional vote reservation (default: 10s)
    pub pending_vote_ttl_ms: u64,
}

impl QuorumConfig {
    /// Defaults with a strict majority of `total_regions`
    pub fn for_regions(total_regions: usize) -> Self {
        Self {
            quorum_size: total_regions.max(1) / 2 + 1,
            quorum_timeout_ms: 30_000,
            vote_timeout_ms: 5_000,
            pending_vote_ttl_ms: 10_000,
        }
    }

    pub fn quorum_timeout(&self) -> Duration {
        Duration::from_millis(self.quorum_timeout_ms)
    }

    pub fn vote_timeout(&self) -> Duration {
        Duration::from_millis(self.vote_timeout_ms)
    }

    pub fn pending_vote_ttl(&self) -> Duration {
        Duration::from_millis(self.pending_vote_ttl_ms)
    }
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self::for_regions(1)
    }
}

/// Lock timeout bounds and store maintenance
#[derive(Clone, Debug)]
pub struct LockConfig {
    pub default_timeout_ms: u64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    /// Interval of the expired-lock sweep
    pub sweep_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            min_timeout_ms: 100,
            max_timeout_ms: 300_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl LockConfig {
    /// Zero selects the default; anything else is clamped into `[min, max]`
    pub fn normalize_timeout(&self, timeout_ms: u64) -> u64 {
        if timeout_ms == 0 {
            return self.default_timeout_ms;
        }
        timeout_ms.clamp(self.min_timeout_ms, self.max_timeout_ms.max(self.min_timeout_ms))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Outbound calls to peer regions
#[derive(Clone, Debug)]
pub struct RegionClientConfig {
    /// Deadline of a single notification/ping/sync attempt
    pub request_timeout_ms: u64,
    /// Attempts for notifications (votes are never retried)
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Consecutive failures that open a region's circuit breaker
    pub failure_threshold: u32,
    /// Time an open breaker waits before probing again
    pub reset_timeout_ms: u64,
    /// Successful trial calls needed to close a half-open breaker
    pub success_threshold: u32,
}

impl Default for RegionClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            max_retries: 3,
            retry_delay_ms: 500,
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            success_threshold: 2,
        }
    }
}

impl RegionClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Everything a lock node needs at construction
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub node_id: NodeId,
    /// Intra-region peers (may include `node_id`, which is ignored)
    pub peers: Vec<NodeId>,
    pub region_id: String,
    pub peer_regions: Vec<String>,
    pub raft: RaftConfig,
    pub quorum: QuorumConfig,
    pub lock: LockConfig,
    pub region_client: RegionClientConfig,
}

impl NodeConfig {
    pub fn new(
        node_id: impl Into<NodeId>,
        peers: Vec<NodeId>,
        region_id: impl Into<String>,
        peer_regions: Vec<String>,
    ) -> Self {
        let quorum = QuorumConfig::for_regions(peer_regions.len() + 1);
        Self {
            node_id: node_id.into(),
            peers,
            region_id: region_id.into(),
            peer_regions,
            raft: RaftConfig::default(),
            quorum,
            lock: LockConfig::default(),
            region_client: RegionClientConfig::default(),
        }
    }

    /// Single-node, single-region configuration
    pub fn standalone(node_id: impl Into<NodeId>) -> Self {
        Self::new(node_id, Vec::new(), DEFAULT_REGION, Vec::new())
    }

    pub fn total_regions(&self) -> usize {
        self.peer_regions.len() + 1
    }
}

// ==================== Client requests ====================

/// Client-facing lock operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LockRequest {
    Acquire {
        lock_id: String,
        client_id: String,
        timeout_ms: u64,
    },
    Release {
        lock_id: String,
        client_id: String,
        fencing_token: u64,
    },
    Extend {
        lock_id: String,
        client_id: String,
        fencing_token: u64,
        timeout_ms: u64,
    },
    Check {
        lock_id: String,
    },
}

impl LockRequest {
    pub fn op(&self) -> &'static str {
        match self {
            LockRequest::Acquire { .. } => "acquire",
            LockRequest::Release { .. } => "release",
            LockRequest::Extend { .. } => "extend",
            LockRequest::Check { .. } => "check",
        }
    }

    pub fn lock_id(&self) -> &str {
        match self {
            LockRequest::Acquire { lock_id, .. }
            | LockRequest::Release { lock_id, .. }
            | LockRequest::Extend { lock_id, .. }
            | LockRequest::Check { lock_id } => lock_id,
        }
    }
}

/// Structured result returned for every client operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockResponse {
    pub status: LockStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock: Option<Lock>,
    /// Known leader when `status` is `NOT_LEADER`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<String>,
}

impl LockResponse {
    pub fn ok(lock: Option<Lock>, message: impl Into<String>) -> Self {
        Self {
            status: LockStatus::Ok,
            message: message.into(),
            lock,
            leader_id: None,
        }
    }

    pub fn error(error: &LockError) -> Self {
        let lock = match error {
            LockError::AlreadyLocked {
                lock_id,
                holder_id,
                holder_region,
                fencing_token,
            } => Some(Lock::new(
                lock_id.clone(),
                holder_id.clone(),
                holder_region.clone(),
                *fencing_token,
                0,
                0,
            )),
            _ => None,
        };
        Self {
            status: error.status(),
            message: error.to_string(),
            lock,
            leader_id: error.leader_hint().map(str::to_string),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == LockStatus::Ok
    }

    pub fn fencing_token(&self) -> Option<u64> {
        self.lock.as_ref().map(|l| l.fencing_token)
    }
}

impl From<Result<Lock, LockError>> for LockResponse {
    fn from(result: Result<Lock, LockError>) -> Self {
        match result {
            Ok(lock) => LockResponse::ok(Some(lock), "OK"),
            Err(e) => LockResponse::error(&e),
        }
    }
}

// ==================== Cross-region messages ====================

/// Vote solicitation sent to every peer region before an acquisition
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockVoteRequest {
    pub lock_id: String,
    pub requesting_region: String,
    pub client_id: String,
    pub fencing_token: u64,
    pub timeout_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockVoteResponse {
    pub granted: bool,
    pub region_id: String,
    pub reason: String,
    /// Current holder when denied because the lock is held
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<Lock>,
    /// Highest token the voter has seen for the lock
    pub current_token: u64,
}

impl LockVoteResponse {
    pub fn granted(region_id: impl Into<String>, current_token: u64) -> Self {
        Self {
            granted: true,
            region_id: region_id.into(),
            reason: "granted".to_string(),
            holder: None,
            current_token,
        }
    }

    pub fn denied(
        region_id: impl Into<String>,
        reason: impl Into<String>,
        holder: Option<Lock>,
        current_token: u64,
    ) -> Self {
        Self {
            granted: false,
            region_id: region_id.into(),
            reason: reason.into(),
            holder,
            current_token,
        }
    }
}

/// Liveness check answer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResponse {
    pub region_id: String,
    pub node_id: NodeId,
    pub is_leader: bool,
    pub leader_id: Option<NodeId>,
    pub term: u64,
    pub timestamp: i64,
}

/// Active lock table of a region
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLockStateResponse {
    pub region_id: String,
    pub locks: Vec<Lock>,
}
