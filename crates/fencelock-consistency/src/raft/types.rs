// Raft type definitions shared by the log, the node and the transport

use serde::{Deserialize, Serialize};

/// Node identifier within a region
pub type NodeId = String;

/// Role of a node in the current term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerState {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerState::Follower => write!(f, "FOLLOWER"),
            ServerState::Candidate => write!(f, "CANDIDATE"),
            ServerState::Leader => write!(f, "LEADER"),
        }
    }
}

/// Point-in-time view of a node's consensus state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMetrics {
    pub node_id: NodeId,
    pub state: ServerState,
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// Votes or acknowledgements needed out of `cluster_size` members
pub fn majority(cluster_size: usize) -> usize {
    cluster_size / 2 + 1
}
