// Raft network layer for intra-region node communication
// Defines the RPC messages and the transport seam; `LocalRaftNetwork` wires nodes in-process

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::node::RaftNode;
use super::request::LogEntry;
use super::types::NodeId;

/// RequestVote RPC arguments
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments; an empty `entries` is a heartbeat
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// On success the follower's last replicated index; on rejection a hint for `nextIndex`
    pub match_index: u64,
}

/// Outbound consensus RPCs to a peer in the same region
///
/// Implementations own marshalling and connection management. Errors are
/// treated by the caller as a missing vote or acknowledgement.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(&self, target: &NodeId, request: VoteRequest)
    -> anyhow::Result<VoteResponse>;

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse>;
}

/// In-process network connecting the nodes of one region
///
/// Nodes are held weakly so dropping a node makes it unreachable. Each node
/// belongs to a partition group (0 by default); RPCs only pass between nodes
/// of the same group.
#[derive(Default)]
pub struct LocalRaftNetwork {
    nodes: DashMap<NodeId, Weak<RaftNode>>,
    groups: DashMap<NodeId, u32>,
}

impl LocalRaftNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport handle used by `node_id` to reach its peers
    pub fn transport(self: &Arc<Self>, node_id: impl Into<NodeId>) -> Arc<dyn RaftTransport> {
        Arc::new(LocalRaftTransport {
            source: node_id.into(),
            network: self.clone(),
        })
    }

    pub fn register(&self, node: &Arc<RaftNode>) {
        self.nodes
            .insert(node.node_id().clone(), Arc::downgrade(node));
    }

    pub fn node(&self, node_id: &str) -> Option<Arc<RaftNode>> {
        self.nodes.get(node_id).and_then(|n| n.upgrade())
    }

    /// Cut `node_id` off from every other node
    pub fn isolate(&self, node_id: &str) {
        let group = self.groups.len() as u32 + 1_000;
        self.groups.insert(node_id.to_string(), group);
    }

    /// Split the region into the given groups; unlisted nodes stay in group 0
    pub fn partition(&self, groups: &[&[&str]]) {
        self.groups.clear();
        for (i, members) in groups.iter().enumerate() {
            for member in members.iter() {
                self.groups.insert(member.to_string(), i as u32 + 1);
            }
        }
    }

    /// Restore full connectivity
    pub fn heal(&self) {
        self.groups.clear();
    }

    fn group_of(&self, node_id: &str) -> u32 {
        self.groups.get(node_id).map(|g| *g).unwrap_or(0)
    }

    fn route(&self, source: &str, target: &str) -> anyhow::Result<Arc<RaftNode>> {
        if self.group_of(source) != self.group_of(target) {
            anyhow::bail!("node {} unreachable from {}", target, source);
        }
        let node = self
            .node(target)
            .ok_or_else(|| anyhow::anyhow!("node {} not registered", target))?;
        if !node.is_running() {
            anyhow::bail!("node {} is shut down", target);
        }
        Ok(node)
    }
}

struct LocalRaftTransport {
    source: NodeId,
    network: Arc<LocalRaftNetwork>,
}

#[async_trait]
impl RaftTransport for LocalRaftTransport {
    async fn request_vote(
        &self,
        target: &NodeId,
        request: VoteRequest,
    ) -> anyhow::Result<VoteResponse> {
        let node = self.network.route(&self.source, target)?;
        tokio::task::yield_now().await;
        trace!(from = %self.source, to = %target, term = request.term, "RequestVote");
        Ok(node.handle_vote_request(request))
    }

    async fn append_entries(
        &self,
        target: &NodeId,
        request: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse> {
        let node = self.network.route(&self.source, target)?;
        tokio::task::yield_now().await;
        trace!(
            from = %self.source,
            to = %target,
            entries = request.entries.len(),
            "AppendEntries"
        );
        let response = node.handle_append_entries(request);
        // The reply may be lost if the partition changed mid-flight
        self.network.route(&self.source, target)?;
        Ok(response)
    }
}
