// In-process transport for whole regions
// Routes cross-region calls to the current leader of the target region and lets
// tests cut regions off or slow them down

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use fencelock_consistency::NodeId;
use fencelock_consistency::raft::{LocalRaftNetwork, LockCommand};
use tracing::{debug, info, trace};

use crate::model::{
    LockRequest, LockResponse, LockVoteRequest, LockVoteResponse, NodeConfig, PingResponse,
    SyncLockStateResponse,
};
use crate::node::LockNode;
use crate::service::forwarder::{LeaderForwarder, LockClient};
use crate::service::region_client::{CrossRegionClient, RegionClientManager};

/// Registry of the nodes of every in-process region
#[derive(Default)]
pub struct LocalRegionDirectory {
    regions: DashMap<String, Vec<Weak<LockNode>>>,
    disconnected: DashSet<String>,
    latency: DashMap<String, Duration>,
}

impl LocalRegionDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: &Arc<LockNode>) {
        self.regions
            .entry(node.region_id().to_string())
            .or_default()
            .push(Arc::downgrade(node));
    }

    /// Make every call into `region` fail until [`reconnect`](Self::reconnect)
    pub fn disconnect(&self, region: &str) {
        info!(region = %region, "Disconnecting region");
        self.disconnected.insert(region.to_string());
    }

    pub fn reconnect(&self, region: &str) {
        info!(region = %region, "Reconnecting region");
        self.disconnected.remove(region);
    }

    /// Delay every call into `region` by `delay`
    pub fn set_latency(&self, region: &str, delay: Duration) {
        if delay.is_zero() {
            self.latency.remove(region);
        } else {
            self.latency.insert(region.to_string(), delay);
        }
    }

    pub fn nodes(&self, region: &str) -> Vec<Arc<LockNode>> {
        self.regions
            .get(region)
            .map(|nodes| nodes.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    /// Running leader of `region`
    pub fn leader(&self, region: &str) -> Option<Arc<LockNode>> {
        self.nodes(region)
            .into_iter()
            .find(|n| n.is_running() && n.is_leader())
    }

    async fn route(&self, region: &str) -> anyhow::Result<Arc<LockNode>> {
        if self.disconnected.contains(region) {
            anyhow::bail!("region {} unreachable", region);
        }
        let delay = self.latency.get(region).map(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.leader(region)
            .ok_or_else(|| anyhow::anyhow!("region {} has no leader", region))
    }
}

/// [`CrossRegionClient`] backed by a [`LocalRegionDirectory`]
pub struct LocalRegionClient {
    region: String,
    directory: Arc<LocalRegionDirectory>,
}

impl LocalRegionClient {
    pub fn new(region: impl Into<String>, directory: Arc<LocalRegionDirectory>) -> Arc<Self> {
        Arc::new(Self {
            region: region.into(),
            directory,
        })
    }
}

#[async_trait]
impl CrossRegionClient for LocalRegionClient {
    fn region_id(&self) -> &str {
        &self.region
    }

    async fn request_lock_vote(
        &self,
        request: LockVoteRequest,
    ) -> anyhow::Result<LockVoteResponse> {
        let node = self.directory.route(&self.region).await?;
        trace!(region = %self.region, lock_id = %request.lock_id, "RequestLockVote");
        Ok(node.handle_lock_vote_request(&request))
    }

    async fn notify_lock_acquired(&self, notification: LockCommand) -> anyhow::Result<LockResponse> {
        let node = self.directory.route(&self.region).await?;
        Ok(node.handle_lock_acquired(notification).await)
    }

    async fn notify_lock_released(&self, notification: LockCommand) -> anyhow::Result<LockResponse> {
        let node = self.directory.route(&self.region).await?;
        Ok(node.handle_lock_released(notification).await)
    }

    async fn ping(&self) -> anyhow::Result<PingResponse> {
        let node = self.directory.route(&self.region).await?;
        Ok(node.handle_ping())
    }

    async fn sync_lock_state(&self) -> anyhow::Result<SyncLockStateResponse> {
        let node = self.directory.route(&self.region).await?;
        Ok(node.handle_sync_lock_state())
    }
}

/// [`LockClient`] calling a node directly
pub struct LocalLockClient {
    node: Arc<LockNode>,
}

impl LocalLockClient {
    pub fn new(node: Arc<LockNode>) -> Arc<Self> {
        Arc::new(Self { node })
    }
}

#[async_trait]
impl LockClient for LocalLockClient {
    async fn call(&self, request: LockRequest) -> anyhow::Result<LockResponse> {
        if !self.node.is_running() {
            anyhow::bail!("node {} is shut down", self.node.node_id());
        }
        tokio::task::yield_now().await;
        Ok(self.node.handle_request(request).await)
    }
}

/// One region of in-process nodes sharing a Raft network
pub struct LocalRegion {
    region_id: String,
    network: Arc<LocalRaftNetwork>,
    nodes: Vec<Arc<LockNode>>,
}

impl LocalRegion {
    /// Build and start the nodes of `region_id`
    ///
    /// `configure` adjusts each node's configuration before it is built.
    pub fn start<F>(
        directory: &Arc<LocalRegionDirectory>,
        region_id: &str,
        node_ids: &[&str],
        peer_regions: &[&str],
        configure: F,
    ) -> Self
    where
        F: Fn(&mut NodeConfig),
    {
        let network = LocalRaftNetwork::new();
        let peers: Vec<NodeId> = node_ids.iter().map(|id| id.to_string()).collect();
        let peer_regions: Vec<String> = peer_regions
            .iter()
            .filter(|r| **r != region_id)
            .map(|r| r.to_string())
            .collect();

        let nodes: Vec<Arc<LockNode>> = node_ids
            .iter()
            .map(|id| {
                let mut config =
                    NodeConfig::new(*id, peers.clone(), region_id, peer_regions.clone());
                configure(&mut config);

                let regions = Arc::new(RegionClientManager::new(
                    region_id,
                    config.region_client.clone(),
                ));
                for peer_region in &peer_regions {
                    regions.register(LocalRegionClient::new(peer_region.clone(), directory.clone()));
                }

                let node = LockNode::new(config, network.transport(*id), regions);
                network.register(node.raft());
                directory.register(&node);
                node
            })
            .collect();

        for node in &nodes {
            node.start();
        }
        debug!(region = %region_id, nodes = nodes.len(), "Local region started");

        Self {
            region_id: region_id.to_string(),
            network,
            nodes,
        }
    }

    pub fn region_id(&self) -> &str {
        &self.region_id
    }

    pub fn network(&self) -> &Arc<LocalRaftNetwork> {
        &self.network
    }

    pub fn nodes(&self) -> &[Arc<LockNode>] {
        &self.nodes
    }

    pub fn node(&self, node_id: &str) -> Option<&Arc<LockNode>> {
        self.nodes.iter().find(|n| n.node_id() == node_id)
    }

    pub fn leader(&self) -> Option<&Arc<LockNode>> {
        self.nodes.iter().find(|n| n.is_running() && n.is_leader())
    }

    /// Poll until a running node leads the region
    pub async fn wait_for_leader(&self, deadline: Duration) -> Option<Arc<LockNode>> {
        let start = tokio::time::Instant::now();
        loop {
            if let Some(leader) = self.leader() {
                return Some(leader.clone());
            }
            if start.elapsed() > deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Forwarder over every node of the region
    pub fn forwarder(&self, request_timeout: Duration) -> LeaderForwarder {
        let clients = self
            .nodes
            .iter()
            .map(|n| {
                let client: Arc<dyn LockClient> = LocalLockClient::new(n.clone());
                (n.node_id().to_string(), client)
            })
            .collect();
        LeaderForwarder::new(clients, request_timeout, self.nodes.len() * 2)
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}
