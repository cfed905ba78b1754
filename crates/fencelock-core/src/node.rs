//! Lock node
//!
//! Wires the Raft node, lock store, quorum manager and lock service of one
//! process and exposes every inbound operation as a plain async call: client
//! requests, intra-region consensus RPCs and cross-region RPCs.

use std::sync::Arc;

use fencelock_common::{LockError, current_timestamp_ms};
use fencelock_consistency::raft::{
    AppendEntriesRequest, AppendEntriesResponse, LockCommand, RaftStateMachine, RaftTransport,
    VoteRequest, VoteResponse,
};
use fencelock_consistency::{FencingTokenGenerator, LockStats, LockStore, RaftMetrics, RaftNode};
use tracing::info;

use crate::model::{
    LockRequest, LockResponse, LockVoteRequest, LockVoteResponse, NodeConfig, PingResponse,
    SyncLockStateResponse,
};
use crate::service::lock::LockService;
use crate::service::quorum::QuorumManager;
use crate::service::region_client::RegionClientManager;

pub struct LockNode {
    config: NodeConfig,
    raft: Arc<RaftNode>,
    store: Arc<LockStore>,
    quorum: Arc<QuorumManager>,
    regions: Arc<RegionClientManager>,
    service: LockService,
}

impl LockNode {
    /// Build a node; nothing runs until [`LockNode::start`]
    pub fn new(
        config: NodeConfig,
        transport: Arc<dyn RaftTransport>,
        regions: Arc<RegionClientManager>,
    ) -> Arc<Self> {
        let tokens = Arc::new(FencingTokenGenerator::new());
        let store = Arc::new(LockStore::new(config.region_id.clone(), tokens));
        let state_machine = Arc::new(RaftStateMachine::new(store.clone()));
        let raft = RaftNode::new(
            config.node_id.clone(),
            config.peers.clone(),
            config.raft.clone(),
            state_machine,
            transport,
        );
        let quorum = Arc::new(QuorumManager::new(
            config.region_id.clone(),
            config.peer_regions.clone(),
            config.quorum.clone(),
            store.clone(),
            raft.clone(),
            regions.clone(),
        ));
        let service = LockService::new(
            config.region_id.clone(),
            config.lock.clone(),
            raft.clone(),
            store.clone(),
            quorum.clone(),
            regions.clone(),
        );

        Arc::new(Self {
            config,
            raft,
            store,
            quorum,
            regions,
            service,
        })
    }

    pub fn start(&self) {
        self.raft.start();
        self.store.start_sweeper(self.config.lock.sweep_interval());
        self.quorum.start_sweeper();
        info!(
            node_id = %self.config.node_id,
            region = %self.config.region_id,
            "Lock node started"
        );
    }

    /// Stop timers and sweepers; waiting proposals fail
    pub fn shutdown(&self) {
        self.quorum.stop_sweeper();
        self.store.stop_sweeper();
        self.raft.shutdown();
        info!(node_id = %self.config.node_id, "Lock node stopped");
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn region_id(&self) -> &str {
        &self.config.region_id
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    pub fn store(&self) -> &Arc<LockStore> {
        &self.store
    }

    pub fn quorum(&self) -> &Arc<QuorumManager> {
        &self.quorum
    }

    pub fn regions(&self) -> &Arc<RegionClientManager> {
        &self.regions
    }

    pub fn service(&self) -> &LockService {
        &self.service
    }

    pub fn is_running(&self) -> bool {
        self.raft.is_running()
    }

    pub fn is_leader(&self) -> bool {
        self.raft.is_leader()
    }

    pub fn raft_metrics(&self) -> RaftMetrics {
        self.raft.metrics()
    }

    pub fn lock_stats(&self) -> LockStats {
        self.store.stats()
    }

    // ==================== Client operations ====================

    pub async fn acquire_lock(&self, lock_id: &str, client_id: &str, timeout_ms: u64) -> LockResponse {
        self.service
            .acquire_lock(lock_id, client_id, timeout_ms)
            .await
            .into()
    }

    pub async fn release_lock(
        &self,
        lock_id: &str,
        client_id: &str,
        fencing_token: u64,
    ) -> LockResponse {
        self.service
            .release_lock(lock_id, client_id, fencing_token)
            .await
            .into()
    }

    pub async fn extend_lock(
        &self,
        lock_id: &str,
        client_id: &str,
        fencing_token: u64,
        timeout_ms: u64,
    ) -> LockResponse {
        self.service
            .extend_lock(lock_id, client_id, fencing_token, timeout_ms)
            .await
            .into()
    }

    pub fn check_lock(&self, lock_id: &str) -> LockResponse {
        match self.service.check_lock(lock_id) {
            Ok(Some(lock)) => LockResponse::ok(Some(lock), "LOCKED"),
            Ok(None) => LockResponse::error(&LockError::NotFound(lock_id.to_string())),
            Err(e) => LockResponse::error(&e),
        }
    }

    /// Dispatch a client request
    pub async fn handle_request(&self, request: LockRequest) -> LockResponse {
        match request {
            LockRequest::Acquire {
                lock_id,
                client_id,
                timeout_ms,
            } => self.acquire_lock(&lock_id, &client_id, timeout_ms).await,
            LockRequest::Release {
                lock_id,
                client_id,
                fencing_token,
            } => self.release_lock(&lock_id, &client_id, fencing_token).await,
            LockRequest::Extend {
                lock_id,
                client_id,
                fencing_token,
                timeout_ms,
            } => {
                self.extend_lock(&lock_id, &client_id, fencing_token, timeout_ms)
                    .await
            }
            LockRequest::Check { lock_id } => self.check_lock(&lock_id),
        }
    }

    // ==================== Consensus RPCs ====================

    pub fn handle_vote_request(&self, request: VoteRequest) -> VoteResponse {
        self.raft.handle_vote_request(request)
    }

    pub fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        self.raft.handle_append_entries(request)
    }

    // ==================== Cross-region RPCs ====================

    pub fn handle_lock_vote_request(&self, request: &LockVoteRequest) -> LockVoteResponse {
        self.quorum.handle_lock_vote_request(request)
    }

    pub async fn handle_lock_acquired(&self, notification: LockCommand) -> LockResponse {
        self.quorum.handle_lock_acquired(notification).await.into()
    }

    pub async fn handle_lock_released(&self, notification: LockCommand) -> LockResponse {
        self.quorum.handle_lock_released(notification).await.into()
    }

    pub fn handle_ping(&self) -> PingResponse {
        let metrics = self.raft.metrics();
        PingResponse {
            region_id: self.config.region_id.clone(),
            node_id: self.config.node_id.clone(),
            is_leader: metrics.leader_id.as_deref() == Some(self.config.node_id.as_str()),
            leader_id: metrics.leader_id,
            term: metrics.current_term,
            timestamp: current_timestamp_ms(),
        }
    }

    pub fn handle_sync_lock_state(&self) -> SyncLockStateResponse {
        SyncLockStateResponse {
            region_id: self.config.region_id.clone(),
            locks: self.store.get_all_active_locks(),
        }
    }
}
