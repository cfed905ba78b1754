//! Cross-region quorum negotiation
//!
//! Provides:
//! - Vote solicitation across peer regions before a lock is committed locally
//! - Provisional vote reservations (`PendingVote`) that close the acquire/acquire race
//! - Replay of remote acquisitions and releases into the local Raft log

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fencelock_common::{LockError, current_timestamp_ms};
use fencelock_consistency::raft::{EntryType, LockCommand, RaftNode};
use fencelock_consistency::{Lock, LockStore};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::region_client::RegionClientManager;
use crate::model::{LockVoteRequest, LockVoteResponse, QuorumConfig};

pub const PENDING_VOTE_FOR_ANOTHER_REGION: &str = "Pending vote for another region";
pub const STALE_FENCING_TOKEN: &str = "Stale fencing token";
pub const LEADER_CATCHING_UP: &str = "Region leader catching up";

/// Provisional reservation of a lock for a requesting region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingVote {
    pub requesting_region: String,
    pub client_id: String,
    pub fencing_token: u64,
    /// Unix millis after which the reservation is void
    pub expires_at: i64,
}

impl PendingVote {
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}

/// Successful quorum round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumDecision {
    pub votes: usize,
    pub needed: usize,
}

/// Cross-region vote coordinator of one node
pub struct QuorumManager {
    region_id: String,
    peer_regions: Vec<String>,
    config: QuorumConfig,
    store: Arc<LockStore>,
    raft: Arc<RaftNode>,
    regions: Arc<RegionClientManager>,
    pending_votes: Arc<DashMap<String, PendingVote>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl QuorumManager {
    pub fn new(
        region_id: impl Into<String>,
        peer_regions: Vec<String>,
        config: QuorumConfig,
        store: Arc<LockStore>,
        raft: Arc<RaftNode>,
        regions: Arc<RegionClientManager>,
    ) -> Self {
        let region_id = region_id.into();
        let peer_regions = peer_regions
            .into_iter()
            .filter(|r| *r != region_id)
            .collect();
        Self {
            region_id,
            peer_regions,
            config,
            store,
            raft,
            regions,
            pending_votes: Arc::new(DashMap::new()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn region_id(&self) -> &str {
        &self.region_id
    }

    pub fn quorum_size(&self) -> usize {
        self.config.quorum_size
    }

    pub fn pending_vote(&self, lock_id: &str) -> Option<PendingVote> {
        self.pending_votes.get(lock_id).map(|v| v.clone())
    }

    pub fn pending_vote_count(&self) -> usize {
        self.pending_votes.len()
    }

    /// Drop the reservation for `lock_id`, whoever holds it
    pub fn clear_pending_vote(&self, lock_id: &str) {
        if self.pending_votes.remove(lock_id).is_some() {
            debug!(lock_id = %lock_id, "Cleared pending vote");
        }
    }

    fn clear_own_pending_vote(&self, lock_id: &str, client_id: &str) {
        self.pending_votes.remove_if(lock_id, |_, vote| {
            vote.requesting_region == self.region_id && vote.client_id == client_id
        });
    }

    fn already_locked(lock: &Lock) -> LockError {
        LockError::AlreadyLocked {
            lock_id: lock.lock_id.clone(),
            holder_id: lock.holder_id.clone(),
            holder_region: lock.holder_region.clone(),
            fencing_token: lock.fencing_token,
        }
    }

    /// Obtain cross-region consent to hand `lock_id` to `client_id`
    ///
    /// Counts this region's own vote. Fails with `AlreadyLocked` when the lock
    /// is held locally or a voter reports a holder, with `InvalidToken` when a
    /// voter has already seen `fencing_token` or a later one, with
    /// `QuorumFailed` when too few regions grant, and with `Timeout` when the
    /// round overruns the quorum deadline. The local reservation is kept on success and dropped
    /// on failure.
    pub async fn request_lock_quorum(
        &self,
        lock_id: &str,
        client_id: &str,
        fencing_token: u64,
        timeout_ms: u64,
    ) -> Result<QuorumDecision, LockError> {
        let needed = self.config.quorum_size;

        if let Some(lock) = self.store.get_lock(lock_id) {
            metrics::counter!("fencelock_quorum_rounds_total", "outcome" => "already_locked")
                .increment(1);
            return Err(Self::already_locked(&lock));
        }
        self.reserve_locally(lock_id, client_id, fencing_token, needed)?;

        let request = LockVoteRequest {
            lock_id: lock_id.to_string(),
            requesting_region: self.region_id.clone(),
            client_id: client_id.to_string(),
            fencing_token,
            timeout_ms,
        };

        let result =
            match tokio::time::timeout(self.config.quorum_timeout(), self.collect_votes(request))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(LockError::Timeout(format!(
                    "quorum for lock '{}' not reached within {}ms",
                    lock_id, self.config.quorum_timeout_ms
                ))),
            };

        let outcome = match &result {
            Ok(_) => "granted",
            Err(LockError::AlreadyLocked { .. }) => "already_locked",
            Err(LockError::InvalidToken { .. }) => "stale_token",
            Err(LockError::Timeout(_)) => "timeout",
            Err(_) => "denied",
        };
        metrics::counter!("fencelock_quorum_rounds_total", "outcome" => outcome).increment(1);

        match &result {
            Ok(decision) => info!(
                lock_id = %lock_id,
                votes = decision.votes,
                needed = decision.needed,
                "Quorum reached"
            ),
            Err(e) => {
                self.clear_own_pending_vote(lock_id, client_id);
                info!(lock_id = %lock_id, "Quorum not reached: {}", e);
            }
        }
        result
    }

    /// Record this region's own reservation, refusing if another requester holds one
    fn reserve_locally(
        &self,
        lock_id: &str,
        client_id: &str,
        fencing_token: u64,
        needed: usize,
    ) -> Result<(), LockError> {
        let now = current_timestamp_ms();
        let vote = PendingVote {
            requesting_region: self.region_id.clone(),
            client_id: client_id.to_string(),
            fencing_token,
            expires_at: now + self.config.pending_vote_ttl_ms as i64,
        };
        match self.pending_votes.entry(lock_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if !current.is_expired_at(now)
                    && (current.requesting_region != self.region_id
                        || current.client_id != client_id)
                {
                    metrics::counter!("fencelock_quorum_rounds_total", "outcome" => "denied")
                        .increment(1);
                    let reason = if current.requesting_region != self.region_id {
                        PENDING_VOTE_FOR_ANOTHER_REGION.to_string()
                    } else {
                        format!("Pending vote for client {}", current.client_id)
                    };
                    return Err(LockError::QuorumFailed {
                        received: 0,
                        needed,
                        reason,
                    });
                }
                entry.insert(vote);
            }
            Entry::Vacant(entry) => {
                entry.insert(vote);
            }
        }
        Ok(())
    }

    async fn collect_votes(&self, request: LockVoteRequest) -> Result<QuorumDecision, LockError> {
        let needed = self.config.quorum_size;
        let mut votes = 1usize;
        if votes >= needed {
            return Ok(QuorumDecision { votes, needed });
        }

        let vote_timeout = self.config.vote_timeout();
        let mut calls: FuturesUnordered<_> = self
            .peer_regions
            .iter()
            .map(|region| {
                let request = request.clone();
                async move {
                    let result = self.regions.request_vote(region, request, vote_timeout).await;
                    (region, result)
                }
            })
            .collect();

        let mut remaining = self.peer_regions.len();
        let mut holder: Option<Lock> = None;
        let mut deny_reason: Option<String> = None;
        let mut stale = false;

        while let Some((region, result)) = calls.next().await {
            remaining -= 1;
            match result {
                Ok(response) => {
                    self.store
                        .tokens()
                        .observe(&request.lock_id, response.current_token);
                    if response.granted {
                        votes += 1;
                        debug!(lock_id = %request.lock_id, region = %region, votes, needed, "Vote granted");
                        if votes >= needed {
                            return Ok(QuorumDecision { votes, needed });
                        }
                    } else {
                        debug!(
                            lock_id = %request.lock_id,
                            region = %region,
                            reason = %response.reason,
                            "Vote denied"
                        );
                        stale |= response.reason.starts_with(STALE_FENCING_TOKEN);
                        if holder.is_none() {
                            holder = response.holder;
                        }
                        deny_reason.get_or_insert(response.reason);
                    }
                }
                Err(e) => {
                    warn!(lock_id = %request.lock_id, region = %region, "Vote request failed: {}", e);
                    deny_reason.get_or_insert_with(|| format!("region {} unavailable", region));
                }
            }

            if votes + remaining < needed {
                break;
            }
        }

        if let Some(lock) = holder {
            return Err(Self::already_locked(&lock));
        }
        if stale {
            return Err(LockError::InvalidToken {
                expected: self.store.tokens().current_token(&request.lock_id) + 1,
                provided: request.fencing_token,
            });
        }
        Err(LockError::QuorumFailed {
            received: votes,
            needed,
            reason: deny_reason.unwrap_or_else(|| "no peer regions answered".to_string()),
        })
    }

    /// Decide a peer region's vote request
    ///
    /// Grants only tokens above every token this region has seen for the
    /// lock, and raises the local counter to the granted token.
    pub fn handle_lock_vote_request(&self, request: &LockVoteRequest) -> LockVoteResponse {
        let tokens = self.store.tokens();

        if let Some(lock) = self.store.get_lock(&request.lock_id) {
            let reason = format!(
                "Lock held by {} in region {}",
                lock.holder_id, lock.holder_region
            );
            let current_token = tokens.current_token(&request.lock_id);
            return LockVoteResponse::denied(&self.region_id, reason, Some(lock), current_token);
        }
        if self.raft.is_leader() && !self.raft.is_leader_ready() {
            return LockVoteResponse::denied(
                &self.region_id,
                LEADER_CATCHING_UP,
                None,
                tokens.current_token(&request.lock_id),
            );
        }

        let now = current_timestamp_ms();
        let vote = PendingVote {
            requesting_region: request.requesting_region.clone(),
            client_id: request.client_id.clone(),
            fencing_token: request.fencing_token,
            expires_at: now + self.config.pending_vote_ttl_ms as i64,
        };
        let current_token = match self.pending_votes.entry(request.lock_id.clone()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                let live = !current.is_expired_at(now);
                let current_token = tokens.current_token(&request.lock_id);
                if live && current.requesting_region != request.requesting_region {
                    debug!(
                        lock_id = %request.lock_id,
                        requester = %request.requesting_region,
                        reserved_for = %current.requesting_region,
                        "Denying vote, reserved for another region"
                    );
                    return LockVoteResponse::denied(
                        &self.region_id,
                        PENDING_VOTE_FOR_ANOTHER_REGION,
                        None,
                        current_token,
                    );
                }
                // A requester repeating its own live round keeps its token
                let repeat = live && current.fencing_token == request.fencing_token;
                if !repeat && request.fencing_token <= current_token {
                    return self.deny_stale(request, current_token);
                }
                tokens.observe(&request.lock_id, request.fencing_token);
                entry.insert(vote);
                current_token
            }
            Entry::Vacant(entry) => {
                let current_token = tokens.current_token(&request.lock_id);
                if request.fencing_token <= current_token {
                    return self.deny_stale(request, current_token);
                }
                tokens.observe(&request.lock_id, request.fencing_token);
                entry.insert(vote);
                current_token
            }
        };

        metrics::gauge!("fencelock_pending_votes").set(self.pending_votes.len() as f64);
        debug!(
            lock_id = %request.lock_id,
            requester = %request.requesting_region,
            token = request.fencing_token,
            "Granted lock vote"
        );
        LockVoteResponse::granted(&self.region_id, current_token)
    }

    fn deny_stale(&self, request: &LockVoteRequest, current_token: u64) -> LockVoteResponse {
        debug!(
            lock_id = %request.lock_id,
            requester = %request.requesting_region,
            token = request.fencing_token,
            current_token,
            "Denying vote, stale fencing token"
        );
        LockVoteResponse::denied(
            &self.region_id,
            format!(
                "{} {} (current {})",
                STALE_FENCING_TOKEN, request.fencing_token, current_token
            ),
            None,
            current_token,
        )
    }

    /// Apply a peer region's acquisition (or extension) locally
    pub async fn handle_lock_acquired(&self, notification: LockCommand) -> Result<Lock, LockError> {
        self.clear_pending_vote(&notification.lock_id);
        debug!(
            lock_id = %notification.lock_id,
            holder = %notification.client_id,
            region = %notification.region_id,
            token = notification.fencing_token,
            "Remote lock acquisition"
        );

        if self.raft.is_leader() {
            let outcome = self
                .raft
                .propose(EntryType::AcquireLock, &notification)
                .await?;
            return outcome
                .into_lock()
                .ok_or_else(|| LockError::Internal("acquisition produced no lock".to_string()));
        }

        warn!(
            lock_id = %notification.lock_id,
            "Applying remote acquisition directly on a non-leader"
        );
        self.store.acquire_with_token(
            &notification.lock_id,
            &notification.client_id,
            &notification.region_id,
            notification.fencing_token,
            notification.acquired_at(),
            notification.expires_at,
        )
    }

    /// Apply a peer region's release locally
    pub async fn handle_lock_released(&self, notification: LockCommand) -> Result<Lock, LockError> {
        self.clear_pending_vote(&notification.lock_id);
        debug!(
            lock_id = %notification.lock_id,
            region = %notification.region_id,
            token = notification.fencing_token,
            "Remote lock release"
        );

        if self.raft.is_leader() {
            let outcome = self
                .raft
                .propose(EntryType::ReleaseLock, &notification)
                .await?;
            return outcome
                .into_lock()
                .ok_or_else(|| LockError::Internal("release produced no lock".to_string()));
        }

        warn!(
            lock_id = %notification.lock_id,
            "Applying remote release directly on a non-leader"
        );
        self.store
            .release_by_token(&notification.lock_id, notification.fencing_token)
    }

    /// Pull a peer region's lock table and install the locks this region lacks
    ///
    /// Returns the number of locks installed.
    pub async fn sync_from_region(&self, region: &str) -> Result<usize, LockError> {
        let locks = self
            .regions
            .sync_lock_state(region)
            .await
            .map_err(|e| LockError::Internal(format!("sync from {} failed: {}", region, e)))?;

        let mut installed = 0;
        for lock in locks {
            self.store.tokens().observe(&lock.lock_id, lock.fencing_token);
            if lock.is_expired() || self.store.get_lock(&lock.lock_id).is_some() {
                continue;
            }
            let command = LockCommand {
                lock_id: lock.lock_id.clone(),
                client_id: lock.holder_id.clone(),
                region_id: lock.holder_region.clone(),
                fencing_token: lock.fencing_token,
                timeout_ms: (lock.expires_at - lock.acquired_at).max(0) as u64,
                expires_at: lock.expires_at,
            };
            match self.handle_lock_acquired(command).await {
                Ok(_) => installed += 1,
                Err(e) => debug!(lock_id = %lock.lock_id, "Skipped synced lock: {}", e),
            }
        }

        info!(region = %region, installed, "Synchronized lock state");
        Ok(installed)
    }

    /// Remove expired reservations, returning how many were dropped
    pub fn sweep_expired_votes(&self) -> usize {
        Self::sweep(&self.pending_votes)
    }

    fn sweep(pending_votes: &DashMap<String, PendingVote>) -> usize {
        let now = current_timestamp_ms();
        let before = pending_votes.len();
        pending_votes.retain(|_, vote| !vote.is_expired_at(now));
        let removed = before.saturating_sub(pending_votes.len());
        if removed > 0 {
            debug!(count = removed, "Removed expired pending votes");
        }
        metrics::gauge!("fencelock_pending_votes").set(pending_votes.len() as f64);
        removed
    }

    /// Start the reservation sweep, running every half TTL
    pub fn start_sweeper(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let period = (self.config.pending_vote_ttl() / 2).max(std::time::Duration::from_millis(1));
        let pending_votes = self.pending_votes.clone();
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                Self::sweep(&pending_votes);
            }
        }));
    }

    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for QuorumManager {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}
