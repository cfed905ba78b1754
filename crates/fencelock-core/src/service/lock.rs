// Lock service orchestrating validation, cross-region quorum and Raft commits
// Entry point for client lock operations on a region's leader

use std::sync::Arc;
use std::time::Instant;

use fencelock_common::{LockError, current_timestamp_ms, validate_lock_id};
use fencelock_consistency::raft::{ApplyOutcome, EntryType, LockCommand, RaftNode};
use fencelock_consistency::{Lock, LockStore};
use tracing::{debug, info, warn};

use super::quorum::QuorumManager;
use super::region_client::RegionClientManager;
use crate::metrics::record_lock_operation;
use crate::model::{LockConfig, LockResponse};

/// Token issuances per acquisition before a stale-token quorum failure is returned
const MAX_TOKEN_ATTEMPTS: usize = 3;

/// Lock operations of one node
pub struct LockService {
    region_id: String,
    config: LockConfig,
    raft: Arc<RaftNode>,
    store: Arc<LockStore>,
    quorum: Arc<QuorumManager>,
    regions: Arc<RegionClientManager>,
}

impl LockService {
    pub fn new(
        region_id: impl Into<String>,
        config: LockConfig,
        raft: Arc<RaftNode>,
        store: Arc<LockStore>,
        quorum: Arc<QuorumManager>,
        regions: Arc<RegionClientManager>,
    ) -> Self {
        Self {
            region_id: region_id.into(),
            config,
            raft,
            store,
            quorum,
            regions,
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn validate(&self, lock_id: &str, client_id: &str) -> Result<(), LockError> {
        validate_lock_id(lock_id)?;
        if client_id.trim().is_empty() {
            return Err(LockError::IllegalArgument(
                "client id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Non-leaders fail at once; a fresh leader first catches up with its log
    async fn ensure_leader(&self) -> Result<(), LockError> {
        self.raft
            .wait_until_ready(self.raft.config().commit_timeout())
            .await
    }

    /// Acquire `lock_id` for `client_id`; a zero timeout selects the default
    pub async fn acquire_lock(
        &self,
        lock_id: &str,
        client_id: &str,
        timeout_ms: u64,
    ) -> Result<Lock, LockError> {
        let started = Instant::now();
        let result = self.do_acquire(lock_id, client_id, timeout_ms).await;
        record_lock_operation("acquire", &result, started);
        result
    }

    async fn do_acquire(
        &self,
        lock_id: &str,
        client_id: &str,
        timeout_ms: u64,
    ) -> Result<Lock, LockError> {
        self.validate(lock_id, client_id)?;
        let timeout_ms = self.config.normalize_timeout(timeout_ms);
        self.ensure_leader().await?;

        if let Some(lock) = self.store.get_lock(lock_id) {
            return Err(LockError::AlreadyLocked {
                lock_id: lock.lock_id,
                holder_id: lock.holder_id,
                holder_region: lock.holder_region,
                fencing_token: lock.fencing_token,
            });
        }

        let fencing_token = self
            .issue_token_with_quorum(lock_id, client_id, timeout_ms)
            .await?;

        let command = LockCommand {
            lock_id: lock_id.to_string(),
            client_id: client_id.to_string(),
            region_id: self.region_id.clone(),
            fencing_token,
            timeout_ms,
            expires_at: current_timestamp_ms() + timeout_ms as i64,
        };

        let committed = self.raft.propose(EntryType::AcquireLock, &command).await;
        self.quorum.clear_pending_vote(lock_id);
        let lock = expect_lock(committed?)?;

        info!(
            lock_id = %lock_id,
            client_id = %client_id,
            token = lock.fencing_token,
            "Lock acquired"
        );
        self.spawn_notify_acquired(command);
        Ok(lock)
    }

    /// Issue a token and win the cross-region vote for it
    ///
    /// A peer that has seen a token at or above ours denies the vote; the
    /// round then reports `InvalidToken` after raising the local counter, so
    /// the next issuance starts above it.
    async fn issue_token_with_quorum(
        &self,
        lock_id: &str,
        client_id: &str,
        timeout_ms: u64,
    ) -> Result<u64, LockError> {
        let mut attempt = 1;
        loop {
            let fencing_token = self.store.tokens().next_token(lock_id);
            match self
                .quorum
                .request_lock_quorum(lock_id, client_id, fencing_token, timeout_ms)
                .await
            {
                Ok(_) => return Ok(fencing_token),
                Err(LockError::InvalidToken { expected, .. }) if attempt < MAX_TOKEN_ATTEMPTS => {
                    debug!(
                        lock_id = %lock_id,
                        stale = fencing_token,
                        expected,
                        attempt,
                        "Fencing token behind peer regions, reissuing"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Release a lock held by `client_id` under `fencing_token`
    pub async fn release_lock(
        &self,
        lock_id: &str,
        client_id: &str,
        fencing_token: u64,
    ) -> Result<Lock, LockError> {
        let started = Instant::now();
        let result = self.do_release(lock_id, client_id, fencing_token).await;
        record_lock_operation("release", &result, started);
        result
    }

    async fn do_release(
        &self,
        lock_id: &str,
        client_id: &str,
        fencing_token: u64,
    ) -> Result<Lock, LockError> {
        self.validate(lock_id, client_id)?;
        self.ensure_leader().await?;

        let held = self.store.check_holder(lock_id, client_id, fencing_token)?;
        let command = LockCommand {
            lock_id: lock_id.to_string(),
            client_id: client_id.to_string(),
            region_id: self.region_id.clone(),
            fencing_token,
            timeout_ms: 0,
            expires_at: held.expires_at,
        };

        let lock = expect_lock(self.raft.propose(EntryType::ReleaseLock, &command).await?)?;
        info!(lock_id = %lock_id, client_id = %client_id, token = fencing_token, "Lock released");
        self.spawn_notify_released(command);
        Ok(lock)
    }

    /// Push the expiry of a held lock to now + `timeout_ms`, keeping its token
    pub async fn extend_lock(
        &self,
        lock_id: &str,
        client_id: &str,
        fencing_token: u64,
        timeout_ms: u64,
    ) -> Result<Lock, LockError> {
        let started = Instant::now();
        let result = self
            .do_extend(lock_id, client_id, fencing_token, timeout_ms)
            .await;
        record_lock_operation("extend", &result, started);
        result
    }

    async fn do_extend(
        &self,
        lock_id: &str,
        client_id: &str,
        fencing_token: u64,
        timeout_ms: u64,
    ) -> Result<Lock, LockError> {
        self.validate(lock_id, client_id)?;
        let timeout_ms = self.config.normalize_timeout(timeout_ms);
        self.ensure_leader().await?;

        let held = self.store.check_holder(lock_id, client_id, fencing_token)?;
        let expires_at = current_timestamp_ms() + timeout_ms as i64;
        let command = LockCommand {
            lock_id: lock_id.to_string(),
            client_id: client_id.to_string(),
            region_id: held.holder_region.clone(),
            fencing_token,
            // Peers rebuild the same acquisition time from the notification
            timeout_ms: (expires_at - held.acquired_at).max(0) as u64,
            expires_at,
        };

        let lock = expect_lock(self.raft.propose(EntryType::ExtendLock, &command).await?)?;
        debug!(lock_id = %lock_id, expires_at, "Lock extended");
        self.spawn_notify_acquired(command);
        Ok(lock)
    }

    /// Live lock for `lock_id` as seen by this node
    pub fn check_lock(&self, lock_id: &str) -> Result<Option<Lock>, LockError> {
        validate_lock_id(lock_id)?;
        Ok(self.store.get_lock(lock_id))
    }

    fn spawn_notify_acquired(&self, command: LockCommand) {
        if self.regions.regions().is_empty() {
            return;
        }
        let regions = self.regions.clone();
        tokio::spawn(async move {
            let lock_id = command.lock_id.clone();
            let results = regions.broadcast_acquired(command).await;
            for (region, failure) in notification_failures(results) {
                warn!(
                    region = %region,
                    lock_id = %lock_id,
                    "Failed to notify lock acquisition: {}",
                    failure
                );
            }
        });
    }

    fn spawn_notify_released(&self, command: LockCommand) {
        if self.regions.regions().is_empty() {
            return;
        }
        let regions = self.regions.clone();
        tokio::spawn(async move {
            let lock_id = command.lock_id.clone();
            let results = regions.broadcast_released(command).await;
            for (region, failure) in notification_failures(results) {
                warn!(
                    region = %region,
                    lock_id = %lock_id,
                    "Failed to notify lock release: {}",
                    failure
                );
            }
        });
    }
}

/// Regions whose notification failed in transport or was refused, with a description
fn notification_failures(
    results: Vec<(String, anyhow::Result<LockResponse>)>,
) -> Vec<(String, String)> {
    results
        .into_iter()
        .filter_map(|(region, result)| match result {
            Ok(response) if response.is_ok() => None,
            Ok(response) => Some((
                region,
                format!("{}: {}", response.status.as_str(), response.message),
            )),
            Err(e) => Some((region, e.to_string())),
        })
        .collect()
}

fn expect_lock(outcome: ApplyOutcome) -> Result<Lock, LockError> {
    outcome
        .into_lock()
        .ok_or_else(|| LockError::Internal("committed entry produced no lock".to_string()))
}
