// Cross-region client manager
// Routes votes, notifications, pings and state syncs to peer regions with deadlines,
// retries and a circuit breaker per region

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use fencelock_consistency::Lock;
use fencelock_consistency::raft::LockCommand;
use futures::future::join_all;
use tracing::{debug, warn};

use super::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState, with_circuit_breaker,
};
use crate::model::{
    LockResponse, LockVoteRequest, LockVoteResponse, PingResponse, RegionClientConfig,
    SyncLockStateResponse,
};

/// RPC surface of one peer region
///
/// One implementation exists per transport; the core only depends on this trait.
#[async_trait]
pub trait CrossRegionClient: Send + Sync {
    /// Region this client talks to
    fn region_id(&self) -> &str;

    async fn request_lock_vote(&self, request: LockVoteRequest)
    -> anyhow::Result<LockVoteResponse>;

    async fn notify_lock_acquired(&self, notification: LockCommand)
    -> anyhow::Result<LockResponse>;

    async fn notify_lock_released(&self, notification: LockCommand)
    -> anyhow::Result<LockResponse>;

    async fn ping(&self) -> anyhow::Result<PingResponse>;

    async fn sync_lock_state(&self) -> anyhow::Result<SyncLockStateResponse>;
}

/// Per-region client registry
pub struct RegionClientManager {
    local_region: String,
    config: RegionClientConfig,
    clients: DashMap<String, Arc<dyn CrossRegionClient>>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    /// Last successful contact per region (Unix millis)
    last_contact: DashMap<String, i64>,
}

impl RegionClientManager {
    pub fn new(local_region: impl Into<String>, config: RegionClientConfig) -> Self {
        Self {
            local_region: local_region.into(),
            config,
            clients: DashMap::new(),
            breakers: DashMap::new(),
            last_contact: DashMap::new(),
        }
    }

    pub fn local_region(&self) -> &str {
        &self.local_region
    }

    /// Register the client of a peer region, replacing any previous one
    pub fn register(&self, client: Arc<dyn CrossRegionClient>) {
        let region = client.region_id().to_string();
        if region == self.local_region {
            warn!(region = %region, "Ignoring client for the local region");
            return;
        }
        self.breakers.insert(
            region.clone(),
            Arc::new(CircuitBreaker::new(
                region.clone(),
                CircuitBreakerConfig::from(&self.config),
            )),
        );
        debug!(region = %region, "Registered cross-region client");
        self.clients.insert(region, client);
    }

    /// Registered peer regions, sorted
    pub fn regions(&self) -> Vec<String> {
        let mut regions: Vec<String> = self.clients.iter().map(|e| e.key().clone()).collect();
        regions.sort();
        regions
    }

    pub fn circuit_state(&self, region: &str) -> Option<CircuitState> {
        self.breakers.get(region).map(|b| b.state())
    }

    pub fn last_contact(&self, region: &str) -> Option<i64> {
        self.last_contact.get(region).map(|t| *t)
    }

    /// Request a vote from `region`; single attempt bounded by `deadline`
    pub async fn request_vote(
        &self,
        region: &str,
        request: LockVoteRequest,
        deadline: Duration,
    ) -> anyhow::Result<LockVoteResponse> {
        self.call(region, "request_lock_vote", 1, deadline, |client| {
            let request = request.clone();
            async move { client.request_lock_vote(request).await }
        })
        .await
    }

    pub async fn notify_acquired(
        &self,
        region: &str,
        notification: LockCommand,
    ) -> anyhow::Result<LockResponse> {
        self.call(
            region,
            "notify_lock_acquired",
            self.config.max_retries,
            self.config.request_timeout(),
            |client| {
                let notification = notification.clone();
                async move { client.notify_lock_acquired(notification).await }
            },
        )
        .await
    }

    pub async fn notify_released(
        &self,
        region: &str,
        notification: LockCommand,
    ) -> anyhow::Result<LockResponse> {
        self.call(
            region,
            "notify_lock_released",
            self.config.max_retries,
            self.config.request_timeout(),
            |client| {
                let notification = notification.clone();
                async move { client.notify_lock_released(notification).await }
            },
        )
        .await
    }

    pub async fn ping(&self, region: &str) -> anyhow::Result<PingResponse> {
        self.call(region, "ping", 1, self.config.request_timeout(), |client| async move {
            client.ping().await
        })
        .await
    }

    pub async fn sync_lock_state(&self, region: &str) -> anyhow::Result<Vec<Lock>> {
        let response = self
            .call(
                region,
                "sync_lock_state",
                self.config.max_retries,
                self.config.request_timeout(),
                |client| async move { client.sync_lock_state().await },
            )
            .await?;
        Ok(response.locks)
    }

    /// Tell every peer region about an acquisition (or extension)
    pub async fn broadcast_acquired(
        &self,
        notification: LockCommand,
    ) -> Vec<(String, anyhow::Result<LockResponse>)> {
        let regions = self.regions();
        let calls = regions.iter().map(|region| {
            let notification = notification.clone();
            async move {
                let result = self.notify_acquired(region, notification).await;
                (region.clone(), result)
            }
        });
        join_all(calls).await
    }

    /// Tell every peer region about a release
    pub async fn broadcast_released(
        &self,
        notification: LockCommand,
    ) -> Vec<(String, anyhow::Result<LockResponse>)> {
        let regions = self.regions();
        let calls = regions.iter().map(|region| {
            let notification = notification.clone();
            async move {
                let result = self.notify_released(region, notification).await;
                (region.clone(), result)
            }
        });
        join_all(calls).await
    }

    async fn call<T, F, Fut>(
        &self,
        region: &str,
        op: &'static str,
        attempts: u32,
        deadline: Duration,
        f: F,
    ) -> anyhow::Result<T>
    where
        F: Fn(Arc<dyn CrossRegionClient>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let client = self
            .clients
            .get(region)
            .map(|c| c.clone())
            .ok_or_else(|| anyhow::anyhow!("no client registered for region {}", region))?;
        let breaker = self
            .breakers
            .get(region)
            .map(|b| b.clone())
            .ok_or_else(|| anyhow::anyhow!("no circuit breaker for region {}", region))?;

        let attempts = attempts.max(1);
        let mut last_error = None;
        for attempt in 0..attempts {
            let call = async {
                match tokio::time::timeout(deadline, f(client.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!(
                        "{} to region {} timed out after {}ms",
                        op,
                        region,
                        deadline.as_millis()
                    )),
                }
            };

            match with_circuit_breaker(&breaker, call).await {
                Ok(value) => {
                    self.last_contact
                        .insert(region.to_string(), chrono::Utc::now().timestamp_millis());
                    return Ok(value);
                }
                Err(CircuitBreakerError::CircuitOpen) => {
                    debug!(region = %region, op, "Skipping call, circuit breaker open");
                    return Err(anyhow::anyhow!("circuit breaker open for region {}", region));
                }
                Err(CircuitBreakerError::OperationFailed(e)) => {
                    warn!(
                        "Failed {} to region {} (attempt {}/{}): {}",
                        op,
                        region,
                        attempt + 1,
                        attempts,
                        e
                    );
                    last_error = Some(e);
                }
            }

            if attempt + 1 < attempts {
                tokio::time::sleep(self.config.retry_delay()).await;
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("{} to region {} failed", op, region)))
    }
}
