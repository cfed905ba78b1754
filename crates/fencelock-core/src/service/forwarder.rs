// Leader forwarding for client requests
// Redirects NOT_LEADER answers to the reported leader from the static node table

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fencelock_common::{LockError, LockStatus};
use fencelock_consistency::NodeId;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::model::{LockRequest, LockResponse};

/// Client-facing RPC surface of one node
#[async_trait]
pub trait LockClient: Send + Sync {
    async fn call(&self, request: LockRequest) -> anyhow::Result<LockResponse>;
}

/// Sends lock requests to the current leader of a region
///
/// Each attempt gets a fresh deadline. A `NOT_LEADER` answer naming a known
/// node redirects there; an unknown leader or a transport failure moves on to
/// the next configured node after `retry_delay`.
pub struct LeaderForwarder {
    /// Nodes in configuration order
    nodes: Vec<NodeId>,
    clients: HashMap<NodeId, Arc<dyn LockClient>>,
    request_timeout: Duration,
    retry_delay: Duration,
    max_redirects: usize,
    /// Last node that answered as leader
    leader_hint: Mutex<Option<NodeId>>,
}

impl LeaderForwarder {
    pub fn new(
        clients: Vec<(NodeId, Arc<dyn LockClient>)>,
        request_timeout: Duration,
        max_redirects: usize,
    ) -> Self {
        let nodes = clients.iter().map(|(id, _)| id.clone()).collect();
        Self {
            nodes,
            clients: clients.into_iter().collect(),
            request_timeout,
            retry_delay: Duration::from_millis(100),
            max_redirects,
            leader_hint: Mutex::new(None),
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn leader_hint(&self) -> Option<NodeId> {
        self.leader_hint.lock().clone()
    }

    fn first_target(&self) -> Option<NodeId> {
        self.leader_hint().or_else(|| self.nodes.first().cloned())
    }

    fn next_after(&self, node: &NodeId) -> Option<NodeId> {
        let position = self.nodes.iter().position(|n| n == node)?;
        self.nodes.get((position + 1) % self.nodes.len()).cloned()
    }

    /// Execute `request` against the leader
    pub async fn execute(&self, request: LockRequest) -> LockResponse {
        let Some(mut target) = self.first_target() else {
            return LockResponse::error(&LockError::Internal("no nodes configured".to_string()));
        };
        let mut last = LockResponse::error(&LockError::not_leader(None));

        for attempt in 0..=self.max_redirects {
            let Some(client) = self.clients.get(&target).cloned() else {
                warn!(node = %target, "Leader hint names an unconfigured node");
                *self.leader_hint.lock() = None;
                match self.nodes.first() {
                    Some(first) => target = first.clone(),
                    None => break,
                }
                continue;
            };

            let response =
                match tokio::time::timeout(self.request_timeout, client.call(request.clone())).await
                {
                    Ok(Ok(response)) => response,
                    Ok(Err(e)) => {
                        debug!(node = %target, attempt, "Forwarded request failed: {}", e);
                        last = LockResponse::error(&LockError::Internal(e.to_string()));
                        self.rotate(&mut target).await;
                        continue;
                    }
                    Err(_) => {
                        debug!(node = %target, attempt, "Forwarded request timed out");
                        last = LockResponse::error(&LockError::Timeout(format!(
                            "node {} did not answer within {}ms",
                            target,
                            self.request_timeout.as_millis()
                        )));
                        self.rotate(&mut target).await;
                        continue;
                    }
                };

            if response.status != LockStatus::NotLeader {
                *self.leader_hint.lock() = Some(target);
                return response;
            }

            match response.leader_id.clone() {
                Some(leader) if leader != target && self.clients.contains_key(&leader) => {
                    debug!(from = %target, to = %leader, "Redirecting to leader");
                    target = leader;
                }
                _ => self.rotate(&mut target).await,
            }
            last = response;
        }

        last
    }

    async fn rotate(&self, target: &mut NodeId) {
        *self.leader_hint.lock() = None;
        if let Some(next) = self.next_after(target) {
            *target = next;
        }
        tokio::time::sleep(self.retry_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Answers NOT_LEADER pointing at `leader`, or OK when it is the leader
    struct StubNode {
        id: String,
        leader: Option<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LockClient for StubNode {
        async fn call(&self, _request: LockRequest) -> anyhow::Result<LockResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.leader.as_deref() == Some(self.id.as_str()) {
                return Ok(LockResponse::ok(None, "OK"));
            }
            Ok(LockResponse::error(&LockError::not_leader(self.leader.clone())))
        }
    }

    fn stub(id: &str, leader: Option<&str>) -> Arc<StubNode> {
        Arc::new(StubNode {
            id: id.to_string(),
            leader: leader.map(str::to_string),
            calls: AtomicUsize::new(0),
        })
    }

    fn entry(id: &str, node: Arc<StubNode>) -> (NodeId, Arc<dyn LockClient>) {
        (id.to_string(), node)
    }

    fn check() -> LockRequest {
        LockRequest::Check {
            lock_id: "L1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_redirects_to_reported_leader() {
        let n1 = stub("n1", Some("n3"));
        let n3 = stub("n3", Some("n3"));
        let forwarder = LeaderForwarder::new(
            vec![
                entry("n1", n1.clone()),
                entry("n2", stub("n2", Some("n3"))),
                entry("n3", n3.clone()),
            ],
            Duration::from_millis(200),
            2,
        );

        let response = forwarder.execute(check()).await;
        assert!(response.is_ok());
        assert_eq!(forwarder.leader_hint().as_deref(), Some("n3"));

        forwarder.execute(check()).await;
        assert_eq!(n1.calls.load(Ordering::SeqCst), 1);
        assert_eq!(n3.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_bounded_redirects() {
        let forwarder = LeaderForwarder::new(
            vec![entry("n1", stub("n1", None)), entry("n2", stub("n2", None))],
            Duration::from_millis(200),
            3,
        )
        .with_retry_delay(Duration::from_millis(1));

        let response = forwarder.execute(check()).await;
        assert_eq!(response.status, LockStatus::NotLeader);
        assert_eq!(forwarder.leader_hint(), None);
    }
}
