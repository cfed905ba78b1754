// Integration tests for deployments spanning several regions
// Covers quorum exclusivity, notifications, state sync and unreachable regions

use std::sync::Arc;
use std::time::Duration;

use fencelock_common::LockStatus;
use fencelock_consistency::raft::RaftConfig;
use fencelock_core::LockNode;
use fencelock_core::model::NodeConfig;
use fencelock_core::service::CircuitState;
use fencelock_core::transport::{LocalRegion, LocalRegionDirectory};

const REGIONS: [&str; 3] = ["us", "eu", "ap"];

fn fast(config: &mut NodeConfig) {
    config.raft = RaftConfig {
        election_timeout_ms: 150,
        election_jitter_ms: 150,
        heartbeat_interval_ms: 30,
        vote_rpc_timeout_ms: 100,
        append_rpc_timeout_ms: 100,
        max_payload_entries: 300,
        commit_timeout_ms: 2000,
    };
    config.quorum.vote_timeout_ms = 500;
    config.quorum.quorum_timeout_ms = 2_000;
    config.region_client.request_timeout_ms = 500;
    config.region_client.retry_delay_ms = 10;
    config.region_client.max_retries = 2;
}

struct Deployment {
    directory: Arc<LocalRegionDirectory>,
    regions: Vec<LocalRegion>,
}

impl Deployment {
    async fn start(nodes_per_region: usize, configure: fn(&mut NodeConfig)) -> Self {
        let directory = LocalRegionDirectory::new();
        let regions: Vec<LocalRegion> = REGIONS
            .iter()
            .map(|region| {
                let ids: Vec<String> = (1..=nodes_per_region)
                    .map(|i| format!("{}-n{}", region, i))
                    .collect();
                let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
                LocalRegion::start(&directory, region, &ids, &REGIONS, configure)
            })
            .collect();
        for region in &regions {
            region
                .wait_for_leader(Duration::from_secs(10))
                .await
                .expect("no leader elected");
        }
        Self { directory, regions }
    }

    fn leader(&self, region: &str) -> Arc<LockNode> {
        self.directory.leader(region).expect("region has no leader")
    }

    fn shutdown(&self) {
        for region in &self.regions {
            region.shutdown();
        }
    }
}

/// Poll `condition` for up to two seconds
async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_acquisition_propagates_to_every_region() {
    let deployment = Deployment::start(1, fast).await;
    let us = deployment.leader("us");

    let acquired = us.acquire_lock("L1", "c1", 30_000).await;
    assert_eq!(acquired.status, LockStatus::Ok, "{}", acquired.message);
    assert_eq!(acquired.fencing_token(), Some(1));

    for region in ["eu", "ap"] {
        let node = deployment.leader(region);
        assert!(
            eventually(|| node.store().get_lock("L1").is_some()).await,
            "{} never saw the acquisition",
            region
        );
        let lock = node.store().get_lock("L1").unwrap();
        assert_eq!(lock.holder_id, "c1");
        assert_eq!(lock.holder_region, "us");
        assert_eq!(lock.fencing_token, 1);
        assert!(node.quorum().pending_vote("L1").is_none());
    }

    // A remote region now refuses with the holder attached
    let eu = deployment.leader("eu");
    let refused = eu.acquire_lock("L1", "c2", 30_000).await;
    assert_eq!(refused.status, LockStatus::AlreadyLocked);
    assert_eq!(refused.lock.unwrap().holder_id, "c1");
    deployment.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_release_propagates_and_tokens_continue() {
    let deployment = Deployment::start(1, fast).await;
    let us = deployment.leader("us");
    let eu = deployment.leader("eu");
    let ap = deployment.leader("ap");

    assert!(us.acquire_lock("L1", "c1", 30_000).await.is_ok());
    assert!(eventually(|| eu.store().get_lock("L1").is_some()).await);
    assert!(eventually(|| ap.store().get_lock("L1").is_some()).await);

    let released = us.release_lock("L1", "c1", 1).await;
    assert_eq!(released.status, LockStatus::Ok, "{}", released.message);
    assert!(eventually(|| eu.store().get_lock("L1").is_none()).await);
    assert!(eventually(|| ap.store().get_lock("L1").is_none()).await);

    let next = eu.acquire_lock("L1", "c2", 30_000).await;
    assert_eq!(next.status, LockStatus::Ok, "{}", next.message);
    assert_eq!(next.fencing_token(), Some(2));
    deployment.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquisitions_have_one_winner() {
    let deployment = Deployment::start(1, fast).await;
    let us = deployment.leader("us");
    let eu = deployment.leader("eu");

    for round in 0..5 {
        let lock_id = format!("race-{}", round);
        let (a, b) = tokio::join!(
            us.acquire_lock(&lock_id, "us-client", 30_000),
            eu.acquire_lock(&lock_id, "eu-client", 30_000)
        );

        let winners = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1, "{}: {} / {}", lock_id, a.message, b.message);
        for response in [&a, &b] {
            if !response.is_ok() {
                assert!(
                    matches!(
                        response.status,
                        LockStatus::AlreadyLocked
                            | LockStatus::QuorumFailed
                            | LockStatus::InvalidToken
                    ),
                    "unexpected status {:?}: {}",
                    response.status,
                    response.message
                );
            }
        }
    }
    deployment.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_unreachable_region_still_reaches_quorum() {
    let deployment = Deployment::start(1, fast).await;
    deployment.directory.disconnect("ap");
    let us = deployment.leader("us");

    let acquired = us.acquire_lock("L1", "c1", 30_000).await;
    assert_eq!(acquired.status, LockStatus::Ok, "{}", acquired.message);

    // ap missed the notification once its retries ran out; pulling state repairs it
    tokio::time::sleep(Duration::from_millis(200)).await;
    let ap = deployment.leader("ap");
    assert!(ap.store().get_lock("L1").is_none());
    deployment.directory.reconnect("ap");
    let installed = ap.quorum().sync_from_region("us").await.unwrap();
    assert_eq!(installed, 1);
    let lock = ap.store().get_lock("L1").unwrap();
    assert_eq!(lock.holder_region, "us");
    assert_eq!(ap.store().tokens().current_token("L1"), 1);
    deployment.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tokens_keep_increasing_after_region_rejoins() {
    let deployment = Deployment::start(1, fast).await;
    deployment.directory.disconnect("ap");
    let us = deployment.leader("us");
    let eu = deployment.leader("eu");
    let ap = deployment.leader("ap");

    let mut issued = Vec::new();
    for _ in 0..3 {
        let acquired = us.acquire_lock("L1", "c1", 30_000).await;
        assert_eq!(acquired.status, LockStatus::Ok, "{}", acquired.message);
        let token = acquired.fencing_token().unwrap();
        assert!(eventually(|| eu.store().get_lock("L1").is_some()).await);

        let released = us.release_lock("L1", "c1", token).await;
        assert_eq!(released.status, LockStatus::Ok, "{}", released.message);
        assert!(eventually(|| eu.store().get_lock("L1").is_none()).await);
        issued.push(token);
    }
    assert_eq!(issued, vec![1, 2, 3]);

    // ap never heard about any of it
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(ap.store().tokens().current_token("L1"), 0);
    deployment.directory.reconnect("ap");

    let acquired = ap.acquire_lock("L1", "c2", 30_000).await;
    assert_eq!(acquired.status, LockStatus::Ok, "{}", acquired.message);
    let token = acquired.fencing_token().unwrap();
    assert!(token > 3, "token {} reissued after {:?}", token, issued);

    for node in [&us, &eu] {
        assert!(
            eventually(|| node
                .store()
                .get_lock("L1")
                .is_some_and(|l| l.holder_id == "c2" && l.fencing_token == token))
            .await,
            "{} never installed token {}",
            node.region_id(),
            token
        );
        assert_eq!(node.store().installed_token("L1"), token);
    }
    deployment.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_majority_unreachable_fails_and_opens_breakers() {
    fn fragile(config: &mut NodeConfig) {
        fast(config);
        config.region_client.failure_threshold = 2;
    }
    let deployment = Deployment::start(1, fragile).await;
    deployment.directory.disconnect("eu");
    deployment.directory.disconnect("ap");
    let us = deployment.leader("us");

    for attempt in 0..3 {
        let response = us.acquire_lock("L1", "c1", 30_000).await;
        assert_eq!(
            response.status,
            LockStatus::QuorumFailed,
            "attempt {}: {}",
            attempt,
            response.message
        );
    }
    assert_eq!(us.regions().circuit_state("eu"), Some(CircuitState::Open));
    assert_eq!(us.regions().circuit_state("ap"), Some(CircuitState::Open));
    assert!(us.store().get_lock("L1").is_none());
    assert!(us.quorum().pending_vote("L1").is_none());
    deployment.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_regions_time_out_quorum() {
    fn impatient(config: &mut NodeConfig) {
        fast(config);
        config.quorum.quorum_timeout_ms = 200;
        config.quorum.vote_timeout_ms = 2_000;
        config.region_client.request_timeout_ms = 2_000;
    }
    let deployment = Deployment::start(1, impatient).await;
    deployment
        .directory
        .set_latency("eu", Duration::from_millis(800));
    deployment
        .directory
        .set_latency("ap", Duration::from_millis(800));
    let us = deployment.leader("us");

    let response = us.acquire_lock("L1", "c1", 30_000).await;
    assert_eq!(response.status, LockStatus::Timeout, "{}", response.message);
    assert!(us.store().get_lock("L1").is_none());
    deployment.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replicated_regions_agree_on_remote_locks() {
    let deployment = Deployment::start(3, fast).await;
    let us = deployment.leader("us");

    let acquired = us.acquire_lock("L1", "c1", 30_000).await;
    assert_eq!(acquired.status, LockStatus::Ok, "{}", acquired.message);

    // The eu leader commits the notification through its own Raft log
    let eu_nodes = deployment.directory.nodes("eu");
    assert_eq!(eu_nodes.len(), 3);
    assert!(
        eventually(|| eu_nodes
            .iter()
            .all(|n| n.store().get_lock("L1").is_some_and(|l| l.fencing_token == 1)))
        .await
    );
    deployment.shutdown();
}
