// Integration tests for Raft clusters on the in-process network
// Covers election safety, replication, log matching and commit durability

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fencelock_common::{LockStatus, current_timestamp_ms};
use fencelock_consistency::lock::{FencingTokenGenerator, LockStore};
use fencelock_consistency::raft::{
    AppendEntriesRequest, EntryType, LocalRaftNetwork, LockCommand, LogEntry, RaftConfig,
    RaftNode, RaftStateMachine, ServerState,
};
use proptest::prelude::*;

fn fast_config() -> RaftConfig {
    RaftConfig {
        election_timeout_ms: 150,
        election_jitter_ms: 150,
        heartbeat_interval_ms: 30,
        vote_rpc_timeout_ms: 100,
        append_rpc_timeout_ms: 100,
        max_payload_entries: 300,
        commit_timeout_ms: 2000,
    }
}

struct Cluster {
    network: Arc<LocalRaftNetwork>,
    nodes: Vec<Arc<RaftNode>>,
}

impl Cluster {
    fn new(size: usize) -> Self {
        let ids: Vec<String> = (1..=size).map(|i| format!("n{}", i)).collect();
        let network = LocalRaftNetwork::new();
        let nodes = ids
            .iter()
            .map(|id| {
                let store = Arc::new(LockStore::new("eu", Arc::new(FencingTokenGenerator::new())));
                let node = RaftNode::new(
                    id.clone(),
                    ids.clone(),
                    fast_config(),
                    Arc::new(RaftStateMachine::new(store)),
                    network.transport(id.clone()),
                );
                network.register(&node);
                node
            })
            .collect();
        Self { network, nodes }
    }

    fn start(&self) {
        for node in &self.nodes {
            node.start();
        }
    }

    fn node(&self, id: &str) -> Arc<RaftNode> {
        self.nodes
            .iter()
            .find(|n| n.node_id() == id)
            .cloned()
            .unwrap()
    }

    /// Leader with the highest term among `candidates`
    async fn wait_for_leader(&self, candidates: &[&str]) -> Arc<RaftNode> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let leader = self
                .nodes
                .iter()
                .filter(|n| candidates.contains(&n.node_id().as_str()))
                .filter(|n| n.is_leader())
                .max_by_key(|n| n.current_term())
                .cloned();
            if let Some(leader) = leader {
                return leader;
            }
            assert!(Instant::now() < deadline, "no leader elected");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn command(lock_id: &str, client: &str, token: u64) -> LockCommand {
    LockCommand {
        lock_id: lock_id.to_string(),
        client_id: client.to_string(),
        region_id: "eu".to_string(),
        fencing_token: token,
        timeout_ms: 60_000,
        expires_at: current_timestamp_ms() + 60_000,
    }
}

fn committed_prefix(node: &RaftNode) -> Vec<(u64, u64)> {
    let commit = node.commit_index();
    node.log()
        .get_range(1, commit + 1)
        .iter()
        .map(|e| (e.index, e.term))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leader_replicates_to_all_followers() {
    let cluster = Cluster::new(3);
    cluster.start();
    let leader = cluster.wait_for_leader(&["n1", "n2", "n3"]).await;

    let outcome = leader
        .propose(EntryType::AcquireLock, &command("L1", "c1", 1))
        .await
        .unwrap();
    assert_eq!(outcome.lock().unwrap().holder_id, "c1");

    wait_until("followers to apply", || {
        cluster
            .nodes
            .iter()
            .all(|n| n.state_machine().store().get_lock("L1").is_some())
    })
    .await;

    for node in &cluster.nodes {
        let metrics = node.metrics();
        assert_eq!(metrics.leader_id.as_deref(), Some(leader.node_id().as_str()));
        assert_eq!(metrics.last_log_index, leader.log().last_index());
    }
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_election_safety_across_partitions() {
    let cluster = Cluster::new(5);
    cluster.start();

    let mut leaders_by_term: HashMap<u64, String> = HashMap::new();
    let mut observe = |cluster: &Cluster| {
        for node in &cluster.nodes {
            let metrics = node.metrics();
            if metrics.state == ServerState::Leader {
                let previous = leaders_by_term
                    .entry(metrics.current_term)
                    .or_insert_with(|| metrics.node_id.clone());
                assert_eq!(
                    *previous, metrics.node_id,
                    "two leaders in term {}",
                    metrics.current_term
                );
            }
        }
    };

    for _ in 0..3 {
        let all = ["n1", "n2", "n3", "n4", "n5"];
        let leader = cluster.wait_for_leader(&all).await;
        observe(&cluster);

        cluster.network.isolate(leader.node_id());
        let survivors: Vec<&str> = all
            .iter()
            .copied()
            .filter(|id| *id != leader.node_id().as_str())
            .collect();
        let sample_until = Instant::now() + Duration::from_millis(800);
        while Instant::now() < sample_until {
            observe(&cluster);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let replacement = cluster.wait_for_leader(&survivors).await;
        assert!(replacement.current_term() > leader.current_term());

        cluster.network.heal();
        let settle_until = Instant::now() + Duration::from_millis(400);
        while Instant::now() < settle_until {
            observe(&cluster);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    assert!(leaders_by_term.len() >= 2);
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_isolated_leader_entries_discarded_and_commits_survive() {
    let cluster = Cluster::new(3);
    cluster.start();
    let old_leader = cluster.wait_for_leader(&["n1", "n2", "n3"]).await;

    old_leader
        .propose(EntryType::AcquireLock, &command("committed", "c1", 1))
        .await
        .unwrap();
    let durable = committed_prefix(&old_leader);

    cluster.network.isolate(old_leader.node_id());
    let orphan = old_leader
        .submit(EntryType::AcquireLock, &command("orphan", "c2", 1))
        .unwrap();
    let orphan_index = orphan.index();

    let survivors: Vec<&str> = ["n1", "n2", "n3"]
        .into_iter()
        .filter(|id| *id != old_leader.node_id().as_str())
        .collect();
    let new_leader = cluster.wait_for_leader(&survivors).await;
    new_leader
        .propose(EntryType::AcquireLock, &command("after", "c3", 1))
        .await
        .unwrap();

    cluster.network.heal();
    wait_until("old leader to step down and converge", || {
        !old_leader.is_leader()
            && cluster
                .nodes
                .iter()
                .all(|n| n.commit_index() >= new_leader.commit_index())
            && old_leader
                .state_machine()
                .store()
                .get_lock("after")
                .is_some()
    })
    .await;

    let result = orphan.wait(Duration::from_secs(3)).await;
    assert!(result.is_err());
    assert!(old_leader.state_machine().store().get_lock("orphan").is_none());
    assert_eq!(
        old_leader.log().term_at(orphan_index),
        new_leader.log().term_at(orphan_index)
    );

    // Every entry committed before the partition is still in place everywhere
    for node in &cluster.nodes {
        let prefix = committed_prefix(node);
        assert!(prefix.len() >= durable.len());
        assert_eq!(&prefix[..durable.len()], &durable[..]);
    }

    // Log matching: same index and term implies identical prefixes
    let reference = committed_prefix(&new_leader);
    for node in &cluster.nodes {
        let prefix = committed_prefix(node);
        let shared = prefix.len().min(reference.len());
        assert_eq!(&prefix[..shared], &reference[..shared]);
    }
    cluster.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_follower_rejects_proposals_with_leader_hint() {
    let cluster = Cluster::new(3);
    cluster.start();
    let leader = cluster.wait_for_leader(&["n1", "n2", "n3"]).await;
    let follower_id = ["n1", "n2", "n3"]
        .into_iter()
        .find(|id| *id != leader.node_id().as_str())
        .unwrap();
    let follower = cluster.node(follower_id);

    wait_until("follower to learn the leader", || follower.leader_id().is_some()).await;
    let err = follower
        .submit(EntryType::AcquireLock, &command("L1", "c1", 1))
        .err()
        .unwrap();
    assert_eq!(err.status(), LockStatus::NotLeader);
    assert_eq!(err.leader_hint(), Some(leader.node_id().as_str()));
    cluster.shutdown();
}

fn sorted_terms() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..5, 0..24).prop_map(|mut terms| {
        terms.sort_unstable();
        terms
    })
}

fn build_log(terms: &[u64]) -> Vec<LogEntry> {
    terms
        .iter()
        .enumerate()
        .map(|(i, t)| LogEntry::noop(i as u64 + 1, *t))
        .collect()
}

proptest! {
    #[test]
    fn prop_follower_converges_to_leader_log(leader_terms in sorted_terms(), follower_terms in sorted_terms()) {
        let network = LocalRaftNetwork::new();
        let store = Arc::new(LockStore::new("eu", Arc::new(FencingTokenGenerator::new())));
        let follower = RaftNode::new(
            "f",
            vec!["l".to_string()],
            fast_config(),
            Arc::new(RaftStateMachine::new(store)),
            network.transport("f"),
        );
        follower.log().append_all(build_log(&follower_terms)).unwrap();
        let leader_log = build_log(&leader_terms);
        let leader_last = leader_log.len() as u64;
        let term_at = |index: u64| {
            if index == 0 { 0 } else { leader_log[(index - 1) as usize].term }
        };

        let mut next = leader_last + 1;
        let mut accepted = false;
        for _ in 0..100 {
            let prev = next - 1;
            let response = follower.handle_append_entries(AppendEntriesRequest {
                term: 10,
                leader_id: "l".to_string(),
                prev_log_index: prev,
                prev_log_term: term_at(prev),
                entries: leader_log[prev as usize..].to_vec(),
                leader_commit: 0,
            });
            if response.success {
                prop_assert_eq!(response.match_index, leader_last);
                accepted = true;
                break;
            }
            next = next.saturating_sub(1).min(response.match_index + 1).max(1);
        }
        prop_assert!(accepted);

        for entry in &leader_log {
            prop_assert_eq!(follower.log().term_at(entry.index), Some(entry.term));
        }
    }
}
