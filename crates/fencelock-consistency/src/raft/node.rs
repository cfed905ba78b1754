// RaftNode: leader election, log replication and commit tracking for one region
// Drives the lock state machine with committed entries

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use fencelock_common::LockError;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::config::RaftConfig;
use super::log_store::RaftLog;
use super::network::{
    AppendEntriesRequest, AppendEntriesResponse, RaftTransport, VoteRequest, VoteResponse,
};
use super::request::{ApplyOutcome, EntryType, LockCommand, LogEntry, RaftLogError};
use super::state_machine::RaftStateMachine;
use super::types::{NodeId, RaftMetrics, ServerState, majority};

type PendingSender = oneshot::Sender<Result<ApplyOutcome, LockError>>;

/// Mutable consensus state, guarded by a single mutex
struct NodeState {
    state: ServerState,
    current_term: u64,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    commit_index: u64,
    next_index: HashMap<NodeId, u64>,
    match_index: HashMap<NodeId, u64>,
    /// Index of the NOOP this node appended when it last became leader
    term_start_index: u64,
    election_deadline: Instant,
}

impl NodeState {
    fn step_down(&mut self, term: u64, leader_id: Option<NodeId>, election_timeout: Duration) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
        }
        self.state = ServerState::Follower;
        self.leader_id = leader_id;
        self.next_index.clear();
        self.match_index.clear();
        self.election_deadline = Instant::now() + election_timeout;
    }
}

/// Handle to a submitted entry, resolved once the entry is applied
pub struct CommitHandle {
    index: u64,
    receiver: oneshot::Receiver<Result<ApplyOutcome, LockError>>,
    node: Arc<RaftNode>,
}

impl CommitHandle {
    /// Log index assigned to the entry
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Wait for the entry to be applied, failing with `Timeout` after `deadline`
    ///
    /// A timed-out entry may still commit later.
    pub async fn wait(self, deadline: Duration) -> Result<ApplyOutcome, LockError> {
        match timeout(deadline, self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LockError::Internal(format!(
                "proposal at index {} was dropped",
                self.index
            ))),
            Err(_) => {
                self.node.pending.remove(&self.index);
                Err(LockError::Timeout(format!(
                    "entry {} not committed within {}ms",
                    self.index,
                    deadline.as_millis()
                )))
            }
        }
    }
}

/// A Raft consensus participant
pub struct RaftNode {
    node_id: NodeId,
    peers: Vec<NodeId>,
    config: RaftConfig,
    core: Mutex<NodeState>,
    log: Arc<RaftLog>,
    state_machine: Arc<RaftStateMachine>,
    transport: Arc<dyn RaftTransport>,
    /// Waiters keyed by log index, tagged with the term the entry was proposed in
    pending: DashMap<u64, (u64, PendingSender)>,
    /// Serializes state machine application
    apply_guard: Mutex<()>,
    /// One replication stream per peer at a time
    replication_guards: HashMap<NodeId, tokio::sync::Mutex<()>>,
    running: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RaftNode {
    pub fn new(
        node_id: impl Into<NodeId>,
        peers: Vec<NodeId>,
        config: RaftConfig,
        state_machine: Arc<RaftStateMachine>,
        transport: Arc<dyn RaftTransport>,
    ) -> Arc<Self> {
        let node_id = node_id.into();
        let peers: Vec<NodeId> = peers.into_iter().filter(|p| *p != node_id).collect();
        let replication_guards = peers
            .iter()
            .map(|p| (p.clone(), tokio::sync::Mutex::new(())))
            .collect();
        let election_deadline = Instant::now() + config.random_election_timeout();

        info!(
            node_id = %node_id,
            peers = ?peers,
            "Creating Raft node"
        );

        Arc::new(Self {
            node_id,
            peers,
            config,
            core: Mutex::new(NodeState {
                state: ServerState::Follower,
                current_term: 0,
                voted_for: None,
                leader_id: None,
                commit_index: 0,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
                term_start_index: 0,
                election_deadline,
            }),
            log: Arc::new(RaftLog::new()),
            state_machine,
            transport,
            pending: DashMap::new(),
            apply_guard: Mutex::new(()),
            replication_guards,
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.peers
    }

    pub fn log(&self) -> &Arc<RaftLog> {
        &self.log
    }

    pub fn state_machine(&self) -> &Arc<RaftStateMachine> {
        &self.state_machine
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start the election timer and heartbeat loops
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.core.lock().election_deadline = Instant::now() + self.config.random_election_timeout();

        let tick = Duration::from_millis((self.config.election_timeout_ms / 10).clamp(5, 100));
        let election_node = self.clone();
        let election_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            loop {
                ticker.tick().await;
                let due = {
                    let s = election_node.core.lock();
                    s.state != ServerState::Leader && Instant::now() >= s.election_deadline
                };
                if due {
                    let node = election_node.clone();
                    tokio::spawn(async move { node.start_election().await });
                }
            }
        });

        let heartbeat_node = self.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_node.config.heartbeat_interval());
            loop {
                ticker.tick().await;
                if heartbeat_node.is_leader() {
                    heartbeat_node.replicate_all();
                }
            }
        });

        self.tasks.lock().extend([election_task, heartbeat_task]);
        info!(node_id = %self.node_id, "Raft node started");
    }

    /// Stop background loops and fail every waiting proposal
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        {
            let mut s = self.core.lock();
            let term = s.current_term;
            s.step_down(term, None, self.config.election_timeout());
        }
        let indices: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for index in indices {
            if let Some((_, (_, tx))) = self.pending.remove(&index) {
                let _ = tx.send(Err(LockError::Internal("raft node shut down".to_string())));
            }
        }
        info!(node_id = %self.node_id, "Raft node shutdown complete");
    }

    pub fn is_leader(&self) -> bool {
        self.core.lock().state == ServerState::Leader
    }

    /// Leader that has applied every entry committed before its term
    ///
    /// Until its NOOP is applied a new leader's lock table and token
    /// counters may lag entries its predecessor committed.
    pub fn is_leader_ready(&self) -> bool {
        let s = self.core.lock();
        s.state == ServerState::Leader && self.state_machine.last_applied() >= s.term_start_index
    }

    /// Wait until this node is a ready leader
    ///
    /// Fails at once with `NotLeader` on a non-leader and with `Timeout` if
    /// the term's NOOP is not applied within `deadline`.
    pub async fn wait_until_ready(&self, deadline: Duration) -> Result<(), LockError> {
        let start = Instant::now();
        loop {
            {
                let s = self.core.lock();
                if s.state != ServerState::Leader {
                    return Err(LockError::not_leader(s.leader_id.clone()));
                }
                if self.state_machine.last_applied() >= s.term_start_index {
                    return Ok(());
                }
            }
            if start.elapsed() >= deadline {
                return Err(LockError::Timeout(format!(
                    "leader {} has not applied its term start within {}ms",
                    self.node_id,
                    deadline.as_millis()
                )));
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.core.lock().leader_id.clone()
    }

    pub fn current_term(&self) -> u64 {
        self.core.lock().current_term
    }

    pub fn commit_index(&self) -> u64 {
        self.core.lock().commit_index
    }

    /// Get current metrics
    pub fn metrics(&self) -> RaftMetrics {
        let s = self.core.lock();
        let (last_log_index, last_log_term) = self.log.last_index_and_term();
        RaftMetrics {
            node_id: self.node_id.clone(),
            state: s.state,
            current_term: s.current_term,
            voted_for: s.voted_for.clone(),
            leader_id: s.leader_id.clone(),
            commit_index: s.commit_index,
            last_applied: self.state_machine.last_applied(),
            last_log_index,
            last_log_term,
        }
    }

    // ==================== Election ====================

    /// Become candidate for the next term and solicit votes from all peers
    pub async fn start_election(self: &Arc<Self>) {
        let request = {
            let mut s = self.core.lock();
            if s.state == ServerState::Leader {
                return;
            }
            s.state = ServerState::Candidate;
            s.current_term += 1;
            s.voted_for = Some(self.node_id.clone());
            s.leader_id = None;
            s.election_deadline = Instant::now() + self.config.random_election_timeout();
            let (last_log_index, last_log_term) = self.log.last_index_and_term();
            VoteRequest {
                term: s.current_term,
                candidate_id: self.node_id.clone(),
                last_log_index,
                last_log_term,
            }
        };
        let term = request.term;
        metrics::gauge!("fencelock_raft_term").set(term as f64);
        info!(node_id = %self.node_id, term, "Starting election");

        let needed = majority(self.cluster_size());
        let mut votes = 1usize;
        if votes >= needed {
            self.become_leader(term);
            return;
        }

        let rpc_timeout = self.config.vote_rpc_timeout();
        let mut calls: FuturesUnordered<_> = self
            .peers
            .iter()
            .map(|peer| {
                let transport = self.transport.clone();
                let request = request.clone();
                async move {
                    let result = timeout(rpc_timeout, transport.request_vote(peer, request)).await;
                    (peer, result)
                }
            })
            .collect();

        while let Some((peer, result)) = calls.next().await {
            match result {
                Ok(Ok(response)) => {
                    if response.term > term {
                        let mut s = self.core.lock();
                        if response.term > s.current_term {
                            info!(
                                node_id = %self.node_id,
                                term = response.term,
                                "Discovered higher term during election, stepping down"
                            );
                            s.step_down(response.term, None, self.config.random_election_timeout());
                        }
                        return;
                    }
                    if response.vote_granted {
                        votes += 1;
                        debug!(node_id = %self.node_id, from = %peer, votes, needed, "Vote granted");
                        if votes >= needed {
                            self.become_leader(term);
                            return;
                        }
                    }
                }
                Ok(Err(e)) => debug!(peer = %peer, "RequestVote failed: {}", e),
                Err(_) => debug!(peer = %peer, "RequestVote timed out"),
            }
        }

        debug!(node_id = %self.node_id, term, votes, needed, "Election lost or split");
    }

    fn become_leader(self: &Arc<Self>, term: u64) {
        {
            let mut s = self.core.lock();
            if s.current_term != term || s.state != ServerState::Candidate {
                return;
            }
            s.state = ServerState::Leader;
            s.leader_id = Some(self.node_id.clone());

            let last_index = self.log.last_index();
            for peer in &self.peers {
                s.next_index.insert(peer.clone(), last_index + 1);
                s.match_index.insert(peer.clone(), 0);
            }
            s.term_start_index = last_index + 1;
            if let Err(e) = self.log.append(LogEntry::noop(last_index + 1, term)) {
                error!(node_id = %self.node_id, "Failed to append leader NOOP: {}", e);
            }
        }

        info!(node_id = %self.node_id, term, "Became leader");
        if self.peers.is_empty() {
            self.advance_commit();
        } else {
            self.replicate_all();
        }
    }

    /// Handle an incoming RequestVote RPC
    pub fn handle_vote_request(&self, request: VoteRequest) -> VoteResponse {
        let mut s = self.core.lock();

        if request.term < s.current_term {
            return VoteResponse {
                term: s.current_term,
                vote_granted: false,
            };
        }
        if request.term > s.current_term {
            s.step_down(request.term, None, self.config.random_election_timeout());
        }

        let (last_index, last_term) = self.log.last_index_and_term();
        let log_ok = request.last_log_term > last_term
            || (request.last_log_term == last_term && request.last_log_index >= last_index);
        let can_vote = match &s.voted_for {
            None => true,
            Some(candidate) => *candidate == request.candidate_id,
        };

        let vote_granted = can_vote && log_ok;
        if vote_granted {
            s.voted_for = Some(request.candidate_id.clone());
            s.election_deadline = Instant::now() + self.config.random_election_timeout();
        }
        debug!(
            node_id = %self.node_id,
            candidate = %request.candidate_id,
            term = request.term,
            vote_granted,
            "Handled vote request"
        );

        VoteResponse {
            term: s.current_term,
            vote_granted,
        }
    }

    // ==================== Replication ====================

    fn replicate_all(self: &Arc<Self>) {
        for peer in &self.peers {
            let node = self.clone();
            let peer = peer.clone();
            tokio::spawn(async move { node.replicate_to_peer(&peer).await });
        }
    }

    /// Send entries from `nextIndex[peer]` onward and process the reply
    ///
    /// Keeps streaming while the peer accepts and lags behind. A rejection
    /// lowers `nextIndex` and waits for the next heartbeat.
    pub async fn replicate_to_peer(self: &Arc<Self>, peer: &NodeId) {
        let Some(guard) = self.replication_guards.get(peer) else {
            return;
        };
        let Ok(_in_flight) = guard.try_lock() else {
            return;
        };

        loop {
            let (request, sent_last) = {
                let s = self.core.lock();
                if s.state != ServerState::Leader {
                    return;
                }
                let next = s.next_index.get(peer).copied().unwrap_or(1).max(1);
                let prev_log_index = next - 1;
                let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
                let entries = self
                    .log
                    .get_range(next, next + self.config.max_payload_entries.max(1));
                let sent_last = prev_log_index + entries.len() as u64;
                (
                    AppendEntriesRequest {
                        term: s.current_term,
                        leader_id: self.node_id.clone(),
                        prev_log_index,
                        prev_log_term,
                        entries,
                        leader_commit: s.commit_index,
                    },
                    sent_last,
                )
            };
            let term = request.term;

            let response = match timeout(
                self.config.append_rpc_timeout(),
                self.transport.append_entries(peer, request),
            )
            .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    debug!(peer = %peer, "AppendEntries failed: {}", e);
                    return;
                }
                Err(_) => {
                    debug!(peer = %peer, "AppendEntries timed out");
                    return;
                }
            };

            let more = {
                let mut s = self.core.lock();
                if response.term > s.current_term {
                    info!(
                        node_id = %self.node_id,
                        term = response.term,
                        "Discovered higher term from {}, stepping down",
                        peer
                    );
                    s.step_down(response.term, None, self.config.random_election_timeout());
                    return;
                }
                if s.state != ServerState::Leader || s.current_term != term {
                    return;
                }

                if response.success {
                    let matched = response.match_index.min(sent_last);
                    let match_index = s.match_index.entry(peer.clone()).or_insert(0);
                    *match_index = (*match_index).max(matched);
                    let next = *match_index + 1;
                    s.next_index.insert(peer.clone(), next);
                    next <= self.log.last_index()
                } else {
                    let next = s.next_index.get(peer).copied().unwrap_or(1);
                    let lowered = next
                        .saturating_sub(1)
                        .min(response.match_index + 1)
                        .max(1);
                    debug!(peer = %peer, next_index = lowered, "AppendEntries rejected");
                    s.next_index.insert(peer.clone(), lowered);
                    false
                }
            };

            if response.success {
                self.advance_commit();
            }
            if !more {
                return;
            }
        }
    }

    /// Recompute the commit index from the majority of match indices
    fn advance_commit(&self) {
        let advanced = {
            let mut s = self.core.lock();
            if s.state != ServerState::Leader {
                return;
            }
            let mut indices: Vec<u64> = s.match_index.values().copied().collect();
            indices.push(self.log.last_index());
            indices.sort_unstable_by(|a, b| b.cmp(a));
            let candidate = indices[majority(self.cluster_size()) - 1];

            // Only entries of the current term commit by counting replicas
            if candidate > s.commit_index
                && self.log.term_at(candidate) == Some(s.current_term)
            {
                s.commit_index = candidate;
                true
            } else {
                false
            }
        };

        if advanced {
            self.apply_committed();
        }
    }

    /// Handle an incoming AppendEntries RPC
    pub fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let (response, advanced) = self.append_entries_locked(request);
        if advanced {
            self.apply_committed();
        }
        response
    }

    fn append_entries_locked(&self, request: AppendEntriesRequest) -> (AppendEntriesResponse, bool) {
        let mut s = self.core.lock();
        let last_index = self.log.last_index();

        if request.term < s.current_term {
            return (
                AppendEntriesResponse {
                    term: s.current_term,
                    success: false,
                    match_index: last_index,
                },
                false,
            );
        }

        if request.term > s.current_term || s.state != ServerState::Follower {
            s.step_down(
                request.term,
                Some(request.leader_id.clone()),
                self.config.random_election_timeout(),
            );
        }
        s.leader_id = Some(request.leader_id.clone());
        s.election_deadline = Instant::now() + self.config.random_election_timeout();
        let term = s.current_term;

        let reject = |match_index: u64| AppendEntriesResponse {
            term,
            success: false,
            match_index,
        };

        if request.prev_log_index > last_index {
            return (reject(last_index), false);
        }
        if !self
            .log
            .contains_entry(request.prev_log_index, request.prev_log_term)
        {
            return (reject(request.prev_log_index.saturating_sub(1)), false);
        }

        let last_new = request.prev_log_index + request.entries.len() as u64;
        let mut to_append = Vec::new();
        for entry in request.entries {
            if !to_append.is_empty() {
                to_append.push(entry);
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(existing) if existing == entry.term => {}
                Some(_) => {
                    if entry.index <= s.commit_index {
                        let e = RaftLogError::TruncateCommitted {
                            index: entry.index,
                            commit_index: s.commit_index,
                        };
                        error!(node_id = %self.node_id, "Rejecting AppendEntries: {}", e);
                        return (reject(s.commit_index), false);
                    }
                    self.log.truncate_from(entry.index);
                    self.fail_pending_from(entry.index, &request.leader_id);
                    to_append.push(entry);
                }
                None => to_append.push(entry),
            }
        }
        if let Err(e) = self.log.append_all(to_append) {
            warn!(node_id = %self.node_id, "Failed to append replicated entries: {}", e);
            return (reject(self.log.last_index()), false);
        }

        let mut advanced = false;
        let commit_target = request.leader_commit.min(last_new);
        if commit_target > s.commit_index {
            s.commit_index = commit_target;
            advanced = true;
        }

        (
            AppendEntriesResponse {
                term,
                success: true,
                match_index: last_new,
            },
            advanced,
        )
    }

    fn fail_pending_from(&self, index: u64, leader_id: &NodeId) {
        let stale: Vec<u64> = self
            .pending
            .iter()
            .map(|e| *e.key())
            .filter(|i| *i >= index)
            .collect();
        for i in stale {
            if let Some((_, (_, tx))) = self.pending.remove(&i) {
                let _ = tx.send(Err(LockError::not_leader(Some(leader_id.clone()))));
            }
        }
    }

    /// Apply committed entries in index order
    fn apply_committed(&self) {
        let _guard = self.apply_guard.lock();
        let commit_index = self.core.lock().commit_index;
        metrics::gauge!("fencelock_raft_commit_index").set(commit_index as f64);

        loop {
            let next = self.state_machine.last_applied() + 1;
            if next > commit_index {
                break;
            }
            let Some(entry) = self.log.get(next) else {
                warn!(node_id = %self.node_id, index = next, "Committed entry missing from log");
                break;
            };
            self.state_machine.apply(&entry, |result| {
                if let Some((_, (term, tx))) = self.pending.remove(&entry.index) {
                    let result = if term == entry.term {
                        result
                    } else {
                        Err(LockError::not_leader(None))
                    };
                    let _ = tx.send(result);
                }
            });
        }
    }

    // ==================== Proposals ====================

    /// Append a lock command as leader and start replicating it
    ///
    /// Fails fast with `NotLeader` carrying the known leader id on followers.
    pub fn submit(
        self: &Arc<Self>,
        entry_type: EntryType,
        command: &LockCommand,
    ) -> Result<CommitHandle, LockError> {
        let payload = command
            .encode()
            .map_err(|e| LockError::Internal(e.to_string()))?;

        let (index, receiver) = {
            let s = self.core.lock();
            if s.state != ServerState::Leader {
                return Err(LockError::not_leader(s.leader_id.clone()));
            }
            let index = self.log.last_index() + 1;
            self.log
                .append(LogEntry::new(index, s.current_term, entry_type, payload))
                .map_err(|e| LockError::Internal(e.to_string()))?;
            let (tx, rx) = oneshot::channel();
            self.pending.insert(index, (s.current_term, tx));
            (index, rx)
        };

        metrics::counter!("fencelock_raft_proposals_total", "type" => entry_type.op_type())
            .increment(1);
        debug!(
            node_id = %self.node_id,
            index,
            op = entry_type.op_type(),
            lock_id = %command.lock_id,
            "Proposed entry"
        );

        if self.peers.is_empty() {
            self.advance_commit();
        } else {
            self.replicate_all();
        }

        Ok(CommitHandle {
            index,
            receiver,
            node: self.clone(),
        })
    }

    /// Submit and wait up to the configured commit timeout
    pub async fn propose(
        self: &Arc<Self>,
        entry_type: EntryType,
        command: &LockCommand,
    ) -> Result<ApplyOutcome, LockError> {
        let handle = self.submit(entry_type, command)?;
        handle.wait(self.config.commit_timeout()).await
    }

    /// Wait until some node is known as leader, returning its id
    pub async fn wait_for_leader(&self, deadline: Duration) -> Option<NodeId> {
        let start = Instant::now();
        loop {
            if let Some(leader_id) = self.leader_id() {
                return Some(leader_id);
            }
            if start.elapsed() > deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for RaftNode {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
