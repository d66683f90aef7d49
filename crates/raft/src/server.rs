//! # server
//!
//! why: drive the pure node state machine with real threads, timers, storage
//! relations: wraps node.rs under one mutex; persists through storage.rs;
//!            talks to peers via transport.rs; feeds state_machine.rs
//! what: RaftServer runtime with election/heartbeat/commit/apply loops
//!
//! Concurrency model: one coarse mutex guards all mutable consensus state.
//! Every rpc handler and loop iteration takes it for its critical section and
//! releases it before any network call - rpc round-trips run on worker-pool
//! threads and never hold the lock. Durable writes happen under the lock,
//! before the change they record is acknowledged to anyone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{error, info, trace, warn};

use crate::config::RaftConfig;
use crate::error::RaftError;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse,
};
use crate::node::{NodeId, NodeState, RaftNode};
use crate::pool::WorkerPool;
use crate::state_machine::StateMachine;
use crate::storage::RaftStorage;
use crate::transport::{RaftService, Transport};

/// Worker threads for outbound rpc fan-out.
const RPC_POOL_SIZE: usize = 32;

/// A point-in-time snapshot of a node's consensus state, for tests and
/// observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    pub state: NodeState,
    pub term: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub leader_id: Option<NodeId>,
}

/// Everything the coarse lock protects: the node state plus its election
/// deadline.
struct Inner {
    node: RaftNode,
    election_deadline: Instant,
}

impl Inner {
    fn reset_election_timer(&mut self, config: &RaftConfig) {
        self.election_deadline = Instant::now() + config.random_election_timeout();
    }
}

/// The threaded raft runtime for one cluster member.
pub struct RaftServer<SM: StateMachine> {
    id: NodeId,
    config: RaftConfig,
    inner: Mutex<Inner>,
    // locked after `inner`, never before it
    storage: Mutex<Box<dyn RaftStorage>>,
    state_machine: Arc<SM>,
    transport: Arc<dyn Transport>,
    pool: WorkerPool,
    stopped: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<SM: StateMachine> RaftServer<SM> {
    /// Build a node, restoring term, vote, and log from storage.
    pub fn new(
        id: NodeId,
        cluster: Vec<NodeId>,
        config: RaftConfig,
        storage: Box<dyn RaftStorage>,
        transport: Arc<dyn Transport>,
        state_machine: Arc<SM>,
    ) -> std::io::Result<Arc<Self>> {
        let mut node = RaftNode::new(id, cluster);
        let (term, voted_for) = storage.load_metadata()?;
        node.current_term = term;
        node.voted_for = voted_for;
        node.log = storage.load_log()?;
        info!(
            node = id,
            term,
            log_len = node.log.len(),
            "restored consensus state"
        );

        let mut inner = Inner { node, election_deadline: Instant::now() };
        inner.reset_election_timer(&config);

        Ok(Arc::new(Self {
            id,
            config,
            inner: Mutex::new(inner),
            storage: Mutex::new(storage),
            state_machine,
            transport,
            pool: WorkerPool::new(RPC_POOL_SIZE),
            stopped: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        }))
    }

    /// Spawn the four background threads. Register the node with its
    /// transport before calling this.
    pub fn start(me: &Arc<Self>) {
        let mut threads = me.threads.lock();
        let spawns: [(&str, fn(Arc<Self>)); 4] = [
            ("raft-election", Self::run_election),
            ("raft-ping", Self::run_ping),
            ("raft-commit", Self::run_commit),
            ("raft-apply", Self::run_apply),
        ];
        for (name, run) in spawns {
            let node = Arc::clone(me);
            let handle = thread::Builder::new()
                .name(format!("{name}-{}", me.id))
                .spawn(move || run(node))
                .expect("spawn background thread");
            threads.push(handle);
        }
    }

    /// Request shutdown and join every background thread. The worker pool is
    /// drained last so in-flight replies still land.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
        self.pool.shutdown();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Append a command to the leader's log and persist it.
    ///
    /// Returns the entry's `(term, index)` without waiting for commit; the
    /// caller observes completion through the state machine (typically via a
    /// result future keyed by the index). Fails fast when not leader.
    pub fn new_command(&self, command: Vec<u8>) -> Result<(u64, u64), RaftError> {
        let mut inner = self.inner.lock();
        if inner.node.state != NodeState::Leader {
            return Err(RaftError::NotLeader);
        }
        let entry = inner.node.append_entry(command);
        if let Err(e) = self.storage.lock().append_entry(&entry) {
            // keep memory and disk consistent: un-append before failing
            inner.node.log.pop();
            return Err(RaftError::Io(e));
        }
        trace!(node = self.id, index = entry.index, "new command appended");
        Ok((entry.term, entry.index))
    }

    /// Whether this node is currently leader, and its term.
    pub fn is_leader(&self) -> (bool, u64) {
        let inner = self.inner.lock();
        (inner.node.state == NodeState::Leader, inner.node.current_term)
    }

    /// Log-compaction hook. Snapshotting is out of scope, so this is a no-op
    /// that reports success.
    pub fn save_snapshot(&self) -> bool {
        true
    }

    pub fn status(&self) -> NodeStatus {
        let inner = self.inner.lock();
        NodeStatus {
            state: inner.node.state,
            term: inner.node.current_term,
            commit_index: inner.node.commit_index,
            last_applied: inner.node.last_applied,
            last_log_index: inner.node.last_log_index(),
            leader_id: inner.node.leader_id,
        }
    }

    // -- persistence helpers --

    /// Persist `(term, voted_for)` if it changed. Returns false when the
    /// write failed, in which case the caller must not act on the change.
    fn persist_metadata_if_changed(&self, inner: &Inner, before: (u64, Option<NodeId>)) -> bool {
        let now = (inner.node.current_term, inner.node.voted_for);
        if now == before {
            return true;
        }
        match self.storage.lock().save_metadata(now.0, now.1) {
            Ok(()) => true,
            Err(e) => {
                error!(node = self.id, error = %e, "failed to persist metadata");
                false
            }
        }
    }

    // -- background loops --

    /// Election loop: followers and candidates watch their randomized timer
    /// and campaign when it expires. Inert on the leader.
    fn run_election(self: Arc<Self>) {
        while !self.is_stopped() {
            thread::sleep(self.config.poll());

            let campaign = {
                let mut inner = self.inner.lock();
                if inner.node.state == NodeState::Leader
                    || Instant::now() < inner.election_deadline
                {
                    None
                } else {
                    // timed out as follower, or campaign stalled as candidate:
                    // either way, start a fresh election with a new deadline
                    let before = (inner.node.current_term, inner.node.voted_for);
                    let req = inner.node.start_election();
                    if !self.persist_metadata_if_changed(&inner, before) {
                        None
                    } else {
                        inner.reset_election_timer(&self.config);
                        if inner.node.has_quorum() {
                            // single-node cluster: own vote is a majority
                            inner.node.become_leader();
                            None
                        } else {
                            let peers: Vec<NodeId> = inner.node.peers().collect();
                            Some((req, peers))
                        }
                    }
                }
            };

            if let Some((req, peers)) = campaign {
                for peer in peers {
                    let me = Arc::clone(&self);
                    let req = req.clone();
                    self.pool.execute(move || Self::send_request_vote(&me, peer, req));
                }
            }
        }
    }

    /// Ping loop: the leader periodically sends (possibly empty)
    /// append-entries to assert leadership and carry leader_commit.
    fn run_ping(self: Arc<Self>) {
        while !self.is_stopped() {
            Self::broadcast_heartbeats(&self);
            thread::sleep(self.config.heartbeat());
        }
    }

    /// Commit-replication loop: ship missing entries to any follower whose
    /// next_index trails the local log.
    fn run_commit(self: Arc<Self>) {
        while !self.is_stopped() {
            thread::sleep(self.config.replicate());

            let sends = {
                let mut inner = self.inner.lock();
                if inner.node.state != NodeState::Leader {
                    Vec::new()
                } else {
                    // a cluster of one gets no replies to drive this
                    inner.node.advance_commit_index();
                    inner
                        .node
                        .peers()
                        .filter_map(|peer| {
                            let req = inner.node.create_append_entries(peer)?;
                            if req.entries.is_empty() {
                                None // peer is caught up, ping loop covers it
                            } else {
                                Some((peer, req))
                            }
                        })
                        .collect::<Vec<_>>()
                }
            };

            for (peer, req) in sends {
                let me = Arc::clone(&self);
                self.pool.execute(move || me.send_append_entries(peer, req));
            }
        }
    }

    /// Apply loop: the only path by which committed entries reach the state
    /// machine - strictly in index order, never concurrently, never skipped.
    fn run_apply(self: Arc<Self>) {
        while !self.is_stopped() {
            thread::sleep(self.config.apply());

            loop {
                let entry = {
                    let mut inner = self.inner.lock();
                    if inner.node.last_applied < inner.node.commit_index {
                        let idx = inner.node.last_applied + 1;
                        inner.node.last_applied = idx;
                        Some(inner.node.log[idx as usize].clone())
                    } else {
                        None
                    }
                };
                match entry {
                    Some(e) => self.state_machine.apply(&e),
                    None => break,
                }
            }
        }
    }

    // -- outbound rpc (worker-pool threads) --

    /// Queue one heartbeat per peer on the worker pool. A slow peer can only
    /// stall its own worker, never the ping tick.
    fn broadcast_heartbeats(me: &Arc<Self>) {
        let beats = {
            let inner = me.inner.lock();
            inner
                .node
                .peers()
                .filter_map(|peer| Some((peer, inner.node.create_heartbeat(peer)?)))
                .collect::<Vec<_>>()
        };
        for (peer, req) in beats {
            let m = Arc::clone(me);
            me.pool.execute(move || m.send_append_entries(peer, req));
        }
    }

    fn send_request_vote(me: &Arc<Self>, target: NodeId, req: VoteRequest) {
        match me.transport.request_vote(target, &req) {
            Ok(resp) => Self::handle_vote_reply(me, target, &resp),
            Err(e) => trace!(node = me.id, peer = target, error = %e, "vote rpc dropped"),
        }
    }

    fn handle_vote_reply(me: &Arc<Self>, from: NodeId, resp: &VoteResponse) {
        let won = {
            let mut inner = me.inner.lock();
            let before = (inner.node.current_term, inner.node.voted_for);
            let won = inner.node.handle_vote_response(from, resp);
            if !me.persist_metadata_if_changed(&inner, before) {
                return;
            }
            if inner.node.state == NodeState::Follower {
                inner.reset_election_timer(&me.config);
            }
            won
        };
        if won {
            info!(node = me.id, "won election");
            Self::broadcast_heartbeats(me);
        }
    }

    fn send_append_entries(&self, target: NodeId, req: AppendEntriesRequest) {
        match self.transport.append_entries(target, &req) {
            Ok(resp) => {
                let mut inner = self.inner.lock();
                let before = (inner.node.current_term, inner.node.voted_for);
                inner.node.handle_append_response(target, &req, &resp);
                if !self.persist_metadata_if_changed(&inner, before) {
                    return;
                }
                if inner.node.state == NodeState::Follower {
                    inner.reset_election_timer(&self.config);
                }
            }
            Err(e) => {
                // retried by the next heartbeat/replication tick
                trace!(node = self.id, peer = target, error = %e, "append rpc dropped");
            }
        }
    }
}

impl<SM: StateMachine> RaftService for RaftServer<SM> {
    fn on_request_vote(&self, req: &VoteRequest) -> VoteResponse {
        let mut inner = self.inner.lock();
        let before = (inner.node.current_term, inner.node.voted_for);
        let resp = inner.node.handle_vote_request(req);
        if !self.persist_metadata_if_changed(&inner, before) {
            // the vote is not durable, so it must not be granted
            return VoteResponse { term: inner.node.current_term, vote_granted: false };
        }
        if resp.vote_granted {
            inner.reset_election_timer(&self.config);
        }
        resp
    }

    fn on_append_entries(&self, req: &AppendEntriesRequest) -> AppendEntriesResponse {
        let mut inner = self.inner.lock();
        let before_term = inner.node.current_term;
        let before = (inner.node.current_term, inner.node.voted_for);
        let (resp, effects) = inner.node.handle_append_entries(req);
        if !self.persist_metadata_if_changed(&inner, before) {
            return AppendEntriesResponse { term: inner.node.current_term, success: false };
        }

        // a truncation and its replacement entries must be durable before the
        // leader hears "success"
        if resp.success {
            let mut storage = self.storage.lock();
            if let Some(idx) = effects.truncated_from {
                if let Err(e) = storage.truncate_from(idx) {
                    warn!(node = self.id, error = %e, "failed to persist log truncation");
                    return AppendEntriesResponse { term: inner.node.current_term, success: false };
                }
            }
            if let Some(from) = effects.appended_from {
                for entry in &inner.node.log[from as usize..] {
                    if let Err(e) = storage.append_entry(entry) {
                        warn!(node = self.id, error = %e, "failed to persist log entry");
                        return AppendEntriesResponse { term: inner.node.current_term, success: false };
                    }
                }
            }
        }

        if req.term >= before_term {
            // any contact from a valid leader resets the election timer
            inner.reset_election_timer(&self.config);
        }
        resp
    }
}
