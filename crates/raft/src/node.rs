//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entry management;
//!            driven by the background threads in server.rs
//! what: NodeState enum, RaftNode struct, election/replication/commit rules
//!
//! Everything here is pure state manipulation: no clocks, no i/o, no locks.
//! That keeps the whole algorithm unit-testable without threads. The runtime
//! in server.rs owns the mutex, the timers, and the persistence ordering.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::log::LogEntry;
use crate::message::{
    AppendEntriesRequest, AppendEntriesResponse, VoteRequest, VoteResponse,
};

/// Identifier of a node in the cluster
pub type NodeId = u64;

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

/// What a follower changed while handling an AppendEntries request.
///
/// The runtime persists exactly these effects before the response is sent:
/// a truncation must hit disk before the entries that replace the conflicting
/// suffix do.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AppendEffects {
    /// Conflicting suffix was removed starting at this index
    pub truncated_from: Option<u64>,
    /// New entries were appended starting at this index
    pub appended_from: Option<u64>,
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: NodeId,
    /// Every node in the cluster, including this one
    pub cluster: Vec<NodeId>,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: u64,
    /// Node ID that received our vote in current term (if any)
    pub voted_for: Option<NodeId>,
    /// The replicated log; index 0 holds a permanent sentinel entry
    pub log: Vec<LogEntry>,
    /// Highest log index known to be replicated on a majority
    pub commit_index: u64,
    /// Highest log index handed to the state machine
    pub last_applied: u64,
    /// Who we believe currently leads the cluster
    pub leader_id: Option<NodeId>,
    /// Votes collected while campaigning (candidate only)
    pub votes_received: Vec<NodeId>,
    /// Next log index to send to each peer (leader only)
    pub next_index: HashMap<NodeId, u64>,
    /// Highest log index known replicated on each peer (leader only)
    pub match_index: HashMap<NodeId, u64>,
}

impl RaftNode {
    /// Create a new Raft node in Follower state with an empty log
    pub fn new(id: NodeId, cluster: Vec<NodeId>) -> Self {
        Self {
            id,
            cluster,
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            log: vec![LogEntry::sentinel()],
            commit_index: 0,
            last_applied: 0,
            leader_id: None,
            votes_received: Vec::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        }
    }

    /// Number of nodes that constitutes a majority
    pub fn quorum_size(&self) -> usize {
        self.cluster.len() / 2 + 1
    }

    /// Whether the collected votes reach a majority
    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    /// All cluster members except this node
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        let me = self.id;
        self.cluster.iter().copied().filter(move |&n| n != me)
    }

    pub fn last_log_index(&self) -> u64 {
        (self.log.len() - 1) as u64
    }

    pub fn last_log_term(&self) -> u64 {
        self.log[self.log.len() - 1].term
    }

    // -- transitions --

    /// Step down to follower at the given term, clearing election state.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.voted_for = None;
        }
        debug!(node = self.id, term, "becoming follower");
        self.state = NodeState::Follower;
        self.current_term = term;
        self.votes_received.clear();
    }

    /// Become candidate for a fresh term and build the vote request to
    /// broadcast. The node votes for itself immediately.
    pub fn start_election(&mut self) -> VoteRequest {
        self.state = NodeState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.votes_received.clear();
        self.votes_received.push(self.id);
        self.leader_id = None;
        debug!(node = self.id, term = self.current_term, "starting election");
        VoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        }
    }

    /// Take leadership of the current term. Resets next_index/match_index
    /// for every peer, as these are meaningless across terms.
    pub fn become_leader(&mut self) {
        debug!(node = self.id, term = self.current_term, "becoming leader");
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();
        let next = self.last_log_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for peer in self.peers().collect::<Vec<_>>() {
            self.next_index.insert(peer, next);
            self.match_index.insert(peer, 0);
        }
    }

    // -- election --

    /// Handle an incoming vote request.
    ///
    /// Grants iff we have not voted for someone else this term and the
    /// candidate's log is at least as up-to-date as ours (higher last term,
    /// or equal last term and an index no shorter than ours).
    ///
    /// The caller must persist `(current_term, voted_for)` before sending the
    /// response whenever they changed.
    pub fn handle_vote_request(&mut self, req: &VoteRequest) -> VoteResponse {
        if req.term < self.current_term {
            return VoteResponse { term: self.current_term, vote_granted: false };
        }
        if req.term > self.current_term {
            self.become_follower(req.term);
        }

        let free_to_vote =
            self.voted_for.is_none() || self.voted_for == Some(req.candidate_id);
        let log_ok = req.last_log_term > self.last_log_term()
            || (req.last_log_term == self.last_log_term()
                && req.last_log_index >= self.last_log_index());

        let vote_granted = free_to_vote && log_ok;
        if vote_granted {
            self.voted_for = Some(req.candidate_id);
            debug!(node = self.id, term = self.current_term, candidate = req.candidate_id, "vote granted");
        }
        VoteResponse { term: self.current_term, vote_granted }
    }

    /// Handle a vote response while campaigning. Returns true when this
    /// response completed the quorum and the node just became leader.
    pub fn handle_vote_response(&mut self, from: NodeId, resp: &VoteResponse) -> bool {
        if resp.term > self.current_term {
            self.become_follower(resp.term);
            return false;
        }
        if self.state != NodeState::Candidate || resp.term != self.current_term {
            // stale reply from an earlier campaign, or we already won/lost
            return false;
        }
        if resp.vote_granted && !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }
        if self.has_quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    // -- replication --

    /// Append a command to the local log. Leader only; the caller checks the
    /// role and persists the returned entry before acknowledging it.
    pub fn append_entry(&mut self, command: Vec<u8>) -> LogEntry {
        let entry = LogEntry::new(self.current_term, self.last_log_index() + 1, command);
        self.log.push(entry.clone());
        entry
    }

    /// Build the AppendEntries request carrying everything the peer is
    /// missing, from its next_index onward. None when we are not leader.
    pub fn create_append_entries(&self, peer: NodeId) -> Option<AppendEntriesRequest> {
        if self.state != NodeState::Leader {
            return None;
        }
        let next = *self.next_index.get(&peer)?;
        let prev = next - 1;
        let entries = self.log[next as usize..].to_vec();
        Some(AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index: prev,
            prev_log_term: self.log[prev as usize].term,
            entries,
            leader_commit: self.commit_index,
        })
    }

    /// Build an empty AppendEntries for the peer: asserts leadership, carries
    /// leader_commit, and still performs the log-matching check on the peer.
    pub fn create_heartbeat(&self, peer: NodeId) -> Option<AppendEntriesRequest> {
        let mut req = self.create_append_entries(peer)?;
        req.entries.clear();
        Some(req)
    }

    /// Handle an incoming AppendEntries request (possibly a heartbeat).
    ///
    /// On success any conflicting suffix is truncated, new entries are
    /// appended, and commit_index advances to min(leader_commit, last new
    /// entry). The returned [`AppendEffects`] tells the runtime what to
    /// persist before replying.
    pub fn handle_append_entries(
        &mut self,
        req: &AppendEntriesRequest,
    ) -> (AppendEntriesResponse, AppendEffects) {
        let mut effects = AppendEffects::default();

        if req.term < self.current_term {
            return (
                AppendEntriesResponse { term: self.current_term, success: false },
                effects,
            );
        }
        // Valid leader contact: a candidate of the same term loses to it,
        // anyone at a lower term adopts it.
        if req.term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(req.term);
        }
        self.leader_id = Some(req.leader_id);

        // log-matching check
        if req.prev_log_index > self.last_log_index()
            || self.log[req.prev_log_index as usize].term != req.prev_log_term
        {
            return (
                AppendEntriesResponse { term: self.current_term, success: false },
                effects,
            );
        }

        for entry in &req.entries {
            let idx = entry.index;
            if idx <= self.last_log_index() {
                if self.log[idx as usize].term == entry.term {
                    // already have this entry, nothing to do
                    continue;
                }
                // conflict: drop this entry and everything after it
                self.log.truncate(idx as usize);
                effects.truncated_from = Some(idx);
            }
            self.log.push(entry.clone());
            effects.appended_from.get_or_insert(idx);
        }

        let last_new = req
            .entries
            .last()
            .map(|e| e.index)
            .unwrap_or(self.last_log_index());
        let new_commit = req.leader_commit.min(last_new);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
        }

        (
            AppendEntriesResponse { term: self.current_term, success: true },
            effects,
        )
    }

    /// Handle a follower's reply to an AppendEntries we sent.
    ///
    /// Success advances match_index/next_index and may advance commit_index.
    /// Failure backs next_index off so the next tick resends from earlier.
    pub fn handle_append_response(
        &mut self,
        from: NodeId,
        req: &AppendEntriesRequest,
        resp: &AppendEntriesResponse,
    ) {
        if resp.term > self.current_term {
            self.become_follower(resp.term);
            return;
        }
        if self.state != NodeState::Leader || resp.term != self.current_term {
            return;
        }
        if resp.success {
            let matched = req.prev_log_index + req.entries.len() as u64;
            let m = self.match_index.entry(from).or_insert(0);
            if matched > *m {
                *m = matched;
            }
            self.next_index.insert(from, matched + 1);
            self.advance_commit_index();
        } else {
            // log mismatch: back off below the probe point and retry
            let next = self.next_index.entry(from).or_insert(1);
            *next = req.prev_log_index.max(1);
        }
    }

    /// Recompute commit_index from the majority match index.
    ///
    /// Only entries from the current term may be committed by counting
    /// replicas; earlier-term entries commit indirectly once a current-term
    /// entry after them does.
    pub fn advance_commit_index(&mut self) {
        let mut matches: Vec<u64> = self.peers().map(|p| self.match_index.get(&p).copied().unwrap_or(0)).collect();
        matches.push(self.last_log_index());
        matches.sort_unstable_by(|a, b| b.cmp(a));
        let majority = matches[self.quorum_size() - 1];
        if majority > self.commit_index && self.log[majority as usize].term == self.current_term {
            debug!(node = self.id, commit = majority, "commit index advanced");
            self.commit_index = majority;
        }
    }
}
