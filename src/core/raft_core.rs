//! Raft consensus state for a single node
//!
//! `RaftCore` is synchronous and transport-agnostic: every handler mutates the
//! node's own state and returns the messages that should be sent as a result.
//! The event loop in `raft_server` decides when handlers run and hands the
//! returned messages to the transport.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::config::{Conformance, RaftConfig};
use super::message::{LogEntry, Message, NodeId, Payload};

/// Raft node states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftState {
    /// Follower: Passive state, receives updates from leader
    Follower,
    /// Candidate: Actively seeking votes to become leader
    Candidate,
    /// Leader: Handles all client requests and replicates log
    Leader,
}

/// Point-in-time view of a node, taken under the node's lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub term: u64,
    pub state: RaftState,
    pub voted_for: Option<NodeId>,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    pub votes_received: usize,
    pub log: Vec<LogEntry>,
    pub alive: bool,
}

/// True if `count` nodes are a strict majority of `cluster_size`
pub fn is_majority(count: usize, cluster_size: usize) -> bool {
    count * 2 > cluster_size
}

/// Core Raft state machine (sync, transport-agnostic)
pub struct RaftCore {
    /// Unique identifier for this node
    pub id: NodeId,
    /// Latest term this node has seen (starts at 0, never decreases)
    pub current_term: u64,
    /// Current state of this node
    pub state: RaftState,
    /// Candidate that received our vote in the current term
    pub voted_for: Option<NodeId>,
    /// Log entries in append order (positions are 1-based)
    pub log: Vec<LogEntry>,
    /// Number of leading log entries known to be committed
    pub commit_index: u64,
    /// Last known leader
    pub current_leader: Option<NodeId>,
    /// IDs of the other nodes in the cluster
    pub peers: Vec<NodeId>,
    /// When the election timer fires unless re-armed first
    pub election_deadline: Instant,
    // Distinct nodes that granted a vote in the current election (self included)
    votes_received: Vec<NodeId>,
    // Leader only: highest log position known to be stored on each peer
    match_index: HashMap<NodeId, u64>,
    config: RaftConfig,
}

impl RaftCore {
    /// Create a follower at term 0 with an empty log and an armed election timer
    pub fn new(id: NodeId, peers: Vec<NodeId>, config: RaftConfig) -> Self {
        let election_deadline = Instant::now() + config.random_election_timeout();
        RaftCore {
            id,
            current_term: 0,
            state: RaftState::Follower,
            voted_for: None,
            log: Vec::new(),
            commit_index: 0,
            current_leader: None,
            peers,
            election_deadline,
            votes_received: Vec::new(),
            match_index: HashMap::new(),
            config,
        }
    }

    /// Number of nodes in the cluster, self included
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Number of distinct votes collected in the current election
    pub fn votes_received(&self) -> usize {
        self.votes_received.len()
    }

    pub fn last_log_index(&self) -> u64 {
        self.log.len() as u64
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at a 1-based position; position 0 is the empty prefix
    fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.log.get(index as usize - 1).map(|e| e.term)
    }

    /// Check if candidate's log is at least as up-to-date as receiver's log
    pub fn is_log_up_to_date(&self, candidate_last_log_term: u64, candidate_last_log_index: u64) -> bool {
        let my_last_term = self.last_log_term();
        let my_last_index = self.last_log_index();

        candidate_last_log_term > my_last_term
            || (candidate_last_log_term == my_last_term && candidate_last_log_index >= my_last_index)
    }

    /// Draw a fresh timeout and push the election deadline forward
    pub fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + self.config.random_election_timeout();
    }

    /// True once the election deadline has passed on a non-leader
    pub fn election_timed_out(&self) -> bool {
        self.state != RaftState::Leader && Instant::now() >= self.election_deadline
    }

    pub fn status(&self, alive: bool) -> NodeStatus {
        NodeStatus {
            id: self.id,
            term: self.current_term,
            state: self.state,
            voted_for: self.voted_for,
            leader_id: self.current_leader,
            commit_index: self.commit_index,
            votes_received: self.votes_received(),
            log: self.log.clone(),
            alive,
        }
    }

    /// Adopt a newer term and revert to follower
    fn adopt_term(&mut self, term: u64) {
        let old_state = self.state;
        self.current_term = term;
        self.voted_for = None;
        self.current_leader = None;
        self.state = RaftState::Follower;
        self.votes_received.clear();
        if old_state != RaftState::Follower {
            info!(node = self.id, term, was = ?old_state, "stepped down to follower");
            // A former leader has no armed timer; give it a fresh one.
            self.reset_election_timer();
        }
    }

    fn envelope(&self, to: NodeId, payload: Payload) -> Message {
        Message {
            term: self.current_term,
            from: self.id,
            to,
            payload,
        }
    }

    /// Start a new election (called when election timeout elapses)
    /// Returns the vote requests to broadcast, or heartbeats if this node won outright
    pub fn start_election(&mut self) -> Vec<Message> {
        self.current_term += 1;
        self.state = RaftState::Candidate;
        self.current_leader = None;
        self.voted_for = Some(self.id);
        self.votes_received.clear();
        self.votes_received.push(self.id);
        self.reset_election_timer();
        info!(node = self.id, term = self.current_term, "became candidate");

        if is_majority(self.votes_received.len(), self.cluster_size()) {
            return self.become_leader();
        }

        let payload = Payload::VoteRequest {
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };
        self.peers
            .iter()
            .map(|&peer| self.envelope(peer, payload.clone()))
            .collect()
    }

    /// Start an election if the timer has really expired
    pub fn handle_election_timeout(&mut self) -> Vec<Message> {
        if !self.election_timed_out() {
            return Vec::new();
        }
        if self.state == RaftState::Candidate {
            debug!(node = self.id, term = self.current_term, votes = self.votes_received(), "election timed out without majority");
        }
        self.start_election()
    }

    /// Become leader (called after receiving majority of votes)
    /// Returns the initial heartbeat broadcast
    pub fn become_leader(&mut self) -> Vec<Message> {
        self.state = RaftState::Leader;
        self.current_leader = Some(self.id);
        self.match_index = self.peers.iter().map(|&peer| (peer, 0)).collect();
        info!(node = self.id, term = self.current_term, votes = self.votes_received(), "became leader");
        self.heartbeat()
    }

    /// AppendEntries to every peer; carries the last log entry when `with_entry` is set
    fn broadcast_append(&self, with_entry: bool) -> Vec<Message> {
        let (entry, prev_log_index) = match (with_entry, self.log.last()) {
            (true, Some(last)) => (Some(last.clone()), self.last_log_index() - 1),
            _ => (None, self.last_log_index()),
        };
        let payload = Payload::AppendEntries {
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.term_at(prev_log_index).unwrap_or(0),
            entry,
            leader_commit: self.commit_index,
        };
        self.peers
            .iter()
            .map(|&peer| self.envelope(peer, payload.clone()))
            .collect()
    }

    /// Heartbeat broadcast (empty AppendEntries); nothing unless leader
    pub fn heartbeat(&self) -> Vec<Message> {
        if self.state != RaftState::Leader {
            return Vec::new();
        }
        self.broadcast_append(false)
    }

    /// Append a client command to the leader's log
    /// Returns None if called on a non-leader node
    pub fn append_log_entry(&mut self, command: String) -> Option<LogEntry> {
        if self.state != RaftState::Leader {
            return None;
        }

        let entry = LogEntry::new(self.current_term, command);
        self.log.push(entry.clone());
        debug!(node = self.id, index = self.last_log_index(), term = self.current_term, command = %entry.command, "appended entry");
        // Only matters for a single-node cluster, where the leader alone is a majority.
        self.advance_commit_index();
        Some(entry)
    }

    /// Append a client command and return the AppendEntries broadcast carrying it
    /// Non-leaders drop the command and return nothing
    pub fn submit_command(&mut self, command: String) -> Vec<Message> {
        match self.append_log_entry(command) {
            Some(_) => self.broadcast_append(true),
            None => {
                debug!(node = self.id, state = ?self.state, "dropping client command, not leader");
                Vec::new()
            }
        }
    }

    /// Handle one inbound message; returns the messages to send in response
    pub fn handle_message(&mut self, msg: Message) -> Vec<Message> {
        if msg.to != self.id {
            warn!(node = self.id, to = msg.to, kind = msg.kind(), "ignoring misaddressed message");
            return Vec::new();
        }

        if msg.term < self.current_term {
            trace!(node = self.id, from = msg.from, kind = msg.kind(), msg_term = msg.term, term = self.current_term, "stale message");
            return self.reject_stale(&msg).into_iter().collect();
        }

        // If RPC request or response contains term T > currentTerm: set currentTerm = T, convert to follower
        if msg.term > self.current_term {
            self.adopt_term(msg.term);
        }

        match msg.payload {
            Payload::VoteRequest { last_log_index, last_log_term } => {
                vec![self.handle_vote_request(msg.from, last_log_index, last_log_term)]
            }
            Payload::VoteResponse { granted } => self.handle_vote_response(msg.from, granted),
            Payload::AppendEntries {
                leader_id,
                prev_log_index,
                prev_log_term,
                entry,
                leader_commit,
            } => self
                .handle_append_entries(msg.from, leader_id, prev_log_index, prev_log_term, entry, leader_commit)
                .into_iter()
                .collect(),
            Payload::AppendReply { success, match_index } => {
                self.handle_append_reply(msg.from, success, match_index);
                Vec::new()
            }
        }
    }

    /// Requests from an older term get a refusal carrying our term; stale replies are dropped
    fn reject_stale(&self, msg: &Message) -> Option<Message> {
        match msg.payload {
            Payload::VoteRequest { .. } => {
                Some(self.envelope(msg.from, Payload::VoteResponse { granted: false }))
            }
            Payload::AppendEntries { .. } => Some(self.envelope(
                msg.from,
                Payload::AppendReply { success: false, match_index: self.last_log_index() },
            )),
            Payload::VoteResponse { .. } | Payload::AppendReply { .. } => None,
        }
    }

    /// Handle a VoteRequest whose term is not stale
    fn handle_vote_request(&mut self, candidate: NodeId, last_log_index: u64, last_log_term: u64) -> Message {
        let free_to_vote = self.voted_for.is_none() || self.voted_for == Some(candidate);
        let log_ok = match self.config.conformance {
            Conformance::Simplified => true,
            Conformance::LogMatching => self.is_log_up_to_date(last_log_term, last_log_index),
        };
        let granted = free_to_vote && log_ok;

        if granted {
            self.voted_for = Some(candidate);
            self.state = RaftState::Follower;
            self.reset_election_timer();
        }
        debug!(node = self.id, candidate, term = self.current_term, granted, "vote request");

        self.envelope(candidate, Payload::VoteResponse { granted })
    }

    /// Count a vote for the current election; becomes leader on majority
    fn handle_vote_response(&mut self, voter: NodeId, granted: bool) -> Vec<Message> {
        if self.state != RaftState::Candidate || !granted {
            return Vec::new();
        }
        if !self.votes_received.contains(&voter) {
            self.votes_received.push(voter);
        }
        if is_majority(self.votes_received.len(), self.cluster_size()) {
            return self.become_leader();
        }
        Vec::new()
    }

    /// Handle an AppendEntries whose term is not stale
    fn handle_append_entries(
        &mut self,
        from: NodeId,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entry: Option<LogEntry>,
        leader_commit: u64,
    ) -> Option<Message> {
        if self.state == RaftState::Leader {
            // Two leaders in one term would break safety; never acknowledge it.
            warn!(node = self.id, other = leader_id, term = self.current_term, "AppendEntries from another leader in own term");
            return None;
        }

        if self.state == RaftState::Candidate {
            info!(node = self.id, term = self.current_term, leader = leader_id, "stepped down to follower, leader exists");
        }
        self.state = RaftState::Follower;
        self.current_leader = Some(leader_id);
        self.reset_election_timer();

        let (success, match_index) = match self.config.conformance {
            Conformance::Simplified => self.append_unchecked(prev_log_index, prev_log_term, entry),
            Conformance::LogMatching => self.match_and_append(prev_log_index, prev_log_term, entry),
        };

        // Simplified followers take the leader's commit index even from a misaligned append.
        if success || self.config.conformance == Conformance::Simplified {
            let new_commit = leader_commit.min(self.last_log_index());
            if new_commit > self.commit_index {
                self.commit_index = new_commit;
                debug!(node = self.id, commit_index = new_commit, "follower advanced commit index");
            }
        }

        Some(self.envelope(from, Payload::AppendReply { success, match_index }))
    }

    /// Simplified append: store the carried entry wherever our log ends, but only
    /// acknowledge it if it landed at the leader's position after the leader's previous entry
    fn append_unchecked(&mut self, prev_log_index: u64, prev_log_term: u64, entry: Option<LogEntry>) -> (bool, u64) {
        let aligned = self.last_log_index() == prev_log_index && self.term_at(prev_log_index) == Some(prev_log_term);
        if let Some(entry) = entry {
            debug!(node = self.id, index = self.last_log_index() + 1, term = entry.term, aligned, "replicated entry");
            self.log.push(entry);
        }
        (aligned, self.last_log_index())
    }

    /// Log-matching append: refuse unless our log holds prev_log_index at prev_log_term,
    /// then replace any conflicting suffix with the carried entry
    fn match_and_append(&mut self, prev_log_index: u64, prev_log_term: u64, entry: Option<LogEntry>) -> (bool, u64) {
        if self.term_at(prev_log_index) != Some(prev_log_term) {
            debug!(node = self.id, prev_log_index, prev_log_term, "log mismatch, refusing entry");
            return (false, self.last_log_index());
        }
        let Some(entry) = entry else {
            return (true, prev_log_index);
        };

        let index = prev_log_index + 1;
        match self.term_at(index) {
            Some(term) if term == entry.term => {}
            Some(_) => {
                debug!(node = self.id, from_index = index, "truncating conflicting entries");
                self.log.truncate(prev_log_index as usize);
                self.log.push(entry);
            }
            None => self.log.push(entry),
        }
        (true, index)
    }

    /// Record a follower's acknowledgement and try to commit
    fn handle_append_reply(&mut self, follower: NodeId, success: bool, match_index: u64) {
        if self.state != RaftState::Leader || !success {
            return;
        }
        let acknowledged = match_index.min(self.last_log_index());
        let current = self.match_index.entry(follower).or_insert(0);
        if acknowledged > *current {
            *current = acknowledged;
        }
        self.advance_commit_index();
    }

    /// Advance commit_index to the highest current-term entry stored on a majority
    fn advance_commit_index(&mut self) -> bool {
        if self.state != RaftState::Leader {
            return false;
        }
        let cluster_size = self.cluster_size();
        for index in (self.commit_index + 1..=self.last_log_index()).rev() {
            // Entries from earlier terms only commit indirectly.
            if self.term_at(index) != Some(self.current_term) {
                continue;
            }
            let replicas = 1 + self.match_index.values().filter(|&&m| m >= index).count();
            if is_majority(replicas, cluster_size) {
                self.commit_index = index;
                debug!(node = self.id, commit_index = index, replicas, cluster_size, "committed");
                return true;
            }
        }
        false
    }
}
