//! Messages exchanged between Raft nodes
//!
//! Every message travels in the same envelope (term, sender, recipient) and
//! carries one of four payloads.

use serde::{Deserialize, Serialize};

/// Node identifier
pub type NodeId = u64;

/// A single log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term when entry was received by leader
    pub term: u64,
    /// Opaque client command
    pub command: String,
}

impl LogEntry {
    pub fn new(term: u64, command: impl Into<String>) -> Self {
        Self { term, command: command.into() }
    }
}

/// A message addressed from one node to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sender's current term
    pub term: u64,
    /// Sending node
    pub from: NodeId,
    /// Receiving node
    pub to: NodeId,
    pub payload: Payload,
}

/// Variant-specific message contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Candidate asks for a vote
    VoteRequest {
        /// Index of candidate's last log entry
        last_log_index: u64,
        /// Term of candidate's last log entry
        last_log_term: u64,
    },
    /// Answer to a VoteRequest
    VoteResponse {
        /// True means candidate received vote
        granted: bool,
    },
    /// Heartbeat from the leader, optionally carrying one new entry
    AppendEntries {
        leader_id: NodeId,
        /// Index of log entry immediately preceding the carried one
        prev_log_index: u64,
        /// Term of prev_log_index entry
        prev_log_term: u64,
        /// Entry to store (None for a plain heartbeat)
        entry: Option<LogEntry>,
        /// Leader's commit_index
        leader_commit: u64,
    },
    /// Answer to an AppendEntries
    AppendReply {
        /// False if the request was stale or the carried entry did not line up
        /// with the follower's log
        success: bool,
        /// Length of the follower's log after handling the request
        match_index: u64,
    },
}

impl Message {
    /// Short name of the payload variant, for logging
    pub fn kind(&self) -> &'static str {
        match self.payload {
            Payload::VoteRequest { .. } => "VoteRequest",
            Payload::VoteResponse { .. } => "VoteResponse",
            Payload::AppendEntries { .. } => "AppendEntries",
            Payload::AppendReply { .. } => "AppendReply",
        }
    }
}
