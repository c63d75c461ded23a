//! Consensus core: per-node state machine, event loop and configuration

pub mod config;
pub mod message;
pub mod raft_core;
pub mod raft_node;
pub mod raft_server;

pub use config::{ConfigError, Conformance, RaftConfig};
pub use message::{LogEntry, Message, NodeId, Payload};
pub use raft_core::{is_majority, NodeStatus, RaftCore, RaftState};
pub use raft_server::{RaftHandle, RaftServer};
