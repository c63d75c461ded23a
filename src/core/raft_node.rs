//! RaftNode - couples a node's shared consensus state with its transport

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use super::message::Message;
use super::raft_core::{RaftCore, RaftState};
use crate::transport::Transport;

/// Shared reference to RaftCore
pub type SharedCore = Arc<Mutex<RaftCore>>;

/// Runs core handlers under the node lock and ships their output
pub struct RaftNode<T: Transport> {
    core: SharedCore,
    transport: T,
}

impl<T: Transport> RaftNode<T> {
    /// Create a new RaftNode
    pub fn new(core: RaftCore, transport: T) -> Self {
        Self {
            core: Arc::new(Mutex::new(core)),
            transport,
        }
    }

    /// Get a shared reference to the core (for status queries)
    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }

    /// Handle one inbound message and send whatever it produced
    pub async fn handle_message(&self, message: Message) {
        let outbound = self.core.lock().await.handle_message(message);
        self.dispatch(outbound);
    }

    /// Start an election if the deadline really passed
    pub async fn handle_election_timeout(&self) {
        let outbound = self.core.lock().await.handle_election_timeout();
        self.dispatch(outbound);
    }

    /// Append a client command (leader only) and broadcast it
    pub async fn submit_command(&self, command: String) {
        let outbound = self.core.lock().await.submit_command(command);
        self.dispatch(outbound);
    }

    /// Send heartbeat to all peers
    /// Returns whether this node is still leader
    pub async fn send_heartbeat(&self) -> bool {
        let outbound = {
            let core = self.core.lock().await;
            if core.state != RaftState::Leader {
                return false;
            }
            core.heartbeat()
        };
        self.dispatch(outbound);
        true
    }

    /// Election deadline and whether the timer is active (it is not for leaders)
    pub async fn election_timer(&self) -> (Instant, bool) {
        let core = self.core.lock().await;
        (core.election_deadline, core.state != RaftState::Leader)
    }

    /// Get current state
    pub async fn state(&self) -> RaftState {
        self.core.lock().await.state
    }

    /// Get current term
    pub async fn current_term(&self) -> u64 {
        self.core.lock().await.current_term
    }

    fn dispatch(&self, messages: Vec<Message>) {
        for message in messages {
            if let Err(e) = self.transport.send(message) {
                warn!(error = %e, "failed to send message");
            }
        }
    }
}
