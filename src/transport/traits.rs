//! Transport abstraction for Raft message delivery

use thiserror::Error;

use crate::core::message::{Message, NodeId};

/// Fire-and-forget delivery of messages to peer nodes
///
/// Implementations must never block the caller. A message that is lost in
/// transit or cannot be enqueued is dropped without telling the sender.
pub trait Transport: Send + Sync {
    /// Send a message to the node named in `message.to`
    fn send(&self, message: Message) -> Result<(), TransportError>;
}

/// Errors that can occur during transport operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Target node is not part of this transport's membership
    #[error("node {0} is not a member of the cluster")]
    UnknownPeer(NodeId),
}
