//! Transport layer for Raft messages
//!
//! - `InMemoryTransport`: channel-based, lossy, non-blocking delivery between in-process nodes

pub mod inmemory;
pub mod traits;

pub use inmemory::{create_cluster, create_cluster_with_loss, InMemoryTransport, LossModel, Mailbox};
pub use traits::{Transport, TransportError};
