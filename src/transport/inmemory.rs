//! In-memory transport with independent per-message loss
//!
//! Each node owns a bounded mailbox. Senders enqueue with `try_send`, so a
//! crashed node whose mailbox fills up (or has been dropped) never blocks the
//! rest of the cluster: the message is simply lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

use crate::core::config::RaftConfig;
use crate::core::message::{Message, NodeId};
use crate::transport::{Transport, TransportError};

/// Probability that a single message is lost, shared by every transport of a cluster
///
/// Stored as raw f64 bits so fault injection can change it while nodes run.
#[derive(Debug)]
pub struct LossModel {
    probability_bits: AtomicU64,
}

impl LossModel {
    pub fn new(probability: f64) -> Arc<Self> {
        Arc::new(Self {
            probability_bits: AtomicU64::new(Self::clamp(probability).to_bits()),
        })
    }

    fn clamp(probability: f64) -> f64 {
        if probability.is_nan() {
            0.0
        } else {
            probability.clamp(0.0, 1.0)
        }
    }

    pub fn probability(&self) -> f64 {
        f64::from_bits(self.probability_bits.load(Ordering::Relaxed))
    }

    /// Change the loss probability for all subsequent sends
    pub fn set_probability(&self, probability: f64) {
        self.probability_bits
            .store(Self::clamp(probability).to_bits(), Ordering::Relaxed);
    }

    /// Roll the dice for one message
    pub fn should_drop(&self) -> bool {
        let p = self.probability();
        p > 0.0 && rand::rng().random_bool(p)
    }
}

/// Receiving end of a node's inbound channel
pub struct Mailbox {
    receiver: mpsc::Receiver<Message>,
}

impl Mailbox {
    /// Wait for the next delivered message; None once every sender is gone
    pub async fn recv(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}

/// In-memory transport that uses channels for communication
pub struct InMemoryTransport {
    /// Node this transport sends on behalf of
    id: NodeId,
    /// Senders to each peer's mailbox
    senders: HashMap<NodeId, mpsc::Sender<Message>>,
    loss: Arc<LossModel>,
}

impl InMemoryTransport {
    /// Create a new in-memory transport with senders to all peers
    pub fn new(id: NodeId, senders: HashMap<NodeId, mpsc::Sender<Message>>, loss: Arc<LossModel>) -> Self {
        Self { id, senders, loss }
    }

    /// Peers reachable through this transport
    pub fn peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self.senders.keys().copied().collect();
        peers.sort_unstable();
        peers
    }
}

impl Transport for InMemoryTransport {
    fn send(&self, message: Message) -> Result<(), TransportError> {
        let to = message.to;
        let sender = self.senders.get(&to).ok_or(TransportError::UnknownPeer(to))?;

        if self.loss.should_drop() {
            trace!(from = self.id, to, kind = message.kind(), term = message.term, "message lost");
            return Ok(());
        }

        match sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                debug!(from = self.id, to, kind = message.kind(), "mailbox full, message dropped");
            }
            Err(TrySendError::Closed(message)) => {
                trace!(from = self.id, to, kind = message.kind(), "mailbox closed, message dropped");
            }
        }
        Ok(())
    }
}

/// Create transports and mailboxes for a cluster of nodes, sized and made lossy
/// according to `config`
pub fn create_cluster(
    node_ids: &[NodeId],
    config: &RaftConfig,
) -> (HashMap<NodeId, InMemoryTransport>, HashMap<NodeId, Mailbox>) {
    create_cluster_with_loss(node_ids, config.mailbox_capacity, LossModel::new(config.loss_probability))
}

/// Create transports and mailboxes for a cluster sharing the given loss model
///
/// Every transport knows only the mailboxes of the other nodes; there is no
/// global registry. Keep `loss` to change the drop rate while the cluster runs.
pub fn create_cluster_with_loss(
    node_ids: &[NodeId],
    capacity: usize,
    loss: Arc<LossModel>,
) -> (HashMap<NodeId, InMemoryTransport>, HashMap<NodeId, Mailbox>) {
    let mut senders: HashMap<NodeId, mpsc::Sender<Message>> = HashMap::new();
    let mut mailboxes: HashMap<NodeId, Mailbox> = HashMap::new();

    // Create a channel for each node
    for &id in node_ids {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        senders.insert(id, tx);
        mailboxes.insert(id, Mailbox { receiver: rx });
    }

    // Create a transport for each node with senders to all other nodes
    let mut transports: HashMap<NodeId, InMemoryTransport> = HashMap::new();
    for &id in node_ids {
        let other_senders: HashMap<NodeId, mpsc::Sender<Message>> = senders
            .iter()
            .filter(|(&k, _)| k != id)
            .map(|(&k, v)| (k, v.clone()))
            .collect();
        transports.insert(id, InMemoryTransport::new(id, other_senders, loss.clone()));
    }

    (transports, mailboxes)
}
