//! RaftServer - per-node event loop and the handle used to drive it
//!
//! Each server runs as one tokio task. Every iteration waits for exactly one
//! of: crash signal, inbound message, client command, heartbeat tick or
//! election deadline, and fully handles it before waiting again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, MissedTickBehavior};
use tracing::{debug, info};

use super::config::RaftConfig;
use super::message::NodeId;
use super::raft_core::{NodeStatus, RaftCore};
use super::raft_node::{RaftNode, SharedCore};
use crate::transport::{Mailbox, Transport};

/// Handle for interacting with a running RaftServer
#[derive(Clone)]
pub struct RaftHandle {
    id: NodeId,
    command_tx: mpsc::Sender<String>,
    crash_tx: mpsc::Sender<()>,
    alive: Arc<AtomicBool>,
    core: SharedCore,
}

impl RaftHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Submit a command to this node (fire-and-forget)
    ///
    /// The command is dropped without any signal if the node is not leader
    /// when it gets to it, has crashed, or its intake is full.
    pub fn submit_command(&self, command: impl Into<String>) {
        if let Err(e) = self.command_tx.try_send(command.into()) {
            debug!(node = self.id, error = %e, "client command not enqueued");
        }
    }

    /// Fail-stop this node; calls after the first have no effect
    pub fn crash(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            info!(node = self.id, "crash injected");
            let _ = self.crash_tx.try_send(());
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Snapshot of the node's consensus state
    pub async fn status(&self) -> NodeStatus {
        let alive = self.is_alive();
        self.core.lock().await.status(alive)
    }
}

/// Raft server that owns a node's event loop
pub struct RaftServer<T: Transport> {
    id: NodeId,
    node: RaftNode<T>,
    mailbox: Mailbox,
    command_rx: mpsc::Receiver<String>,
    command_tx: mpsc::Sender<String>,
    crash_rx: mpsc::Receiver<()>,
    crash_tx: mpsc::Sender<()>,
    alive: Arc<AtomicBool>,
    config: RaftConfig,
}

impl<T: Transport + 'static> RaftServer<T> {
    /// Create a node that knows its peers and reaches them through `transport`
    pub fn new(id: NodeId, peers: Vec<NodeId>, transport: T, mailbox: Mailbox, config: RaftConfig) -> Self {
        let core = RaftCore::new(id, peers, config.clone());
        let (command_tx, command_rx) = mpsc::channel(config.mailbox_capacity.max(1));
        let (crash_tx, crash_rx) = mpsc::channel(1);
        Self {
            id,
            node: RaftNode::new(core, transport),
            mailbox,
            command_rx,
            command_tx,
            crash_rx,
            crash_tx,
            alive: Arc::new(AtomicBool::new(true)),
            config,
        }
    }

    /// Start the server and return a handle for interaction
    pub fn start(self) -> RaftHandle {
        let handle = RaftHandle {
            id: self.id,
            command_tx: self.command_tx.clone(),
            crash_tx: self.crash_tx.clone(),
            alive: self.alive.clone(),
            core: self.node.shared_core(),
        };

        tokio::spawn(self.run());

        handle
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Main server loop
    async fn run(mut self) {
        let mut heartbeat_interval = interval(self.config.heartbeat_interval);
        // Use Delay behavior to prevent accumulated missed ticks from starving election timeout
        heartbeat_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(node = self.id, "event loop started");

        while self.is_alive() {
            let (election_deadline, timer_armed) = self.node.election_timer().await;

            tokio::select! {
                biased;
                _ = self.crash_rx.recv() => break,
                Some(message) = self.mailbox.recv() => {
                    if !self.is_alive() {
                        break;
                    }
                    self.node.handle_message(message).await;
                }
                Some(command) = self.command_rx.recv() => {
                    if !self.is_alive() {
                        break;
                    }
                    self.node.submit_command(command).await;
                }
                _ = heartbeat_interval.tick() => {
                    if !self.is_alive() {
                        break;
                    }
                    self.node.send_heartbeat().await;
                }
                _ = sleep_until(election_deadline), if timer_armed => {
                    if !self.is_alive() {
                        break;
                    }
                    self.node.handle_election_timeout().await;
                }
            }
        }

        let term = self.node.current_term().await;
        let state = self.node.state().await;
        info!(node = self.id, term, state = ?state, "event loop halted");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::core::message::LogEntry;
    use crate::core::raft_core::RaftState;
    use crate::transport::create_cluster;

    fn fast_config() -> RaftConfig {
        RaftConfig::default()
            .with_loss_probability(0.0)
            .with_heartbeat_interval(Duration::from_millis(10))
            .with_election_timeout(Duration::from_millis(30), Duration::from_millis(60))
    }

    fn start_nodes(ids: &[NodeId], configs: impl Fn(NodeId) -> RaftConfig) -> Vec<RaftHandle> {
        let (mut transports, mut mailboxes) = create_cluster(ids, &configs(ids[0]));
        ids.iter()
            .map(|&id| {
                let transport = transports.remove(&id).unwrap();
                let peers = transport.peers();
                let mailbox = mailboxes.remove(&id).unwrap();
                RaftServer::new(id, peers, transport, mailbox, configs(id)).start()
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_node_elects_itself() {
        let handles = start_nodes(&[0], |_| fast_config());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = handles[0].status().await;
        assert_eq!(status.state, RaftState::Leader);
        assert_eq!(status.term, 1);

        handles[0].submit_command("solo");
        tokio::time::sleep(Duration::from_millis(10)).await;
        let status = handles[0].status().await;
        assert_eq!(status.log, vec![LogEntry::new(1, "solo")]);
        assert_eq!(status.commit_index, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_node_wins_first_election() {
        let slow = fast_config().with_election_timeout(Duration::from_millis(500), Duration::from_millis(600));
        let fast = fast_config().with_election_timeout(Duration::from_millis(20), Duration::from_millis(20));
        let handles = start_nodes(&[0, 1, 2], |id| if id == 0 { fast.clone() } else { slow.clone() });

        tokio::time::sleep(Duration::from_millis(100)).await;

        let leader = handles[0].status().await;
        assert_eq!(leader.state, RaftState::Leader);
        assert_eq!(leader.term, 1);
        for handle in &handles[1..] {
            let status = handle.status().await;
            assert_eq!(status.state, RaftState::Follower);
            assert_eq!(status.leader_id, Some(0));
            assert_eq!(status.voted_for, Some(0));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_drops_command() {
        let slow = fast_config().with_election_timeout(Duration::from_millis(500), Duration::from_millis(600));
        let fast = fast_config().with_election_timeout(Duration::from_millis(20), Duration::from_millis(20));
        let handles = start_nodes(&[0, 1, 2], |id| if id == 0 { fast.clone() } else { slow.clone() });
        tokio::time::sleep(Duration::from_millis(100)).await;

        handles[1].submit_command("not forwarded");
        tokio::time::sleep(Duration::from_millis(50)).await;

        for handle in &handles {
            assert!(handle.status().await.log.is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_is_idempotent_and_halts_node() {
        let handles = start_nodes(&[0], |_| fast_config());
        tokio::time::sleep(Duration::from_millis(100)).await;

        handles[0].crash();
        handles[0].crash();
        assert!(!handles[0].is_alive());

        handles[0].submit_command("after crash");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let status = handles[0].status().await;
        assert!(!status.alive);
        assert!(status.log.is_empty());
        assert_eq!(status.term, 1, "a halted node never moves on");
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_loss_reaches_transport() {
        let handles = start_nodes(&[0, 1, 2], |_| fast_config().with_loss_probability(1.0));
        tokio::time::sleep(Duration::from_millis(500)).await;

        for handle in &handles {
            let status = handle.status().await;
            assert_ne!(status.state, RaftState::Leader);
            assert_eq!(status.leader_id, None);
            assert!(status.term > 1, "candidates keep retrying");
        }
    }

    #[test]
    fn test_event_loop_future_is_send() {
        fn assert_send<F: std::future::Future + Send>(_: &F) {}

        let (mut transports, mut mailboxes) = create_cluster(&[0], &fast_config());
        let (Some(transport), Some(mailbox)) = (transports.remove(&0), mailboxes.remove(&0)) else {
            panic!("single-node cluster");
        };
        let server = RaftServer::new(0, Vec::new(), transport, mailbox, fast_config());
        let run = server.run();
        assert_send(&run);
    }
}
