//! Testing utilities for Raft cluster integration tests
//!
//! Provides `TestCluster` for spinning up in-process clusters over the lossy
//! in-memory transport, and `History` for checking safety properties over
//! sampled node states.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::core::config::RaftConfig;
use crate::core::message::NodeId;
use crate::core::raft_core::{NodeStatus, RaftState};
use crate::core::raft_server::{RaftHandle, RaftServer};
use crate::transport::{create_cluster_with_loss, LossModel};

/// How often cluster helpers poll node status
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A test cluster of Raft nodes with ids `0..count`
pub struct TestCluster {
    /// Handles of all nodes, indexed by node id
    pub nodes: Vec<RaftHandle>,
    loss: Arc<LossModel>,
}

impl TestCluster {
    /// Create and start a loss-free cluster with the specified number of nodes
    pub fn with_nodes(count: usize) -> Self {
        Self::with_config(count, RaftConfig::default().with_loss_probability(0.0))
    }

    /// Create and start a cluster where every node shares one config
    pub fn with_config(count: usize, config: RaftConfig) -> Self {
        Self::with_node_configs(count, |_| config.clone())
    }

    /// Create and start a cluster with a per-node config
    ///
    /// Loss probability and mailbox capacity are cluster-wide and taken from
    /// node 0's config; the other nodes' values for them are ignored.
    pub fn with_node_configs(count: usize, configs: impl Fn(NodeId) -> RaftConfig) -> Self {
        let node_ids: Vec<NodeId> = (0..count as NodeId).collect();
        let network = configs(0);
        let loss = LossModel::new(network.loss_probability);
        let (mut transports, mut mailboxes) =
            create_cluster_with_loss(&node_ids, network.mailbox_capacity, loss.clone());

        let mut nodes = Vec::with_capacity(count);
        for &id in &node_ids {
            let (Some(transport), Some(mailbox)) = (transports.remove(&id), mailboxes.remove(&id)) else {
                unreachable!("create_cluster_with_loss builds a transport and mailbox for every id");
            };
            let peers = transport.peers();
            nodes.push(RaftServer::new(id, peers, transport, mailbox, configs(id)).start());
        }

        TestCluster { nodes, loss }
    }

    /// Handle of a specific node, or None if no node has that id
    pub fn node(&self, id: NodeId) -> Option<&RaftHandle> {
        self.nodes.get(id as usize)
    }

    /// Change the cluster-wide message loss probability
    pub fn set_loss_probability(&self, probability: f64) {
        self.loss.set_probability(probability);
    }

    /// Fail-stop a node
    pub fn crash(&self, id: NodeId) {
        if let Some(node) = self.node(id) {
            node.crash();
        }
    }

    /// Status of every node, in id order
    pub async fn statuses(&self) -> Vec<NodeStatus> {
        let mut statuses = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            statuses.push(node.status().await);
        }
        statuses
    }

    /// Live nodes currently in the leader state
    pub async fn leaders(&self) -> Vec<NodeStatus> {
        self.statuses()
            .await
            .into_iter()
            .filter(|s| s.alive && s.state == RaftState::Leader)
            .collect()
    }

    /// Wait until `condition` holds over all statuses, with timeout
    pub async fn wait_until(&self, timeout: Duration, condition: impl Fn(&[NodeStatus]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if condition(&self.statuses().await) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait for a live leader to be elected, with timeout
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<NodeStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(leader) = self.leaders().await.into_iter().next() {
                return Some(leader);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Poll statuses for `duration` and record them
    pub async fn observe(&self, duration: Duration) -> History {
        let mut history = History::default();
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            history.record(&self.statuses().await);
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        history.record(&self.statuses().await);
        history
    }

    /// Stop every node
    pub fn shutdown(self) {
        for node in &self.nodes {
            node.crash();
        }
    }
}

/// Safety violation found in a recorded history
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// More than one node was seen leading the same term
    TwoLeaders { term: u64, leaders: Vec<NodeId> },
    /// A node's term went backwards between samples
    TermDecreased { node: NodeId, from: u64, to: u64 },
    /// A node's commit index exceeded its log length
    CommitBeyondLog { node: NodeId, commit_index: u64, log_len: usize },
}

/// Sampled node states, checked for the protocol's safety properties
#[derive(Debug, Default)]
pub struct History {
    leaders_by_term: BTreeMap<u64, BTreeSet<NodeId>>,
    last_term: HashMap<NodeId, u64>,
    violations: Vec<Violation>,
    samples: usize,
}

impl History {
    /// Record one sample of every node's status
    pub fn record(&mut self, statuses: &[NodeStatus]) {
        self.samples += 1;
        for status in statuses {
            if let Some(&previous) = self.last_term.get(&status.id) {
                if status.term < previous {
                    self.violations.push(Violation::TermDecreased {
                        node: status.id,
                        from: previous,
                        to: status.term,
                    });
                }
            }
            self.last_term.insert(status.id, status.term);

            if status.commit_index > status.log.len() as u64 {
                self.violations.push(Violation::CommitBeyondLog {
                    node: status.id,
                    commit_index: status.commit_index,
                    log_len: status.log.len(),
                });
            }

            if status.state == RaftState::Leader {
                let leaders = self.leaders_by_term.entry(status.term).or_default();
                if leaders.insert(status.id) && leaders.len() > 1 {
                    self.violations.push(Violation::TwoLeaders {
                        term: status.term,
                        leaders: leaders.iter().copied().collect(),
                    });
                }
            }
        }
    }

    /// Every (term, leader) pair seen, in term order
    pub fn leaders_by_term(&self) -> &BTreeMap<u64, BTreeSet<NodeId>> {
        &self.leaders_by_term
    }

    /// Highest term seen for any node
    pub fn max_term(&self) -> u64 {
        self.last_term.values().copied().max().unwrap_or(0)
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::LogEntry;

    fn status(id: NodeId, term: u64, state: RaftState) -> NodeStatus {
        NodeStatus {
            id,
            term,
            state,
            voted_for: None,
            leader_id: None,
            commit_index: 0,
            votes_received: 0,
            log: Vec::new(),
            alive: true,
        }
    }

    #[test]
    fn test_history_accepts_leader_changes_across_terms() {
        let mut history = History::default();
        history.record(&[status(0, 1, RaftState::Leader), status(1, 1, RaftState::Follower)]);
        history.record(&[status(0, 1, RaftState::Leader), status(1, 2, RaftState::Leader)]);
        assert!(history.violations().is_empty());
        assert_eq!(history.leaders_by_term().len(), 2);
        assert_eq!(history.max_term(), 2);
    }

    #[test]
    fn test_history_flags_two_leaders_in_one_term() {
        let mut history = History::default();
        history.record(&[status(0, 3, RaftState::Leader)]);
        history.record(&[status(1, 3, RaftState::Leader)]);
        assert_eq!(
            history.violations(),
            &[Violation::TwoLeaders { term: 3, leaders: vec![0, 1] }]
        );
    }

    #[test]
    fn test_history_flags_term_regression() {
        let mut history = History::default();
        history.record(&[status(0, 3, RaftState::Follower)]);
        history.record(&[status(0, 2, RaftState::Follower)]);
        assert_eq!(
            history.violations(),
            &[Violation::TermDecreased { node: 0, from: 3, to: 2 }]
        );
    }

    #[test]
    fn test_history_flags_commit_beyond_log() {
        let mut history = History::default();
        let mut bad = status(0, 1, RaftState::Follower);
        bad.log = vec![LogEntry::new(1, "a")];
        bad.commit_index = 2;
        history.record(&[bad]);
        assert!(matches!(
            history.violations(),
            [Violation::CommitBeyondLog { node: 0, commit_index: 2, log_len: 1 }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_node_is_none() {
        let cluster = TestCluster::with_nodes(3);
        assert!(cluster.node(2).is_some());
        assert!(cluster.node(9).is_none());

        cluster.crash(9);
        assert!(cluster.nodes.iter().all(|node| node.is_alive()));
        cluster.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_configs_set_network_loss() {
        let cluster = TestCluster::with_node_configs(3, |_| RaftConfig::default().with_loss_probability(1.0));

        assert!(cluster.wait_for_leader(Duration::from_secs(2)).await.is_none());
        for status in cluster.statuses().await {
            assert!(status.term >= 1, "timers still fire");
            assert!(status.votes_received <= 1, "no vote request is ever delivered");
        }
        cluster.shutdown();
    }
}
