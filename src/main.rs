//! Demonstration driver
//!
//! Seeds a cluster, waits for a leader, submits one command to it, lets the
//! cluster run, crashes the leader, lets the survivors recover, and prints
//! every node's final status as JSON.
//!
//! Example:
//!   RUST_LOG=raft_sim=debug raft-sim --nodes 5 --loss 0.1 --command commandX

use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use raft_sim::core::{Conformance, RaftConfig};
use raft_sim::testing::TestCluster;

#[derive(Debug, Parser)]
#[command(name = "raft-sim", about = "Leader election and log replication over a lossy network")]
struct Args {
    /// Number of nodes in the cluster
    #[arg(long, default_value_t = 5)]
    nodes: usize,

    /// Probability that any single message is lost
    #[arg(long, default_value_t = 0.1)]
    loss: f64,

    /// Command submitted to the elected leader
    #[arg(long, default_value = "commandX")]
    command: String,

    /// How long to let the cluster run before and after the crash, in milliseconds
    #[arg(long, default_value_t = 2000)]
    run_ms: u64,

    /// Require log matching on AppendEntries and up-to-date logs for votes
    #[arg(long)]
    log_matching: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let conformance = if args.log_matching {
        Conformance::LogMatching
    } else {
        Conformance::Simplified
    };
    let config = RaftConfig::default()
        .with_loss_probability(args.loss)
        .with_conformance(conformance);
    config.validate()?;

    let run_for = Duration::from_millis(args.run_ms);
    let cluster = TestCluster::with_config(args.nodes, config);
    info!(nodes = args.nodes, loss = args.loss, ?conformance, "cluster started");

    match cluster.wait_for_leader(run_for).await {
        Some(leader) => {
            info!(leader = leader.id, term = leader.term, "leader elected");
            if let Some(node) = cluster.node(leader.id) {
                node.submit_command(args.command.clone());
            }
            tokio::time::sleep(run_for).await;

            cluster.crash(leader.id);
            match cluster.wait_for_leader(run_for).await {
                Some(next) => info!(leader = next.id, term = next.term, "new leader after crash"),
                None => warn!("no new leader after crash"),
            }
            tokio::time::sleep(run_for).await;
        }
        None => warn!(waited = ?run_for, "no leader elected"),
    }

    let statuses = cluster.statuses().await;
    println!("{}", serde_json::to_string_pretty(&statuses)?);

    cluster.shutdown();
    Ok(())
}
