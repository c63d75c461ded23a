//! Single-leader replicated log over a lossy simulated network
//!
//! Nodes elect a leader by term and majority vote, exchange heartbeats and
//! replicate client commands, while every message may be dropped in transit.

pub mod core;
pub mod transport;

/// Testing utilities for integration tests.
pub mod testing;
