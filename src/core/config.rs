//! Raft configuration parameters

use std::time::Duration;

use thiserror::Error;

/// How strictly followers check incoming AppendEntries against their own log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Conformance {
    /// Append the carried entry unconditionally (no previous index/term check)
    #[default]
    Simplified,
    /// Require a matching entry at prev_log_index/prev_log_term before appending,
    /// and apply the up-to-date log check when granting votes
    LogMatching,
}

/// Errors reported by [`RaftConfig::validate`]
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("election timeout range is empty: min {min:?} > max {max:?}")]
    InvertedElectionRange { min: Duration, max: Duration },
    #[error("election timeout must be non-zero")]
    ZeroElectionTimeout,
    #[error("heartbeat interval {heartbeat:?} must be shorter than the minimum election timeout {election_min:?}")]
    HeartbeatTooSlow { heartbeat: Duration, election_min: Duration },
    #[error("loss probability {0} is outside [0, 1]")]
    LossProbability(f64),
    #[error("mailbox capacity must be at least 1")]
    ZeroCapacity,
}

/// Configuration for Raft timing, transport loss and conformance
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Interval between heartbeats sent by leader (default: 50ms)
    pub heartbeat_interval: Duration,
    /// Minimum election timeout (default: 150ms)
    pub election_timeout_min: Duration,
    /// Maximum election timeout (default: 300ms)
    pub election_timeout_max: Duration,
    /// Probability that any single message is dropped in transit (default: 0.1)
    pub loss_probability: f64,
    /// Capacity of each node's inbound mailbox and command intake (default: 64)
    pub mailbox_capacity: usize,
    /// Follower-side log check applied to AppendEntries (default: simplified)
    pub conformance: Conformance,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            loss_probability: 0.1,
            mailbox_capacity: 64,
            conformance: Conformance::Simplified,
        }
    }
}

impl RaftConfig {
    /// Create a new config with custom heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Create a new config with custom election timeout range
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    /// Create a new config with a custom per-message loss probability
    pub fn with_loss_probability(mut self, probability: f64) -> Self {
        self.loss_probability = probability;
        self
    }

    /// Create a new config with a custom mailbox capacity
    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    /// Create a new config with a different conformance level
    pub fn with_conformance(mut self, conformance: Conformance) -> Self {
        self.conformance = conformance;
        self
    }

    /// Check that the timing, loss and capacity settings are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.election_timeout_min > self.election_timeout_max {
            return Err(ConfigError::InvertedElectionRange {
                min: self.election_timeout_min,
                max: self.election_timeout_max,
            });
        }
        if self.election_timeout_max.is_zero() {
            return Err(ConfigError::ZeroElectionTimeout);
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval,
                election_min: self.election_timeout_min,
            });
        }
        if !(0.0..=1.0).contains(&self.loss_probability) {
            return Err(ConfigError::LossProbability(self.loss_probability));
        }
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }

    /// Generate a random election timeout within the configured range
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        if min_ms >= max_ms {
            return self.election_timeout_min;
        }
        let timeout_ms = rand::rng().random_range(min_ms..=max_ms);
        Duration::from_millis(timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert_eq!(RaftConfig::default().validate(), Ok(()));
    }

    #[test]
    fn test_random_timeout_within_range() {
        let config = RaftConfig::default();
        for _ in 0..100 {
            let timeout = config.random_election_timeout();
            assert!(timeout >= Duration::from_millis(150));
            assert!(timeout <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_fixed_range_returns_min() {
        let config = RaftConfig::default()
            .with_heartbeat_interval(Duration::from_millis(5))
            .with_election_timeout(Duration::from_millis(20), Duration::from_millis(20));
        assert_eq!(config.random_election_timeout(), Duration::from_millis(20));
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_rejects_inverted_range() {
        let config = RaftConfig::default()
            .with_election_timeout(Duration::from_millis(300), Duration::from_millis(150));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvertedElectionRange { .. })
        ));
    }

    #[test]
    fn test_rejects_slow_heartbeat() {
        let config = RaftConfig::default().with_heartbeat_interval(Duration::from_millis(150));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HeartbeatTooSlow { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_loss_probability() {
        let config = RaftConfig::default().with_loss_probability(1.5);
        assert_eq!(config.validate(), Err(ConfigError::LossProbability(1.5)));
        let config = RaftConfig::default().with_loss_probability(-0.1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let config = RaftConfig::default().with_mailbox_capacity(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroCapacity));
    }
}
