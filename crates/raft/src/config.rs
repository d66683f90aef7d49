//! # config
//!
//! why: keep all consensus timing knobs in one tunable place
//! relations: used by server.rs to drive the background loops
//! what: RaftConfig with election/heartbeat/replication/apply intervals

use std::time::Duration;

use rand::Rng;

/// Timing parameters for a raft node. All values are milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout
    pub election_timeout_min: u64,
    /// Upper bound of the randomized election timeout
    pub election_timeout_max: u64,
    /// Interval between leader heartbeats
    pub heartbeat_interval: u64,
    /// How often the election loop wakes up to check its timer
    pub poll_interval: u64,
    /// How often the leader checks followers for missing entries
    pub replicate_interval: u64,
    /// How often the apply loop checks for newly committed entries
    pub apply_interval: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 500,
            heartbeat_interval: 50,
            poll_interval: 20,
            replicate_interval: 20,
            apply_interval: 10,
        }
    }
}

impl RaftConfig {
    /// Draw a fresh election timeout from the configured range.
    ///
    /// Randomizing per node is what keeps simultaneous candidates from
    /// splitting the vote forever.
    pub fn random_election_timeout(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.election_timeout_min..=self.election_timeout_max);
        Duration::from_millis(ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_interval)
    }

    pub fn replicate(&self) -> Duration {
        Duration::from_millis(self.replicate_interval)
    }

    pub fn apply(&self) -> Duration {
        Duration::from_millis(self.apply_interval)
    }
}
