use std::collections::BTreeSet;
use std::time::Duration;

use rand::Rng;

use super::RaftError;

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub address: String,
    pub members: BTreeSet<String>, // peer addresses, excluding self
    pub election_timeout_min: u64, // in milliseconds
    pub election_timeout_max: u64, // in milliseconds
    pub heartbeat_interval: u64,   // in milliseconds
    pub rpc_timeout: u64,          // in milliseconds
}

impl RaftConfig {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            members: BTreeSet::new(),
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            rpc_timeout: 100,
        }
    }

    pub fn add_member(&mut self, address: &str) {
        if address != self.address {
            self.members.insert(address.to_string());
        }
    }

    pub fn with_members<I, S>(mut self, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for member in members {
            self.add_member(member.as_ref());
        }
        self
    }

    pub fn with_timing(mut self, election_min: u64, election_max: u64, heartbeat: u64) -> Self {
        self.election_timeout_min = election_min;
        self.election_timeout_max = election_max;
        self.heartbeat_interval = heartbeat;
        self
    }

    /// Draws a fresh election timeout uniformly from the configured range.
    pub fn election_timeout(&self) -> Duration {
        let mut rng = rand::rng();
        let timeout_ms = rng.random_range(self.election_timeout_min..=self.election_timeout_max);
        Duration::from_millis(timeout_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }

    pub fn validate(&self) -> Result<(), RaftError> {
        if self.address.is_empty() {
            return Err(RaftError::InvalidConfig("address must not be empty".into()));
        }
        if self.members.contains(&self.address) {
            return Err(RaftError::InvalidConfig(format!(
                "members must not include this node ({})",
                self.address
            )));
        }
        if self.election_timeout_min == 0 || self.heartbeat_interval == 0 || self.rpc_timeout == 0 {
            return Err(RaftError::InvalidConfig("timeouts must be non-zero".into()));
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(RaftError::InvalidConfig(format!(
                "election timeout range is empty ({}..={})",
                self.election_timeout_min, self.election_timeout_max
            )));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat interval ({}ms) must be shorter than the minimum election timeout ({}ms)",
                self.heartbeat_interval, self.election_timeout_min
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_member_skips_self() {
        let cfg = RaftConfig::new("a").with_members(["a", "b", "c"]);
        assert_eq!(cfg.members.len(), 2);
        assert!(!cfg.members.contains("a"));
        cfg.validate().expect("valid config");
    }

    #[test]
    fn election_timeout_stays_in_range() {
        let cfg = RaftConfig::new("a").with_timing(100, 120, 20);
        for _ in 0..100 {
            let t = cfg.election_timeout();
            assert!(t >= Duration::from_millis(100) && t <= Duration::from_millis(120));
        }
    }

    #[test]
    fn validate_rejects_bad_timing() {
        let cfg = RaftConfig::new("a").with_timing(300, 150, 50);
        assert!(matches!(cfg.validate(), Err(RaftError::InvalidConfig(_))));

        let cfg = RaftConfig::new("a").with_timing(150, 300, 150);
        assert!(matches!(cfg.validate(), Err(RaftError::InvalidConfig(_))));

        let mut cfg = RaftConfig::new("a");
        cfg.members.insert("a".into());
        assert!(matches!(cfg.validate(), Err(RaftError::InvalidConfig(_))));

        assert!(RaftConfig::new("").validate().is_err());
    }
}
