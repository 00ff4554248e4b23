//! Delivery protocol configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reliability::RetryPolicy;

/// Delivery protocol configuration
///
/// # Example
///
/// ```
/// use relaykit_dispatch::ProtocolConfig;
/// use std::time::Duration;
///
/// let config = ProtocolConfig::default()
///     .with_default_ttl(Duration::from_secs(2))
///     .with_reorder_window(64);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Ack timeout of a first attempt when the task sets no ttl
    #[serde(with = "crate::duration_millis")]
    pub default_ttl: Duration,

    /// Cap on the doubled ack timeout of later attempts
    #[serde(with = "crate::duration_millis")]
    pub max_ack_timeout: Duration,

    /// Default attempt budget and hold between retries
    pub retry: RetryPolicy,

    /// Results held behind a gap before a forced release
    pub reorder_window: usize,

    /// Dedup cache capacity
    pub dedup_capacity: usize,

    /// How long a resolved identity stays deduplicated after last use
    #[serde(with = "crate::duration_millis")]
    pub dedup_retention: Duration,

    /// Hedge every task still running this long after dispatch; tasks may
    /// set their own delay. Off by default.
    #[serde(default, with = "crate::duration_millis::option")]
    pub speculate_after: Option<Duration>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(5),
            max_ack_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            reorder_window: 256,
            dedup_capacity: 10_000,
            dedup_retention: Duration::from_secs(300),
            speculate_after: None,
        }
    }
}

impl ProtocolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_max_ack_timeout(mut self, timeout: Duration) -> Self {
        self.max_ack_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_reorder_window(mut self, window: usize) -> Self {
        self.reorder_window = window;
        self
    }

    pub fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity;
        self
    }

    pub fn with_dedup_retention(mut self, retention: Duration) -> Self {
        self.dedup_retention = retention;
        self
    }

    pub fn with_speculate_after(mut self, after: Duration) -> Self {
        self.speculate_after = Some(after);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.default_ttl.is_zero() {
            return Err("default_ttl must be greater than zero".into());
        }
        if self.reorder_window == 0 {
            return Err("reorder_window must be at least 1".into());
        }
        if self.dedup_capacity == 0 {
            return Err("dedup_capacity must be at least 1".into());
        }
        if self.speculate_after.is_some_and(|after| after.is_zero()) {
            return Err("speculate_after must be greater than zero".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ProtocolConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_window() {
        let config = ProtocolConfig::new().with_reorder_window(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialization() {
        let config = ProtocolConfig::new().with_default_ttl(Duration::from_millis(750));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["default_ttl"], 750);
        assert!(json["speculate_after"].is_null());
        let parsed: ProtocolConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);

        let hedged = ProtocolConfig::new().with_speculate_after(Duration::from_secs(2));
        let json = serde_json::to_value(&hedged).unwrap();
        assert_eq!(json["speculate_after"], 2000);
        assert_eq!(serde_json::from_value::<ProtocolConfig>(json).unwrap(), hedged);
    }
}
