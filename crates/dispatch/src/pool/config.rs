//! Pool sizing and health timing

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Worker pool configuration
///
/// # Example
///
/// ```
/// use relaykit_dispatch::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig::default()
///     .with_size(2, 8)
///     .with_idle_timeout(Duration::from_secs(10))
///     .with_worker_weights(vec![3, 1]);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Workers kept alive even when idle
    pub min_workers: usize,

    /// Upper bound when scaling for backlog
    pub max_workers: usize,

    /// Idle time after which a worker above `min_workers` is reclaimed
    #[serde(with = "crate::duration_millis")]
    pub idle_timeout: Duration,

    /// How often workers are pinged
    #[serde(with = "crate::duration_millis")]
    pub health_check_interval: Duration,

    /// Silence after which a worker is marked unresponsive
    #[serde(with = "crate::duration_millis")]
    pub heartbeat_timeout: Duration,

    /// Time an unresponsive worker gets before it is force-crashed
    #[serde(with = "crate::duration_millis")]
    pub unresponsive_timeout: Duration,

    /// Ping round trip above which a worker is reported slow
    #[serde(with = "crate::duration_millis")]
    pub slow_threshold: Duration,

    /// Queued tickets beyond idle capacity tolerated before growing
    pub scale_up_backlog: usize,

    /// Weights for weighted round-robin, assigned to workers in spawn order
    /// (cycled); empty means every worker weighs 1
    #[serde(default)]
    pub worker_weights: Vec<u32>,

    /// Consecutive spawn or warm-up failures before the pool is unavailable
    pub max_spawn_failures: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            idle_timeout: Duration::from_secs(3),
            health_check_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(2),
            unresponsive_timeout: Duration::from_secs(5),
            slow_threshold: Duration::from_millis(500),
            scale_up_backlog: 0,
            worker_weights: vec![],
            max_spawn_failures: 3,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed-size pool
    pub fn fixed(workers: usize) -> Self {
        Self::default().with_size(workers, workers)
    }

    pub fn with_size(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max.max(1);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_unresponsive_timeout(mut self, timeout: Duration) -> Self {
        self.unresponsive_timeout = timeout;
        self
    }

    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    pub fn with_scale_up_backlog(mut self, backlog: usize) -> Self {
        self.scale_up_backlog = backlog;
        self
    }

    pub fn with_worker_weights(mut self, weights: Vec<u32>) -> Self {
        self.worker_weights = weights;
        self
    }

    pub fn with_max_spawn_failures(mut self, failures: u32) -> Self {
        self.max_spawn_failures = failures.max(1);
        self
    }

    /// Weight of the n-th spawned worker (1-based)
    pub fn weight_for(&self, ordinal: u64) -> u32 {
        if self.worker_weights.is_empty() {
            return 1;
        }
        let index = (ordinal.saturating_sub(1) % self.worker_weights.len() as u64) as usize;
        self.worker_weights[index].max(1)
    }

    /// Clamp a requested size into `[min_workers, max_workers]`
    pub fn clamp(&self, target: usize) -> usize {
        target.clamp(self.min_workers, self.max_workers.max(self.min_workers))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_workers == 0 {
            return Err("max_workers must be at least 1".into());
        }
        if self.min_workers > self.max_workers {
            return Err(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            ));
        }
        if self.health_check_interval.is_zero() {
            return Err("health_check_interval must be greater than zero".into());
        }
        if self.heartbeat_timeout < self.health_check_interval {
            return Err("heartbeat_timeout must be at least health_check_interval".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.min_workers, 1);
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.idle_timeout, Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        assert!(PoolConfig::default().with_size(5, 2).validate().is_err());
        assert!(PoolConfig::default()
            .with_health_check_interval(Duration::from_secs(5))
            .validate()
            .is_err());
    }

    #[test]
    fn test_weights_cycle() {
        let config = PoolConfig::default().with_worker_weights(vec![3, 1]);
        assert_eq!(config.weight_for(1), 3);
        assert_eq!(config.weight_for(2), 1);
        assert_eq!(config.weight_for(3), 3);
        assert_eq!(PoolConfig::default().weight_for(7), 1);
    }

    #[test]
    fn test_clamp() {
        let config = PoolConfig::default().with_size(2, 6);
        assert_eq!(config.clamp(0), 2);
        assert_eq!(config.clamp(4), 4);
        assert_eq!(config.clamp(60), 6);
    }
}
