//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::DispatchError;
use crate::pool::{BackpressureConfig, PoolConfig};
use crate::protocol::ProtocolConfig;
use crate::reliability::CircuitBreakerConfig;
use crate::scheduler::SchedulingPolicy;

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ConfigError {
    /// Environment variable could not be parsed
    #[error("{var}: cannot parse '{value}': {reason}")]
    Parse {
        var: String,
        value: String,
        reason: String,
    },

    /// A section failed validation
    #[error("{section}: {reason}")]
    Invalid { section: &'static str, reason: String },
}

impl From<ConfigError> for DispatchError {
    fn from(err: ConfigError) -> Self {
        DispatchError::InvalidConfig(err.to_string())
    }
}

/// Full engine configuration
///
/// # Example
///
/// ```
/// use relaykit_dispatch::{EngineConfig, PoolConfig, SchedulingPolicy};
///
/// let config = EngineConfig::default()
///     .with_pool(PoolConfig::fixed(2))
///     .with_scheduling(SchedulingPolicy::Deadline);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub protocol: ProtocolConfig,

    #[serde(default)]
    pub scheduling: SchedulingPolicy,

    #[serde(default)]
    pub backpressure: BackpressureConfig,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub channels: ChannelConfig,

    /// How long `shutdown` waits for running tasks
    #[serde(with = "crate::duration_millis", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            protocol: ProtocolConfig::default(),
            scheduling: SchedulingPolicy::default(),
            backpressure: BackpressureConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            channels: ChannelConfig::default(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Buffer sizes of the broadcast channels
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    /// Lifecycle events kept for slow subscribers
    pub event_capacity: usize,

    /// Deliveries kept for slow result subscribers
    pub result_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
            result_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_scheduling(mut self, scheduling: SchedulingPolicy) -> Self {
        self.scheduling = scheduling;
        self
    }

    pub fn with_backpressure(mut self, backpressure: BackpressureConfig) -> Self {
        self.backpressure = backpressure;
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables (all optional, durations in milliseconds):
    /// - `RELAYKIT_MIN_WORKERS`, `RELAYKIT_MAX_WORKERS`
    /// - `RELAYKIT_IDLE_TIMEOUT_MS`, `RELAYKIT_HEALTH_CHECK_INTERVAL_MS`
    /// - `RELAYKIT_HEARTBEAT_TIMEOUT_MS`, `RELAYKIT_UNRESPONSIVE_TIMEOUT_MS`
    /// - `RELAYKIT_DEFAULT_TTL_MS`, `RELAYKIT_MAX_ACK_TIMEOUT_MS`
    /// - `RELAYKIT_MAX_ATTEMPTS`, `RELAYKIT_REORDER_WINDOW`
    /// - `RELAYKIT_SPECULATE_AFTER_MS`
    /// - `RELAYKIT_MAX_OUTSTANDING`
    /// - `RELAYKIT_SCHEDULING`: `priority`, `fair-share`, `wrr`, `deadline`, `work-stealing`
    /// - `RELAYKIT_SHUTDOWN_TIMEOUT_MS`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = EnvReader { lookup: &lookup };
        let mut config = Self::default();

        if let Some(min) = env.parse("RELAYKIT_MIN_WORKERS")? {
            config.pool.min_workers = min;
        }
        if let Some(max) = env.parse("RELAYKIT_MAX_WORKERS")? {
            config.pool.max_workers = max;
        }
        if let Some(timeout) = env.millis("RELAYKIT_IDLE_TIMEOUT_MS")? {
            config.pool.idle_timeout = timeout;
        }
        if let Some(interval) = env.millis("RELAYKIT_HEALTH_CHECK_INTERVAL_MS")? {
            config.pool.health_check_interval = interval;
        }
        if let Some(timeout) = env.millis("RELAYKIT_HEARTBEAT_TIMEOUT_MS")? {
            config.pool.heartbeat_timeout = timeout;
        }
        if let Some(timeout) = env.millis("RELAYKIT_UNRESPONSIVE_TIMEOUT_MS")? {
            config.pool.unresponsive_timeout = timeout;
        }
        if let Some(ttl) = env.millis("RELAYKIT_DEFAULT_TTL_MS")? {
            config.protocol.default_ttl = ttl;
        }
        if let Some(cap) = env.millis("RELAYKIT_MAX_ACK_TIMEOUT_MS")? {
            config.protocol.max_ack_timeout = cap;
        }
        if let Some(attempts) = env.parse::<u32>("RELAYKIT_MAX_ATTEMPTS")? {
            config.protocol.retry.max_attempts = attempts.max(1);
        }
        if let Some(window) = env.parse("RELAYKIT_REORDER_WINDOW")? {
            config.protocol.reorder_window = window;
        }
        if let Some(after) = env.millis("RELAYKIT_SPECULATE_AFTER_MS")? {
            config.protocol.speculate_after = Some(after);
        }
        if let Some(limit) = env.parse("RELAYKIT_MAX_OUTSTANDING")? {
            config.backpressure.max_outstanding = Some(limit);
        }
        if let Some(policy) = env.parse("RELAYKIT_SCHEDULING")? {
            config.scheduling = policy;
        }
        if let Some(timeout) = env.millis("RELAYKIT_SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout = timeout;
        }

        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |section: &'static str| move |reason: String| ConfigError::Invalid { section, reason };

        self.pool.validate().map_err(invalid("pool"))?;
        self.protocol.validate().map_err(invalid("protocol"))?;
        self.backpressure
            .validate()
            .map_err(|e| invalid("backpressure")(e.to_string()))?;
        self.circuit_breaker
            .validate()
            .map_err(invalid("circuit_breaker"))?;
        if self.channels.event_capacity == 0 || self.channels.result_capacity == 0 {
            return Err(invalid("channels")("capacities must be at least 1".into()));
        }
        Ok(())
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn parse<T>(&self, var: &str) -> Result<Option<T>, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(value) = (self.lookup)(var) else {
            return Ok(None);
        };
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        trimmed.parse().map(Some).map_err(|e: T::Err| ConfigError::Parse {
            var: var.to_string(),
            value: value.clone(),
            reason: e.to_string(),
        })
    }

    fn millis(&self, var: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(var)?.map(Duration::from_millis))
    }
}
