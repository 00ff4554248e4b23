//! Circuit breakers for dependencies called from task bodies

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::{Clock, TokioClock};
use crate::error::DispatchError;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold exceeded - all calls rejected
    Open,

    /// Cool-down elapsed - one trial call at a time
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  N consecutive failures  ┌─────────┐  reset timeout  ┌──────────┐
/// │ Closed  │ ───── within window ───► │  Open   │ ──────────────► │ HalfOpen │
/// └─────────┘                          └─────────┘ ◄── failure ─── └──────────┘
///      ▲                                                                 │
///      └──────────────────────── trial success ──────────────────────────┘
/// ```
///
/// # Example
///
/// ```
/// use relaykit_dispatch::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default()
///     .with_failure_threshold(3)
///     .with_reset_timeout(Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Successful trials needed to close from half-open
    pub success_threshold: u32,

    /// Cool-down before a half-open trial
    #[serde(with = "crate::duration_millis")]
    pub reset_timeout: Duration,

    /// Failures further apart than this restart the count
    #[serde(with = "crate::duration_millis")]
    pub window_size: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(30),
            window_size: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_window_size(mut self, window: Duration) -> Self {
        self.window_size = window;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".into());
        }
        if self.success_threshold == 0 {
            return Err("success_threshold must be at least 1".into());
        }
        Ok(())
    }
}

/// Error types for circuit breaker operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CircuitBreakerError {
    /// Circuit is open, calls are not allowed
    #[error("circuit '{0}' is open")]
    Open(String),

    /// Half-open trial already in progress
    #[error("circuit '{0}' is half-open with a trial in progress")]
    HalfOpenExhausted(String),
}

impl From<CircuitBreakerError> for DispatchError {
    fn from(err: CircuitBreakerError) -> Self {
        match err {
            CircuitBreakerError::Open(name) | CircuitBreakerError::HalfOpenExhausted(name) => {
                DispatchError::CircuitOpen(name)
            }
        }
    }
}

/// Result of [`CircuitBreaker::call`]
#[derive(Debug, Error)]
pub enum CircuitCallError<E> {
    /// Short-circuited without calling the dependency
    #[error(transparent)]
    Rejected(CircuitBreakerError),

    /// Dependency was called and failed
    #[error("{0}")]
    Failed(E),
}

/// Observer of state transitions: `(circuit name, from, to)`
pub type CircuitListener = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

type ListenerSlot = Arc<RwLock<Option<CircuitListener>>>;

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    streak_started: Option<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    trial_in_flight: bool,
}

/// Circuit breaker around one dependency
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
    listener: ListenerSlot,
}

/// Permission to make one call; report the outcome through it
#[must_use = "record the outcome with success() or failure()"]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    recorded: bool,
}

impl CircuitPermit<'_> {
    pub fn success(mut self) {
        self.recorded = true;
        self.breaker.on_success(self.trial);
    }

    pub fn failure(mut self) {
        self.recorded = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.recorded && self.trial {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_listener(name, config, clock, Arc::new(RwLock::new(None)))
    }

    fn with_listener(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
        listener: ListenerSlot,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                streak_started: None,
                opened_at: None,
                half_open_successes: 0,
                trial_in_flight: false,
            }),
            listener,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, moving Open to HalfOpen once the cool-down has passed
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        let transition = self.maybe_half_open(&mut inner, self.clock.now());
        let state = inner.state;
        drop(inner);
        self.notify(transition);
        state
    }

    /// Ask to make a call
    pub fn try_acquire(&self) -> Result<CircuitPermit<'_>, CircuitBreakerError> {
        let mut inner = self.inner.lock();
        let transition = self.maybe_half_open(&mut inner, self.clock.now());

        let outcome = match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => Err(CircuitBreakerError::Open(self.name.clone())),
            CircuitState::HalfOpen if inner.trial_in_flight => {
                Err(CircuitBreakerError::HalfOpenExhausted(self.name.clone()))
            }
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Ok(true)
            }
        };
        drop(inner);
        self.notify(transition);

        outcome.map(|trial| CircuitPermit {
            breaker: self,
            trial,
            recorded: false,
        })
    }

    /// Run `call` through the breaker, recording its outcome
    pub async fn call<F, Fut, T, E>(&self, call: F) -> Result<T, CircuitCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().map_err(CircuitCallError::Rejected)?;
        match call().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                permit.failure();
                Err(CircuitCallError::Failed(err))
            }
        }
    }

    /// Force the circuit closed
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        let from = inner.state;
        Self::close(&mut inner);
        drop(inner);
        if from != CircuitState::Closed {
            self.notify(Some((from, CircuitState::Closed)));
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        let transition = match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
                inner.streak_started = None;
                None
            }
            CircuitState::HalfOpen if trial => {
                inner.trial_in_flight = false;
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    Self::close(&mut inner);
                    Some((CircuitState::HalfOpen, CircuitState::Closed))
                } else {
                    None
                }
            }
            _ => None,
        };
        drop(inner);
        self.notify(transition);
    }

    fn on_failure(&self, trial: bool) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        let transition = match inner.state {
            CircuitState::Closed => {
                let fresh_streak = inner
                    .streak_started
                    .map_or(true, |started| {
                        now.saturating_duration_since(started) > self.config.window_size
                    });
                if fresh_streak {
                    inner.streak_started = Some(now);
                    inner.consecutive_failures = 1;
                } else {
                    inner.consecutive_failures += 1;
                }
                if inner.consecutive_failures >= self.config.failure_threshold {
                    Self::open(&mut inner, now);
                    Some((CircuitState::Closed, CircuitState::Open))
                } else {
                    None
                }
            }
            CircuitState::HalfOpen if trial => {
                Self::open(&mut inner, now);
                Some((CircuitState::HalfOpen, CircuitState::Open))
            }
            _ => None,
        };
        drop(inner);
        self.notify(transition);
    }

    fn maybe_half_open(
        &self,
        inner: &mut BreakerInner,
        now: Instant,
    ) -> Option<(CircuitState, CircuitState)> {
        if inner.state != CircuitState::Open {
            return None;
        }
        let opened_at = inner.opened_at?;
        if now.saturating_duration_since(opened_at) < self.config.reset_timeout {
            return None;
        }
        inner.state = CircuitState::HalfOpen;
        inner.half_open_successes = 0;
        inner.trial_in_flight = false;
        Some((CircuitState::Open, CircuitState::HalfOpen))
    }

    fn open(inner: &mut BreakerInner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.trial_in_flight = false;
        inner.consecutive_failures = 0;
        inner.streak_started = None;
    }

    fn close(inner: &mut BreakerInner) {
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        inner.half_open_successes = 0;
        inner.consecutive_failures = 0;
        inner.streak_started = None;
    }

    fn notify(&self, transition: Option<(CircuitState, CircuitState)>) {
        let Some((from, to)) = transition else {
            return;
        };
        match to {
            CircuitState::Open => warn!(circuit = %self.name, %from, "circuit opened"),
            CircuitState::Closed => info!(circuit = %self.name, %from, "circuit closed"),
            CircuitState::HalfOpen => debug!(circuit = %self.name, "circuit half-open"),
        }
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener(&self.name, from, to);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

/// Breakers by dependency name, created on first use
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    listener: ListenerSlot,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            listener: Arc::new(RwLock::new(None)),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Breaker for `name`, created with the registry config if absent
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return breaker.clone();
        }
        self.breakers
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_listener(
                    name,
                    self.config.clone(),
                    self.clock.clone(),
                    self.listener.clone(),
                ))
            })
            .clone()
    }

    /// Observe transitions of every breaker in the registry
    pub fn set_listener(&self, listener: CircuitListener) {
        *self.listener.write() = Some(listener);
    }

    /// Snapshot of all breaker states, sorted by name
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.read().values().cloned().collect();
        let mut states: Vec<(String, CircuitState)> = breakers
            .iter()
            .map(|breaker| (breaker.name().to_string(), breaker.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default(), Arc::new(TokioClock))
    }
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("config", &self.config)
            .field("breakers", &self.breakers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(clock: &ManualClock) -> CircuitBreaker {
        let config = CircuitBreakerConfig::new()
            .with_failure_threshold(3)
            .with_reset_timeout(Duration::from_secs(10))
            .with_window_size(Duration::from_secs(5));
        CircuitBreaker::new("db", config, Arc::new(clock.clone()))
    }

    fn fail(breaker: &CircuitBreaker) {
        breaker.try_acquire().unwrap().failure();
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock);

        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(
            breaker.try_acquire().err(),
            Some(CircuitBreakerError::Open("db".into()))
        );
    }

    #[test]
    fn test_success_resets_streak() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock);

        fail(&breaker);
        fail(&breaker);
        breaker.try_acquire().unwrap().success();
        fail(&breaker);
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_failures_outside_window_restart_count() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock);

        fail(&breaker);
        fail(&breaker);
        clock.advance(Duration::from_secs(6));
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_allows_one_trial() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock);
        for _ in 0..3 {
            fail(&breaker);
        }

        clock.advance(Duration::from_secs(10));
        let trial = breaker.try_acquire().unwrap();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(
            breaker.try_acquire().err(),
            Some(CircuitBreakerError::HalfOpenExhausted("db".into()))
        );

        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock);
        for _ in 0..3 {
            fail(&breaker);
        }

        clock.advance(Duration::from_secs(11));
        breaker.try_acquire().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // a fresh cool-down starts from the failed trial
        clock.advance(Duration::from_secs(5));
        assert!(breaker.try_acquire().is_err());
    }

    #[test]
    fn test_dropped_trial_permit_frees_slot() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock);
        for _ in 0..3 {
            fail(&breaker);
        }
        clock.advance(Duration::from_secs(10));

        drop(breaker.try_acquire().unwrap());
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn test_call_short_circuits_without_invoking() {
        let clock = ManualClock::new();
        let breaker = breaker(&clock);
        let invocations = AtomicU32::new(0);

        for _ in 0..3 {
            let result: Result<(), _> = breaker
                .call(|| async {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("boom")
                })
                .await;
            assert!(matches!(result, Err(CircuitCallError::Failed("boom"))));
        }

        let result = breaker
            .call(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;
        assert!(matches!(result, Err(CircuitCallError::Rejected(_))));
        assert_eq!(invocations.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_registry_reuses_breakers_and_notifies() {
        let clock = ManualClock::new();
        let registry = CircuitBreakerRegistry::new(
            CircuitBreakerConfig::new().with_failure_threshold(1),
            Arc::new(clock.clone()),
        );
        let transitions = Arc::new(Mutex::new(Vec::new()));
        {
            let transitions = transitions.clone();
            registry.set_listener(Arc::new(move |name, from, to| {
                transitions.lock().push((name.to_string(), from, to));
            }));
        }

        let a = registry.get("payments");
        let b = registry.get("payments");
        assert!(Arc::ptr_eq(&a, &b));

        a.try_acquire().unwrap().failure();
        a.reset();

        let seen = transitions.lock().clone();
        assert_eq!(
            seen,
            vec![
                ("payments".to_string(), CircuitState::Closed, CircuitState::Open),
                ("payments".to_string(), CircuitState::Open, CircuitState::Closed),
            ]
        );
        assert_eq!(
            registry.states(),
            vec![("payments".to_string(), CircuitState::Closed)]
        );
    }

    #[test]
    fn test_config_serialization() {
        let config = CircuitBreakerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: CircuitBreakerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }
}
