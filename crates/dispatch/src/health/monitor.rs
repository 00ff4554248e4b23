//! Heartbeat tracking per worker

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::pool::{PoolConfig, WorkerId};

/// Classification change for a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthVerdict {
    /// Ping round trip above the slow threshold; informational only
    Slow { worker: WorkerId, round_trip: Duration },

    /// No sign of life within the heartbeat timeout
    Unresponsive { worker: WorkerId, silent_for: Duration },

    /// Answered again before being force-crashed
    Recovered { worker: WorkerId },

    /// Unresponsive past the grace period; crash and replace it
    ForceCrash { worker: WorkerId },
}

/// Heartbeat errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeartbeatError {
    #[error("heartbeat from untracked worker {0}")]
    UnknownWorker(WorkerId),
}

#[derive(Debug)]
struct WorkerHealth {
    last_seen: Instant,
    pending_ping: Option<(u64, Instant)>,
    unresponsive_since: Option<Instant>,
    slow: bool,
}

/// Decides when workers are unresponsive, recovered or beyond saving
///
/// Pure state: the engine feeds it pings, pongs and other worker traffic and
/// acts on the verdicts. It never touches tasks.
#[derive(Debug)]
pub struct HealthMonitor {
    heartbeat_timeout: Duration,
    unresponsive_timeout: Duration,
    slow_threshold: Duration,
    workers: HashMap<WorkerId, WorkerHealth>,
    next_nonce: u64,
}

impl HealthMonitor {
    pub fn new(heartbeat_timeout: Duration, unresponsive_timeout: Duration, slow_threshold: Duration) -> Self {
        Self {
            heartbeat_timeout,
            unresponsive_timeout,
            slow_threshold,
            workers: HashMap::new(),
            next_nonce: 1,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(
            config.heartbeat_timeout,
            config.unresponsive_timeout,
            config.slow_threshold,
        )
    }

    pub fn reconfigure(&mut self, config: &PoolConfig) {
        self.heartbeat_timeout = config.heartbeat_timeout;
        self.unresponsive_timeout = config.unresponsive_timeout;
        self.slow_threshold = config.slow_threshold;
    }

    /// Start watching a worker that just became ready
    pub fn track(&mut self, worker: WorkerId, now: Instant) {
        self.workers.insert(
            worker,
            WorkerHealth {
                last_seen: now,
                pending_ping: None,
                unresponsive_since: None,
                slow: false,
            },
        );
    }

    pub fn untrack(&mut self, worker: WorkerId) {
        self.workers.remove(&worker);
    }

    pub fn is_tracked(&self, worker: WorkerId) -> bool {
        self.workers.contains_key(&worker)
    }

    pub fn tracked(&self) -> usize {
        self.workers.len()
    }

    /// Any message from the worker counts as a heartbeat
    pub fn observe(&mut self, worker: WorkerId, now: Instant) -> Option<HealthVerdict> {
        let health = self.workers.get_mut(&worker)?;
        health.last_seen = now;
        if health.unresponsive_since.take().is_some() {
            debug!(worker_id = %worker, "worker answered again");
            return Some(HealthVerdict::Recovered { worker });
        }
        None
    }

    /// Nonce for the next ping, or `None` while one is still outstanding
    pub fn prepare_ping(&mut self, worker: WorkerId, now: Instant) -> Option<u64> {
        let health = self.workers.get_mut(&worker)?;
        if health.pending_ping.is_some() {
            return None;
        }
        let nonce = self.next_nonce;
        self.next_nonce += 1;
        health.pending_ping = Some((nonce, now));
        Some(nonce)
    }

    pub fn pong(&mut self, worker: WorkerId, nonce: u64, now: Instant) -> Result<Vec<HealthVerdict>, HeartbeatError> {
        if !self.workers.contains_key(&worker) {
            return Err(HeartbeatError::UnknownWorker(worker));
        }
        let mut verdicts: Vec<HealthVerdict> = self.observe(worker, now).into_iter().collect();

        let slow_threshold = self.slow_threshold;
        if let Some(health) = self.workers.get_mut(&worker) {
            if let Some((pending, sent_at)) = health.pending_ping {
                if pending == nonce {
                    health.pending_ping = None;
                    let round_trip = now.saturating_duration_since(sent_at);
                    let slow = round_trip > slow_threshold;
                    if slow && !health.slow {
                        debug!(worker_id = %worker, ?round_trip, "worker is slow");
                        verdicts.push(HealthVerdict::Slow { worker, round_trip });
                    }
                    health.slow = slow;
                }
            }
        }
        Ok(verdicts)
    }

    /// Check every tracked worker against the timeouts
    pub fn evaluate(&mut self, now: Instant) -> Vec<HealthVerdict> {
        let mut verdicts = Vec::new();
        let mut crashed = Vec::new();

        for (worker, health) in self.workers.iter_mut() {
            match health.unresponsive_since {
                Some(since) => {
                    if now.saturating_duration_since(since) >= self.unresponsive_timeout {
                        warn!(worker_id = %worker, "worker unresponsive past grace period");
                        crashed.push(*worker);
                    }
                }
                None => {
                    let silent_for = now.saturating_duration_since(health.last_seen);
                    if silent_for > self.heartbeat_timeout {
                        warn!(worker_id = %worker, ?silent_for, "worker missed heartbeats");
                        health.unresponsive_since = Some(now);
                        verdicts.push(HealthVerdict::Unresponsive {
                            worker: *worker,
                            silent_for,
                        });
                    }
                }
            }
        }

        crashed.sort();
        for worker in crashed {
            self.workers.remove(&worker);
            verdicts.push(HealthVerdict::ForceCrash { worker });
        }
        verdicts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: WorkerId = WorkerId::new(1);

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(
            Duration::from_secs(2),
            Duration::from_secs(5),
            Duration::from_millis(500),
        )
    }

    #[test]
    fn test_silence_then_force_crash() {
        let start = Instant::now();
        let mut health = monitor();
        health.track(W, start);

        assert!(health.evaluate(start + Duration::from_secs(2)).is_empty());
        let verdicts = health.evaluate(start + Duration::from_secs(3));
        assert!(matches!(verdicts[..], [HealthVerdict::Unresponsive { worker: W, .. }]));

        // still inside the grace period
        assert!(health.evaluate(start + Duration::from_secs(7)).is_empty());
        let verdicts = health.evaluate(start + Duration::from_secs(8));
        assert_eq!(verdicts, vec![HealthVerdict::ForceCrash { worker: W }]);
        assert!(!health.is_tracked(W));
    }

    #[test]
    fn test_recovers_before_grace_period_ends() {
        let start = Instant::now();
        let mut health = monitor();
        health.track(W, start);
        health.evaluate(start + Duration::from_secs(3));

        let verdict = health.observe(W, start + Duration::from_secs(4));
        assert_eq!(verdict, Some(HealthVerdict::Recovered { worker: W }));

        // grace period restarts from scratch
        assert!(health.evaluate(start + Duration::from_secs(6)).is_empty());
        let verdicts = health.evaluate(start + Duration::from_secs(9));
        assert!(matches!(verdicts[..], [HealthVerdict::Unresponsive { .. }]));
        assert!(health.is_tracked(W));
    }

    #[test]
    fn test_slow_round_trip_reported_once() {
        let start = Instant::now();
        let mut health = monitor();
        health.track(W, start);

        let nonce = health.prepare_ping(W, start).unwrap();
        assert!(health.prepare_ping(W, start).is_none());
        let verdicts = health.pong(W, nonce, start + Duration::from_millis(800)).unwrap();
        assert!(matches!(verdicts[..], [HealthVerdict::Slow { .. }]));

        let nonce = health.prepare_ping(W, start).unwrap();
        let verdicts = health.pong(W, nonce, start + Duration::from_millis(900)).unwrap();
        assert!(verdicts.is_empty());
    }

    #[test]
    fn test_stale_pong_still_counts_as_heartbeat() {
        let start = Instant::now();
        let mut health = monitor();
        health.track(W, start);
        health.prepare_ping(W, start);

        health.pong(W, 999, start + Duration::from_secs(2)).unwrap();
        assert!(health.evaluate(start + Duration::from_secs(4)).is_empty());
    }

    #[test]
    fn test_unknown_worker() {
        let mut health = monitor();
        assert_eq!(
            health.pong(W, 1, Instant::now()),
            Err(HeartbeatError::UnknownWorker(W))
        );
        assert!(health.observe(W, Instant::now()).is_none());
    }
}
