//! Pool manager: worker records, scaling and crash replacement

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::record::{WorkerRecord, WorkerSnapshot};
use super::worker::{
    ExitReason, WorkerCommand, WorkerEvent, WorkerId, WorkerSpawner, WorkerState,
};
use super::PoolConfig;
use crate::protocol::{Envelope, Sequence};

/// Pool changes the engine turns into protocol actions and events
#[derive(Debug)]
pub enum PoolEvent {
    Spawned(WorkerId),
    Ready(WorkerId),
    Reclaimed(WorkerId),
    Crashed {
        worker: WorkerId,
        /// Envelope the worker held; goes back to the protocol as abandoned
        abandoned: Option<Envelope>,
        reason: String,
    },
    Unavailable {
        reason: String,
    },
}

/// Owns worker records; driven only by the control loop
#[derive(Debug)]
pub struct PoolManager {
    config: PoolConfig,
    spawner: Arc<dyn WorkerSpawner>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    workers: BTreeMap<WorkerId, WorkerRecord>,
    next_id: u64,
    spawn_failures: u32,
    unavailable: bool,
}

impl PoolManager {
    pub fn new(
        config: PoolConfig,
        spawner: Arc<dyn WorkerSpawner>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            config,
            spawner,
            events,
            workers: BTreeMap::new(),
            next_id: 1,
            spawn_failures: 0,
            unavailable: false,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Spawn until `min_workers` are live
    pub fn ensure_min(&mut self, now: Instant) -> Vec<PoolEvent> {
        let mut events = Vec::new();
        while !self.unavailable && self.live_count() < self.config.min_workers {
            if !self.spawn_one(now, &mut events) {
                break;
            }
        }
        events
    }

    /// Hand an envelope to an idle worker
    ///
    /// Returns the envelope when the worker is not idle or its channel is
    /// closed.
    pub fn acquire_worker(&mut self, id: WorkerId, envelope: Envelope, now: Instant) -> Result<(), Envelope> {
        let Some(record) = self.workers.get_mut(&id) else {
            return Err(envelope);
        };
        if record.state != WorkerState::Idle {
            return Err(envelope);
        }

        match record.handle.send(WorkerCommand::Run(envelope.clone())) {
            Ok(()) => {
                record.start_envelope(envelope, now);
                Ok(())
            }
            Err(_) => {
                warn!(worker_id = %id, "worker channel closed on dispatch");
                Err(envelope)
            }
        }
    }

    /// A worker reported a result for `sequence`/`attempt`
    ///
    /// Returns false when the worker was not holding that attempt.
    pub fn release_worker(&mut self, id: WorkerId, sequence: Sequence, attempt: u32, now: Instant) -> bool {
        let Some(record) = self.workers.get_mut(&id) else {
            return false;
        };
        record.last_heartbeat_at = now;
        if !record.holds(sequence, attempt) {
            return false;
        }
        record.finish_envelope(now);
        true
    }

    /// Warm-up finished
    pub fn on_ready(&mut self, id: WorkerId, now: Instant) -> Option<PoolEvent> {
        let record = self.workers.get_mut(&id)?;
        if record.state != WorkerState::Starting {
            return None;
        }
        record.state = WorkerState::Idle;
        record.idle_since = Some(now);
        record.last_heartbeat_at = now;
        self.spawn_failures = 0;
        self.unavailable = false;
        info!(worker_id = %id, "worker ready");
        Some(PoolEvent::Ready(id))
    }

    /// The worker task ended
    pub fn on_exit(&mut self, id: WorkerId, reason: ExitReason, now: Instant) -> Vec<PoolEvent> {
        let Some(mut record) = self.workers.remove(&id) else {
            return Vec::new();
        };
        let mut events = Vec::new();

        match record.state {
            // Already handled when it was force-crashed
            WorkerState::Crashed => {
                debug!(worker_id = %id, %reason, "worker removed");
            }
            // A draining worker may still hold the envelope it was running
            WorkerState::Draining => {
                if record.current.is_none() && matches!(reason, ExitReason::Stopped) {
                    debug!(worker_id = %id, "drained worker stopped");
                } else {
                    error!(worker_id = %id, %reason, "draining worker crashed");
                    events.push(PoolEvent::Crashed {
                        worker: id,
                        abandoned: record.current.take(),
                        reason: reason.to_string(),
                    });
                    self.refill_min(now, &mut events);
                }
            }
            WorkerState::Starting => {
                warn!(worker_id = %id, %reason, "worker failed before ready");
                self.spawn_failures += 1;
                events.push(PoolEvent::Crashed {
                    worker: id,
                    abandoned: None,
                    reason: reason.to_string(),
                });
                self.replace_lost(now, &mut events);
            }
            WorkerState::Idle | WorkerState::Busy | WorkerState::Unresponsive => {
                error!(worker_id = %id, %reason, "worker crashed");
                events.push(PoolEvent::Crashed {
                    worker: id,
                    abandoned: record.current.take(),
                    reason: reason.to_string(),
                });
                self.replace_lost(now, &mut events);
            }
        }
        events
    }

    /// Kill a worker and start a new one in its place
    ///
    /// The held envelope, if any, is returned as abandoned. The old record
    /// stays `Crashed` until its exit is observed. A draining worker was
    /// already on its way out, so it gets no successor.
    pub fn replace(&mut self, id: WorkerId, reason: &str, now: Instant) -> Vec<PoolEvent> {
        let Some(record) = self.workers.get_mut(&id) else {
            return Vec::new();
        };
        if record.state == WorkerState::Crashed {
            return Vec::new();
        }

        warn!(worker_id = %id, reason, "replacing worker");
        let draining = record.state == WorkerState::Draining;
        record.handle.abort();
        record.state = WorkerState::Crashed;
        let mut events = vec![PoolEvent::Crashed {
            worker: id,
            abandoned: record.current.take(),
            reason: reason.to_string(),
        }];
        if draining {
            self.refill_min(now, &mut events);
        } else {
            self.spawn_one(now, &mut events);
        }
        events
    }

    /// Grow or shrink to `target`, clamped to the configured bounds
    pub fn resize(&mut self, target: usize, now: Instant) -> Vec<PoolEvent> {
        let target = self.config.clamp(target);
        let mut events = Vec::new();
        info!(target, live = self.live_count(), "resizing pool");

        while self.live_count() < target {
            if !self.spawn_one(now, &mut events) {
                break;
            }
        }
        while self.live_count() > target {
            let Some(victim) = self.shrink_candidate() else {
                break;
            };
            self.drain(victim, &mut events);
        }
        events
    }

    /// Swap in a new configuration and bring the pool into its bounds
    pub fn configure(&mut self, config: PoolConfig, now: Instant) -> Vec<PoolEvent> {
        self.config = config;
        for record in self.workers.values_mut() {
            record.weight = self.config.weight_for(record.id.as_u64());
        }
        self.spawn_failures = 0;
        self.unavailable = false;
        let live = self.live_count();
        self.resize(live, now)
    }

    /// Clear the unavailable latch after an operator action
    pub fn reset_failures(&mut self) {
        self.spawn_failures = 0;
        self.unavailable = false;
    }

    /// Grow when queued tickets exceed what idle and starting workers absorb
    pub fn scale_for_backlog(&mut self, backlog: usize, now: Instant) -> Vec<PoolEvent> {
        let mut events = Vec::new();
        if self.unavailable || backlog <= self.config.scale_up_backlog {
            return events;
        }

        let absorbing = self
            .workers
            .values()
            .filter(|r| matches!(r.state, WorkerState::Idle | WorkerState::Starting))
            .count();
        let wanted = backlog
            .saturating_sub(self.config.scale_up_backlog)
            .saturating_sub(absorbing);
        let room = self.config.max_workers.saturating_sub(self.live_count());

        for _ in 0..wanted.min(room) {
            if !self.spawn_one(now, &mut events) {
                break;
            }
        }
        if !events.is_empty() {
            debug!(backlog, spawned = events.len(), "scaled up for backlog");
        }
        events
    }

    /// Drain workers idle past `idle_timeout`, oldest first, down to `min_workers`
    pub fn reclaim_idle(&mut self, now: Instant) -> Vec<PoolEvent> {
        let mut events = Vec::new();
        let mut expired: Vec<(Instant, WorkerId)> = self
            .workers
            .values()
            .filter(|r| r.state == WorkerState::Idle)
            .filter_map(|r| r.idle_since.map(|since| (since, r.id)))
            .filter(|(since, _)| now.saturating_duration_since(*since) >= self.config.idle_timeout)
            .collect();
        expired.sort();

        for (_, id) in expired {
            if self.live_count() <= self.config.min_workers {
                break;
            }
            self.drain(id, &mut events);
        }
        events
    }

    /// Any sign of life from a worker
    pub fn heartbeat(&mut self, id: WorkerId, now: Instant) {
        if let Some(record) = self.workers.get_mut(&id) {
            record.last_heartbeat_at = now;
        }
    }

    pub fn mark_unresponsive(&mut self, id: WorkerId) -> bool {
        match self.workers.get_mut(&id) {
            Some(record) if matches!(record.state, WorkerState::Idle | WorkerState::Busy) => {
                record.prior_state = Some(record.state);
                record.state = WorkerState::Unresponsive;
                true
            }
            _ => false,
        }
    }

    pub fn mark_recovered(&mut self, id: WorkerId) -> bool {
        match self.workers.get_mut(&id) {
            Some(record) if record.state == WorkerState::Unresponsive => {
                record.state = match (record.prior_state.take(), &record.current) {
                    (_, Some(_)) => WorkerState::Busy,
                    (Some(prior), None) if prior != WorkerState::Busy => prior,
                    _ => WorkerState::Idle,
                };
                true
            }
            _ => false,
        }
    }

    pub fn ping(&self, id: WorkerId, nonce: u64) -> bool {
        self.workers
            .get(&id)
            .is_some_and(|r| r.handle.send(WorkerCommand::Ping { nonce }).is_ok())
    }

    /// Ask a worker to cooperatively cancel an attempt
    pub fn recall(&self, id: WorkerId, sequence: Sequence, attempt: u32) -> bool {
        self.workers.get(&id).is_some_and(|r| {
            r.handle
                .send(WorkerCommand::Cancel { sequence, attempt })
                .is_ok()
        })
    }

    /// Ask every worker to finish and exit
    pub fn shutdown_all(&mut self) {
        for record in self.workers.values_mut() {
            if record.state != WorkerState::Crashed {
                record.state = WorkerState::Draining;
                let _ = record.handle.send(WorkerCommand::Shutdown);
            }
        }
    }

    /// Kill every worker task still running
    pub fn abort_all(&mut self) {
        for record in self.workers.values() {
            record.handle.abort();
        }
    }

    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        self.workers.values().map(WorkerRecord::snapshot).collect()
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerRecord> {
        self.workers.get(&id)
    }

    /// Workers that count toward pool size
    pub fn live_count(&self) -> usize {
        self.workers.values().filter(|r| r.is_live()).count()
    }

    /// Workers with a task body that can still run
    pub fn total_count(&self) -> usize {
        self.workers.len()
    }

    pub fn counts_by_state(&self) -> BTreeMap<WorkerState, usize> {
        let mut counts = BTreeMap::new();
        for record in self.workers.values() {
            *counts.entry(record.state).or_insert(0) += 1;
        }
        counts
    }

    /// Ids of workers the health monitor should watch
    ///
    /// Includes draining workers that are still finishing an envelope.
    pub fn monitored(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.workers
            .values()
            .filter(|r| {
                matches!(r.state, WorkerState::Idle | WorkerState::Busy | WorkerState::Unresponsive)
                    || (r.state == WorkerState::Draining && r.current.is_some())
            })
            .map(|r| r.id)
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable
    }

    fn replace_lost(&mut self, now: Instant, events: &mut Vec<PoolEvent>) {
        if self.check_unavailable(events) {
            return;
        }
        if self.spawn_failures >= self.config.max_spawn_failures {
            warn!(failures = self.spawn_failures, "not replacing worker after repeated start failures");
            return;
        }
        if self.live_count() < self.config.max_workers {
            self.spawn_one(now, events);
        }
        self.refill_min(now, events);
    }

    fn refill_min(&mut self, now: Instant, events: &mut Vec<PoolEvent>) {
        while !self.unavailable && self.live_count() < self.config.min_workers {
            if !self.spawn_one(now, events) {
                break;
            }
        }
    }

    /// Returns true once failures are exhausted and nothing is live
    fn check_unavailable(&mut self, events: &mut Vec<PoolEvent>) -> bool {
        if self.spawn_failures < self.config.max_spawn_failures || self.live_count() > 0 {
            return false;
        }
        if !self.unavailable {
            self.unavailable = true;
            let reason = format!(
                "{} consecutive worker start failures and no live worker",
                self.spawn_failures
            );
            error!(%reason, "worker pool unavailable");
            events.push(PoolEvent::Unavailable { reason });
        }
        true
    }

    fn spawn_one(&mut self, now: Instant, events: &mut Vec<PoolEvent>) -> bool {
        if self.check_unavailable(events) {
            return false;
        }

        let id = WorkerId::new(self.next_id);
        self.next_id += 1;

        match self.spawner.spawn(id, self.events.clone()) {
            Ok(handle) => {
                let weight = self.config.weight_for(id.as_u64());
                self.workers.insert(id, WorkerRecord::new(id, weight, handle, now));
                debug!(worker_id = %id, weight, "worker spawned");
                events.push(PoolEvent::Spawned(id));
                true
            }
            Err(e) => {
                self.spawn_failures += 1;
                warn!(worker_id = %id, error = %e, failures = self.spawn_failures, "worker spawn failed");
                self.check_unavailable(events);
                false
            }
        }
    }

    /// Idle workers first (longest idle), then starting, then busy
    fn shrink_candidate(&self) -> Option<WorkerId> {
        let rank = |state: WorkerState| match state {
            WorkerState::Idle => 0,
            WorkerState::Starting => 1,
            WorkerState::Unresponsive => 2,
            _ => 3,
        };
        self.workers
            .values()
            .filter(|r| r.is_live())
            .min_by_key(|r| (rank(r.state), r.idle_since, std::cmp::Reverse(r.id)))
            .map(|r| r.id)
    }

    fn drain(&mut self, id: WorkerId, events: &mut Vec<PoolEvent>) {
        if let Some(record) = self.workers.get_mut(&id) {
            info!(worker_id = %id, state = %record.state, "draining worker");
            record.state = WorkerState::Draining;
            let _ = record.handle.send(WorkerCommand::Shutdown);
            events.push(PoolEvent::Reclaimed(id));
        }
    }
}
