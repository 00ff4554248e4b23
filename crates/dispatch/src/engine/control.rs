//! The control loop
//!
//! One task owns the delivery protocol, scheduler, pool manager and health
//! monitor. Callers reach it through [`Command`]s, workers through
//! [`WorkerEvent`]s; nothing else mutates engine state. After every event
//! the loop pumps queued tickets onto idle workers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::time::{interval, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{EngineEvent, EngineEventKind};
use super::handle::{Admitted, Outcome, WaiterId};
use super::stats::EngineStats;
use crate::error::{DispatchError, TaskError, POOL_UNAVAILABLE};
use crate::health::{HealthMonitor, HealthVerdict};
use crate::pool::{BackpressureState, PoolConfig, PoolEvent, PoolManager, WorkerEvent, WorkerId};
use crate::protocol::{DeliveryAction, DeliveryProtocol, Dispatch, SeenTask, Sequence, Submission};
use crate::reliability::CircuitBreakerRegistry;
use crate::scheduler::Scheduler;
use crate::task::{Delivery, HandlerRegistry, TaskResult, TaskSpec};

/// Caller requests
#[derive(Debug)]
pub(crate) enum Command {
    Submit {
        spec: TaskSpec,
        reply: oneshot::Sender<Result<Admitted, DispatchError>>,
    },
    Cancel {
        sequence: Sequence,
        waiter: WaiterId,
    },
    Configure {
        config: PoolConfig,
        reply: oneshot::Sender<()>,
    },
    Resize {
        target: usize,
        reply: oneshot::Sender<usize>,
    },
    Replace {
        worker: WorkerId,
        reply: oneshot::Sender<bool>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
}

/// Everything the loop needs, assembled by the engine on start
pub(crate) struct ControlParts {
    pub protocol: DeliveryProtocol,
    pub scheduler: Scheduler,
    pub pool: PoolManager,
    pub health: HealthMonitor,
    pub handlers: Arc<HandlerRegistry>,
    pub circuits: Arc<CircuitBreakerRegistry>,
    pub backpressure: Arc<BackpressureState>,
    pub capacity: Arc<Notify>,
    pub results: broadcast::Sender<Delivery>,
    pub events: broadcast::Sender<EngineEvent>,
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub worker_events: mpsc::UnboundedReceiver<WorkerEvent>,
    pub shutdown: CancellationToken,
}

/// A handle waiting for a sequence's result
struct Waiter {
    id: WaiterId,
    tx: oneshot::Sender<TaskResult>,
}

pub(crate) struct ControlLoop {
    protocol: DeliveryProtocol,
    scheduler: Scheduler,
    pool: PoolManager,
    health: HealthMonitor,
    handlers: Arc<HandlerRegistry>,
    circuits: Arc<CircuitBreakerRegistry>,
    backpressure: Arc<BackpressureState>,
    capacity: Arc<Notify>,
    results: broadcast::Sender<Delivery>,
    events: broadcast::Sender<EngineEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    worker_events: mpsc::UnboundedReceiver<WorkerEvent>,
    shutdown: CancellationToken,
    health_tick: Interval,
    waiters: HashMap<Sequence, Vec<Waiter>>,
    next_waiter: WaiterId,
}

impl ControlLoop {
    pub(crate) fn new(parts: ControlParts) -> Self {
        let health_tick = health_interval(parts.pool.config());
        Self {
            protocol: parts.protocol,
            scheduler: parts.scheduler,
            pool: parts.pool,
            health: parts.health,
            handlers: parts.handlers,
            circuits: parts.circuits,
            backpressure: parts.backpressure,
            capacity: parts.capacity,
            results: parts.results,
            events: parts.events,
            commands: parts.commands,
            worker_events: parts.worker_events,
            shutdown: parts.shutdown,
            health_tick,
            waiters: HashMap::new(),
            next_waiter: 1,
        }
    }

    /// Run until shutdown, then drain workers for at most `drain_timeout`
    pub(crate) async fn run(mut self, drain_timeout: std::time::Duration) -> Result<(), DispatchError> {
        let events = self.pool.ensure_min(Instant::now());
        self.on_pool_events(events, Instant::now());

        loop {
            let next_timer = self.protocol.next_deadline();
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break,

                Some(command) = self.commands.recv() => self.on_command(command, Instant::now()),

                Some(event) = self.worker_events.recv() => self.on_worker_event(event, Instant::now()),

                _ = self.health_tick.tick() => self.on_health_tick(Instant::now()),

                _ = wait_until(next_timer) => {
                    let actions = self.protocol.expire(Instant::now());
                    self.apply(actions);
                }
            }
            self.pump(Instant::now());
        }

        self.drain(drain_timeout).await
    }

    fn on_command(&mut self, command: Command, now: Instant) {
        match command {
            Command::Submit { spec, reply } => {
                let admitted = self.submit(spec, now);
                let _ = reply.send(admitted);
            }
            Command::Cancel { sequence, waiter } => self.cancel(sequence, waiter, now),
            Command::Configure { config, reply } => {
                info!(min = config.min_workers, max = config.max_workers, "reconfiguring pool");
                self.health.reconfigure(&config);
                self.health_tick = health_interval(&config);
                let events = self.pool.configure(config, now);
                self.on_pool_events(events, now);
                let _ = reply.send(());
            }
            Command::Resize { target, reply } => {
                self.pool.reset_failures();
                let events = self.pool.resize(target, now);
                self.on_pool_events(events, now);
                let _ = reply.send(self.pool.live_count());
            }
            Command::Replace { worker, reply } => {
                let events = self.pool.replace(worker, "replaced on request", now);
                let replaced = !events.is_empty();
                self.on_pool_events(events, now);
                let _ = reply.send(replaced);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn submit(&mut self, spec: TaskSpec, now: Instant) -> Result<Admitted, DispatchError> {
        // Duplicates bypass admission control
        if let Some(seen) = self.protocol.find_duplicate(&spec.dedup_key(), now) {
            return self.attach(seen);
        }

        self.backpressure.set_outstanding(self.protocol.outstanding());
        if !self.backpressure.should_accept() {
            let reason = self
                .backpressure
                .reason()
                .unwrap_or_else(|| "engine at capacity".to_string());
            return Err(DispatchError::rejected(reason));
        }
        if !self.handlers.contains(&spec.kind) {
            return Err(DispatchError::UnknownTaskKind(spec.kind));
        }
        if self.pool.is_unavailable() {
            return Err(DispatchError::PoolUnavailable(
                "no worker could be started".to_string(),
            ));
        }

        match self.protocol.submit(spec, now) {
            Submission::Accepted(ticket) => {
                let (waiter, rx) = self.add_waiter(ticket.sequence);
                debug!(
                    sequence = ticket.sequence,
                    task_id = %ticket.task.id,
                    kind = %ticket.task.kind,
                    priority = ticket.task.priority,
                    "task accepted"
                );
                let admitted = Admitted {
                    task_id: ticket.task.id.clone(),
                    sequence: ticket.sequence,
                    duplicate: false,
                    waiter: Some(waiter),
                    outcome: Outcome::Pending(rx),
                };
                self.scheduler.enqueue(ticket);
                self.backpressure.set_outstanding(self.protocol.outstanding());
                Ok(admitted)
            }
            Submission::Duplicate(seen) => self.attach(seen),
        }
    }

    /// Hand a duplicate submitter the original's outcome, now or on delivery
    fn attach(&mut self, seen: SeenTask) -> Result<Admitted, DispatchError> {
        if let Some(result) = seen.outcome {
            return Ok(Admitted {
                task_id: result.task_id.clone(),
                sequence: seen.sequence,
                duplicate: true,
                waiter: None,
                outcome: Outcome::Ready(result),
            });
        }

        let Some(task_id) = self.protocol.task_id(seen.sequence).cloned() else {
            return Err(DispatchError::rejected(format!(
                "duplicate of sequence {} which is no longer tracked",
                seen.sequence
            )));
        };
        let (waiter, rx) = self.add_waiter(seen.sequence);
        Ok(Admitted {
            task_id,
            sequence: seen.sequence,
            duplicate: true,
            waiter: Some(waiter),
            outcome: Outcome::Pending(rx),
        })
    }

    fn add_waiter(&mut self, sequence: Sequence) -> (WaiterId, oneshot::Receiver<TaskResult>) {
        let id = self.next_waiter;
        self.next_waiter += 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.entry(sequence).or_default().push(Waiter { id, tx });
        (id, rx)
    }

    /// Withdraw one handle; cancel the task only when no other handle waits
    fn cancel(&mut self, sequence: Sequence, waiter: WaiterId, now: Instant) {
        let Some(waiters) = self.waiters.get_mut(&sequence) else {
            return;
        };
        let Some(position) = waiters.iter().position(|w| w.id == waiter) else {
            return;
        };
        let shared = waiters
            .iter()
            .any(|w| w.id != waiter && !w.tx.is_closed());

        if shared {
            let withdrawn = waiters.swap_remove(position);
            if let Some(task_id) = self.protocol.task_id(sequence).cloned() {
                let _ = withdrawn.tx.send(TaskResult::withdrawn(task_id, sequence));
            }
            debug!(sequence, waiter, "handle withdrawn, task still awaited");
            return;
        }

        self.scheduler.remove(sequence);
        let actions = self.protocol.cancel(sequence, now);
        if !actions.is_empty() {
            debug!(sequence, "task cancelled");
        }
        self.apply(actions);
    }

    fn on_worker_event(&mut self, event: WorkerEvent, now: Instant) {
        let worker = event.worker();
        self.pool.heartbeat(worker, now);
        if let Some(verdict) = self.health.observe(worker, now) {
            self.on_verdict(verdict, now);
        }

        match event {
            WorkerEvent::Ready { worker } => {
                if let Some(ready) = self.pool.on_ready(worker, now) {
                    self.health.track(worker, now);
                    self.on_pool_events(vec![ready], now);
                }
            }
            WorkerEvent::Pong { worker, nonce } => match self.health.pong(worker, nonce, now) {
                Ok(verdicts) => {
                    for verdict in verdicts {
                        self.on_verdict(verdict, now);
                    }
                }
                Err(e) => debug!(error = %e, "ignoring pong"),
            },
            WorkerEvent::Acked {
                worker,
                sequence,
                attempt,
            } => {
                if !self.protocol.acknowledge(sequence, attempt) {
                    debug!(worker_id = %worker, sequence, attempt, "ack for attempt that no longer counts");
                }
            }
            WorkerEvent::Finished {
                worker,
                sequence,
                attempt,
                outcome,
                duration,
            } => {
                self.pool.release_worker(worker, sequence, attempt, now);
                let actions = self
                    .protocol
                    .complete(worker, sequence, attempt, outcome, duration, now);
                self.apply(actions);
            }
            WorkerEvent::Exited { worker, reason } => {
                self.health.untrack(worker);
                self.scheduler.worker_removed(worker);
                let events = self.pool.on_exit(worker, reason, now);
                self.on_pool_events(events, now);
            }
        }
    }

    fn on_health_tick(&mut self, now: Instant) {
        let monitored: Vec<WorkerId> = self.pool.monitored().collect();
        for worker in monitored {
            if let Some(nonce) = self.health.prepare_ping(worker, now) {
                if !self.pool.ping(worker, nonce) {
                    debug!(worker_id = %worker, "ping not delivered");
                }
            }
        }

        for verdict in self.health.evaluate(now) {
            self.on_verdict(verdict, now);
        }

        let events = self.pool.reclaim_idle(now);
        self.on_pool_events(events, now);
        let events = self.pool.ensure_min(now);
        self.on_pool_events(events, now);
    }

    fn on_verdict(&mut self, verdict: HealthVerdict, now: Instant) {
        match verdict {
            HealthVerdict::Slow { worker, round_trip } => {
                self.emit(EngineEventKind::WorkerSlow { worker, round_trip });
            }
            HealthVerdict::Unresponsive { worker, silent_for } => {
                if self.pool.mark_unresponsive(worker) {
                    self.emit(EngineEventKind::WorkerUnresponsive { worker, silent_for });
                }
            }
            HealthVerdict::Recovered { worker } => {
                if self.pool.mark_recovered(worker) {
                    self.emit(EngineEventKind::WorkerRecovered { worker });
                }
            }
            HealthVerdict::ForceCrash { worker } => {
                let events = self.pool.replace(worker, "unresponsive past grace period", now);
                self.on_pool_events(events, now);
            }
        }
    }

    fn on_pool_events(&mut self, events: Vec<PoolEvent>, now: Instant) {
        for event in events {
            match event {
                PoolEvent::Spawned(worker) => self.emit(EngineEventKind::WorkerSpawned { worker }),
                PoolEvent::Ready(worker) => self.emit(EngineEventKind::WorkerReady { worker }),
                PoolEvent::Reclaimed(worker) => {
                    // Keep watching a worker that is finishing an envelope
                    let busy = self.pool.get(worker).is_some_and(|r| r.current.is_some());
                    if !busy {
                        self.health.untrack(worker);
                    }
                    self.scheduler.worker_removed(worker);
                    self.emit(EngineEventKind::WorkerReclaimed { worker });
                }
                PoolEvent::Crashed {
                    worker,
                    abandoned,
                    reason,
                } => {
                    self.health.untrack(worker);
                    self.scheduler.worker_removed(worker);
                    self.emit(EngineEventKind::WorkerCrashed {
                        worker,
                        reason,
                        abandoned: abandoned.as_ref().map(|envelope| envelope.sequence),
                    });
                    if let Some(envelope) = abandoned {
                        let actions = self.protocol.abandon(envelope.sequence, envelope.attempt, now);
                        self.apply(actions);
                    }
                }
                PoolEvent::Unavailable { reason } => {
                    self.emit(EngineEventKind::PoolUnavailable {
                        reason: reason.clone(),
                    });
                    self.fail_queued(&reason, now);
                }
            }
        }
    }

    /// Nothing can run the queued tickets; resolve them as failures
    fn fail_queued(&mut self, reason: &str, now: Instant) {
        let queued = self.scheduler.drain();
        if queued.is_empty() {
            return;
        }
        warn!(count = queued.len(), "failing queued tasks, pool unavailable");
        for ticket in queued {
            let error = TaskError::non_retryable(format!("worker pool unavailable: {reason}"))
                .with_kind(POOL_UNAVAILABLE);
            let actions = self.protocol.fail(ticket.sequence, error, now);
            self.apply(actions);
        }
    }

    fn apply(&mut self, actions: Vec<DeliveryAction>) {
        for action in actions {
            match action {
                DeliveryAction::Enqueue(ticket) => self.scheduler.enqueue(ticket),
                DeliveryAction::Dequeue { sequence } => {
                    self.scheduler.remove(sequence);
                }
                DeliveryAction::Deliver(delivery) => self.deliver(delivery),
                DeliveryAction::Retried {
                    task_id,
                    sequence,
                    attempt,
                    reason,
                    delay,
                } => {
                    info!(%task_id, sequence, attempt, %reason, ?delay, "retrying task");
                    self.emit(EngineEventKind::TaskRetried {
                        task_id,
                        sequence,
                        attempt,
                        reason,
                        delay,
                    });
                }
                DeliveryAction::Recall {
                    worker,
                    sequence,
                    attempt,
                } => {
                    if !self.pool.recall(worker, sequence, attempt) {
                        debug!(worker_id = %worker, sequence, attempt, "recall not delivered");
                    }
                }
                DeliveryAction::Discarded { .. } => {}
            }
        }
    }

    fn deliver(&mut self, delivery: Delivery) {
        let result = &delivery.result;
        if delivery.out_of_order {
            self.emit(EngineEventKind::TaskOutOfOrder {
                task_id: result.task_id.clone(),
                sequence: result.sequence,
            });
        }
        if result.late {
            self.emit(EngineEventKind::TaskLate {
                task_id: result.task_id.clone(),
                sequence: result.sequence,
            });
        }
        debug!(
            sequence = result.sequence,
            task_id = %result.task_id,
            status = %result.status,
            attempts = result.attempts,
            "delivering result"
        );

        if let Some(waiters) = self.waiters.remove(&result.sequence) {
            for waiter in waiters {
                let _ = waiter.tx.send(result.clone());
            }
        }
        // No subscribers is fine
        let _ = self.results.send(delivery);
    }

    /// Assign queued tickets to idle workers until one side runs out
    fn pump(&mut self, now: Instant) {
        loop {
            let workers = self.pool.snapshot();
            let Some((ticket, worker)) = self.scheduler.next_assignment(&workers) else {
                break;
            };

            match self.protocol.dispatch(ticket.sequence, ticket.attempt, worker, now) {
                Dispatch::Send(envelope) => {
                    let (sequence, attempt) = (envelope.sequence, envelope.attempt);
                    if let Err(envelope) = self.pool.acquire_worker(worker, envelope, now) {
                        warn!(worker_id = %worker, sequence, attempt, "worker refused envelope");
                        let actions = self.protocol.abandon(envelope.sequence, envelope.attempt, now);
                        self.apply(actions);
                    }
                }
                Dispatch::Stale => {
                    debug!(sequence = ticket.sequence, attempt = ticket.attempt, "skipping stale ticket");
                }
                Dispatch::Dropped(actions) => self.apply(actions),
            }
        }

        let events = self.pool.scale_for_backlog(self.scheduler.len(), now);
        self.on_pool_events(events, now);

        self.backpressure.set_outstanding(self.protocol.outstanding());
        self.capacity.notify_waiters();
    }

    fn emit(&self, kind: EngineEventKind) {
        let _ = self.events.send(EngineEvent::now(kind));
    }

    fn stats(&self) -> EngineStats {
        EngineStats {
            in_flight: self.protocol.in_flight_count(),
            buffered: self.protocol.buffered_count(),
            queued: self.scheduler.len(),
            workers: self.pool.counts_by_state(),
            worker_details: self.pool.snapshot(),
            protocol: self.protocol.stats().clone(),
            scheduler: self.scheduler.stats(),
            rejected: self.backpressure.rejected(),
            forced_releases: self.protocol.forced_releases(),
            accepting: self.backpressure.is_accepting(),
            admission_load: self.backpressure.load_ratio(),
            dedup_entries: self.protocol.dedup_len(),
            pool_unavailable: self.pool.is_unavailable(),
            circuits: self.circuits.states(),
        }
    }

    /// Let running tasks finish, then stop every worker
    async fn drain(mut self, timeout: std::time::Duration) -> Result<(), DispatchError> {
        let queued = self.scheduler.drain();
        info!(
            queued = queued.len(),
            running = self.pool.total_count(),
            "control loop draining"
        );
        self.pool.shutdown_all();

        let deadline = Instant::now() + timeout;
        let mut outcome = Ok(());
        while self.pool.total_count() > 0 {
            tokio::select! {
                Some(event) = self.worker_events.recv() => self.on_worker_event(event, Instant::now()),
                _ = sleep_until(deadline) => {
                    warn!(remaining = self.pool.total_count(), "shutdown timeout reached, aborting workers");
                    self.pool.abort_all();
                    outcome = Err(DispatchError::ShutdownTimeout);
                    break;
                }
            }
        }

        // Pending handles observe EngineStopped once their senders drop
        self.waiters.clear();
        self.capacity.notify_waiters();
        info!("control loop stopped");
        outcome
    }
}

fn health_interval(config: &PoolConfig) -> Interval {
    let mut tick = interval(config.health_check_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
