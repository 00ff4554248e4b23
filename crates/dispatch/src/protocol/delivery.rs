//! Delivery protocol state machine
//!
//! The protocol never touches channels or clocks. Every operation takes the
//! current instant and returns the [`DeliveryAction`]s the control loop must
//! carry out, so the whole retry, dedup and ordering logic runs in plain
//! unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::dedup::{DedupCache, SeenTask};
use super::envelope::{ack_timeout, Envelope, Sequence, Ticket};
use super::reorder::ReorderBuffer;
use super::timers::{TimerHeap, TimerKind};
use super::ProtocolConfig;
use crate::error::{TaskError, DEADLINE_MISSED};
use crate::pool::WorkerId;
use crate::task::{DedupKey, Delivery, Task, TaskId, TaskResult, TaskSpec, TaskStatus};

/// Why an attempt was reissued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    /// No ack before the ack deadline
    AckTimeout,
    /// Ticket waited in the queue past its deadline
    QueueTimeout,
    /// Worker crashed or was force-crashed while holding the envelope
    WorkerLost,
    /// Task body returned a retryable error
    TaskFailed,
    /// Running attempt was slow; a hedge attempt runs alongside it
    Speculative,
}

impl std::fmt::Display for RetryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AckTimeout => write!(f, "ack_timeout"),
            Self::QueueTimeout => write!(f, "queue_timeout"),
            Self::WorkerLost => write!(f, "worker_lost"),
            Self::TaskFailed => write!(f, "task_failed"),
            Self::Speculative => write!(f, "speculative"),
        }
    }
}

/// Work the control loop must carry out after a protocol transition
#[derive(Debug, Clone)]
pub enum DeliveryAction {
    /// Hand the ticket to the scheduler
    Enqueue(Ticket),

    /// Take the sequence's queued ticket back out of the scheduler
    Dequeue { sequence: Sequence },

    /// Release a result to the caller
    Deliver(Delivery),

    /// An attempt was reissued
    Retried {
        task_id: TaskId,
        sequence: Sequence,
        attempt: u32,
        reason: RetryReason,
        delay: Duration,
    },

    /// Ask a worker to cooperatively cancel an attempt that no longer counts
    Recall {
        worker: WorkerId,
        sequence: Sequence,
        attempt: u32,
    },

    /// A completion arrived for an attempt that no longer counts
    Discarded { sequence: Sequence, attempt: u32 },
}

/// Outcome of a submission
#[derive(Debug, Clone)]
pub enum Submission {
    /// New task; the ticket goes to the scheduler
    Accepted(Ticket),

    /// Same identity already seen; nothing is dispatched
    Duplicate(SeenTask),
}

/// Outcome of assigning a ticket to a worker
#[derive(Debug)]
pub enum Dispatch {
    /// Send this envelope to the worker
    Send(Envelope),

    /// Ticket no longer matches a live attempt (cancelled or superseded)
    Stale,

    /// Hard deadline missed; the task resolved without running
    Dropped(Vec<DeliveryAction>),
}

/// Counters kept by the protocol
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ProtocolStats {
    pub submitted: u64,
    pub duplicates: u64,
    pub retried: u64,
    /// Hedge attempts started next to a slow one
    pub speculated: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub discarded: u64,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Queued,
    Backoff,
    Running {
        worker: WorkerId,
        acked: bool,
    },
}

#[derive(Debug)]
struct InFlight {
    task: Arc<Task>,
    attempt: u32,
    phase: Phase,
    late: bool,
    /// Earlier attempt left running when a hedge was started
    hedge: Option<(WorkerId, u32)>,
}

impl InFlight {
    fn running_worker(&self) -> Option<WorkerId> {
        match self.phase {
            Phase::Running { worker, .. } => Some(worker),
            _ => None,
        }
    }
}

struct Resolution {
    status: TaskStatus,
    payload: Option<Value>,
    error: Option<TaskError>,
    worker: Option<WorkerId>,
    duration: Duration,
}

impl Resolution {
    fn success(payload: Value, worker: WorkerId, duration: Duration) -> Self {
        Self {
            status: TaskStatus::Success,
            payload: Some(payload),
            error: None,
            worker: Some(worker),
            duration,
        }
    }

    fn failure(error: TaskError, worker: Option<WorkerId>, duration: Duration) -> Self {
        Self {
            status: TaskStatus::Failure,
            payload: None,
            error: Some(error),
            worker,
            duration,
        }
    }

    fn without_outcome(status: TaskStatus) -> Self {
        Self {
            status,
            payload: None,
            error: None,
            worker: None,
            duration: Duration::ZERO,
        }
    }
}

enum Fired {
    QueueExpired,
    AckTimeout(WorkerId),
    BackoffElapsed(Ticket),
    Speculate(WorkerId),
}

/// Envelope bookkeeping, retries, dedup and ordered release
#[derive(Debug)]
pub struct DeliveryProtocol {
    config: ProtocolConfig,
    next_sequence: Sequence,
    in_flight: HashMap<Sequence, InFlight>,
    dedup: DedupCache,
    reorder: ReorderBuffer,
    timers: TimerHeap,
    stats: ProtocolStats,
}

impl DeliveryProtocol {
    pub fn new(config: ProtocolConfig) -> Self {
        Self {
            next_sequence: 1,
            in_flight: HashMap::new(),
            dedup: DedupCache::new(config.dedup_capacity, config.dedup_retention),
            reorder: ReorderBuffer::new(1, config.reorder_window),
            timers: TimerHeap::default(),
            stats: ProtocolStats::default(),
            config,
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Known submission with this identity, if still retained
    pub fn find_duplicate(&mut self, key: &DedupKey, now: Instant) -> Option<SeenTask> {
        let seen = self.dedup.lookup(key, now);
        if seen.is_some() {
            self.stats.duplicates += 1;
        }
        seen
    }

    /// Assign a sequence and start tracking a task
    pub fn submit(&mut self, spec: TaskSpec, now: Instant) -> Submission {
        let key = spec.dedup_key();
        if let Some(seen) = self.find_duplicate(&key, now) {
            debug!(sequence = seen.sequence, identity = %key, "duplicate submission");
            return Submission::Duplicate(seen);
        }

        let task = spec.into_task(self.config.default_ttl, self.config.retry.max_attempts, now);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.dedup.insert_pending(key, sequence, now);

        let task = Arc::new(task);
        self.in_flight.insert(
            sequence,
            InFlight {
                task: task.clone(),
                attempt: 1,
                phase: Phase::Queued,
                late: false,
                hedge: None,
            },
        );
        self.stats.submitted += 1;

        let ticket = Ticket {
            sequence,
            attempt: 1,
            task,
        };
        self.arm_queue_expiry(&ticket, now);
        Submission::Accepted(ticket)
    }

    /// Turn a ticket into an envelope for `worker` and start its ack timer
    ///
    /// The ack deadline restarts at dispatch; until then the queue-expiry
    /// timer armed on enqueue bounds the wait.
    pub fn dispatch(
        &mut self,
        sequence: Sequence,
        attempt: u32,
        worker: WorkerId,
        now: Instant,
    ) -> Dispatch {
        let Some(entry) = self.in_flight.get_mut(&sequence) else {
            return Dispatch::Stale;
        };
        if entry.attempt != attempt || !matches!(entry.phase, Phase::Queued) {
            return Dispatch::Stale;
        }

        if entry.task.is_late(now) {
            entry.late = true;
            if entry.task.hard_deadline {
                let error = TaskError::non_retryable(format!(
                    "task {} reached a worker after its hard deadline",
                    entry.task.id
                ))
                .with_kind(DEADLINE_MISSED);
                warn!(sequence, task_id = %entry.task.id, "dropping task past hard deadline");
                return Dispatch::Dropped(self.resolve(
                    sequence,
                    Resolution::failure(error, None, Duration::ZERO),
                    now,
                ));
            }
        }

        let ack_deadline =
            now + ack_timeout(entry.task.ttl, attempt, self.config.max_ack_timeout);
        let speculate_at = entry
            .task
            .speculate_after
            .or(self.config.speculate_after)
            .filter(|_| entry.hedge.is_none() && attempt < entry.task.max_attempts)
            .map(|after| now + after);
        entry.phase = Phase::Running {
            worker,
            acked: false,
        };
        let envelope = Envelope {
            sequence,
            attempt,
            task: entry.task.clone(),
            sent_at: now,
            ack_deadline,
            late: entry.late,
        };
        self.timers
            .schedule(ack_deadline, sequence, attempt, TimerKind::AckDeadline);
        if let Some(at) = speculate_at {
            self.timers.schedule(at, sequence, attempt, TimerKind::Speculate);
        }

        Dispatch::Send(envelope)
    }

    /// Explicit ack from the task body; stops the ack-deadline timer
    pub fn acknowledge(&mut self, sequence: Sequence, attempt: u32) -> bool {
        match self.in_flight.get_mut(&sequence) {
            Some(entry) if entry.attempt == attempt => match &mut entry.phase {
                Phase::Running { acked, .. } => {
                    *acked = true;
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// A worker finished an attempt
    ///
    /// The first successful outcome for a sequence wins, even from an attempt
    /// that was already given up on. Anything after that is discarded but
    /// keeps the dedup entry warm.
    pub fn complete(
        &mut self,
        worker: WorkerId,
        sequence: Sequence,
        attempt: u32,
        outcome: Result<Value, TaskError>,
        duration: Duration,
        now: Instant,
    ) -> Vec<DeliveryAction> {
        let Some(entry) = self.in_flight.get(&sequence) else {
            self.dedup.touch_sequence(sequence, now);
            return self.discard(sequence, attempt);
        };

        let current = entry.attempt == attempt && matches!(entry.phase, Phase::Running { .. });
        let attempts_left = entry.attempt < entry.task.max_attempts;
        let hedged = entry.hedge.is_some_and(|(_, hedge)| hedge == attempt);

        if !current {
            if hedged {
                if let Some(entry) = self.in_flight.get_mut(&sequence) {
                    entry.hedge = None;
                }
            }
            return match outcome {
                Ok(payload) => {
                    debug!(sequence, attempt, %worker, "earlier attempt finished first");
                    let mut actions = self.recall(sequence);
                    actions.extend(self.resolve(
                        sequence,
                        Resolution::success(payload, worker, duration),
                        now,
                    ));
                    actions
                }
                Err(_) => self.discard(sequence, attempt),
            };
        }

        match outcome {
            Ok(payload) => self.resolve(sequence, Resolution::success(payload, worker, duration), now),
            Err(error)
                if error.retryable
                    && attempts_left
                    && self.config.retry.should_retry(error.kind()) =>
            {
                debug!(sequence, attempt, error = %error, "retryable task failure");
                self.retry(sequence, RetryReason::TaskFailed, now)
            }
            Err(error) => self.resolve(
                sequence,
                Resolution::failure(error, Some(worker), duration),
                now,
            ),
        }
    }

    /// The worker holding this attempt is gone (crashed or force-crashed)
    pub fn abandon(&mut self, sequence: Sequence, attempt: u32, now: Instant) -> Vec<DeliveryAction> {
        // A lost hedge leaves the newer attempt in charge
        if let Some(entry) = self.in_flight.get_mut(&sequence) {
            if entry.hedge.is_some_and(|(_, hedge)| hedge == attempt) {
                entry.hedge = None;
                return Vec::new();
            }
        }

        let running = self.in_flight.get(&sequence).is_some_and(|entry| {
            entry.attempt == attempt && matches!(entry.phase, Phase::Running { .. })
        });
        if !running {
            return Vec::new();
        }
        self.attempt_lost(sequence, RetryReason::WorkerLost, now)
    }

    /// Fire due timers: queue expiry, ack deadlines, retry backoffs and hedges
    pub fn expire(&mut self, now: Instant) -> Vec<DeliveryAction> {
        let purged = self.dedup.purge_expired(now);
        if purged > 0 {
            debug!(purged, "expired dedup entries");
        }

        let mut actions = Vec::new();
        for timer in self.timers.pop_due(now) {
            let fired = match self.in_flight.get_mut(&timer.sequence) {
                Some(entry) if entry.attempt == timer.attempt => match timer.kind {
                    TimerKind::QueueExpiry => {
                        matches!(entry.phase, Phase::Queued).then_some(Fired::QueueExpired)
                    }
                    TimerKind::AckDeadline => match entry.phase {
                        Phase::Running {
                            worker,
                            acked: false,
                            ..
                        } => Some(Fired::AckTimeout(worker)),
                        _ => None,
                    },
                    TimerKind::RetryBackoff if matches!(entry.phase, Phase::Backoff) => {
                        entry.phase = Phase::Queued;
                        Some(Fired::BackoffElapsed(Ticket {
                            sequence: timer.sequence,
                            attempt: entry.attempt,
                            task: entry.task.clone(),
                        }))
                    }
                    TimerKind::RetryBackoff => None,
                    TimerKind::Speculate => match entry.phase {
                        Phase::Running { worker, .. }
                            if entry.hedge.is_none() && entry.attempt < entry.task.max_attempts =>
                        {
                            Some(Fired::Speculate(worker))
                        }
                        _ => None,
                    },
                },
                _ => None,
            };

            match fired {
                Some(Fired::QueueExpired) => {
                    warn!(sequence = timer.sequence, attempt = timer.attempt, "ticket expired in queue");
                    actions.push(DeliveryAction::Dequeue {
                        sequence: timer.sequence,
                    });
                    actions.extend(self.attempt_lost(timer.sequence, RetryReason::QueueTimeout, now));
                }
                Some(Fired::AckTimeout(worker)) => {
                    warn!(sequence = timer.sequence, attempt = timer.attempt, %worker, "ack deadline expired");
                    actions.push(DeliveryAction::Recall {
                        worker,
                        sequence: timer.sequence,
                        attempt: timer.attempt,
                    });
                    actions.extend(self.attempt_lost(timer.sequence, RetryReason::AckTimeout, now));
                }
                Some(Fired::BackoffElapsed(ticket)) => {
                    self.arm_queue_expiry(&ticket, now);
                    actions.push(DeliveryAction::Enqueue(ticket));
                }
                Some(Fired::Speculate(worker)) => {
                    debug!(sequence = timer.sequence, attempt = timer.attempt, %worker, "hedging slow attempt");
                    if let Some(entry) = self.in_flight.get_mut(&timer.sequence) {
                        entry.hedge = Some((worker, timer.attempt));
                    }
                    actions.extend(self.retry(timer.sequence, RetryReason::Speculative, now));
                }
                None => {}
            }
        }
        actions
    }

    /// Cancel a task that has not resolved yet
    ///
    /// Resolves it as `Cancelled` and forgets its identity, so the same task
    /// may be submitted again.
    pub fn cancel(&mut self, sequence: Sequence, now: Instant) -> Vec<DeliveryAction> {
        if !self.in_flight.contains_key(&sequence) {
            return Vec::new();
        }
        let mut actions = self.recall(sequence);
        self.dedup.remove_sequence(sequence);
        actions.extend(self.resolve(
            sequence,
            Resolution::without_outcome(TaskStatus::Cancelled),
            now,
        ));
        actions
    }

    /// Resolve a task as failed without running it further
    pub fn fail(&mut self, sequence: Sequence, error: TaskError, now: Instant) -> Vec<DeliveryAction> {
        self.resolve(sequence, Resolution::failure(error, None, Duration::ZERO), now)
    }

    /// Earliest pending timer
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Accepted tasks without a result yet (queued, backing off or running)
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Results held in the reorder buffer
    pub fn buffered_count(&self) -> usize {
        self.reorder.len()
    }

    /// `in_flight_count + buffered_count`, the admission-control load
    pub fn outstanding(&self) -> usize {
        self.in_flight_count() + self.buffered_count()
    }

    pub fn is_pending(&self, sequence: Sequence) -> bool {
        self.in_flight.contains_key(&sequence)
    }

    pub fn task_id(&self, sequence: Sequence) -> Option<&TaskId> {
        self.in_flight.get(&sequence).map(|entry| &entry.task.id)
    }

    pub fn forced_releases(&self) -> u64 {
        self.reorder.forced_releases()
    }

    pub fn dedup_len(&self) -> usize {
        self.dedup.len()
    }

    pub fn stats(&self) -> &ProtocolStats {
        &self.stats
    }

    fn attempt_lost(&mut self, sequence: Sequence, reason: RetryReason, now: Instant) -> Vec<DeliveryAction> {
        let Some(entry) = self.in_flight.get(&sequence) else {
            return Vec::new();
        };
        if entry.attempt < entry.task.max_attempts {
            self.retry(sequence, reason, now)
        } else {
            warn!(sequence, attempts = entry.attempt, %reason, "attempts exhausted");
            self.resolve(sequence, Resolution::without_outcome(TaskStatus::Timeout), now)
        }
    }

    fn retry(&mut self, sequence: Sequence, reason: RetryReason, now: Instant) -> Vec<DeliveryAction> {
        let Some(entry) = self.in_flight.get_mut(&sequence) else {
            return Vec::new();
        };
        entry.attempt += 1;
        let attempt = entry.attempt;
        let delay = if reason == RetryReason::Speculative {
            Duration::ZERO
        } else {
            self.config.retry.delay_for_attempt(attempt)
        };

        let mut actions = vec![DeliveryAction::Retried {
            task_id: entry.task.id.clone(),
            sequence,
            attempt,
            reason,
            delay,
        }];
        if delay.is_zero() {
            entry.phase = Phase::Queued;
            let ticket = Ticket {
                sequence,
                attempt,
                task: entry.task.clone(),
            };
            self.arm_queue_expiry(&ticket, now);
            actions.push(DeliveryAction::Enqueue(ticket));
        } else {
            entry.phase = Phase::Backoff;
            self.timers
                .schedule(now + delay, sequence, attempt, TimerKind::RetryBackoff);
        }
        if reason == RetryReason::Speculative {
            self.stats.speculated += 1;
        } else {
            self.stats.retried += 1;
        }
        actions
    }

    /// A queued ticket counts as lost if no worker takes it within its ack timeout
    fn arm_queue_expiry(&mut self, ticket: &Ticket, now: Instant) {
        let expires_at =
            now + ack_timeout(ticket.task.ttl, ticket.attempt, self.config.max_ack_timeout);
        self.timers
            .schedule(expires_at, ticket.sequence, ticket.attempt, TimerKind::QueueExpiry);
    }

    fn recall(&self, sequence: Sequence) -> Vec<DeliveryAction> {
        self.in_flight
            .get(&sequence)
            .and_then(|entry| {
                entry.running_worker().map(|worker| DeliveryAction::Recall {
                    worker,
                    sequence,
                    attempt: entry.attempt,
                })
            })
            .into_iter()
            .collect()
    }

    fn discard(&mut self, sequence: Sequence, attempt: u32) -> Vec<DeliveryAction> {
        debug!(sequence, attempt, "discarding completion of superseded attempt");
        self.stats.discarded += 1;
        vec![DeliveryAction::Discarded { sequence, attempt }]
    }

    fn resolve(&mut self, sequence: Sequence, resolution: Resolution, now: Instant) -> Vec<DeliveryAction> {
        let Some(entry) = self.in_flight.remove(&sequence) else {
            return Vec::new();
        };
        let mut actions: Vec<DeliveryAction> = entry
            .hedge
            .map(|(worker, attempt)| DeliveryAction::Recall {
                worker,
                sequence,
                attempt,
            })
            .into_iter()
            .collect();

        match resolution.status {
            TaskStatus::Success => self.stats.succeeded += 1,
            TaskStatus::Failure => self.stats.failed += 1,
            TaskStatus::Timeout => self.stats.timed_out += 1,
            TaskStatus::Cancelled => self.stats.cancelled += 1,
        }

        let result = TaskResult {
            task_id: entry.task.id.clone(),
            sequence,
            status: resolution.status,
            payload: resolution.payload,
            error: resolution.error,
            worker_id: resolution.worker,
            duration: resolution.duration,
            attempts: entry.attempt,
            late: entry.late,
        };
        self.dedup.resolve(result.clone(), now);

        actions.extend(self.reorder.push(result).into_iter().map(DeliveryAction::Deliver));
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::RetryPolicy;
    use serde_json::json;

    const W1: WorkerId = WorkerId::new(1);
    const W2: WorkerId = WorkerId::new(2);

    fn protocol() -> DeliveryProtocol {
        DeliveryProtocol::new(
            ProtocolConfig::default()
                .with_default_ttl(Duration::from_secs(1))
                .with_max_ack_timeout(Duration::from_secs(30)),
        )
    }

    fn accept(protocol: &mut DeliveryProtocol, spec: TaskSpec, now: Instant) -> Ticket {
        match protocol.submit(spec, now) {
            Submission::Accepted(ticket) => ticket,
            Submission::Duplicate(seen) => panic!("unexpected duplicate of {}", seen.sequence),
        }
    }

    fn send(protocol: &mut DeliveryProtocol, ticket: &Ticket, worker: WorkerId, now: Instant) -> Envelope {
        match protocol.dispatch(ticket.sequence, ticket.attempt, worker, now) {
            Dispatch::Send(envelope) => envelope,
            other => panic!("expected envelope, got {other:?}"),
        }
    }

    fn deliveries(actions: &[DeliveryAction]) -> Vec<&Delivery> {
        actions
            .iter()
            .filter_map(|a| match a {
                DeliveryAction::Deliver(d) => Some(d),
                _ => None,
            })
            .collect()
    }

    fn requeued(actions: &[DeliveryAction]) -> Option<Ticket> {
        actions.iter().find_map(|a| match a {
            DeliveryAction::Enqueue(ticket) => Some(ticket.clone()),
            _ => None,
        })
    }

    #[test]
    fn test_sequences_start_at_one() {
        let now = Instant::now();
        let mut p = protocol();
        let a = accept(&mut p, TaskSpec::new("k", json!(1)), now);
        let b = accept(&mut p, TaskSpec::new("k", json!(2)), now);
        assert_eq!((a.sequence, b.sequence), (1, 2));
        assert_eq!(a.attempt, 1);
        assert_eq!(p.in_flight_count(), 2);
    }

    #[test]
    fn test_success_is_delivered_once() {
        let now = Instant::now();
        let mut p = protocol();
        let ticket = accept(&mut p, TaskSpec::new("k", json!(null)), now);
        send(&mut p, &ticket, W1, now);

        let actions = p.complete(W1, 1, 1, Ok(json!("done")), Duration::from_millis(5), now);
        let out = deliveries(&actions);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].result.status, TaskStatus::Success);
        assert_eq!(out[0].result.worker_id, Some(W1));
        assert!(!out[0].out_of_order);

        // the same completion again is discarded
        let again = p.complete(W1, 1, 1, Ok(json!("done")), Duration::ZERO, now);
        assert!(deliveries(&again).is_empty());
        assert_eq!(p.stats().discarded, 1);
        assert_eq!(p.outstanding(), 0);
    }

    #[test]
    fn test_duplicate_submission_is_not_dispatched() {
        let now = Instant::now();
        let mut p = protocol();
        let spec = TaskSpec::new("k", json!(null)).with_idempotency_key("order-1");
        let ticket = accept(&mut p, spec.clone(), now);

        match p.submit(spec.clone(), now) {
            Submission::Duplicate(seen) => {
                assert_eq!(seen.sequence, ticket.sequence);
                assert!(seen.outcome.is_none());
            }
            other => panic!("expected duplicate, got {other:?}"),
        }

        send(&mut p, &ticket, W1, now);
        p.complete(W1, 1, 1, Ok(json!(7)), Duration::ZERO, now);

        match p.submit(spec, now) {
            Submission::Duplicate(seen) => {
                assert_eq!(seen.outcome.unwrap().payload, Some(json!(7)));
            }
            other => panic!("expected duplicate, got {other:?}"),
        }
        assert_eq!(p.stats().submitted, 1);
        assert_eq!(p.stats().duplicates, 2);
    }

    #[test]
    fn test_ack_timeout_retries_with_doubled_deadline() {
        let start = Instant::now();
        let mut p = protocol();
        let ticket = accept(&mut p, TaskSpec::new("k", json!(null)).with_max_attempts(3), start);

        let first = send(&mut p, &ticket, W1, start);
        assert_eq!(first.ack_deadline - start, Duration::from_secs(1));
        assert!(p.expire(start + Duration::from_millis(999)).is_empty());

        let t1 = start + Duration::from_secs(1);
        let actions = p.expire(t1);
        assert!(matches!(
            actions[0],
            DeliveryAction::Recall { worker, attempt: 1, .. } if worker == W1
        ));
        assert!(actions.iter().any(|a| matches!(
            a,
            DeliveryAction::Retried { attempt: 2, reason: RetryReason::AckTimeout, .. }
        )));

        let retry = requeued(&actions).unwrap();
        let second = send(&mut p, &retry, W2, t1);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.ack_deadline - t1, Duration::from_secs(2));
    }

    #[test]
    fn test_exhausted_attempts_report_timeout() {
        let mut now = Instant::now();
        let mut p = protocol();
        let mut ticket = accept(&mut p, TaskSpec::new("k", json!(null)).with_max_attempts(2), now);

        for _ in 0..2 {
            let envelope = send(&mut p, &ticket, W1, now);
            now = envelope.ack_deadline;
            let actions = p.expire(now);
            if let Some(next) = requeued(&actions) {
                ticket = next;
            } else {
                let out = deliveries(&actions);
                assert_eq!(out.len(), 1);
                assert_eq!(out[0].result.status, TaskStatus::Timeout);
                assert_eq!(out[0].result.attempts, 2);
            }
        }
        assert_eq!(p.stats().timed_out, 1);
        assert_eq!(p.in_flight_count(), 0);
    }

    #[test]
    fn test_acknowledged_attempt_does_not_time_out() {
        let now = Instant::now();
        let mut p = protocol();
        let ticket = accept(&mut p, TaskSpec::new("k", json!(null)), now);
        send(&mut p, &ticket, W1, now);

        assert!(p.acknowledge(1, 1));
        assert!(p.expire(now + Duration::from_secs(10)).is_empty());
        assert!(p.is_pending(1));
        assert!(!p.acknowledge(1, 2));
    }

    #[test]
    fn test_abandoned_attempt_is_retried_then_times_out() {
        let now = Instant::now();
        let mut p = protocol();
        let ticket = accept(&mut p, TaskSpec::new("k", json!(null)).with_max_attempts(2), now);
        send(&mut p, &ticket, W1, now);
        p.acknowledge(1, 1);

        let actions = p.abandon(1, 1, now);
        assert!(actions.iter().any(|a| matches!(
            a,
            DeliveryAction::Retried { reason: RetryReason::WorkerLost, .. }
        )));

        // a stale abandon for the old attempt does nothing
        assert!(p.abandon(1, 1, now).is_empty());

        let retry = requeued(&actions).unwrap();
        send(&mut p, &retry, W2, now);
        let actions = p.abandon(1, 2, now);
        let out = deliveries(&actions);
        assert_eq!(out[0].result.status, TaskStatus::Timeout);
    }

    #[test]
    fn test_straggler_success_wins_and_later_result_is_discarded() {
        let now = Instant::now();
        let mut p = protocol();
        let ticket = accept(&mut p, TaskSpec::new("k", json!(null)), now);
        let first = send(&mut p, &ticket, W1, now);

        let actions = p.expire(first.ack_deadline);
        let retry = requeued(&actions).unwrap();
        send(&mut p, &retry, W2, first.ack_deadline);

        // attempt 1 finishes after being given up on: first result wins
        let actions = p.complete(W1, 1, 1, Ok(json!("slow")), Duration::from_secs(2), first.ack_deadline);
        assert!(actions.iter().any(|a| matches!(
            a,
            DeliveryAction::Recall { worker, attempt: 2, .. } if *worker == W2
        )));
        let out = deliveries(&actions);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].result.payload, Some(json!("slow")));
        assert_eq!(out[0].result.attempts, 2);

        // attempt 2 finishing later is discarded
        let actions = p.complete(W2, 1, 2, Ok(json!("fast")), Duration::ZERO, first.ack_deadline);
        assert!(deliveries(&actions).is_empty());
        assert!(matches!(actions[0], DeliveryAction::Discarded { sequence: 1, attempt: 2 }));
    }

    #[test]
    fn test_failed_straggler_does_not_resolve() {
        let now = Instant::now();
        let mut p = protocol();
        let ticket = accept(&mut p, TaskSpec::new("k", json!(null)), now);
        let first = send(&mut p, &ticket, W1, now);
        let retry = requeued(&p.expire(first.ack_deadline)).unwrap();
        send(&mut p, &retry, W2, first.ack_deadline);

        let actions = p.complete(W1, 1, 1, Err(TaskError::retryable("late failure")), Duration::ZERO, now);
        assert!(deliveries(&actions).is_empty());
        assert!(p.is_pending(1));
    }

    #[test]
    fn test_retryable_error_is_retried_until_exhausted() {
        let now = Instant::now();
        let mut p = protocol();
        let ticket = accept(&mut p, TaskSpec::new("k", json!(null)).with_max_attempts(2), now);
        send(&mut p, &ticket, W1, now);

        let actions = p.complete(W1, 1, 1, Err(TaskError::retryable("flaky")), Duration::ZERO, now);
        let retry = requeued(&actions).unwrap();
        assert_eq!(retry.attempt, 2);

        send(&mut p, &retry, W1, now);
        let actions = p.complete(W1, 1, 2, Err(TaskError::retryable("flaky")), Duration::ZERO, now);
        let out = deliveries(&actions);
        assert_eq!(out[0].result.status, TaskStatus::Failure);
        assert_eq!(out[0].result.error.as_ref().unwrap().message, "flaky");
    }

    #[test]
    fn test_non_retryable_errors_fail_immediately() {
        let now = Instant::now();
        let mut p = DeliveryProtocol::new(
            ProtocolConfig::default()
                .with_retry(RetryPolicy::immediate(5).with_non_retryable_error("validation")),
        );

        let a = accept(&mut p, TaskSpec::new("k", json!(1)), now);
        send(&mut p, &a, W1, now);
        let actions = p.complete(W1, 1, 1, Err(TaskError::non_retryable("bad")), Duration::ZERO, now);
        assert_eq!(deliveries(&actions)[0].result.status, TaskStatus::Failure);

        let b = accept(&mut p, TaskSpec::new("k", json!(2)), now);
        send(&mut p, &b, W1, now);
        let error = TaskError::retryable("schema").with_kind("validation");
        let actions = p.complete(W1, 2, 1, Err(error), Duration::ZERO, now);
        assert_eq!(deliveries(&actions)[0].result.error_kind(), Some("validation"));
    }

    #[test]
    fn test_results_released_in_sequence_order() {
        let now = Instant::now();
        let mut p = protocol();
        let tickets: Vec<Ticket> = (0..3)
            .map(|i| accept(&mut p, TaskSpec::new("k", json!(i)), now))
            .collect();
        for ticket in &tickets {
            send(&mut p, ticket, W1, now);
        }

        assert!(deliveries(&p.complete(W1, 3, 1, Ok(json!(3)), Duration::ZERO, now)).is_empty());
        assert!(deliveries(&p.complete(W1, 2, 1, Ok(json!(2)), Duration::ZERO, now)).is_empty());
        assert_eq!(p.buffered_count(), 2);
        assert_eq!(p.outstanding(), 3);

        let actions = p.complete(W1, 1, 1, Ok(json!(1)), Duration::ZERO, now);
        let order: Vec<Sequence> = deliveries(&actions).iter().map(|d| d.result.sequence).collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(p.outstanding(), 0);
    }

    #[test]
    fn test_hard_deadline_drops_and_soft_deadline_marks_late() {
        let now = Instant::now();
        let mut p = protocol();
        let hard = accept(
            &mut p,
            TaskSpec::new("k", json!(1))
                .with_deadline(now + Duration::from_millis(10))
                .with_hard_deadline(),
            now,
        );
        let soft = accept(
            &mut p,
            TaskSpec::new("k", json!(2)).with_deadline(now + Duration::from_millis(10)),
            now,
        );
        let later = now + Duration::from_secs(1);

        match p.dispatch(hard.sequence, 1, W1, later) {
            Dispatch::Dropped(actions) => {
                let out = deliveries(&actions);
                assert_eq!(out[0].result.status, TaskStatus::Failure);
                assert_eq!(out[0].result.error_kind(), Some(DEADLINE_MISSED));
                assert!(out[0].result.late);
            }
            other => panic!("expected drop, got {other:?}"),
        }

        let envelope = send(&mut p, &soft, W1, later);
        assert!(envelope.late);
        let actions = p.complete(W1, soft.sequence, 1, Ok(json!(null)), Duration::ZERO, later);
        assert!(deliveries(&actions)[0].result.late);
    }

    #[test]
    fn test_cancel_queued_task() {
        let now = Instant::now();
        let mut p = protocol();
        let spec = TaskSpec::new("k", json!(null)).with_id("job-1");
        let ticket = accept(&mut p, spec.clone(), now);

        let actions = p.cancel(ticket.sequence, now);
        assert_eq!(deliveries(&actions)[0].result.status, TaskStatus::Cancelled);
        assert!(matches!(p.dispatch(ticket.sequence, 1, W1, now), Dispatch::Stale));

        // identity is forgotten after cancellation
        assert!(matches!(p.submit(spec, now), Submission::Accepted(_)));
    }

    #[test]
    fn test_cancel_running_task_recalls_worker() {
        let now = Instant::now();
        let mut p = protocol();
        let ticket = accept(&mut p, TaskSpec::new("k", json!(null)), now);
        send(&mut p, &ticket, W2, now);

        let actions = p.cancel(ticket.sequence, now);
        assert!(matches!(
            actions[0],
            DeliveryAction::Recall { worker, .. } if worker == W2
        ));
        assert!(p.cancel(ticket.sequence, now).is_empty());
    }

    #[test]
    fn test_retry_backoff_waits_in_timer_heap() {
        let now = Instant::now();
        let mut p = DeliveryProtocol::new(ProtocolConfig::default().with_retry(
            RetryPolicy::fixed(Duration::from_millis(500), 3),
        ));
        let ticket = accept(&mut p, TaskSpec::new("k", json!(null)), now);
        send(&mut p, &ticket, W1, now);

        let actions = p.complete(W1, 1, 1, Err(TaskError::retryable("flaky")), Duration::ZERO, now);
        assert!(requeued(&actions).is_none());
        assert!(actions.iter().any(|a| matches!(
            a,
            DeliveryAction::Retried { delay, .. } if *delay == Duration::from_millis(500)
        )));

        assert!(requeued(&p.expire(now + Duration::from_millis(499))).is_none());
        let ticket = requeued(&p.expire(now + Duration::from_millis(500))).unwrap();
        assert_eq!(ticket.attempt, 2);
    }

    #[test]
    fn test_ticket_expires_in_queue_then_times_out() {
        let now = Instant::now();
        let mut p = protocol();
        let ticket = accept(&mut p, TaskSpec::new("k", json!(null)).with_max_attempts(2), now);

        // nobody takes attempt 1 within its ttl
        assert!(p.expire(now + Duration::from_millis(999)).is_empty());
        let t1 = now + Duration::from_secs(1);
        let actions = p.expire(t1);
        assert!(matches!(actions[0], DeliveryAction::Dequeue { sequence: 1 }));
        assert!(actions.iter().any(|a| matches!(
            a,
            DeliveryAction::Retried { attempt: 2, reason: RetryReason::QueueTimeout, .. }
        )));
        let retry = requeued(&actions).unwrap();
        assert_eq!(retry.attempt, 2);
        assert!(matches!(p.dispatch(ticket.sequence, 1, W1, t1), Dispatch::Stale));

        // attempt 2 waits with the doubled window, then the task times out
        assert!(p.expire(t1 + Duration::from_millis(1_999)).is_empty());
        let actions = p.expire(t1 + Duration::from_secs(2));
        let out = deliveries(&actions);
        assert_eq!(out[0].result.status, TaskStatus::Timeout);
        assert_eq!(out[0].result.attempts, 2);
        assert_eq!(p.stats().timed_out, 1);
    }

    #[test]
    fn test_dispatch_stops_queue_expiry() {
        let now = Instant::now();
        let mut p = protocol();
        let ticket = accept(&mut p, TaskSpec::new("k", json!(null)), now);
        send(&mut p, &ticket, W1, now + Duration::from_millis(900));
        p.acknowledge(1, 1);

        assert!(p.expire(now + Duration::from_secs(5)).is_empty());
        assert!(p.is_pending(1));
    }

    #[test]
    fn test_slow_attempt_is_hedged_and_first_result_wins() {
        let now = Instant::now();
        let mut p = DeliveryProtocol::new(
            ProtocolConfig::default().with_speculate_after(Duration::from_millis(300)),
        );
        let ticket = accept(&mut p, TaskSpec::new("k", json!(null)).with_max_attempts(3), now);
        send(&mut p, &ticket, W1, now);
        p.acknowledge(1, 1);

        let t1 = now + Duration::from_millis(300);
        let actions = p.expire(t1);
        // the slow attempt keeps running
        assert!(!actions.iter().any(|a| matches!(a, DeliveryAction::Recall { .. })));
        assert!(actions.iter().any(|a| matches!(
            a,
            DeliveryAction::Retried { attempt: 2, reason: RetryReason::Speculative, delay, .. } if delay.is_zero()
        )));
        let hedge = requeued(&actions).unwrap();
        send(&mut p, &hedge, W2, t1);
        assert_eq!(p.stats().speculated, 1);
        assert_eq!(p.stats().retried, 0);

        // only one hedge per task
        assert!(p.expire(t1 + Duration::from_millis(300)).is_empty());

        // the original finishes first; the hedge is recalled
        let actions = p.complete(W1, 1, 1, Ok(json!("original")), Duration::from_millis(400), t1);
        assert!(actions.iter().any(|a| matches!(
            a,
            DeliveryAction::Recall { worker, attempt: 2, .. } if *worker == W2
        )));
        assert_eq!(deliveries(&actions)[0].result.payload, Some(json!("original")));
        assert!(matches!(
            p.complete(W2, 1, 2, Ok(json!("hedge")), Duration::ZERO, t1)[0],
            DeliveryAction::Discarded { .. }
        ));
    }

    #[test]
    fn test_hedge_winning_recalls_original() {
        let now = Instant::now();
        let mut p = protocol();
        let spec = TaskSpec::new("k", json!(null))
            .with_max_attempts(2)
            .with_speculation(Duration::from_millis(100));
        let ticket = accept(&mut p, spec, now);
        send(&mut p, &ticket, W1, now);
        p.acknowledge(1, 1);

        let t1 = now + Duration::from_millis(100);
        let hedge = requeued(&p.expire(t1)).unwrap();
        send(&mut p, &hedge, W2, t1);

        let actions = p.complete(W2, 1, 2, Ok(json!("hedge")), Duration::ZERO, t1);
        assert!(actions.iter().any(|a| matches!(
            a,
            DeliveryAction::Recall { worker, attempt: 1, .. } if *worker == W1
        )));
        let out = deliveries(&actions);
        assert_eq!(out[0].result.payload, Some(json!("hedge")));
        assert_eq!(out[0].result.worker_id, Some(W2));
    }

    #[test]
    fn test_lost_hedge_leaves_newer_attempt_running() {
        let now = Instant::now();
        let mut p = protocol();
        let spec = TaskSpec::new("k", json!(null))
            .with_max_attempts(2)
            .with_speculation(Duration::from_millis(100));
        let ticket = accept(&mut p, spec, now);
        send(&mut p, &ticket, W1, now);
        p.acknowledge(1, 1);
        let t1 = now + Duration::from_millis(100);
        let hedge = requeued(&p.expire(t1)).unwrap();
        send(&mut p, &hedge, W2, t1);

        // the worker running attempt 1 crashes: nothing to retry
        assert!(p.abandon(1, 1, t1).is_empty());
        p.acknowledge(1, 2);
        let actions = p.complete(W2, 1, 2, Ok(json!(2)), Duration::ZERO, t1);
        assert!(!actions.iter().any(|a| matches!(a, DeliveryAction::Recall { .. })));
        assert_eq!(deliveries(&actions)[0].result.attempts, 2);
    }

    #[test]
    fn test_no_hedge_without_spare_attempt() {
        let now = Instant::now();
        let mut p = DeliveryProtocol::new(
            ProtocolConfig::default().with_speculate_after(Duration::from_millis(100)),
        );
        let ticket = accept(&mut p, TaskSpec::new("k", json!(null)).with_max_attempts(1), now);
        send(&mut p, &ticket, W1, now);
        p.acknowledge(1, 1);
        assert!(p.expire(now + Duration::from_secs(1)).is_empty());
        assert_eq!(p.stats().speculated, 0);
    }

    #[test]
    fn test_stale_dispatch_of_superseded_ticket() {
        let now = Instant::now();
        let mut p = protocol();
        let ticket = accept(&mut p, TaskSpec::new("k", json!(null)), now);
        send(&mut p, &ticket, W1, now);
        assert!(matches!(p.dispatch(ticket.sequence, 1, W2, now), Dispatch::Stale));
    }
}
