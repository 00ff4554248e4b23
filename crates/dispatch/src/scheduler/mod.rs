//! Task-to-worker assignment
//!
//! The scheduler owns the queued tickets and decides which one goes to which
//! idle worker. It reads pool state through [`WorkerSnapshot`]s and only
//! mutates its own counters.
//!
//! - [`SchedulingPolicy`] - Policy selection
//! - [`Scheduler`] - Queue plus worker selection for the active policy

mod policy;
mod queue;
mod stealing;
mod weighted;

use serde::Serialize;
use tokio::time::Instant;

pub use policy::SchedulingPolicy;

use crate::pool::{WorkerId, WorkerSnapshot, WorkerState};
use crate::protocol::{Sequence, Ticket};
use queue::{DeadlineQueue, FairShareQueue, PriorityQueue};
use stealing::StealingQueues;
use weighted::SmoothWeighted;

#[derive(Debug)]
enum Queue {
    Priority(PriorityQueue),
    Deadline(DeadlineQueue),
    FairShare(FairShareQueue),
    Fifo(std::collections::VecDeque<Ticket>),
    Stealing(StealingQueues),
}

/// Scheduler counters
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SchedulerStats {
    pub policy: String,
    pub queued: usize,
    pub assigned: u64,
    pub steals: u64,
    /// Assignments that landed on a worker with a matching affinity key
    pub affinity_hits: u64,
}

/// Orders queued tickets and picks workers for them
#[derive(Debug)]
pub struct Scheduler {
    policy: SchedulingPolicy,
    queue: Queue,
    round_robin: SmoothWeighted,
    assigned: u64,
    affinity_hits: u64,
}

impl Scheduler {
    /// `origin` anchors priority aging; use the engine start time
    pub fn new(policy: SchedulingPolicy, origin: Instant) -> Self {
        let queue = match &policy {
            SchedulingPolicy::Priority { aging_per_sec } => {
                Queue::Priority(PriorityQueue::new(*aging_per_sec, origin))
            }
            SchedulingPolicy::FairShare => Queue::FairShare(FairShareQueue::default()),
            SchedulingPolicy::WeightedRoundRobin => Queue::Fifo(Default::default()),
            SchedulingPolicy::Deadline => Queue::Deadline(DeadlineQueue::default()),
            SchedulingPolicy::WorkStealing => Queue::Stealing(StealingQueues::default()),
        };
        Self {
            policy,
            queue,
            round_robin: SmoothWeighted::default(),
            assigned: 0,
            affinity_hits: 0,
        }
    }

    pub fn policy(&self) -> &SchedulingPolicy {
        &self.policy
    }

    pub fn enqueue(&mut self, ticket: Ticket) {
        match &mut self.queue {
            Queue::Priority(q) => q.push(ticket),
            Queue::Deadline(q) => q.push(ticket),
            Queue::FairShare(q) => q.push(ticket),
            Queue::Fifo(q) => q.push_back(ticket),
            Queue::Stealing(q) => q.push(ticket),
        }
    }

    /// Drop a queued ticket (cancelled before dispatch)
    pub fn remove(&mut self, sequence: Sequence) -> bool {
        match &mut self.queue {
            Queue::Priority(q) => q.remove(sequence),
            Queue::Deadline(q) => q.remove(sequence),
            Queue::FairShare(q) => q.remove(sequence),
            Queue::Fifo(q) => match q.iter().position(|t| t.sequence == sequence) {
                Some(pos) => q.remove(pos).is_some(),
                None => false,
            },
            Queue::Stealing(q) => q.remove(sequence),
        }
    }

    pub fn len(&self) -> usize {
        match &self.queue {
            Queue::Priority(q) => q.len(),
            Queue::Deadline(q) => q.len(),
            Queue::FairShare(q) => q.len(),
            Queue::Fifo(q) => q.len(),
            Queue::Stealing(q) => q.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Worker for `ticket` among the idle ones, or `None` when none is idle
    ///
    /// Weighted round-robin rotates by worker weight; every other policy
    /// takes the idle worker with the lowest recent load. A ticket with an
    /// affinity key goes to an idle worker that last ran the same key first.
    pub fn pick_worker(&mut self, ticket: &Ticket, workers: &[WorkerSnapshot]) -> Option<WorkerId> {
        let idle = workers.iter().filter(|w| w.state == WorkerState::Idle);

        if matches!(self.policy, SchedulingPolicy::WeightedRoundRobin) {
            let candidates: Vec<(WorkerId, u32)> = idle.map(|w| (w.id, w.weight.max(1))).collect();
            return self.round_robin.pick(&candidates);
        }

        let affine = |w: &WorkerSnapshot| {
            ticket.task.affinity.is_some() && w.last_affinity == ticket.task.affinity
        };
        let picked = idle
            .min_by(|a, b| {
                affine(*b)
                    .cmp(&affine(*a))
                    .then_with(|| a.load.total_cmp(&b.load))
                    .then_with(|| a.id.cmp(&b.id))
            })?;
        if affine(picked) {
            self.affinity_hits += 1;
        }
        Some(picked.id)
    }

    /// Next ticket and the worker it goes to
    pub fn next_assignment(&mut self, workers: &[WorkerSnapshot]) -> Option<(Ticket, WorkerId)> {
        if let Queue::Stealing(queues) = &mut self.queue {
            sync_members(queues, workers, &mut self.round_robin);
            let mut idle: Vec<&WorkerSnapshot> =
                workers.iter().filter(|w| w.state == WorkerState::Idle).collect();
            // Workers with local work first so stealing is the fallback
            idle.sort_by(|a, b| {
                queues
                    .queued_for(b.id)
                    .cmp(&queues.queued_for(a.id))
                    .then_with(|| a.load.total_cmp(&b.load))
                    .then_with(|| a.id.cmp(&b.id))
            });
            for worker in idle {
                if let Some(ticket) = queues.pop_for(worker.id) {
                    self.assigned += 1;
                    return Some((ticket, worker.id));
                }
            }
            return None;
        }

        if self.is_empty() || !workers.iter().any(|w| w.state == WorkerState::Idle) {
            return None;
        }

        let ticket = match &mut self.queue {
            Queue::Priority(q) => q.pop(),
            Queue::Deadline(q) => q.pop(),
            Queue::FairShare(q) => q.pop(),
            Queue::Fifo(q) => q.pop_front(),
            Queue::Stealing(_) => None,
        }?;

        match self.pick_worker(&ticket, workers) {
            Some(worker) => {
                self.assigned += 1;
                Some((ticket, worker))
            }
            None => {
                self.enqueue(ticket);
                None
            }
        }
    }

    /// Tickets queued locally for a worker (work-stealing only)
    pub fn queued_for(&self, worker: WorkerId) -> usize {
        match &self.queue {
            Queue::Stealing(q) => q.queued_for(worker),
            _ => 0,
        }
    }

    /// A worker left the pool
    pub fn worker_removed(&mut self, worker: WorkerId) {
        self.round_robin.forget(worker);
        if let Queue::Stealing(q) = &mut self.queue {
            q.remove_worker(worker);
        }
    }

    /// Remove and return every queued ticket in sequence order
    pub fn drain(&mut self) -> Vec<Ticket> {
        let mut tickets = match &mut self.queue {
            Queue::Priority(q) => q.drain(),
            Queue::Deadline(q) => q.drain(),
            Queue::FairShare(q) => q.drain(),
            Queue::Fifo(q) => q.drain(..).collect(),
            Queue::Stealing(q) => q.drain(),
        };
        tickets.sort_by_key(|t| t.sequence);
        tickets
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            policy: self.policy.to_string(),
            queued: self.len(),
            assigned: self.assigned,
            steals: match &self.queue {
                Queue::Stealing(q) => q.steals(),
                _ => 0,
            },
            affinity_hits: self.affinity_hits,
        }
    }
}

/// Keep one local deque per live worker
fn sync_members(queues: &mut StealingQueues, workers: &[WorkerSnapshot], round_robin: &mut SmoothWeighted) {
    let live = |state: WorkerState| !matches!(state, WorkerState::Crashed | WorkerState::Draining);
    let gone: Vec<WorkerId> = queues
        .workers()
        .filter(|id| !workers.iter().any(|w| w.id == *id && live(w.state)))
        .collect();
    for id in gone {
        queues.remove_worker(id);
        round_robin.forget(id);
    }
    for worker in workers.iter().filter(|w| live(w.state)) {
        queues.add_worker(worker.id);
    }
}
