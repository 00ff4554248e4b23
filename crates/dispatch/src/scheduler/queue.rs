//! Ticket queues for the shared-queue policies

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use tokio::time::Instant;

use crate::protocol::{Sequence, Ticket};

/// Max-heap on effective priority
///
/// Aging adds the same amount per second to every queued ticket, so the
/// relative order only depends on `priority - rate * submitted_offset`.
/// That key is fixed at push time and the heap never needs rebuilding.
#[derive(Debug)]
pub(crate) struct PriorityQueue {
    heap: BinaryHeap<PriorityEntry>,
    aging_per_sec: f64,
    origin: Instant,
}

#[derive(Debug)]
struct PriorityEntry {
    key: f64,
    ticket: Ticket,
}

impl PartialEq for PriorityEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PriorityEntry {}

impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .total_cmp(&other.key)
            .then_with(|| other.ticket.sequence.cmp(&self.ticket.sequence))
    }
}

impl PriorityQueue {
    pub fn new(aging_per_sec: f64, origin: Instant) -> Self {
        Self {
            heap: BinaryHeap::new(),
            aging_per_sec,
            origin,
        }
    }

    pub fn push(&mut self, ticket: Ticket) {
        let offset = ticket
            .task
            .submitted_at
            .saturating_duration_since(self.origin)
            .as_secs_f64();
        let key = ticket.task.priority as f64 - self.aging_per_sec * offset;
        self.heap.push(PriorityEntry { key, ticket });
    }

    pub fn pop(&mut self) -> Option<Ticket> {
        self.heap.pop().map(|entry| entry.ticket)
    }

    pub fn remove(&mut self, sequence: Sequence) -> bool {
        let before = self.heap.len();
        self.heap.retain(|entry| entry.ticket.sequence != sequence);
        self.heap.len() != before
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn drain(&mut self) -> Vec<Ticket> {
        self.heap.drain().map(|entry| entry.ticket).collect()
    }
}

/// Earliest deadline first
#[derive(Debug, Default)]
pub(crate) struct DeadlineQueue {
    heap: BinaryHeap<DeadlineEntry>,
}

#[derive(Debug)]
struct DeadlineEntry {
    ticket: Ticket,
}

impl DeadlineEntry {
    fn key(&self) -> (bool, Option<Instant>, Sequence) {
        let deadline = self.ticket.task.deadline;
        (deadline.is_none(), deadline, self.ticket.sequence)
    }
}

impl PartialEq for DeadlineEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for DeadlineEntry {}

impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeadlineEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: the smallest key is on top
        other.key().cmp(&self.key())
    }
}

impl DeadlineQueue {
    pub fn push(&mut self, ticket: Ticket) {
        self.heap.push(DeadlineEntry { ticket });
    }

    pub fn pop(&mut self) -> Option<Ticket> {
        self.heap.pop().map(|entry| entry.ticket)
    }

    pub fn remove(&mut self, sequence: Sequence) -> bool {
        let before = self.heap.len();
        self.heap.retain(|entry| entry.ticket.sequence != sequence);
        self.heap.len() != before
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn drain(&mut self) -> Vec<Ticket> {
        self.heap.drain().map(|entry| entry.ticket).collect()
    }
}

/// FIFO per share key; the key with the least assigned weight goes next
#[derive(Debug, Default)]
pub(crate) struct FairShareQueue {
    queues: HashMap<String, VecDeque<Ticket>>,
    usage: HashMap<String, u64>,
    len: usize,
}

impl FairShareQueue {
    pub fn push(&mut self, ticket: Ticket) {
        let key = ticket.task.share_key.clone();
        let reactivated = self.queues.get(&key).map_or(true, VecDeque::is_empty);
        if reactivated {
            // A key returning from idle starts level with the least-served
            // active key instead of cashing in the time it was away.
            let floor = self
                .queues
                .iter()
                .filter(|(k, q)| !q.is_empty() && **k != key)
                .filter_map(|(k, _)| self.usage.get(k).copied())
                .min();
            if let Some(floor) = floor {
                let usage = self.usage.entry(key.clone()).or_insert(0);
                *usage = (*usage).max(floor);
            }
        }
        self.queues.entry(key).or_default().push_back(ticket);
        self.len += 1;
    }

    pub fn pop(&mut self) -> Option<Ticket> {
        let key = self
            .queues
            .iter()
            .filter_map(|(key, queue)| {
                queue.front().map(|head| {
                    let usage = self.usage.get(key).copied().unwrap_or(0);
                    (usage, head.sequence, key)
                })
            })
            .min()
            .map(|(_, _, key)| key.clone())?;

        let ticket = self.queues.get_mut(&key)?.pop_front()?;
        *self.usage.entry(key).or_insert(0) += u64::from(ticket.task.weight);
        self.len -= 1;
        Some(ticket)
    }

    pub fn remove(&mut self, sequence: Sequence) -> bool {
        let mut removed = false;
        for queue in self.queues.values_mut() {
            if let Some(pos) = queue.iter().position(|t| t.sequence == sequence) {
                queue.remove(pos);
                removed = true;
                break;
            }
        }
        if removed {
            self.len -= 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Cumulative assigned weight of a share key
    pub fn usage(&self, key: &str) -> u64 {
        self.usage.get(key).copied().unwrap_or(0)
    }

    pub fn drain(&mut self) -> Vec<Ticket> {
        self.len = 0;
        let mut tickets: Vec<Ticket> = self.queues.drain().flat_map(|(_, q)| q).collect();
        tickets.sort_by_key(|t| t.sequence);
        tickets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn ticket(sequence: Sequence, spec: TaskSpec, submitted_at: Instant) -> Ticket {
        Ticket {
            sequence,
            attempt: 1,
            task: Arc::new(spec.into_task(Duration::from_secs(1), 3, submitted_at)),
        }
    }

    #[test]
    fn test_priority_order_and_fifo_ties() {
        let now = Instant::now();
        let mut queue = PriorityQueue::new(0.0, now);
        queue.push(ticket(1, TaskSpec::new("k", json!(1)).with_priority(1), now));
        queue.push(ticket(2, TaskSpec::new("k", json!(2)).with_priority(5), now));
        queue.push(ticket(3, TaskSpec::new("k", json!(3)).with_priority(5), now));

        let order: Vec<Sequence> = std::iter::from_fn(|| queue.pop()).map(|t| t.sequence).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn test_aging_lets_old_tickets_overtake() {
        let origin = Instant::now();
        let mut queue = PriorityQueue::new(1.0, origin);
        queue.push(ticket(1, TaskSpec::new("k", json!(1)).with_priority(0), origin));
        // submitted 10s later with priority 5: the old ticket has aged by 10
        queue.push(ticket(
            2,
            TaskSpec::new("k", json!(2)).with_priority(5),
            origin + Duration::from_secs(10),
        ));
        assert_eq!(queue.pop().unwrap().sequence, 1);
    }

    #[test]
    fn test_deadline_order() {
        let now = Instant::now();
        let mut queue = DeadlineQueue::default();
        queue.push(ticket(1, TaskSpec::new("k", json!(1)), now));
        queue.push(ticket(2, TaskSpec::new("k", json!(2)).with_deadline(now + Duration::from_secs(9)), now));
        queue.push(ticket(3, TaskSpec::new("k", json!(3)).with_deadline(now + Duration::from_secs(1)), now));

        let order: Vec<Sequence> = std::iter::from_fn(|| queue.pop()).map(|t| t.sequence).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn test_fair_share_alternates_by_usage() {
        let now = Instant::now();
        let mut queue = FairShareQueue::default();
        for seq in 1..=4 {
            queue.push(ticket(seq, TaskSpec::new("k", json!(seq)).with_share_key("a"), now));
        }
        queue.push(ticket(5, TaskSpec::new("k", json!(5)).with_share_key("b").with_weight(2), now));
        queue.push(ticket(6, TaskSpec::new("k", json!(6)).with_share_key("b"), now));

        let order: Vec<Sequence> = std::iter::from_fn(|| queue.pop()).map(|t| t.sequence).collect();
        // a(1) -> b(5, weight 2) -> a(2) -> a(3) -> b(6) -> a(4)
        assert_eq!(order, vec![1, 5, 2, 3, 6, 4]);
        assert_eq!(queue.usage("a"), 4);
        assert_eq!(queue.usage("b"), 3);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_returning_key_does_not_monopolize() {
        let now = Instant::now();
        let mut queue = FairShareQueue::default();
        for seq in 1..=5 {
            queue.push(ticket(seq, TaskSpec::new("k", json!(seq)).with_share_key("busy"), now));
        }
        for _ in 0..3 {
            queue.pop();
        }
        queue.push(ticket(6, TaskSpec::new("k", json!(6)).with_share_key("new"), now));
        queue.push(ticket(7, TaskSpec::new("k", json!(7)).with_share_key("new"), now));

        let order: Vec<Sequence> = std::iter::from_fn(|| queue.pop()).map(|t| t.sequence).collect();
        assert_eq!(order, vec![4, 6, 5, 7]);
    }

    #[test]
    fn test_remove() {
        let now = Instant::now();
        let mut queue = FairShareQueue::default();
        queue.push(ticket(1, TaskSpec::new("k", json!(1)), now));
        queue.push(ticket(2, TaskSpec::new("k", json!(2)), now));
        assert!(queue.remove(1));
        assert!(!queue.remove(1));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().unwrap().sequence, 2);
    }
}
