//! Work-stealing deques

use std::collections::{BTreeMap, VecDeque};

use crate::pool::WorkerId;
use crate::protocol::{Sequence, Ticket};

/// One deque per worker plus a shared injector
///
/// New tickets go to the shortest local deque. A worker takes from the front
/// of its own deque, then from the injector, then steals from the back of
/// the longest peer deque.
#[derive(Debug, Default)]
pub(crate) struct StealingQueues {
    local: BTreeMap<WorkerId, VecDeque<Ticket>>,
    injector: VecDeque<Ticket>,
    steals: u64,
}

impl StealingQueues {
    pub fn add_worker(&mut self, id: WorkerId) {
        self.local.entry(id).or_default();
    }

    /// Drop a worker's deque, returning its tickets to the injector
    pub fn remove_worker(&mut self, id: WorkerId) -> usize {
        let Some(orphans) = self.local.remove(&id) else {
            return 0;
        };
        let count = orphans.len();
        for ticket in orphans.into_iter().rev() {
            self.injector.push_front(ticket);
        }
        count
    }

    pub fn workers(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.local.keys().copied()
    }

    pub fn push(&mut self, ticket: Ticket) {
        let shortest = self
            .local
            .iter_mut()
            .min_by_key(|(_, deque)| deque.len())
            .map(|(_, deque)| deque);
        match shortest {
            Some(deque) => deque.push_back(ticket),
            None => self.injector.push_back(ticket),
        }
    }

    /// Next ticket for `worker`
    pub fn pop_for(&mut self, worker: WorkerId) -> Option<Ticket> {
        if let Some(ticket) = self.local.get_mut(&worker).and_then(VecDeque::pop_front) {
            return Some(ticket);
        }
        if let Some(ticket) = self.injector.pop_front() {
            return Some(ticket);
        }

        let victim = self
            .local
            .iter()
            .filter(|(id, deque)| **id != worker && !deque.is_empty())
            .max_by(|(a_id, a), (b_id, b)| a.len().cmp(&b.len()).then_with(|| b_id.cmp(a_id)))
            .map(|(id, _)| *id)?;

        let ticket = self.local.get_mut(&victim)?.pop_back()?;
        self.steals += 1;
        Some(ticket)
    }

    pub fn queued_for(&self, worker: WorkerId) -> usize {
        self.local.get(&worker).map_or(0, VecDeque::len)
    }

    pub fn remove(&mut self, sequence: Sequence) -> bool {
        for deque in self.local.values_mut().chain(std::iter::once(&mut self.injector)) {
            if let Some(pos) = deque.iter().position(|t| t.sequence == sequence) {
                deque.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.injector.len() + self.local.values().map(VecDeque::len).sum::<usize>()
    }

    pub fn steals(&self) -> u64 {
        self.steals
    }

    pub fn drain(&mut self) -> Vec<Ticket> {
        let mut tickets: Vec<Ticket> = self.injector.drain(..).collect();
        for deque in self.local.values_mut() {
            tickets.extend(deque.drain(..));
        }
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
    use tokio::time::Instant;

    fn ticket(sequence: Sequence) -> Ticket {
        Ticket {
            sequence,
            attempt: 1,
            task: Arc::new(
                TaskSpec::new("k", json!(sequence)).into_task(Duration::from_secs(1), 1, Instant::now()),
            ),
        }
    }

    #[test]
    fn test_push_balances_across_workers() {
        let mut queues = StealingQueues::default();
        let (a, b) = (WorkerId::new(1), WorkerId::new(2));
        queues.add_worker(a);
        queues.add_worker(b);
        for seq in 1..=4 {
            queues.push(ticket(seq));
        }
        assert_eq!(queues.queued_for(a), 2);
        assert_eq!(queues.queued_for(b), 2);
    }

    #[test]
    fn test_idle_worker_steals_from_tail_of_longest() {
        let mut queues = StealingQueues::default();
        let (a, b) = (WorkerId::new(1), WorkerId::new(2));
        queues.add_worker(a);
        for seq in 1..=3 {
            queues.push(ticket(seq));
        }
        queues.add_worker(b);

        assert_eq!(queues.pop_for(b).unwrap().sequence, 3);
        assert_eq!(queues.pop_for(a).unwrap().sequence, 1);
        assert_eq!(queues.steals(), 1);
    }

    #[test]
    fn test_removed_worker_returns_tickets_to_injector() {
        let mut queues = StealingQueues::default();
        let (a, b) = (WorkerId::new(1), WorkerId::new(2));
        queues.add_worker(a);
        queues.push(ticket(1));
        queues.push(ticket(2));
        assert_eq!(queues.remove_worker(a), 2);

        queues.add_worker(b);
        assert_eq!(queues.len(), 2);
        assert_eq!(queues.pop_for(b).unwrap().sequence, 1);
        assert_eq!(queues.pop_for(b).unwrap().sequence, 2);
        assert_eq!(queues.steals(), 0);
    }

    #[test]
    fn test_no_workers_uses_injector() {
        let mut queues = StealingQueues::default();
        queues.push(ticket(1));
        assert_eq!(queues.len(), 1);
        assert_eq!(queues.drain().len(), 1);
        assert_eq!(queues.len(), 0);
    }
}
