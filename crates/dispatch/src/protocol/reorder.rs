//! Reorder buffer releasing results in sequence order
//!
//! Overflow policy: when more than `window` results are held behind a gap,
//! every held result is released at once in arrival order, flagged
//! `out_of_order`, and the expected sequence jumps past the highest one.
//! A gap result that shows up after such a release is delivered
//! immediately, also flagged `out_of_order`.

use std::collections::BTreeMap;

use super::Sequence;
use crate::task::{Delivery, TaskResult};

#[derive(Debug)]
pub struct ReorderBuffer {
    next_expected: Sequence,
    window: usize,
    held: BTreeMap<Sequence, (u64, TaskResult)>,
    arrivals: u64,
    forced_releases: u64,
}

impl ReorderBuffer {
    pub fn new(first_sequence: Sequence, window: usize) -> Self {
        Self {
            next_expected: first_sequence,
            window: window.max(1),
            held: BTreeMap::new(),
            arrivals: 0,
            forced_releases: 0,
        }
    }

    /// Accept a result and return whatever can be released now
    pub fn push(&mut self, result: TaskResult) -> Vec<Delivery> {
        if result.sequence < self.next_expected {
            return vec![Delivery {
                result,
                out_of_order: true,
            }];
        }

        self.arrivals += 1;
        self.held.insert(result.sequence, (self.arrivals, result));

        let mut released = Vec::new();
        while let Some((_, result)) = self.held.remove(&self.next_expected) {
            released.push(Delivery {
                result,
                out_of_order: false,
            });
            self.next_expected += 1;
        }

        if self.held.len() > self.window {
            released.extend(self.force_release());
        }
        released
    }

    fn force_release(&mut self) -> Vec<Delivery> {
        self.forced_releases += 1;
        if let Some(last) = self.held.keys().next_back() {
            self.next_expected = last + 1;
        }

        let mut batch: Vec<(u64, TaskResult)> = std::mem::take(&mut self.held).into_values().collect();
        batch.sort_by_key(|(arrival, _)| *arrival);
        batch
            .into_iter()
            .map(|(_, result)| Delivery {
                result,
                out_of_order: true,
            })
            .collect()
    }

    /// Results held behind a gap
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    pub fn next_expected(&self) -> Sequence {
        self.next_expected
    }

    pub fn forced_releases(&self) -> u64 {
        self.forced_releases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskId, TaskStatus};
    use std::time::Duration;

    fn result(sequence: Sequence) -> TaskResult {
        TaskResult {
            task_id: TaskId::from(format!("t-{sequence}")),
            sequence,
            status: TaskStatus::Success,
            payload: None,
            error: None,
            worker_id: None,
            duration: Duration::ZERO,
            attempts: 1,
            late: false,
        }
    }

    fn sequences(deliveries: &[Delivery]) -> Vec<Sequence> {
        deliveries.iter().map(|d| d.result.sequence).collect()
    }

    #[test]
    fn test_in_order_passthrough() {
        let mut buffer = ReorderBuffer::new(1, 4);
        assert_eq!(sequences(&buffer.push(result(1))), vec![1]);
        assert_eq!(sequences(&buffer.push(result(2))), vec![2]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_holds_until_gap_closes() {
        let mut buffer = ReorderBuffer::new(1, 4);
        assert!(buffer.push(result(3)).is_empty());
        assert!(buffer.push(result(2)).is_empty());
        assert_eq!(buffer.len(), 2);

        let released = buffer.push(result(1));
        assert_eq!(sequences(&released), vec![1, 2, 3]);
        assert!(released.iter().all(|d| !d.out_of_order));
        assert_eq!(buffer.next_expected(), 4);
    }

    #[test]
    fn test_overflow_forces_release_in_arrival_order() {
        let mut buffer = ReorderBuffer::new(1, 2);
        assert!(buffer.push(result(4)).is_empty());
        assert!(buffer.push(result(2)).is_empty());

        let released = buffer.push(result(3));
        assert_eq!(sequences(&released), vec![4, 2, 3]);
        assert!(released.iter().all(|d| d.out_of_order));
        assert_eq!(buffer.next_expected(), 5);
        assert_eq!(buffer.forced_releases(), 1);
        assert!(buffer.is_empty());

        // the gap closes late and goes straight out, flagged
        let late = buffer.push(result(1));
        assert_eq!(sequences(&late), vec![1]);
        assert!(late[0].out_of_order);

        // ordering resumes after the jump
        assert_eq!(sequences(&buffer.push(result(5))), vec![5]);
    }

    #[test]
    fn test_buffer_never_exceeds_window() {
        let mut buffer = ReorderBuffer::new(1, 3);
        for sequence in 2..50 {
            buffer.push(result(sequence));
            assert!(buffer.len() <= 3);
        }
    }
}
