//! Timer heap with lazy cancellation
//!
//! Timers are never removed on cancel. When one fires, the protocol checks
//! it against the current attempt and ignores it if the attempt moved on.

use std::collections::BinaryHeap;

use tokio::time::Instant;

use super::Sequence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Queued ticket must reach a worker by now
    QueueExpiry,
    /// Envelope must be acknowledged by now
    AckDeadline,
    /// Retry backoff elapsed, requeue the attempt
    RetryBackoff,
    /// Running attempt is slow enough to hedge with another
    Speculate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Timer {
    pub at: Instant,
    pub sequence: Sequence,
    pub attempt: u32,
    pub kind: TimerKind,
}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering: earliest timer on top, lower sequence first
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.sequence.cmp(&self.sequence))
            .then_with(|| other.attempt.cmp(&self.attempt))
    }
}

#[derive(Debug, Default)]
pub(crate) struct TimerHeap {
    heap: BinaryHeap<Timer>,
}

impl TimerHeap {
    pub fn schedule(&mut self, at: Instant, sequence: Sequence, attempt: u32, kind: TimerKind) {
        self.heap.push(Timer {
            at,
            sequence,
            attempt,
            kind,
        });
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|timer| timer.at)
    }

    /// Remove and return every timer due at `now`, earliest first
    pub fn pop_due(&mut self, now: Instant) -> Vec<Timer> {
        let mut due = Vec::new();
        while let Some(timer) = self.heap.peek() {
            if timer.at > now {
                break;
            }
            if let Some(timer) = self.heap.pop() {
                due.push(timer);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pop_due_in_time_order() {
        let now = Instant::now();
        let mut timers = TimerHeap::default();
        timers.schedule(now + Duration::from_secs(3), 3, 1, TimerKind::AckDeadline);
        timers.schedule(now + Duration::from_secs(1), 1, 1, TimerKind::AckDeadline);
        timers.schedule(now + Duration::from_secs(2), 2, 1, TimerKind::RetryBackoff);

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(1)));

        let due = timers.pop_due(now + Duration::from_secs(2));
        let sequences: Vec<_> = due.iter().map(|t| t.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(due[1].kind, TimerKind::RetryBackoff);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_nothing_due_before_deadline() {
        let now = Instant::now();
        let mut timers = TimerHeap::default();
        timers.schedule(now + Duration::from_millis(10), 1, 1, TimerKind::AckDeadline);
        assert!(timers.pop_due(now).is_empty());
        assert_eq!(timers.len(), 1);
    }
}
