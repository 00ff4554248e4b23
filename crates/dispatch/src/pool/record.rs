//! Per-worker bookkeeping

use serde::Serialize;
use tokio::time::Instant;

use super::worker::{WorkerHandle, WorkerId, WorkerState};
use crate::protocol::{Envelope, Sequence};

/// Weight of the newest sample in the load average
const LOAD_SMOOTHING: f64 = 0.2;

/// Pool-owned record of one worker
#[derive(Debug)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub state: WorkerState,

    /// State to return to when an unresponsive worker answers again
    pub prior_state: Option<WorkerState>,

    /// Envelope currently held
    pub current: Option<Envelope>,

    pub started_at: Instant,
    pub last_heartbeat_at: Instant,
    pub idle_since: Option<Instant>,
    busy_since: Option<Instant>,

    /// Smoothed share of time spent busy (0.0 - 1.0)
    pub load: f64,

    /// Round-robin weight
    pub weight: u32,

    /// Envelopes finished by this worker
    pub completed: u64,

    /// Affinity key of the most recent envelope that carried one
    pub last_affinity: Option<String>,

    pub(crate) handle: WorkerHandle,
}

impl WorkerRecord {
    pub(crate) fn new(id: WorkerId, weight: u32, handle: WorkerHandle, now: Instant) -> Self {
        Self {
            id,
            state: WorkerState::Starting,
            prior_state: None,
            current: None,
            started_at: now,
            last_heartbeat_at: now,
            idle_since: None,
            busy_since: None,
            load: 0.0,
            weight,
            completed: 0,
            last_affinity: None,
            handle,
        }
    }

    /// Counts toward pool size
    pub fn is_live(&self) -> bool {
        !matches!(self.state, WorkerState::Crashed | WorkerState::Draining)
    }

    pub fn holds(&self, sequence: Sequence, attempt: u32) -> bool {
        self.current
            .as_ref()
            .is_some_and(|e| e.sequence == sequence && e.attempt == attempt)
    }

    pub(crate) fn start_envelope(&mut self, envelope: Envelope, now: Instant) {
        if let Some(key) = &envelope.task.affinity {
            self.last_affinity = Some(key.clone());
        }
        self.current = Some(envelope);
        self.state = WorkerState::Busy;
        self.busy_since = Some(now);
    }

    /// Clear the held envelope and fold the busy period into the load average
    pub(crate) fn finish_envelope(&mut self, now: Instant) {
        self.current = None;
        self.completed += 1;

        if let Some(busy_since) = self.busy_since.take() {
            let busy = now.saturating_duration_since(busy_since).as_secs_f64();
            let idle = self
                .idle_since
                .map(|idle_since| busy_since.saturating_duration_since(idle_since).as_secs_f64())
                .unwrap_or(0.0);
            let sample = if busy + idle > 0.0 { busy / (busy + idle) } else { 1.0 };
            self.load = (1.0 - LOAD_SMOOTHING) * self.load + LOAD_SMOOTHING * sample;
        }

        match self.state {
            WorkerState::Busy => {
                self.state = WorkerState::Idle;
                self.idle_since = Some(now);
            }
            WorkerState::Unresponsive => {
                self.prior_state = Some(WorkerState::Idle);
                self.idle_since = Some(now);
            }
            _ => {}
        }
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id,
            state: self.state,
            load: self.load,
            weight: self.weight,
            current: self.current.as_ref().map(|e| (e.sequence, e.attempt)),
            last_affinity: self.last_affinity.clone(),
        }
    }
}

/// Read-only view of a worker, handed to the scheduler and to stats
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub state: WorkerState,
    pub load: f64,
    pub weight: u32,

    /// Sequence and attempt of the held envelope
    pub current: Option<(Sequence, u32)>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_affinity: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn record(now: Instant) -> WorkerRecord {
        let (tx, _rx) = mpsc::unbounded_channel();
        WorkerRecord::new(WorkerId::new(1), 1, WorkerHandle::new(tx, None), now)
    }

    fn envelope(now: Instant) -> Envelope {
        Envelope {
            sequence: 1,
            attempt: 1,
            task: Arc::new(TaskSpec::new("k", json!(null)).into_task(Duration::from_secs(1), 1, now)),
            sent_at: now,
            ack_deadline: now + Duration::from_secs(1),
            late: false,
        }
    }

    #[test]
    fn test_load_tracks_busy_share() {
        let start = Instant::now();
        let mut record = record(start);
        record.state = WorkerState::Idle;
        record.idle_since = Some(start);

        // idle 1s, busy 3s: sample 0.75
        record.start_envelope(envelope(start), start + Duration::from_secs(1));
        assert!(record.holds(1, 1));
        record.finish_envelope(start + Duration::from_secs(4));

        assert!((record.load - 0.15).abs() < 1e-9);
        assert_eq!(record.state, WorkerState::Idle);
        assert_eq!(record.completed, 1);
        assert!(record.current.is_none());
    }

    #[test]
    fn test_finish_while_unresponsive_restores_idle_later() {
        let now = Instant::now();
        let mut record = record(now);
        record.start_envelope(envelope(now), now);
        record.prior_state = Some(WorkerState::Busy);
        record.state = WorkerState::Unresponsive;

        record.finish_envelope(now);
        assert_eq!(record.state, WorkerState::Unresponsive);
        assert_eq!(record.prior_state, Some(WorkerState::Idle));
    }

    #[test]
    fn test_snapshot() {
        let now = Instant::now();
        let mut record = record(now);
        record.start_envelope(envelope(now), now);
        let snapshot = record.snapshot();
        assert_eq!(snapshot.state, WorkerState::Busy);
        assert_eq!(snapshot.current, Some((1, 1)));
        assert!(snapshot.last_affinity.is_none());
        assert!(record.is_live());
    }

    #[test]
    fn test_affinity_sticks_across_unkeyed_envelopes() {
        let now = Instant::now();
        let mut record = record(now);
        let mut keyed = envelope(now);
        keyed.task = Arc::new(
            TaskSpec::new("k", json!(null))
                .with_affinity("model-a")
                .into_task(Duration::from_secs(1), 1, now),
        );
        record.start_envelope(keyed, now);
        record.finish_envelope(now);
        record.start_envelope(envelope(now), now);
        assert_eq!(record.snapshot().last_affinity.as_deref(), Some("model-a"));
    }
}
