//! Bounded dedup cache with least-recently-used eviction
//!
//! Entries are pending until their task resolves. Pending entries are never
//! evicted; resolved entries expire after the retention window since last
//! use and are evicted oldest-first once the cache is over capacity.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::time::Instant;

use super::Sequence;
use crate::task::{DedupKey, TaskResult};

#[derive(Debug)]
struct DedupEntry {
    sequence: Sequence,
    outcome: Option<TaskResult>,
    last_used: Instant,
    tick: u64,
}

/// A previously seen submission
#[derive(Debug, Clone, PartialEq)]
pub struct SeenTask {
    pub sequence: Sequence,

    /// `None` while the original is still in flight
    pub outcome: Option<TaskResult>,
}

#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    retention: Duration,
    entries: HashMap<DedupKey, DedupEntry>,
    recency: BTreeMap<u64, DedupKey>,
    by_sequence: HashMap<Sequence, DedupKey>,
    tick: u64,
}

impl DedupCache {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            retention,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            by_sequence: HashMap::new(),
            tick: 0,
        }
    }

    /// Look up a key, refreshing its recency when found
    pub fn lookup(&mut self, key: &DedupKey, now: Instant) -> Option<SeenTask> {
        let expired = self
            .entries
            .get(key)
            .map(|entry| self.is_expired(entry, now))?;
        if expired {
            self.remove(key);
            return None;
        }
        self.touch(key, now);
        self.entries.get(key).map(|entry| SeenTask {
            sequence: entry.sequence,
            outcome: entry.outcome.clone(),
        })
    }

    pub fn insert_pending(&mut self, key: DedupKey, sequence: Sequence, now: Instant) {
        self.remove(&key);
        self.tick += 1;
        self.recency.insert(self.tick, key.clone());
        self.by_sequence.insert(sequence, key.clone());
        self.entries.insert(
            key,
            DedupEntry {
                sequence,
                outcome: None,
                last_used: now,
                tick: self.tick,
            },
        );
    }

    /// Record the outcome for a sequence
    pub fn resolve(&mut self, result: TaskResult, now: Instant) {
        let Some(key) = self.by_sequence.get(&result.sequence).cloned() else {
            return;
        };
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.outcome = Some(result);
        }
        self.touch(&key, now);
        self.evict_over_capacity();
    }

    /// Credit a sequence (a late duplicate completion arrived)
    pub fn touch_sequence(&mut self, sequence: Sequence, now: Instant) -> bool {
        match self.by_sequence.get(&sequence).cloned() {
            Some(key) => {
                self.touch(&key, now);
                true
            }
            None => false,
        }
    }

    pub fn remove_sequence(&mut self, sequence: Sequence) {
        if let Some(key) = self.by_sequence.get(&sequence).cloned() {
            self.remove(&key);
        }
    }

    /// Drop resolved entries past the retention window
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<DedupKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_expired(&self, entry: &DedupEntry, now: Instant) -> bool {
        entry.outcome.is_some() && now.saturating_duration_since(entry.last_used) > self.retention
    }

    fn touch(&mut self, key: &DedupKey, now: Instant) {
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.tick);
            self.tick += 1;
            entry.tick = self.tick;
            entry.last_used = now;
            self.recency.insert(self.tick, key.clone());
        }
    }

    fn remove(&mut self, key: &DedupKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.recency.remove(&entry.tick);
            if self.by_sequence.get(&entry.sequence) == Some(key) {
                self.by_sequence.remove(&entry.sequence);
            }
        }
    }

    fn evict_over_capacity(&mut self) {
        while self.entries.len() > self.capacity {
            let victim = self
                .recency
                .values()
                .find(|key| {
                    self.entries
                        .get(*key)
                        .is_some_and(|entry| entry.outcome.is_some())
                })
                .cloned();
            match victim {
                Some(key) => self.remove(&key),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskId, TaskStatus};

    fn key(name: &str) -> DedupKey {
        DedupKey::Idempotency(name.to_string())
    }

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

    #[test]
    fn test_pending_then_resolved() {
        let now = Instant::now();
        let mut cache = DedupCache::new(10, Duration::from_secs(60));
        cache.insert_pending(key("a"), 1, now);

        let seen = cache.lookup(&key("a"), now).unwrap();
        assert_eq!(seen.sequence, 1);
        assert!(seen.outcome.is_none());

        cache.resolve(result(1), now);
        let seen = cache.lookup(&key("a"), now).unwrap();
        assert_eq!(seen.outcome.unwrap().sequence, 1);
    }

    #[test]
    fn test_resolved_entries_expire() {
        let now = Instant::now();
        let mut cache = DedupCache::new(10, Duration::from_secs(60));
        cache.insert_pending(key("a"), 1, now);
        cache.resolve(result(1), now);

        assert!(cache.lookup(&key("a"), now + Duration::from_secs(30)).is_some());
        // lookup refreshed last use at +30s
        assert!(cache.lookup(&key("a"), now + Duration::from_secs(89)).is_some());
        assert!(cache.lookup(&key("a"), now + Duration::from_secs(150)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_pending_entries_never_expire() {
        let now = Instant::now();
        let mut cache = DedupCache::new(10, Duration::from_secs(1));
        cache.insert_pending(key("a"), 1, now);

        assert_eq!(cache.purge_expired(now + Duration::from_secs(3600)), 0);
        assert!(cache.lookup(&key("a"), now + Duration::from_secs(3600)).is_some());
    }

    #[test]
    fn test_lru_eviction_skips_pending() {
        let now = Instant::now();
        let mut cache = DedupCache::new(2, Duration::from_secs(60));
        cache.insert_pending(key("pending"), 1, now);
        cache.insert_pending(key("b"), 2, now);
        cache.resolve(result(2), now);
        cache.insert_pending(key("c"), 3, now);
        cache.resolve(result(3), now);

        // over capacity by one: the oldest resolved entry goes, the pending one stays
        assert_eq!(cache.len(), 2);
        assert!(cache.lookup(&key("pending"), now).is_some());
        assert!(cache.lookup(&key("b"), now).is_none());
        assert!(cache.lookup(&key("c"), now).is_some());
    }

    #[test]
    fn test_touch_sequence_keeps_entry_warm() {
        let now = Instant::now();
        let mut cache = DedupCache::new(10, Duration::from_secs(10));
        cache.insert_pending(key("a"), 1, now);
        cache.resolve(result(1), now);

        assert!(cache.touch_sequence(1, now + Duration::from_secs(8)));
        assert_eq!(cache.purge_expired(now + Duration::from_secs(15)), 0);
        assert_eq!(cache.purge_expired(now + Duration::from_secs(20)), 1);
        assert!(!cache.touch_sequence(1, now + Duration::from_secs(21)));
    }

    #[test]
    fn test_remove_sequence() {
        let now = Instant::now();
        let mut cache = DedupCache::new(10, Duration::from_secs(10));
        cache.insert_pending(key("a"), 7, now);
        cache.remove_sequence(7);
        assert!(cache.lookup(&key("a"), now).is_none());
    }
}
