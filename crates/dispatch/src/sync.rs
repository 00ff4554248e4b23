//! Atomic coordination primitives shared between task bodies
//!
//! Workers share no mutable state with each other except through these.
//! Task bodies reach them by name through [`TaskContext::shared`].
//!
//! [`TaskContext::shared`]: crate::task::TaskContext::shared

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{Barrier, Notify};

/// Counter supporting fetch-add and compare-and-swap
#[derive(Debug, Default)]
pub struct SharedCounter {
    value: AtomicI64,
}

impl SharedCounter {
    pub fn new(initial: i64) -> Self {
        Self {
            value: AtomicI64::new(initial),
        }
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Add `delta`, returning the previous value
    pub fn fetch_add(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, Ordering::SeqCst)
    }

    /// Increment, returning the new value
    pub fn increment(&self) -> i64 {
        self.fetch_add(1) + 1
    }

    /// Store `new` if the value is still `current`
    ///
    /// Returns the previous value on success, the actual value on failure.
    pub fn compare_and_swap(&self, current: i64, new: i64) -> Result<i64, i64> {
        self.value
            .compare_exchange(current, new, Ordering::SeqCst, Ordering::SeqCst)
    }
}

/// Latch that opens once counted down to zero
#[derive(Debug)]
pub struct CountdownLatch {
    remaining: AtomicUsize,
    opened: Notify,
}

impl CountdownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            opened: Notify::new(),
        }
    }

    /// Decrement; the call that reaches zero wakes all waiters
    pub fn count_down(&self) {
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.opened.notify_waiters();
        }
    }

    pub fn count(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }

    /// Wait until the count reaches zero
    pub async fn wait(&self) {
        loop {
            let opened = self.opened.notified();
            tokio::pin!(opened);
            opened.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            opened.await;
        }
    }
}

/// Named primitives, created on first use
#[derive(Debug, Default)]
pub struct SyncRegistry {
    counters: RwLock<HashMap<String, Arc<SharedCounter>>>,
    latches: RwLock<HashMap<String, Arc<CountdownLatch>>>,
    barriers: RwLock<HashMap<String, Arc<Barrier>>>,
}

impl SyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter `name`, starting at zero
    pub fn counter(&self, name: &str) -> Arc<SharedCounter> {
        get_or_create(&self.counters, name, || SharedCounter::new(0))
    }

    /// Latch `name`; `count` only applies when the latch is created
    pub fn latch(&self, name: &str, count: usize) -> Arc<CountdownLatch> {
        get_or_create(&self.latches, name, || CountdownLatch::new(count))
    }

    /// Barrier `name`; `parties` only applies when the barrier is created
    pub fn barrier(&self, name: &str, parties: usize) -> Arc<Barrier> {
        get_or_create(&self.barriers, name, || Barrier::new(parties))
    }
}

fn get_or_create<T>(
    map: &RwLock<HashMap<String, Arc<T>>>,
    name: &str,
    create: impl FnOnce() -> T,
) -> Arc<T> {
    if let Some(existing) = map.read().get(name) {
        return existing.clone();
    }
    map.write()
        .entry(name.to_string())
        .or_insert_with(|| Arc::new(create()))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_cas() {
        let counter = SharedCounter::new(5);
        assert_eq!(counter.compare_and_swap(5, 9), Ok(5));
        assert_eq!(counter.compare_and_swap(5, 1), Err(9));
        assert_eq!(counter.increment(), 10);
        assert_eq!(counter.fetch_add(-4), 10);
        assert_eq!(counter.get(), 6);
    }

    #[tokio::test]
    async fn test_counter_from_many_tasks() {
        let counter = Arc::new(SharedCounter::default());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    counter.increment();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(counter.get(), 800);
    }

    #[tokio::test]
    async fn test_latch_releases_waiters() {
        let latch = Arc::new(CountdownLatch::new(3));
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };

        latch.count_down();
        latch.count_down();
        assert_eq!(latch.count(), 1);
        assert!(!waiter.is_finished());

        latch.count_down();
        waiter.await.unwrap();

        // extra count-downs saturate at zero
        latch.count_down();
        assert_eq!(latch.count(), 0);
        latch.wait().await;
    }

    #[tokio::test]
    async fn test_registry_barrier_is_shared() {
        let registry = Arc::new(SyncRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..3 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.barrier("phase", 3).wait().await.is_leader()
            }));
        }

        let mut leaders = 0;
        for handle in handles {
            if handle.await.unwrap() {
                leaders += 1;
            }
        }
        assert_eq!(leaders, 1);
    }

    #[test]
    fn test_registry_returns_same_instance() {
        let registry = SyncRegistry::new();
        let a = registry.counter("hits");
        let b = registry.counter("hits");
        assert!(Arc::ptr_eq(&a, &b));

        let latch = registry.latch("ready", 2);
        assert_eq!(registry.latch("ready", 99).count(), latch.count());
    }
}
