//! Concurrency limiter (spec §4.G): a per-endpoint slot pool bounding the
//! number of concurrent in-flight requests to each data centre.
//!
//! monoio is single-threaded per worker; the pool is deliberately
//! `Rc<RefCell<_>>` rather than a cross-thread mutex, which trades strict
//! process-wide fairness (one pool per worker thread, not one global pool)
//! for avoiding a shared-nothing violation. See SPEC_FULL.md's note on the
//! Open Question this setup resolves.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use eida_federator_core::GatewayError;

struct SlotState {
    capacity: usize,
    held: usize,
}

/// A mapping from endpoint URL to `(capacity, held)`, created lazily on
/// first acquire.
#[derive(Clone, Default)]
pub struct SlotPool {
    inner: Rc<RefCell<HashMap<String, SlotState>>>,
    default_capacity: usize,
    poll_interval: Duration,
}

impl SlotPool {
    pub fn new(default_capacity: usize, poll_interval: Duration) -> Self {
        Self {
            inner: Rc::new(RefCell::new(HashMap::new())),
            default_capacity,
            poll_interval,
        }
    }

    /// Registers an explicit capacity for `url`, overriding the default.
    /// Capacity can still be widened by re-calling this before any slot for
    /// `url` is held.
    pub fn set_capacity(&self, url: &str, capacity: usize) {
        let mut pools = self.inner.borrow_mut();
        pools
            .entry(url.to_string())
            .or_insert(SlotState { capacity, held: 0 })
            .capacity = capacity;
    }

    fn try_acquire(&self, url: &str) -> bool {
        let mut pools = self.inner.borrow_mut();
        let state = pools.entry(url.to_string()).or_insert(SlotState {
            capacity: self.default_capacity,
            held: 0,
        });
        if state.held < state.capacity {
            state.held += 1;
            true
        } else {
            false
        }
    }

    fn release(&self, url: &str) {
        let mut pools = self.inner.borrow_mut();
        if let Some(state) = pools.get_mut(url) {
            state.held = state.held.saturating_sub(1);
        }
    }

    /// Waits cooperatively until a slot for `url` is free or `timeout`
    /// elapses, polling at `self.poll_interval`.
    pub async fn acquire(&self, url: &str, timeout: Duration) -> Result<SlotGuard, GatewayError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if self.try_acquire(url) {
                return Ok(SlotGuard {
                    pool: self.clone(),
                    url: url.to_string(),
                });
            }
            if std::time::Instant::now() >= deadline {
                return Err(GatewayError::SlotTimeout {
                    url: url.to_string(),
                });
            }
            monoio::time::sleep(self.poll_interval).await;
        }
    }

    #[cfg(test)]
    fn held(&self, url: &str) -> usize {
        self.inner
            .borrow()
            .get(url)
            .map(|s| s.held)
            .unwrap_or_default()
    }
}

/// A held slot, released exactly once on drop.
pub struct SlotGuard {
    pool: SlotPool,
    url: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.pool.release(&self.url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[monoio::test]
    async fn acquire_blocks_until_release() {
        let pool = SlotPool::new(1, Duration::from_millis(5));
        let first = pool.acquire("http://node1", Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.held("http://node1"), 1);

        let pool2 = pool.clone();
        let waiter = monoio::spawn(async move {
            pool2.acquire("http://node1", Duration::from_secs(1)).await
        });

        monoio::time::sleep(Duration::from_millis(20)).await;
        drop(first);

        let second = waiter.await.unwrap();
        assert!(second.is_ok());
    }

    #[monoio::test]
    async fn acquire_times_out_when_exhausted() {
        let pool = SlotPool::new(1, Duration::from_millis(5));
        let _held = pool.acquire("http://node1", Duration::from_secs(1)).await.unwrap();
        let result = pool.acquire("http://node1", Duration::from_millis(30)).await;
        assert!(matches!(result, Err(GatewayError::SlotTimeout { .. })));
    }

    #[monoio::test]
    async fn distinct_endpoints_have_independent_capacity() {
        let pool = SlotPool::new(1, Duration::from_millis(5));
        let _a = pool.acquire("http://node1", Duration::from_secs(1)).await.unwrap();
        let b = pool.acquire("http://node2", Duration::from_secs(1)).await;
        assert!(b.is_ok());
    }
}
