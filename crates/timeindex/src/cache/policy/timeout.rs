use super::{EvictAction, EvictableCache, EvictionPolicy, RecencyQueue};
use crate::error::Result;
use std::time::{Duration, Instant};
use tracing::trace;

/// Evicts items that have not been accessed for `timeout`.
///
/// Expiry is checked at the start of every add and get.
#[derive(Debug)]
pub struct TimeoutPolicy {
    timeout: Duration,
    action: EvictAction,
    queue: RecencyQueue,
}

impl TimeoutPolicy {
    /// Creates a policy expiring items after `timeout` without access.
    pub fn new(timeout: Duration, action: EvictAction) -> Self {
        Self {
            timeout,
            action,
            queue: RecencyQueue::new(),
        }
    }

    /// Evicts every position last accessed more than `timeout` before `now`.
    /// Returns the number of positions evicted.
    pub fn evict_expired(&mut self, cache: &mut dyn EvictableCache, now: Instant) -> usize {
        let mut evicted = 0;
        while let Some((position, at)) = self.queue.oldest() {
            if now.saturating_duration_since(at) <= self.timeout {
                break;
            }
            self.queue.pop_oldest();
            trace!("Timeout evicting position {}", position);
            self.action.apply(cache, position);
            evicted += 1;
        }
        evicted
    }

    fn record(&mut self, position: u64, now: Instant) {
        self.queue.touch(position, now);
    }
}

impl EvictionPolicy for TimeoutPolicy {
    fn on_add_begin(&mut self, cache: &mut dyn EvictableCache, _position: u64) -> Result<()> {
        self.evict_expired(cache, Instant::now());
        Ok(())
    }

    fn on_add_end(&mut self, _cache: &mut dyn EvictableCache, position: u64) -> Result<()> {
        self.record(position, Instant::now());
        Ok(())
    }

    fn on_get_begin(&mut self, cache: &mut dyn EvictableCache, _position: u64) -> Result<()> {
        self.evict_expired(cache, Instant::now());
        Ok(())
    }

    fn on_get_end(&mut self, _cache: &mut dyn EvictableCache, position: u64) -> Result<()> {
        self.record(position, Instant::now());
        Ok(())
    }

    fn on_remove(&mut self, position: u64) {
        self.queue.remove(position);
    }

    fn reset(&mut self) {
        self.queue.clear();
    }
}
