use super::{EvictableCache, EvictionPolicy, RecencyQueue};
use crate::error::Result;
use std::time::{Duration, Instant};
use tracing::trace;

/// Default length of the pre-queue.
pub const DEFAULT_PRE_QUEUE_LEN: usize = 2;

/// Two-stage volume policy.
///
/// ```text
///  add/get ──► pre-queue ──► main queue ──► hollowed ──► removed
///              (newest N)    (LRU order)    (aging)      (after timeout)
/// ```
///
/// Newly seen positions wait in a short pre-queue before they are eligible
/// for eviction. Volume pressure hollows the least recently used entries of
/// the main queue first, then the pre-queue down to its newest entry.
/// Hollowed entries are removed from the cache once they have aged past
/// `timeout` without being read again.
#[derive(Debug)]
pub struct VolumeTimeoutPolicy {
    threshold: u64,
    timeout: Duration,
    pre_len: usize,
    pre: RecencyQueue,
    main: RecencyQueue,
    hollowed: RecencyQueue,
}

impl VolumeTimeoutPolicy {
    /// Creates a policy bounding volume to `threshold` bytes and removing
    /// hollowed entries after `timeout`.
    pub fn new(threshold: u64, timeout: Duration) -> Self {
        Self {
            threshold,
            timeout,
            pre_len: DEFAULT_PRE_QUEUE_LEN,
            pre: RecencyQueue::new(),
            main: RecencyQueue::new(),
            hollowed: RecencyQueue::new(),
        }
    }

    /// Sets the pre-queue length (at least one).
    pub fn with_pre_queue(mut self, len: usize) -> Self {
        self.pre_len = len.max(1);
        self
    }

    /// Removes hollowed entries older than `timeout` at `now`. Returns the
    /// number removed.
    pub fn remove_aged(&mut self, cache: &mut dyn EvictableCache, now: Instant) -> usize {
        let mut removed = 0;
        while let Some((position, at)) = self.hollowed.oldest() {
            if now.saturating_duration_since(at) <= self.timeout {
                break;
            }
            self.hollowed.pop_oldest();
            trace!("Removing aged hollow position {}", position);
            cache.remove(position);
            removed += 1;
        }
        removed
    }

    fn observe(&mut self, cache: &mut dyn EvictableCache, position: u64, now: Instant) {
        if self.hollowed.contains(position) {
            if !cache.is_resident(position) {
                return;
            }
            self.hollowed.remove(position);
        }

        if self.main.contains(position) {
            self.main.touch(position, now);
        } else {
            self.pre.touch(position, now);
            while self.pre.len() > self.pre_len {
                if let Some((promoted, _)) = self.pre.pop_oldest() {
                    self.main.touch(promoted, now);
                }
            }
        }

        self.relieve(cache, now);
    }

    fn relieve(&mut self, cache: &mut dyn EvictableCache, now: Instant) {
        while cache.data_volume() > self.threshold {
            let victim = match self.main.pop_oldest() {
                Some((position, _)) => position,
                None if self.pre.len() > 1 => match self.pre.pop_oldest() {
                    Some((position, _)) => position,
                    None => break,
                },
                None => break,
            };
            trace!("Volume pressure, hollowing position {}", victim);
            cache.hollow(victim);
            self.hollowed.touch(victim, now);
        }
    }
}

impl EvictionPolicy for VolumeTimeoutPolicy {
    fn on_add_begin(&mut self, cache: &mut dyn EvictableCache, _position: u64) -> Result<()> {
        self.remove_aged(cache, Instant::now());
        Ok(())
    }

    fn on_add_end(&mut self, cache: &mut dyn EvictableCache, position: u64) -> Result<()> {
        self.observe(cache, position, Instant::now());
        Ok(())
    }

    fn on_get_begin(&mut self, cache: &mut dyn EvictableCache, _position: u64) -> Result<()> {
        self.remove_aged(cache, Instant::now());
        Ok(())
    }

    fn on_get_end(&mut self, cache: &mut dyn EvictableCache, position: u64) -> Result<()> {
        self.observe(cache, position, Instant::now());
        Ok(())
    }

    fn on_remove(&mut self, position: u64) {
        self.pre.remove(position);
        self.main.remove(position);
        self.hollowed.remove(position);
    }

    fn reset(&mut self) {
        self.pre.clear();
        self.main.clear();
        self.hollowed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::policy::testing::MockCache;

    fn add(
        policy: &mut VolumeTimeoutPolicy,
        cache: &mut MockCache,
        position: u64,
        size: u64,
        now: Instant,
    ) {
        cache.add(position, size);
        policy.observe(cache, position, now);
    }

    #[test]
    fn test_pressure_hollows_main_before_pre() {
        let now = Instant::now();
        let mut cache = MockCache::default();
        let mut policy = VolumeTimeoutPolicy::new(40, Duration::from_secs(60));

        for position in 0..4 {
            add(&mut policy, &mut cache, position, 10, now);
        }
        assert_eq!(cache.data_volume(), 40);

        add(&mut policy, &mut cache, 4, 10, now);
        assert_eq!(cache.resident(), vec![1, 2, 3, 4]);
        // Hollowed entries stay in the cache until they age out.
        assert!(cache.entries.contains_key(&0));
    }

    #[test]
    fn test_pre_queue_keeps_newest() {
        let now = Instant::now();
        let mut cache = MockCache::default();
        let mut policy = VolumeTimeoutPolicy::new(10, Duration::from_secs(60)).with_pre_queue(3);

        add(&mut policy, &mut cache, 0, 30, now);
        assert_eq!(cache.resident(), vec![0]);
        add(&mut policy, &mut cache, 1, 30, now);
        assert_eq!(cache.resident(), vec![1]);
    }

    #[test]
    fn test_hollowed_removed_after_timeout() {
        let start = Instant::now();
        let mut cache = MockCache::default();
        let mut policy = VolumeTimeoutPolicy::new(10, Duration::from_secs(5)).with_pre_queue(1);

        add(&mut policy, &mut cache, 0, 10, start);
        add(&mut policy, &mut cache, 1, 10, start);
        assert_eq!(cache.resident(), vec![1]);

        assert_eq!(policy.remove_aged(&mut cache, start + Duration::from_secs(5)), 0);
        assert!(cache.entries.contains_key(&0));
        assert_eq!(policy.remove_aged(&mut cache, start + Duration::from_secs(6)), 1);
        assert!(!cache.entries.contains_key(&0));
        assert!(cache.entries.contains_key(&1));
    }

    #[test]
    fn test_rematerialized_entry_is_rescued() {
        let start = Instant::now();
        let mut cache = MockCache::default();
        let mut policy = VolumeTimeoutPolicy::new(10, Duration::from_secs(5)).with_pre_queue(1);

        add(&mut policy, &mut cache, 0, 10, start);
        add(&mut policy, &mut cache, 1, 10, start);

        // Reading 0 back brings it to the front and pushes 1 out instead.
        cache.entries.insert(0, (10, true));
        policy.observe(&mut cache, 0, start);
        assert_eq!(cache.resident(), vec![0]);

        policy.remove_aged(&mut cache, start + Duration::from_secs(6));
        assert!(cache.entries.contains_key(&0));
        assert!(!cache.entries.contains_key(&1));
    }
}
