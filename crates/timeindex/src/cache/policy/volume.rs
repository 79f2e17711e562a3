use super::{EvictAction, EvictableCache, EvictionPolicy, RecencyQueue};
use crate::error::Result;
use std::time::Instant;
use tracing::trace;

/// Bounds resident payload volume.
///
/// After every add and get, the least recently used items are evicted while
/// the cache holds more than `threshold` bytes. The most recent item is never
/// evicted, so a single payload larger than the threshold stays resident.
#[derive(Debug)]
pub struct VolumePolicy {
    threshold: u64,
    action: EvictAction,
    queue: RecencyQueue,
}

impl VolumePolicy {
    /// Creates a policy keeping resident volume at or below `threshold` bytes.
    pub fn new(threshold: u64, action: EvictAction) -> Self {
        Self {
            threshold,
            action,
            queue: RecencyQueue::new(),
        }
    }

    fn enforce(&mut self, cache: &mut dyn EvictableCache, position: u64) {
        self.queue.touch(position, Instant::now());
        while cache.data_volume() > self.threshold && self.queue.len() > 1 {
            if let Some((oldest, _)) = self.queue.pop_oldest() {
                trace!(
                    "Volume {} over {}, evicting position {}",
                    cache.data_volume(),
                    self.threshold,
                    oldest
                );
                self.action.apply(cache, oldest);
            }
        }
    }
}

impl EvictionPolicy for VolumePolicy {
    fn on_add_end(&mut self, cache: &mut dyn EvictableCache, position: u64) -> Result<()> {
        self.enforce(cache, position);
        Ok(())
    }

    fn on_get_end(&mut self, cache: &mut dyn EvictableCache, position: u64) -> Result<()> {
        self.enforce(cache, position);
        Ok(())
    }

    fn on_remove(&mut self, position: u64) {
        self.queue.remove(position);
    }

    fn reset(&mut self) {
        self.queue.clear();
    }
}
