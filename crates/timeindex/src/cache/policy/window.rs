use super::{EvictAction, EvictableCache, EvictionPolicy, RecencyQueue};
use crate::error::Result;
use std::time::Instant;
use tracing::trace;

/// Keeps at most `capacity` recently used items.
///
/// Adds and gets move a position to the back of the window; once more than
/// `capacity` positions are watched, the front is evicted.
#[derive(Debug)]
pub struct WindowPolicy {
    capacity: usize,
    action: EvictAction,
    queue: RecencyQueue,
}

impl WindowPolicy {
    /// Creates a window of `capacity` items (at least one).
    pub fn new(capacity: usize, action: EvictAction) -> Self {
        Self {
            capacity: capacity.max(1),
            action,
            queue: RecencyQueue::new(),
        }
    }

    /// Number of watched positions.
    pub fn watched(&self) -> usize {
        self.queue.len()
    }

    fn touch(&mut self, cache: &mut dyn EvictableCache, position: u64) {
        self.queue.touch(position, Instant::now());
        while self.queue.len() > self.capacity {
            if let Some((oldest, _)) = self.queue.pop_oldest() {
                trace!("Window evicting position {}", oldest);
                self.action.apply(cache, oldest);
            }
        }
    }
}

impl EvictionPolicy for WindowPolicy {
    fn on_add_end(&mut self, cache: &mut dyn EvictableCache, position: u64) -> Result<()> {
        self.touch(cache, position);
        Ok(())
    }

    fn on_get_end(&mut self, cache: &mut dyn EvictableCache, position: u64) -> Result<()> {
        self.touch(cache, position);
        Ok(())
    }

    fn on_remove(&mut self, position: u64) {
        self.queue.remove(position);
    }

    fn reset(&mut self) {
        self.queue.clear();
    }
}
