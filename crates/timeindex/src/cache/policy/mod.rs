//! Eviction policies.
//!
//! A policy watches cache traffic through add/get callbacks and bounds memory
//! by hollowing entries (dropping the payload, keeping the record) or
//! removing them outright. Policies only see the cache through
//! [`EvictableCache`] and own nothing but an ordering over positions.

mod timeout;
mod volume;
mod volume_timeout;
mod window;

pub use timeout::TimeoutPolicy;
pub use volume::VolumePolicy;
pub use volume_timeout::{VolumeTimeoutPolicy, DEFAULT_PRE_QUEUE_LEN};
pub use window::WindowPolicy;

use crate::error::Result;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

/// Operations a policy may perform on the cache.
pub trait EvictableCache {
    /// Drops the payload at `position`. Returns false if nothing was resident.
    fn hollow(&mut self, position: u64) -> bool;

    /// Drops the entry at `position`. Returns false if the slot was empty.
    fn remove(&mut self, position: u64) -> bool;

    /// Bytes of materialized payload.
    fn data_volume(&self) -> u64;

    /// Returns true if the payload at `position` is materialized.
    fn is_resident(&self, position: u64) -> bool;
}

/// What a single-stage policy does to an evicted entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictAction {
    /// Keep the record, drop the payload.
    #[default]
    Hollow,
    /// Drop the whole entry.
    Remove,
}

impl EvictAction {
    /// Applies the action to `position`.
    pub fn apply(self, cache: &mut dyn EvictableCache, position: u64) -> bool {
        match self {
            EvictAction::Hollow => cache.hollow(position),
            EvictAction::Remove => cache.remove(position),
        }
    }
}

/// Callbacks bracketing cache traffic.
///
/// Every method has a no-op default. Errors are logged by the cache and
/// otherwise ignored.
pub trait EvictionPolicy: Send {
    /// Called before an item is added at `position`.
    fn on_add_begin(&mut self, _cache: &mut dyn EvictableCache, _position: u64) -> Result<()> {
        Ok(())
    }

    /// Called after an item was added at `position`.
    fn on_add_end(&mut self, _cache: &mut dyn EvictableCache, _position: u64) -> Result<()> {
        Ok(())
    }

    /// Called before the item at `position` is looked up.
    fn on_get_begin(&mut self, _cache: &mut dyn EvictableCache, _position: u64) -> Result<()> {
        Ok(())
    }

    /// Called after the item at `position` was returned.
    fn on_get_end(&mut self, _cache: &mut dyn EvictableCache, _position: u64) -> Result<()> {
        Ok(())
    }

    /// Called when the cache owner removes `position` directly.
    fn on_remove(&mut self, _position: u64) {}

    /// Called when the cache is cleared.
    fn reset(&mut self) {}
}

/// Keeps everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEviction;

impl EvictionPolicy for NoEviction {}

/// Positions in least-recently-touched order.
#[derive(Debug, Default)]
pub(crate) struct RecencyQueue {
    order: BTreeMap<u64, (u64, Instant)>,
    stamps: HashMap<u64, u64>,
    clock: u64,
}

impl RecencyQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Moves `position` to the back, recording `now` as its last access.
    pub(crate) fn touch(&mut self, position: u64, now: Instant) {
        if let Some(stamp) = self.stamps.remove(&position) {
            self.order.remove(&stamp);
        }
        self.clock += 1;
        self.order.insert(self.clock, (position, now));
        self.stamps.insert(position, self.clock);
    }

    /// Least recently touched position and its access time.
    pub(crate) fn oldest(&self) -> Option<(u64, Instant)> {
        self.order.values().next().copied()
    }

    pub(crate) fn pop_oldest(&mut self) -> Option<(u64, Instant)> {
        let (_, (position, at)) = self.order.pop_first()?;
        self.stamps.remove(&position);
        Some((position, at))
    }

    pub(crate) fn remove(&mut self, position: u64) -> bool {
        match self.stamps.remove(&position) {
            Some(stamp) => {
                self.order.remove(&stamp);
                true
            }
            None => false,
        }
    }

    pub(crate) fn contains(&self, position: u64) -> bool {
        self.stamps.contains_key(&position)
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn clear(&mut self) {
        self.order.clear();
        self.stamps.clear();
    }
}

/// Cache double used by the policy tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::EvictableCache;
    use std::collections::BTreeMap;

    /// Entries are `position -> (size, resident)`.
    #[derive(Debug, Default)]
    pub(crate) struct MockCache {
        pub(crate) entries: BTreeMap<u64, (u64, bool)>,
    }

    impl MockCache {
        pub(crate) fn add(&mut self, position: u64, size: u64) {
            self.entries.insert(position, (size, true));
        }

        pub(crate) fn resident(&self) -> Vec<u64> {
            self.entries
                .iter()
                .filter(|(_, (_, resident))| *resident)
                .map(|(position, _)| *position)
                .collect()
        }
    }

    impl EvictableCache for MockCache {
        fn hollow(&mut self, position: u64) -> bool {
            match self.entries.get_mut(&position) {
                Some((_, resident)) if *resident => {
                    *resident = false;
                    true
                }
                _ => false,
            }
        }

        fn remove(&mut self, position: u64) -> bool {
            self.entries.remove(&position).is_some()
        }

        fn data_volume(&self) -> u64 {
            self.entries
                .values()
                .filter(|(_, resident)| *resident)
                .map(|(size, _)| size)
                .sum()
        }

        fn is_resident(&self, position: u64) -> bool {
            self.entries.get(&position).map(|e| e.1).unwrap_or(false)
        }
    }
}
