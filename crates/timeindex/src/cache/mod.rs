//! In-memory item cache with pluggable eviction.
//!
//! The cache keeps one [`Slot`] per store position and a bitset of positions
//! whose payload is materialized. Every add and get is bracketed by
//! [`EvictionPolicy`] callbacks; a policy sees the table only through
//! [`EvictableCache`] and can hollow or remove entries to bound memory.
//!
//! ```text
//! position:   0      1       2      3
//! slots:    [Item] [Empty] [Item] [Item]
//! resident:   1      0       0      1      (item 2 is hollow)
//! ```

pub mod policy;

pub use policy::{
    EvictAction, EvictableCache, EvictionPolicy, NoEviction, TimeoutPolicy, VolumePolicy,
    VolumeTimeoutPolicy, WindowPolicy,
};

use crate::error::{Result, TimeIndexError};
use crate::format::{IndexItem, Payload};
use crate::timestamp::Timestamp;
use bitvec::vec::BitVec;
use tracing::warn;

/// Supplies items the cache does not hold.
pub trait ItemSource {
    /// Loads the item at `position`, with its payload if asked.
    fn load_item(&mut self, position: u64, with_payload: bool) -> Result<IndexItem>;

    /// Loads the payload an item record points at.
    fn load_payload(&mut self, item: &IndexItem) -> Result<Payload>;

    /// Number of items the source holds.
    fn item_count(&self) -> u64;
}

/// One cache position.
#[derive(Debug, Clone, Default)]
pub enum Slot {
    /// Nothing cached at this position.
    #[default]
    Empty,
    /// A cached item, hollow or materialized.
    Item(IndexItem),
}

/// Position-indexed item storage with residency tracking.
#[derive(Debug, Default)]
pub struct CacheTable {
    slots: Vec<Slot>,
    resident: BitVec,
    data_volume: u64,
    item_count: u64,
}

impl CacheTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of positions, including empty ones.
    pub fn len(&self) -> u64 {
        self.slots.len() as u64
    }

    /// Returns true if the table has no positions.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of occupied positions.
    pub fn item_count(&self) -> u64 {
        self.item_count
    }

    /// Returns the item at `position`, if cached.
    pub fn get(&self, position: u64) -> Option<&IndexItem> {
        match self.slots.get(position as usize) {
            Some(Slot::Item(item)) => Some(item),
            _ => None,
        }
    }

    /// Stores `item` at `position`, growing the table and replacing any
    /// previous entry.
    pub fn insert(&mut self, position: u64, item: IndexItem) {
        let index = position as usize;
        if index >= self.slots.len() {
            self.slots.resize(index + 1, Slot::Empty);
            self.resident.resize(index + 1, false);
        }

        self.vacate(index);
        if let Some(payload) = &item.payload {
            self.data_volume += payload.len() as u64;
            self.resident.set(index, true);
        }
        self.slots[index] = Slot::Item(item);
        self.item_count += 1;
    }

    /// Attaches a loaded payload to a hollow entry.
    fn materialize(&mut self, position: u64, payload: Payload) -> bool {
        let index = position as usize;
        match self.slots.get_mut(index) {
            Some(Slot::Item(item)) if item.payload.is_none() => {
                self.data_volume += payload.len() as u64;
                item.payload = Some(payload);
                self.resident.set(index, true);
                true
            }
            _ => false,
        }
    }

    /// Empties the slot at `index`, undoing its accounting.
    fn vacate(&mut self, index: usize) -> Option<IndexItem> {
        let slot = std::mem::take(self.slots.get_mut(index)?);
        match slot {
            Slot::Empty => None,
            Slot::Item(item) => {
                if let Some(payload) = &item.payload {
                    self.data_volume -= payload.len() as u64;
                    self.resident.set(index, false);
                }
                self.item_count -= 1;
                Some(item)
            }
        }
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.resident.clear();
        self.data_volume = 0;
        self.item_count = 0;
    }

    /// Index timestamp of the lowest cached position.
    pub fn first_time(&self) -> Option<Timestamp> {
        self.slots.iter().find_map(|slot| match slot {
            Slot::Item(item) => Some(item.index_timestamp),
            Slot::Empty => None,
        })
    }

    /// Index timestamp of the highest cached position.
    pub fn last_time(&self) -> Option<Timestamp> {
        self.slots.iter().rev().find_map(|slot| match slot {
            Slot::Item(item) => Some(item.index_timestamp),
            Slot::Empty => None,
        })
    }
}

impl EvictableCache for CacheTable {
    fn hollow(&mut self, position: u64) -> bool {
        let index = position as usize;
        match self.slots.get_mut(index) {
            Some(Slot::Item(item)) => match item.hollow() {
                Some(payload) => {
                    self.data_volume -= payload.len() as u64;
                    self.resident.set(index, false);
                    true
                }
                None => false,
            },
            _ => false,
        }
    }

    fn remove(&mut self, position: u64) -> bool {
        self.vacate(position as usize).is_some()
    }

    fn data_volume(&self) -> u64 {
        self.data_volume
    }

    fn is_resident(&self, position: u64) -> bool {
        self.resident
            .get(position as usize)
            .map(|bit| *bit)
            .unwrap_or(false)
    }
}

/// Item cache of one store.
pub struct ItemCache {
    table: CacheTable,
    policy: Box<dyn EvictionPolicy>,
}

impl Default for ItemCache {
    fn default() -> Self {
        Self::new(Box::new(NoEviction))
    }
}

impl ItemCache {
    /// Creates an empty cache governed by `policy`.
    pub fn new(policy: Box<dyn EvictionPolicy>) -> Self {
        Self {
            table: CacheTable::new(),
            policy,
        }
    }

    /// Caches `item` at `position` and returns the table length.
    pub fn add_item(&mut self, item: IndexItem, position: u64) -> u64 {
        self.notify("add begin", |policy, table| policy.on_add_begin(table, position));
        self.table.insert(position, item);
        self.notify("add end", |policy, table| policy.on_add_end(table, position));
        self.table.len()
    }

    /// Returns the item at `position`, loading it from `source` on a miss.
    ///
    /// With `with_payload`, a hollow entry is re-materialized first.
    ///
    /// # Errors
    ///
    /// Returns `PositionOutOfBounds` if the source holds no such position
    /// and any error the source reports while loading.
    pub fn get_item(
        &mut self,
        position: u64,
        with_payload: bool,
        source: &mut dyn ItemSource,
    ) -> Result<IndexItem> {
        self.notify("get begin", |policy, table| policy.on_get_begin(table, position));
        let item = self.fetch(position, with_payload, source)?;
        self.notify("get end", |policy, table| policy.on_get_end(table, position));
        Ok(item)
    }

    fn fetch(
        &mut self,
        position: u64,
        with_payload: bool,
        source: &mut dyn ItemSource,
    ) -> Result<IndexItem> {
        if let Some(cached) = self.table.get(position) {
            if !with_payload || cached.payload.is_some() {
                return Ok(cached.clone());
            }
            let payload = source.load_payload(cached)?;
            self.table.materialize(position, payload);
            return self
                .table
                .get(position)
                .cloned()
                .ok_or(TimeIndexError::PositionOutOfBounds {
                    position,
                    length: self.table.len(),
                });
        }

        let length = source.item_count();
        if position >= length {
            return Err(TimeIndexError::PositionOutOfBounds { position, length });
        }
        let item = source.load_item(position, with_payload)?;
        self.table.insert(position, item.clone());
        Ok(item)
    }

    /// Returns true if the payload at `position` is materialized.
    pub fn contains_item(&self, position: u64) -> bool {
        self.table.is_resident(position)
    }

    /// Returns the cached entry at `position` without loading anything.
    pub fn peek(&self, position: u64) -> Option<&IndexItem> {
        self.table.get(position)
    }

    /// Drops the payload at `position`, keeping the record. Returns false if
    /// there was nothing to drop.
    pub fn hollow_item(&mut self, position: u64) -> bool {
        self.table.hollow(position)
    }

    /// Drops the entry at `position`. Returns false if it was empty.
    pub fn remove_item(&mut self, position: u64) -> bool {
        self.policy.on_remove(position);
        self.table.remove(position)
    }

    /// Drops every entry and resets the policy.
    pub fn clear(&mut self) {
        self.table.clear();
        self.policy.reset();
    }

    /// Bytes of materialized payload.
    pub fn data_volume(&self) -> u64 {
        self.table.data_volume()
    }

    /// Number of cached entries.
    pub fn item_count(&self) -> u64 {
        self.table.item_count()
    }

    /// Number of positions, including empty ones.
    pub fn len(&self) -> u64 {
        self.table.len()
    }

    /// Returns true if nothing has been cached.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Index timestamp of the lowest cached position.
    pub fn first_time(&self) -> Option<Timestamp> {
        self.table.first_time()
    }

    /// Index timestamp of the highest cached position.
    pub fn last_time(&self) -> Option<Timestamp> {
        self.table.last_time()
    }

    /// Runs a policy callback; faults are logged and dropped.
    fn notify<F>(&mut self, hook: &str, f: F)
    where
        F: FnOnce(&mut dyn EvictionPolicy, &mut dyn EvictableCache) -> Result<()>,
    {
        if let Err(e) = f(self.policy.as_mut(), &mut self.table) {
            warn!("Eviction policy failed on {}: {:?}", hook, e);
        }
    }
}
