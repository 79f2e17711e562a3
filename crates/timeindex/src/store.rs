//! Store handle.
//!
//! [`TimeIndex`] ties one storage engine to an [`ItemCache`]
//! behind a single mutex, so appends, reads and cache bookkeeping of a store
//! are serialized and positions are handed out in append order.
//!
//! # Example
//!
//! ```rust,ignore
//! use timeindex::{StoreSpec, TimeIndex, Timestamp};
//!
//! let store = TimeIndex::create(&StoreSpec::new(dir, "camera-1"))?;
//! let position = store.add_item(frame, Timestamp::from_millis(40)?)?;
//! let item = store.get_item(position)?;
//! store.close()?;
//! ```

use crate::cache::{EvictionPolicy, ItemCache, ItemSource};
use crate::config::StoreSpec;
use crate::error::{Result, TimeIndexError};
use crate::format::{Header, IndexItem, Payload};
use crate::io::StorageEngine;
use crate::timestamp::{TimeRange, Timestamp};
use parking_lot::Mutex;
use std::ops::Range;
use tracing::debug;

impl ItemSource for StorageEngine {
    fn load_item(&mut self, position: u64, with_payload: bool) -> Result<IndexItem> {
        self.read_item(position, with_payload)
    }

    fn load_payload(&mut self, item: &IndexItem) -> Result<Payload> {
        self.read_payload(item)
    }

    fn item_count(&self) -> u64 {
        self.len()
    }
}

/// An item to append, before the store assigns its position and offsets.
#[derive(Debug, Clone)]
pub struct NewItem {
    /// Timestamp the item is ordered and selected by.
    pub index_timestamp: Timestamp,
    /// Timestamp carried by the payload.
    pub data_timestamp: Timestamp,
    /// Data type ID.
    pub data_type: u32,
    /// Annotation ID.
    pub annotation_id: u64,
    /// Payload bytes, or `None` for bytes already in a shadow data file.
    pub payload: Option<Payload>,
    /// Payload length in bytes.
    pub data_size: u64,
}

impl NewItem {
    /// Creates an item whose index and data timestamps are both `timestamp`.
    pub fn new(payload: impl Into<Payload>, timestamp: Timestamp) -> Self {
        let payload = payload.into();
        Self {
            index_timestamp: timestamp,
            data_timestamp: timestamp,
            data_type: 0,
            annotation_id: 0,
            data_size: payload.len() as u64,
            payload: Some(payload),
        }
    }

    /// Creates an item for the next `data_size` bytes of a shadow store's
    /// data file, without holding the bytes in memory.
    ///
    /// Other placements reject such an item with `MissingPayload` unless
    /// `data_size` is zero.
    pub fn referencing(data_size: u64, timestamp: Timestamp) -> Self {
        Self {
            index_timestamp: timestamp,
            data_timestamp: timestamp,
            data_type: 0,
            annotation_id: 0,
            payload: None,
            data_size,
        }
    }

    /// Sets a data timestamp distinct from the index timestamp.
    pub fn with_data_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.data_timestamp = timestamp;
        self
    }

    /// Sets the data type ID.
    pub fn with_data_type(mut self, data_type: u32) -> Self {
        self.data_type = data_type;
        self
    }

    /// Sets the annotation ID.
    pub fn with_annotation(mut self, annotation_id: u64) -> Self {
        self.annotation_id = annotation_id;
        self
    }
}

struct Inner {
    engine: StorageEngine,
    cache: ItemCache,
    closed: bool,
}

impl Inner {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(TimeIndexError::Closed);
        }
        Ok(())
    }

    /// Index timestamp at `position`, from the cache when possible.
    fn index_time(&mut self, position: u64) -> Result<Timestamp> {
        if let Some(item) = self.cache.peek(position) {
            return Ok(item.index_timestamp);
        }
        Ok(self.engine.read_item(position, false)?.index_timestamp)
    }

    /// First position in `lo..hi` whose index timestamp is not before
    /// `bound`. Requires time-ordered items.
    fn partition_point(&mut self, mut lo: u64, mut hi: u64, bound: &Timestamp) -> Result<u64> {
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.index_time(mid)?.less_than(bound) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }
}

/// Handle to one open store.
///
/// All operations take `&self`; the handle is `Send + Sync` and may be
/// shared across threads.
pub struct TimeIndex {
    inner: Mutex<Inner>,
    identity: String,
}

impl TimeIndex {
    /// Creates a new store described by `spec`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyWriteLocked` if another handle is writing the store.
    pub fn create(spec: &StoreSpec) -> Result<Self> {
        Ok(Self::from_engine(StorageEngine::create(spec)?))
    }

    /// Opens an existing store for appending.
    ///
    /// # Errors
    ///
    /// Returns `IdentityMismatch` if the files do not belong to the store
    /// `spec` names, `AlreadyWriteLocked` if another handle is writing and
    /// format faults for damaged files.
    pub fn open(spec: &StoreSpec) -> Result<Self> {
        Ok(Self::from_engine(StorageEngine::open(spec)?))
    }

    /// Opens an existing store for reading only. No write lock is taken.
    pub fn open_read_only(spec: &StoreSpec) -> Result<Self> {
        Ok(Self::from_engine(StorageEngine::open_read_only(spec)?))
    }

    fn from_engine(engine: StorageEngine) -> Self {
        let identity = engine.header().identity();
        debug!(
            "Store {} ready with {} items, appending at offset {}",
            identity,
            engine.len(),
            engine.append_offset()
        );
        Self {
            inner: Mutex::new(Inner {
                engine,
                cache: ItemCache::default(),
                closed: false,
            }),
            identity,
        }
    }

    /// Replaces the eviction policy. Any cached items are dropped.
    pub fn with_policy(mut self, policy: impl EvictionPolicy + 'static) -> Self {
        self.inner.get_mut().cache = ItemCache::new(Box::new(policy));
        self
    }

    /// Store identity, `"<store id>/<name>"`.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Appends `payload` with `timestamp` as both index and data timestamp.
    /// Returns the item's position.
    pub fn add_item(&self, payload: impl Into<Payload>, timestamp: Timestamp) -> Result<u64> {
        self.add_item_with(NewItem::new(payload, timestamp))
    }

    /// Appends `new` and returns its position.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnly` for read-only handles, `Closed` after close,
    /// `TimestampOverflow` for unencodable timestamps, `PayloadTooLarge`
    /// for unaddressable payloads and `MissingPayload` for a size-only item
    /// outside a shadow store.
    pub fn add_item_with(&self, new: NewItem) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        let position = inner.engine.len();
        let mut item = IndexItem::new(new.index_timestamp, new.data_timestamp, Vec::new());
        item.payload = new.payload;
        item.data_size = new.data_size;
        item.data_type = new.data_type;
        item.annotation_id = new.annotation_id;
        item.item_id = position;

        inner.engine.write_item(&mut item)?;
        inner.cache.add_item(item, position);
        Ok(position)
    }

    /// Returns the item at `position` with its payload.
    ///
    /// # Errors
    ///
    /// Returns `PositionOutOfBounds` past the end of the store.
    pub fn get_item(&self, position: u64) -> Result<IndexItem> {
        let mut guard = self.inner.lock();
        guard.check_open()?;
        let inner = &mut *guard;
        inner.cache.get_item(position, true, &mut inner.engine)
    }

    /// Returns the record at `position` without its payload.
    ///
    /// Nothing is loaded into or evicted from the cache.
    pub fn get_item_info(&self, position: u64) -> Result<IndexItem> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        if let Some(item) = inner.cache.peek(position) {
            return Ok(item.to_hollow());
        }
        inner.engine.read_item(position, false)
    }

    /// Returns true if the payload at `position` is held in memory.
    pub fn contains_item(&self, position: u64) -> bool {
        self.inner.lock().cache.contains_item(position)
    }

    /// Drops the cached payload at `position`, keeping its record. Returns
    /// false if no payload was held.
    pub fn hollow_item(&self, position: u64) -> bool {
        self.inner.lock().cache.hollow_item(position)
    }

    /// Drops the cache entry at `position`. The item stays in the store.
    pub fn remove_item(&self, position: u64) -> bool {
        self.inner.lock().cache.remove_item(position)
    }

    /// Selects the items whose index timestamp falls in `range`.
    ///
    /// Time-ordered stores are binary searched; others are scanned.
    pub fn select(&self, range: TimeRange) -> Result<View<'_>> {
        let mut inner = self.inner.lock();
        inner.check_open()?;

        let len = inner.engine.len();
        let positions = if range.is_empty() || len == 0 {
            Positions::Span(0..0)
        } else if inner.engine.header().in_time_order() {
            let start = inner.partition_point(0, len, &range.start)?;
            let end = inner.partition_point(start, len, &range.end)?;
            Positions::Span(start..end)
        } else {
            debug!("Scanning {} items of unordered store {}", len, self.identity);
            let mut listed = Vec::new();
            for position in 0..len {
                if range.contains(&inner.index_time(position)?) {
                    listed.push(position);
                }
            }
            Positions::Listed(listed)
        };

        Ok(View {
            store: self,
            range,
            positions,
        })
    }

    /// Number of items in the store.
    pub fn len(&self) -> u64 {
        self.inner.lock().engine.len()
    }

    /// Returns true if the store holds no items.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the current header.
    pub fn header(&self) -> Header {
        self.inner.lock().engine.header().clone()
    }

    /// Returns true if the handle cannot append.
    pub fn is_read_only(&self) -> bool {
        self.inner.lock().engine.is_read_only()
    }

    /// Bytes of payload held in memory.
    pub fn data_volume(&self) -> u64 {
        self.inner.lock().cache.data_volume()
    }

    /// Number of cached items, hollow or not.
    pub fn cached_count(&self) -> u64 {
        self.inner.lock().cache.item_count()
    }

    /// Index timestamp of the earliest cached position.
    pub fn first_time(&self) -> Option<Timestamp> {
        self.inner.lock().cache.first_time()
    }

    /// Index timestamp of the latest cached position.
    pub fn last_time(&self) -> Option<Timestamp> {
        self.inner.lock().cache.last_time()
    }

    /// Writes buffered items and the header to disk.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.engine.flush()
    }

    /// Closes the store and returns the final index file size.
    ///
    /// Later calls on this handle fail with `Closed`.
    pub fn close(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.check_open()?;
        inner.closed = true;
        inner.cache.clear();
        inner.engine.close()
    }
}

enum Positions {
    Span(Range<u64>),
    Listed(Vec<u64>),
}

/// Items of a store selected by time.
pub struct View<'a> {
    store: &'a TimeIndex,
    range: TimeRange,
    positions: Positions,
}

impl<'a> View<'a> {
    /// Time range the view was selected with.
    pub fn range(&self) -> TimeRange {
        self.range
    }

    /// Number of selected items.
    pub fn len(&self) -> usize {
        match &self.positions {
            Positions::Span(span) => (span.end - span.start) as usize,
            Positions::Listed(listed) => listed.len(),
        }
    }

    /// Returns true if nothing was selected.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Positions of the selected items in store order.
    pub fn positions(&self) -> impl Iterator<Item = u64> + '_ {
        let (span, listed) = match &self.positions {
            Positions::Span(span) => (Some(span.clone()), None),
            Positions::Listed(listed) => (None, Some(listed.iter().copied())),
        };
        span.into_iter().flatten().chain(listed.into_iter().flatten())
    }

    /// Fetches the selected items, with payload, as the iterator advances.
    pub fn iter(&self) -> impl Iterator<Item = Result<IndexItem>> + '_ {
        let store = self.store;
        self.positions().map(move |position| store.get_item(position))
    }
}
