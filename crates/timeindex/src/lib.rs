//! TimeIndex - Append-Only Time Index Store
//!
//! This crate stores time-stamped payloads (media frames, log records,
//! sensor samples) in append-only files with a fixed-size index record per
//! item, and keeps recently used items in an evicting in-memory cache.
//!
//! # Components
//!
//! - [`Timestamp`]: Tagged 64-bit timestamps (absolute or elapsed, several resolutions)
//! - [`Header`] / [`IndexItem`]: On-disk header and 52-byte item record codecs
//! - [`TimeIndex`]: Store handle combining the storage engine and the item cache
//! - [`ItemCache`] / [`EvictionPolicy`]: Position-indexed cache with pluggable eviction
//!
//! # Example
//!
//! ```rust,ignore
//! use timeindex::{Placement, StoreConfig, StoreSpec, TimeIndex, TimeRange, Timestamp};
//! use timeindex::{EvictAction, VolumePolicy};
//!
//! let spec = StoreSpec::new(dir, "camera-1")
//!     .with_config(StoreConfig::default().with_placement(Placement::External));
//!
//! // Bound resident payload to 64 MiB
//! let store = TimeIndex::create(&spec)?
//!     .with_policy(VolumePolicy::new(64 << 20, EvictAction::Hollow));
//!
//! store.add_item(frame, Timestamp::from_millis(40)?)?;
//!
//! let view = store.select(TimeRange::new(start, end))?;
//! for item in view.iter() {
//!     let item = item?;
//! }
//! store.close()?;
//! ```

#![deny(missing_docs)]

pub mod cache;
pub mod config;
pub mod error;
pub mod format;
mod io;
pub mod store;
pub mod timestamp;

pub use cache::{
    EvictAction, EvictableCache, EvictionPolicy, ItemCache, ItemSource, NoEviction,
    TimeoutPolicy, VolumePolicy, VolumeTimeoutPolicy, WindowPolicy,
};
pub use config::{HeaderPlacement, StoreConfig, StoreSpec, SyncMode};
pub use error::{Result, TimeIndexError};
pub use format::{FileType, Header, IndexItem, Payload, Placement};
pub use store::{NewItem, TimeIndex, View};
pub use timestamp::{Scale, TimeRange, Timestamp};
