//! Index item records and payload handles.
//!
//! ```text
//! ┌────────────────────────────┬───────┐
//! │ Index timestamp            │ 8     │
//! │ Data timestamp             │ 8     │
//! │ Data offset                │ 8     │
//! │ Data size                  │ 8     │
//! │ Data type                  │ 4     │
//! │ Item ID                    │ 8     │
//! │ Annotation ID              │ 8     │
//! └────────────────────────────┴───────┘
//! ```

use crate::error::{Result, TimeIndexError};
use crate::timestamp::Timestamp;
use memmap2::Mmap;
use std::fmt;
use std::io::Read;
use std::ops::Deref;
use std::sync::Arc;

/// Size of one encoded item record in bytes.
pub const ITEM_SIZE: usize = 52;

/// Materialized payload bytes.
///
/// Cloning is cheap: both variants share their backing storage.
#[derive(Clone)]
pub enum Payload {
    /// Bytes copied onto the heap.
    Heap(Arc<[u8]>),
    /// Bytes served from a read-only memory map of the payload range.
    Mapped(Arc<Mmap>),
}

impl Payload {
    /// Returns the payload bytes.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Heap(bytes) => bytes,
            Self::Mapped(map) => map,
        }
    }

    /// Returns true if the bytes are served from a memory map.
    pub fn is_mapped(&self) -> bool {
        matches!(self, Self::Mapped(_))
    }
}

impl Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for Payload {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_mapped() { "Mapped" } else { "Heap" };
        write!(f, "Payload::{}({} bytes)", kind, self.len())
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for Payload {}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Heap(bytes.into())
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self::Heap(bytes.into())
    }
}

impl From<Mmap> for Payload {
    fn from(map: Mmap) -> Self {
        Self::Mapped(Arc::new(map))
    }
}

/// One entry of a time index.
///
/// The record fields are immutable once written. `payload` is `None` while
/// the item is hollow: the record still locates its bytes through
/// `data_offset` and `data_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexItem {
    /// Timestamp used for ordering and selection.
    pub index_timestamp: Timestamp,
    /// Timestamp carried by the payload itself.
    pub data_timestamp: Timestamp,
    /// Offset of the payload in the file that holds it.
    pub data_offset: u64,
    /// Payload length in bytes.
    pub data_size: u64,
    /// Data type ID.
    pub data_type: u32,
    /// Item ID.
    pub item_id: u64,
    /// Annotation ID.
    pub annotation_id: u64,
    /// Materialized payload, or `None` when hollow.
    pub payload: Option<Payload>,
}

impl IndexItem {
    /// Creates an item carrying `payload`. Offsets and IDs start at zero.
    pub fn new(
        index_timestamp: Timestamp,
        data_timestamp: Timestamp,
        payload: impl Into<Payload>,
    ) -> Self {
        let payload = payload.into();
        Self {
            index_timestamp,
            data_timestamp,
            data_offset: 0,
            data_size: payload.len() as u64,
            data_type: 0,
            item_id: 0,
            annotation_id: 0,
            payload: Some(payload),
        }
    }

    /// Returns the payload bytes if materialized.
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Returns true if the payload is not materialized.
    pub fn is_hollow(&self) -> bool {
        self.payload.is_none()
    }

    /// Drops the materialized payload, returning it.
    pub fn hollow(&mut self) -> Option<Payload> {
        self.payload.take()
    }

    /// Returns a copy of the record without payload.
    pub fn to_hollow(&self) -> Self {
        Self {
            payload: None,
            ..self.clone()
        }
    }

    /// Encodes the record.
    ///
    /// # Errors
    ///
    /// Returns `TimestampOverflow` if a timestamp does not fit its variant.
    pub fn encode(&self) -> Result<[u8; ITEM_SIZE]> {
        self.index_timestamp.validate()?;
        self.data_timestamp.validate()?;

        let mut buf = [0u8; ITEM_SIZE];
        // Index timestamp (8 bytes)
        buf[0..8].copy_from_slice(&self.index_timestamp.encode().to_be_bytes());
        // Data timestamp (8 bytes)
        buf[8..16].copy_from_slice(&self.data_timestamp.encode().to_be_bytes());
        // Data offset (8 bytes)
        buf[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        // Data size (8 bytes)
        buf[24..32].copy_from_slice(&self.data_size.to_be_bytes());
        // Data type (4 bytes)
        buf[32..36].copy_from_slice(&self.data_type.to_be_bytes());
        // Item ID (8 bytes)
        buf[36..44].copy_from_slice(&self.item_id.to_be_bytes());
        // Annotation ID (8 bytes)
        buf[44..52].copy_from_slice(&self.annotation_id.to_be_bytes());
        Ok(buf)
    }

    /// Decodes a hollow record from the start of `buf`.
    ///
    /// `offset` is the file offset of `buf`, used for error reports.
    ///
    /// # Errors
    ///
    /// Returns `TruncatedItem` if fewer than [`ITEM_SIZE`] bytes are
    /// available and `UnknownTimestampTag` for an undecodable timestamp.
    pub fn decode(buf: &[u8], offset: u64, units_per_second: u64) -> Result<Self> {
        if buf.len() < ITEM_SIZE {
            return Err(TimeIndexError::TruncatedItem {
                offset,
                needed: ITEM_SIZE as u64,
                available: buf.len() as u64,
            });
        }

        let word = |at: usize| u64::from_be_bytes(buf[at..at + 8].try_into().unwrap());
        Ok(Self {
            index_timestamp: Timestamp::decode_with_units(word(0), units_per_second)?,
            data_timestamp: Timestamp::decode_with_units(word(8), units_per_second)?,
            data_offset: word(16),
            data_size: word(24),
            data_type: u32::from_be_bytes(buf[32..36].try_into().unwrap()),
            item_id: word(36),
            annotation_id: word(44),
            payload: None,
        })
    }

    /// Reads a hollow record from `reader`, which is positioned at `offset`.
    pub fn read_from<R: Read>(reader: &mut R, offset: u64, units_per_second: u64) -> Result<Self> {
        let mut buf = Vec::with_capacity(ITEM_SIZE);
        reader.take(ITEM_SIZE as u64).read_to_end(&mut buf)?;
        Self::decode(&buf, offset, units_per_second)
    }
}
