//! Payload placement strategies.
//!
//! The engine writes every item record to the index file and hands the
//! payload to a [`PlacementStrategy`], which decides where the bytes go.

use super::buffer::{read_range, AppendFile};
use crate::error::{Result, TimeIndexError};
use crate::format::{Payload, Placement, ITEM_SIZE};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where payload bytes are written and read back from.
pub(crate) trait PlacementStrategy: Send {
    /// Placement implemented by this strategy.
    fn placement(&self) -> Placement;

    /// Offset the payload of an item recorded at `item_offset` will get.
    fn align_for_data(&self, item_offset: u64) -> u64;

    /// Stores `payload` and returns its data offset.
    fn process_data(&mut self, index: &mut AppendFile, payload: &[u8]) -> Result<u64>;

    /// Registers `size` payload bytes that are already where they belong
    /// and returns their data offset.
    fn reference_data(&mut self, size: u64) -> Result<u64> {
        Err(TimeIndexError::MissingPayload { size })
    }

    /// Reads `size` payload bytes at `offset`.
    fn read_data(
        &mut self,
        index: &mut AppendFile,
        offset: u64,
        size: u64,
        mmap_threshold: u64,
    ) -> Result<Payload>;

    /// Continues appending after an existing payload ending at `data_end`.
    fn resume(&mut self, _data_end: u64) {}

    /// Returns true if a payload range is fully present.
    fn holds(&self, index: &AppendFile, offset: u64, size: u64) -> bool;

    /// Makes written payload durable.
    fn flush(&mut self) -> Result<()>;

    /// Flushes and releases any data file.
    fn close(&mut self) -> Result<()>;
}

/// Payload directly follows its record in the index file.
pub(crate) struct Inline;

impl PlacementStrategy for Inline {
    fn placement(&self) -> Placement {
        Placement::Inline
    }

    fn align_for_data(&self, item_offset: u64) -> u64 {
        item_offset + ITEM_SIZE as u64
    }

    fn process_data(&mut self, index: &mut AppendFile, payload: &[u8]) -> Result<u64> {
        index.append(payload)
    }

    fn read_data(
        &mut self,
        index: &mut AppendFile,
        offset: u64,
        size: u64,
        mmap_threshold: u64,
    ) -> Result<Payload> {
        index.read_payload(offset, size, mmap_threshold)
    }

    fn holds(&self, index: &AppendFile, offset: u64, size: u64) -> bool {
        offset.saturating_add(size) <= index.len()
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Payload is appended to a data file owned by the store.
pub(crate) struct External {
    data: AppendFile,
}

impl External {
    pub(crate) fn new(data: AppendFile) -> Self {
        Self { data }
    }
}

impl PlacementStrategy for External {
    fn placement(&self) -> Placement {
        Placement::External
    }

    fn align_for_data(&self, _item_offset: u64) -> u64 {
        self.data.len()
    }

    fn process_data(&mut self, _index: &mut AppendFile, payload: &[u8]) -> Result<u64> {
        self.data.append(payload)
    }

    fn read_data(
        &mut self,
        _index: &mut AppendFile,
        offset: u64,
        size: u64,
        mmap_threshold: u64,
    ) -> Result<Payload> {
        self.data.read_payload(offset, size, mmap_threshold)
    }

    fn holds(&self, _index: &AppendFile, offset: u64, size: u64) -> bool {
        offset.saturating_add(size) <= self.data.len()
    }

    fn flush(&mut self) -> Result<()> {
        self.data.flush()
    }

    fn close(&mut self) -> Result<()> {
        debug!("Closing data file {}", self.data.path().display());
        self.data.flush()
    }
}

/// Payload lives in a data file produced by someone else.
///
/// Appends only advance the offset the next payload is expected at; the
/// data file is opened read-only on first read and never modified.
pub(crate) struct Shadow {
    path: PathBuf,
    reader: Option<File>,
    next_offset: u64,
}

impl Shadow {
    pub(crate) fn new(path: &Path, next_offset: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            reader: None,
            next_offset,
        }
    }

    fn reader(&mut self) -> Result<&File> {
        let file = match self.reader.take() {
            Some(file) => file,
            None => {
                debug!("Opening shadow data file {}", self.path.display());
                File::open(&self.path)?
            }
        };
        Ok(self.reader.insert(file))
    }
}

impl PlacementStrategy for Shadow {
    fn placement(&self) -> Placement {
        Placement::Shadow
    }

    fn align_for_data(&self, _item_offset: u64) -> u64 {
        self.next_offset
    }

    fn process_data(&mut self, _index: &mut AppendFile, payload: &[u8]) -> Result<u64> {
        self.reference_data(payload.len() as u64)
    }

    fn reference_data(&mut self, size: u64) -> Result<u64> {
        let offset = self.next_offset;
        self.next_offset += size;
        Ok(offset)
    }

    fn read_data(
        &mut self,
        _index: &mut AppendFile,
        offset: u64,
        size: u64,
        mmap_threshold: u64,
    ) -> Result<Payload> {
        let file = self.reader()?;
        read_range(file, offset, size, mmap_threshold)
    }

    fn resume(&mut self, data_end: u64) {
        self.next_offset = data_end;
    }

    fn holds(&self, _index: &AppendFile, _offset: u64, _size: u64) -> bool {
        true
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}
