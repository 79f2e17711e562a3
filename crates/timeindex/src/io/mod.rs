//! Storage engine for one logical store.
//!
//! The engine owns the store's files and the header. Item records always go
//! to the index file; a [`PlacementStrategy`] decides where payload bytes go.
//!
//! ## Index File Layouts
//!
//! ```text
//! Separate header (.tih):   [magic][item][item]...
//! Leading header:           [magic][header][item][item]...
//! Trailing header:          [magic][item][item]...[header][trailer]
//! ```
//!
//! With inline placement each item record is directly followed by its
//! payload, so record offsets are found by scanning the file at open. Other
//! placements keep records contiguous and compute offsets.
//!
//! ## Recovery
//!
//! A store whose header is not marked terminated was not closed cleanly.
//! Opening it for writing adopts every complete record found past the
//! header's item count, then cuts off any torn tail.

mod buffer;
mod lock;
mod placement;

pub(crate) use buffer::PAYLOAD_LIMIT;

use crate::config::{HeaderPlacement, StoreConfig, StoreSpec, SyncMode};
use crate::error::{Result, TimeIndexError};
use crate::format::{
    read_magic, FileType, Header, IndexItem, Payload, Placement, Trailer, ITEM_SIZE, MAGIC_SIZE,
    TRAILER_SIZE,
};
use buffer::AppendFile;
use lock::WriteLock;
use placement::{External, Inline, PlacementStrategy, Shadow};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Offsets of item records in the index file.
enum ItemOffsets {
    /// Records are contiguous from `first`.
    Fixed { first: u64 },
    /// Records interleaved with payload; one offset per position.
    Scanned(Vec<u64>),
}

impl ItemOffsets {
    fn get(&self, position: u64) -> Option<u64> {
        match self {
            Self::Fixed { first } => position
                .checked_mul(ITEM_SIZE as u64)
                .and_then(|offset| offset.checked_add(*first)),
            Self::Scanned(offsets) => usize::try_from(position)
                .ok()
                .and_then(|index| offsets.get(index))
                .copied(),
        }
    }

    fn clear(&mut self) {
        if let Self::Scanned(offsets) = self {
            offsets.clear();
        }
    }

    fn push(&mut self, offset: u64) {
        if let Self::Scanned(offsets) = self {
            offsets.push(offset);
        }
    }
}

/// Reads and writes the items of one store.
pub(crate) struct StorageEngine {
    header: Header,
    header_placement: HeaderPlacement,
    /// Open `.tih` file for a separate header.
    header_file: Option<File>,
    index: AppendFile,
    strategy: Box<dyn PlacementStrategy>,
    offsets: ItemOffsets,
    /// Offset the next record is written at.
    next_item_offset: u64,
    /// Offset of a trailing header currently on disk.
    trailer_at: Option<u64>,
    /// Space taken by a leading header, fixed at create.
    reserved_header_len: u64,
    config: StoreConfig,
    lock: Option<WriteLock>,
    read_only: bool,
    closed: bool,
}

impl StorageEngine {
    /// Creates a new, empty store, replacing any files at the spec's paths.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyWriteLocked` if another writer holds the store.
    pub(crate) fn create(spec: &StoreSpec) -> Result<Self> {
        let config = spec.config.clone();
        let placement = config.placement;
        let header_placement = config.header_placement;
        let index_path = spec.index_path(placement);
        let header_path = spec.header_path();
        let data_path = spec.data_path();

        let lock = match header_placement {
            HeaderPlacement::Separate => WriteLock::acquire(&header_path)?,
            HeaderPlacement::Leading | HeaderPlacement::Trailing => {
                if header_path.exists() {
                    debug!("Removing stale header file {}", header_path.display());
                    fs::remove_file(&header_path)?;
                }
                WriteLock::acquire(&index_path)?
            }
        };

        let store_id = spec.resolve_store_id(SystemTime::now());
        let mut header = Header::new(store_id, spec.name.clone(), placement);
        if let Some(description) = &spec.description {
            header.extensions.descriptions.push((0, description.clone()));
        }
        header.extensions.data_types = spec.data_types.clone();
        header.extensions.references = spec.references.clone();
        if placement.has_data_file() {
            header.extensions.data_path = Some(data_path.to_string_lossy().into_owned());
            if placement == Placement::Shadow || !config.data_file_header {
                header.extensions.no_data_file_header = Some(true);
            }
        }

        let mut index = AppendFile::create(
            &index_path,
            config.buffer_count,
            config.buffer_size,
            config.sync_mode,
        )?;
        index.append(&placement.index_file_type().magic())?;

        let mut reserved_header_len = 0;
        header.first_item_offset = MAGIC_SIZE as u64;
        if header_placement == HeaderPlacement::Leading {
            reserved_header_len = header.encoded_len() as u64;
            header.first_item_offset += reserved_header_len;
            index.append(&header.to_bytes(FileType::Header)?)?;
        }

        let strategy: Box<dyn PlacementStrategy> = match placement {
            Placement::Inline => Box::new(Inline),
            Placement::External => {
                let mut data = AppendFile::create(
                    &data_path,
                    config.buffer_count,
                    config.buffer_size,
                    config.sync_mode,
                )?;
                if header.has_data_file_header() {
                    data.append(&header.to_bytes(FileType::ExternalData)?)?;
                }
                Box::new(External::new(data))
            }
            Placement::Shadow => Box::new(Shadow::new(&data_path, 0)),
        };

        let header_file = match header_placement {
            HeaderPlacement::Separate => Some(open_header_file(&header_path)?),
            _ => None,
        };

        let offsets = match placement {
            Placement::Inline => ItemOffsets::Scanned(Vec::new()),
            _ => ItemOffsets::Fixed {
                first: header.first_item_offset,
            },
        };

        let mut engine = Self {
            next_item_offset: header.first_item_offset,
            header,
            header_placement,
            header_file,
            index,
            strategy,
            offsets,
            trailer_at: None,
            reserved_header_len,
            config,
            lock: Some(lock),
            read_only: false,
            closed: false,
        };
        engine.flush()?;

        debug!(
            "Created store {} ({:?} placement, {:?} header) at {}",
            engine.header.identity(),
            placement,
            header_placement,
            engine.index.path().display()
        );
        Ok(engine)
    }

    /// Opens an existing store for appending.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyWriteLocked` if another writer holds the store,
    /// `IdentityMismatch` if the files belong to a different store, and
    /// format faults for damaged files.
    pub(crate) fn open(spec: &StoreSpec) -> Result<Self> {
        Self::open_with(spec, false)
    }

    /// Opens an existing store for reading. No lock is taken.
    pub(crate) fn open_read_only(spec: &StoreSpec) -> Result<Self> {
        Self::open_with(spec, true)
    }

    fn open_with(spec: &StoreSpec, read_only: bool) -> Result<Self> {
        let config = spec.config.clone();
        let separate_path = spec.header_path();

        let mut lock = None;
        let mut header_file = None;
        let separate = if separate_path.exists() {
            if !read_only {
                lock = Some(WriteLock::acquire(&separate_path)?);
                header_file = Some(open_header_file(&separate_path)?);
            }
            let mut file = File::open(&separate_path)?;
            Some(Header::read_expecting(&mut file, FileType::Header)?)
        } else {
            None
        };

        let index_path = match &separate {
            Some(header) => spec.index_path(header.placement),
            None => spec
                .index_candidates()
                .into_iter()
                .find(|path| path.exists())
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no index file for store at {}", spec.base.display()),
                    )
                })?,
        };

        if !read_only && lock.is_none() {
            lock = Some(WriteLock::acquire(&index_path)?);
        }

        let mut index = if read_only {
            AppendFile::open_read_only(&index_path)?
        } else {
            AppendFile::open(
                &index_path,
                config.buffer_count,
                config.buffer_size,
                config.sync_mode,
            )?
        };

        let index_type = read_magic(&mut index.reader_at(0)?)?;
        let (header, header_placement, trailer_at) = match separate {
            Some(header) => (header, HeaderPlacement::Separate, None),
            None => match probe_trailer(&mut index)? {
                Some(trailer) => {
                    let header = Header::read_expecting(
                        &mut index.reader_at(trailer.header_offset)?,
                        FileType::Header,
                    )?;
                    (header, HeaderPlacement::Trailing, Some(trailer.header_offset))
                }
                None => {
                    let header = Header::read_expecting(
                        &mut index.reader_at(MAGIC_SIZE as u64)?,
                        FileType::Header,
                    )?;
                    (header, HeaderPlacement::Leading, None)
                }
            },
        };

        let header_path = match header_placement {
            HeaderPlacement::Separate => separate_path,
            _ => index_path.clone(),
        };
        header.verify_identity(spec.store_id, &spec.name, &header_path)?;

        let placement = header.placement;
        if index_type != placement.index_file_type() {
            return Err(TimeIndexError::UnexpectedFileType {
                expected: placement.index_file_type() as u8,
                actual: index_type as u8,
            });
        }

        let data_path = match (&spec.data_path, &header.extensions.data_path) {
            (Some(path), _) => path.clone(),
            (None, Some(path)) => PathBuf::from(path),
            (None, None) => spec.data_path(),
        };
        let strategy: Box<dyn PlacementStrategy> = match placement {
            Placement::Inline => Box::new(Inline),
            Placement::External => {
                let mut data = if read_only {
                    AppendFile::open_read_only(&data_path)?
                } else {
                    AppendFile::open(
                        &data_path,
                        config.buffer_count,
                        config.buffer_size,
                        config.sync_mode,
                    )?
                };
                if header.has_data_file_header() {
                    let data_header =
                        Header::read_expecting(&mut data.reader_at(0)?, FileType::ExternalData)?;
                    data_header.verify_identity(Some(header.store_id), &header.name, &data_path)?;
                }
                Box::new(External::new(data))
            }
            Placement::Shadow => Box::new(Shadow::new(&data_path, 0)),
        };

        let reserved_header_len = match header_placement {
            HeaderPlacement::Leading => header.first_item_offset - MAGIC_SIZE as u64,
            _ => 0,
        };
        let offsets = match placement {
            Placement::Inline => ItemOffsets::Scanned(Vec::new()),
            _ => ItemOffsets::Fixed {
                first: header.first_item_offset,
            },
        };

        let mut engine = Self {
            next_item_offset: header.first_item_offset,
            header,
            header_placement,
            header_file,
            index,
            strategy,
            offsets,
            trailer_at,
            reserved_header_len,
            config,
            lock,
            read_only,
            closed: false,
        };
        let recovering = !read_only && !engine.header.terminated && engine.trailer_at.is_none();
        match engine.locate_items() {
            Ok(()) if !recovering || engine.next_item_offset <= engine.index.len() => {}
            Ok(()) => engine.rescan_items(),
            Err(e) if recovering && e.is_format_fault() => engine.rescan_items(),
            Err(e) => return Err(e),
        }

        if !read_only {
            if recovering {
                engine.recover()?;
            }
            engine.resume_data_offset()?;
            engine.header.terminated = false;
            if engine.trailer_at.is_none() {
                engine.persist_header()?;
            }
        }

        debug!(
            "Opened {:?} store {} with {} items{}",
            engine.strategy.placement(),
            engine.header.identity(),
            engine.header.item_count,
            if read_only { " (read-only)" } else { "" }
        );
        Ok(engine)
    }

    /// Finds the records the header accounts for.
    fn locate_items(&mut self) -> Result<()> {
        let count = self.header.item_count;
        match self.header.placement {
            Placement::Inline => {
                let mut offset = self.header.first_item_offset;
                for _ in 0..count {
                    let item = self.decode_at(offset)?;
                    self.offsets.push(offset);
                    offset = item.data_offset + item.data_size;
                }
                self.next_item_offset = offset;
            }
            Placement::External | Placement::Shadow => {
                self.next_item_offset = self.header.first_item_offset + count * ITEM_SIZE as u64;
            }
        }
        Ok(())
    }

    /// Forgets the items the header accounts for so that recovery rebuilds
    /// them from the records actually on disk.
    fn rescan_items(&mut self) {
        warn!(
            "Header of store {} claims {} items past the end of {}; rescanning",
            self.header.identity(),
            self.header.item_count,
            self.index.path().display()
        );
        self.header.reset_items();
        self.offsets.clear();
        self.next_item_offset = self.header.first_item_offset;
    }

    /// Adopts complete records written after the last persisted header.
    fn recover(&mut self) -> Result<()> {
        let end = self.index.len();
        let mut adopted = 0u64;

        while end.saturating_sub(self.next_item_offset) >= ITEM_SIZE as u64 {
            let offset = self.next_item_offset;
            let item = match self.decode_at(offset) {
                Ok(item) => item,
                Err(e) if e.is_format_fault() => break,
                Err(e) => return Err(e),
            };
            let next = match self.header.placement {
                Placement::Inline => {
                    if item.data_offset != offset + ITEM_SIZE as u64 {
                        break;
                    }
                    item.data_offset + item.data_size
                }
                Placement::External | Placement::Shadow => offset + ITEM_SIZE as u64,
            };
            if !self.strategy.holds(&self.index, item.data_offset, item.data_size) {
                break;
            }
            self.offsets.push(offset);
            self.header.record_item(&item, offset);
            self.next_item_offset = next;
            adopted += 1;
        }

        let torn = end.checked_sub(self.next_item_offset).ok_or_else(|| {
            TimeIndexError::CorruptHeader(format!(
                "item records end at {} past the index end at {}",
                self.next_item_offset, end
            ))
        })?;
        warn!(
            "Recovered unterminated store {}: adopted {} items, dropped {} torn bytes",
            self.header.identity(),
            adopted,
            torn
        );
        if torn > 0 {
            self.index.truncate(self.next_item_offset)?;
        }
        Ok(())
    }

    /// Points a shadow strategy past the last referenced payload.
    fn resume_data_offset(&mut self) -> Result<()> {
        if self.header.placement == Placement::Shadow && self.header.item_count > 0 {
            let last = self.read_item(self.header.item_count - 1, false)?;
            self.strategy.resume(last.data_offset + last.data_size);
        }
        Ok(())
    }

    /// Number of items in the store.
    pub(crate) fn len(&self) -> u64 {
        self.header.item_count
    }

    /// Current header.
    pub(crate) fn header(&self) -> &Header {
        &self.header
    }

    /// Offset the next item record will be written at.
    pub(crate) fn append_offset(&self) -> u64 {
        self.next_item_offset
    }

    /// Returns true if the store was opened read-only.
    pub(crate) fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Appends `item`, assigning its data offset and size.
    ///
    /// A hollow item keeps its declared `data_size` on a shadow store, where
    /// the bytes are already in the foreign data file. Elsewhere it must
    /// declare an empty payload. Returns the number of bytes the item
    /// occupies (record plus payload).
    ///
    /// Nothing on disk and nothing in `item` changes if the record cannot be
    /// encoded.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnly` or `Closed` for handles that cannot write,
    /// `PayloadTooLarge` for unaddressable payloads, `MissingPayload` for a
    /// hollow item outside a shadow store and `TimestampOverflow` for
    /// timestamps that do not fit their variant.
    pub(crate) fn write_item(&mut self, item: &mut IndexItem) -> Result<u64> {
        self.check_writable()?;

        let payload = item.payload.clone();
        let size = match &payload {
            Some(bytes) => bytes.len() as u64,
            None if item.data_size == 0 || self.header.placement == Placement::Shadow => {
                item.data_size
            }
            None => {
                return Err(TimeIndexError::MissingPayload {
                    size: item.data_size,
                })
            }
        };
        if size >= PAYLOAD_LIMIT {
            return Err(TimeIndexError::PayloadTooLarge {
                size,
                limit: PAYLOAD_LIMIT,
            });
        }

        let item_offset = self.next_item_offset;
        let mut staged = item.to_hollow();
        staged.data_offset = self.strategy.align_for_data(item_offset);
        staged.data_size = size;
        let record = staged.encode()?;

        if let Some(at) = self.trailer_at.take() {
            self.index.truncate(at)?;
        }

        self.index.append(&record)?;
        let stored = match payload.as_deref() {
            None if size > 0 => self.strategy.reference_data(size),
            bytes => self.strategy.process_data(&mut self.index, bytes.unwrap_or(&[])),
        };
        match stored {
            Ok(data_offset) => debug_assert_eq!(data_offset, staged.data_offset),
            Err(e) => {
                if let Err(undo) = self.index.truncate(item_offset) {
                    warn!("Failed to drop record at {}: {:?}", item_offset, undo);
                } else if self.header_placement == HeaderPlacement::Trailing {
                    if let Err(undo) = self.persist_header() {
                        warn!("Failed to restore trailing header: {:?}", undo);
                    }
                }
                return Err(e);
            }
        }

        item.data_offset = staged.data_offset;
        item.data_size = size;
        self.offsets.push(item_offset);
        self.next_item_offset = self.index.len();
        self.header.record_item(item, item_offset);
        Ok(ITEM_SIZE as u64 + size)
    }

    /// Reads the item at `position`, with its payload if asked.
    ///
    /// # Errors
    ///
    /// Returns `PositionOutOfBounds` past the end of the store and
    /// `TruncatedItem` if the record or payload is cut short on disk.
    pub(crate) fn read_item(&mut self, position: u64, with_payload: bool) -> Result<IndexItem> {
        if self.closed {
            return Err(TimeIndexError::Closed);
        }
        let length = self.len();
        let offset = match self.offsets.get(position) {
            Some(offset) if position < length => offset,
            _ => return Err(TimeIndexError::PositionOutOfBounds { position, length }),
        };

        let mut item = self.decode_at(offset)?;
        if with_payload {
            item.payload = Some(self.read_payload(&item)?);
        }
        Ok(item)
    }

    /// Reads the payload an item record points at.
    pub(crate) fn read_payload(&mut self, item: &IndexItem) -> Result<Payload> {
        if item.data_size >= PAYLOAD_LIMIT {
            return Err(TimeIndexError::PayloadTooLarge {
                size: item.data_size,
                limit: PAYLOAD_LIMIT,
            });
        }
        self.strategy.read_data(
            &mut self.index,
            item.data_offset,
            item.data_size,
            self.config.mmap_threshold,
        )
    }

    fn decode_at(&mut self, offset: u64) -> Result<IndexItem> {
        let bytes = self.index.read_at(offset, ITEM_SIZE)?;
        IndexItem::decode(&bytes, offset, self.config.units_per_second)
    }

    /// Writes and syncs payload, then item records, then the header.
    ///
    /// The header never accounts for records that are not yet on disk.
    pub(crate) fn flush(&mut self) -> Result<()> {
        self.check_writable()?;
        self.strategy.flush()?;
        self.index.flush()?;
        self.persist_header()?;
        if self.header_placement != HeaderPlacement::Separate {
            self.index.flush()?;
        }
        debug!(
            "Flushed store {} ({} items)",
            self.header.identity(),
            self.header.item_count
        );
        Ok(())
    }

    /// Marks the store terminated, persists everything and releases the
    /// write lock. Returns the final size of the index file.
    ///
    /// Every step runs even if an earlier one fails, except that the header
    /// is not rewritten once payload or records failed to reach the disk.
    /// The first error is returned.
    pub(crate) fn close(&mut self) -> Result<u64> {
        if self.closed {
            return Err(TimeIndexError::Closed);
        }
        self.closed = true;

        let mut first_error = None;
        if !self.read_only {
            self.header.terminated = true;
            keep_first(&mut first_error, self.strategy.flush());
            keep_first(&mut first_error, self.index.flush());
            if first_error.is_none() {
                keep_first(&mut first_error, self.persist_header());
            }
            if self.header_placement != HeaderPlacement::Separate {
                keep_first(&mut first_error, self.index.flush());
            }
        }
        keep_first(&mut first_error, self.strategy.close());
        if let Some(lock) = self.lock.take() {
            keep_first(&mut first_error, lock.release());
        }
        self.header_file = None;

        debug!(
            "Closed store {} ({} items)",
            self.header.identity(),
            self.header.item_count
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(self.index.len()),
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.closed {
            return Err(TimeIndexError::Closed);
        }
        if self.read_only {
            return Err(TimeIndexError::ReadOnly);
        }
        Ok(())
    }

    /// Writes the header wherever this store keeps it.
    fn persist_header(&mut self) -> Result<()> {
        match self.header_placement {
            HeaderPlacement::Separate => {
                let bytes = self.header.to_bytes(FileType::Header)?;
                if let Some(file) = self.header_file.as_mut() {
                    file.seek(SeekFrom::Start(0))?;
                    file.write_all(&bytes)?;
                    file.set_len(bytes.len() as u64)?;
                    sync_file(file, self.config.sync_mode)?;
                }
            }
            HeaderPlacement::Leading => {
                let bytes = self.header.to_bytes(FileType::Header)?;
                if bytes.len() as u64 != self.reserved_header_len {
                    return Err(TimeIndexError::HeaderSizeChanged {
                        reserved: self.reserved_header_len,
                        actual: bytes.len() as u64,
                    });
                }
                self.index.write_at(MAGIC_SIZE as u64, &bytes)?;
            }
            HeaderPlacement::Trailing => {
                if let Some(at) = self.trailer_at.take() {
                    self.index.truncate(at)?;
                }
                let bytes = self.header.to_bytes(FileType::Header)?;
                let header_offset = self.index.append(&bytes)?;
                let trailer = Trailer {
                    header_size: bytes.len() as u64,
                    header_offset,
                };
                self.index.append(&trailer.to_bytes())?;
                self.trailer_at = Some(header_offset);
            }
        }
        Ok(())
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Best effort to persist the header and release the lock
        if !self.read_only {
            warn!("Store {} dropped without close", self.header.identity());
        }
        if let Err(e) = self.close() {
            warn!("Failed to close store on drop: {:?}", e);
        }
    }
}

fn open_header_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?)
}

fn sync_file(file: &File, sync_mode: SyncMode) -> Result<()> {
    match sync_mode {
        SyncMode::Fsync => file.sync_all()?,
        SyncMode::Fdatasync => file.sync_data()?,
        SyncMode::None => {}
    }
    Ok(())
}

fn probe_trailer(index: &mut AppendFile) -> Result<Option<Trailer>> {
    let len = index.len();
    if len < (MAGIC_SIZE + TRAILER_SIZE) as u64 {
        return Ok(None);
    }
    let bytes = index.read_at(len - TRAILER_SIZE as u64, TRAILER_SIZE)?;
    Ok(<[u8; TRAILER_SIZE]>::try_from(bytes.as_slice())
        .ok()
        .and_then(|buf| Trailer::probe(&buf, len)))
}

fn keep_first(slot: &mut Option<TimeIndexError>, result: Result<()>) {
    if let Err(e) = result {
        match slot {
            Some(_) => warn!("Additional error while closing store: {:?}", e),
            None => *slot = Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Placement;
    use crate::timestamp::{Scale, Timestamp};
    use tempfile::TempDir;

    fn spec(dir: &TempDir, placement: Placement, header: HeaderPlacement) -> StoreSpec {
        StoreSpec::new(dir.path(), "s1").with_config(
            StoreConfig::default()
                .with_placement(placement)
                .with_header_placement(header)
                .with_buffers(2, 128)
                .with_sync_mode(SyncMode::None),
        )
    }

    fn item(ms: i64, len: usize) -> IndexItem {
        let ts = Timestamp::from_millis(ms).unwrap();
        IndexItem::new(ts, ts, vec![(ms % 251) as u8; len])
    }

    /// Simulates a crash: buffered bytes reach the disk but the header is
    /// not rewritten.
    fn crash(mut engine: StorageEngine) {
        engine.strategy.flush().unwrap();
        engine.index.flush().unwrap();
        engine.lock.take().unwrap().release().unwrap();
        engine.closed = true;
    }

    #[test]
    fn test_create_write_read() {
        let dir = TempDir::new().unwrap();
        let mut engine =
            StorageEngine::create(&spec(&dir, Placement::Inline, HeaderPlacement::Separate))
                .unwrap();
        assert_eq!(engine.append_offset(), MAGIC_SIZE as u64);

        let mut first = item(100, 10);
        assert_eq!(engine.write_item(&mut first).unwrap(), 62);
        assert_eq!(first.data_offset, (MAGIC_SIZE + ITEM_SIZE) as u64);
        let mut second = item(200, 20);
        engine.write_item(&mut second).unwrap();
        assert_eq!(engine.append_offset(), (MAGIC_SIZE + 2 * ITEM_SIZE + 30) as u64);

        let read = engine.read_item(1, true).unwrap();
        assert_eq!(read, second);
        let hollow = engine.read_item(0, false).unwrap();
        assert!(hollow.is_hollow());
        assert_eq!(hollow.data_size, 10);

        assert!(matches!(
            engine.read_item(2, false),
            Err(TimeIndexError::PositionOutOfBounds {
                position: 2,
                length: 2
            })
        ));
        engine.close().unwrap();
    }

    #[test]
    fn test_reopen_each_header_placement() {
        for header_placement in [
            HeaderPlacement::Separate,
            HeaderPlacement::Leading,
            HeaderPlacement::Trailing,
        ] {
            for placement in [Placement::Inline, Placement::External] {
                let dir = TempDir::new().unwrap();
                let spec = spec(&dir, placement, header_placement);
                let mut engine = StorageEngine::create(&spec).unwrap();
                for (i, ms) in [100, 200, 300].into_iter().enumerate() {
                    engine.write_item(&mut item(ms, 10 * (i + 1))).unwrap();
                }
                let last_offset = engine.header().last_item_offset;
                engine.close().unwrap();

                let mut engine = StorageEngine::open(&spec).unwrap();
                assert_eq!(engine.header_placement, header_placement);
                assert_eq!(engine.len(), 3);
                assert_eq!(engine.header().last_item_offset, last_offset);
                for (i, ms) in [100, 200, 300].into_iter().enumerate() {
                    let read = engine.read_item(i as u64, true).unwrap();
                    assert_eq!(read.index_timestamp, Timestamp::from_millis(ms).unwrap());
                    assert_eq!(read.payload().unwrap(), &vec![(ms % 251) as u8; 10 * (i + 1)][..]);
                }

                // Appending after reopen continues the store.
                engine.write_item(&mut item(400, 5)).unwrap();
                engine.close().unwrap();
                let mut engine = StorageEngine::open_read_only(&spec).unwrap();
                assert_eq!(engine.len(), 4);
                assert_eq!(engine.read_item(3, true).unwrap().payload().unwrap(), &[149; 5]);
            }
        }
    }

    #[test]
    fn test_flush_persists_header() {
        let dir = TempDir::new().unwrap();
        let spec = spec(&dir, Placement::Inline, HeaderPlacement::Trailing);
        let mut engine = StorageEngine::create(&spec).unwrap();
        engine.write_item(&mut item(1, 3)).unwrap();
        engine.flush().unwrap();
        engine.write_item(&mut item(2, 3)).unwrap();
        engine.flush().unwrap();

        let mut reader = StorageEngine::open_read_only(&spec).unwrap();
        assert_eq!(reader.len(), 2);
        assert!(!reader.header().terminated);
        assert_eq!(reader.read_item(1, true).unwrap().payload().unwrap(), &[2, 2, 2]);
        engine.close().unwrap();
    }

    #[test]
    fn test_recover_unterminated_store() {
        let dir = TempDir::new().unwrap();
        let spec = spec(&dir, Placement::Inline, HeaderPlacement::Separate);
        let mut engine = StorageEngine::create(&spec).unwrap();
        for ms in 1..=3 {
            engine.write_item(&mut item(ms, 8)).unwrap();
        }
        engine.flush().unwrap();
        for ms in 4..=5 {
            engine.write_item(&mut item(ms, 8)).unwrap();
        }
        let complete_len = engine.append_offset();
        crash(engine);

        // Torn record at the tail.
        let index_path = spec.index_path(Placement::Inline);
        let mut bytes = fs::read(&index_path).unwrap();
        bytes.extend_from_slice(&[0x40; 20]);
        fs::write(&index_path, &bytes).unwrap();

        let mut engine = StorageEngine::open(&spec).unwrap();
        assert_eq!(engine.len(), 5);
        assert_eq!(engine.append_offset(), complete_len);
        assert_eq!(fs::metadata(&index_path).unwrap().len(), complete_len);
        assert_eq!(engine.read_item(4, true).unwrap().payload().unwrap(), &[5; 8]);
        engine.close().unwrap();
    }

    #[test]
    fn test_recover_external_requires_payload() {
        let dir = TempDir::new().unwrap();
        let spec = spec(&dir, Placement::External, HeaderPlacement::Separate);
        let mut engine = StorageEngine::create(&spec).unwrap();
        engine.write_item(&mut item(1, 8)).unwrap();
        engine.flush().unwrap();
        engine.write_item(&mut item(2, 8)).unwrap();
        crash(engine);

        // The payload of the second item never reached the data file.
        let data_path = spec.data_path();
        let len = fs::metadata(&data_path).unwrap().len();
        OpenOptions::new()
            .write(true)
            .open(&data_path)
            .unwrap()
            .set_len(len - 8)
            .unwrap();

        let engine = StorageEngine::open(&spec).unwrap();
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_leading_header_size_is_fixed() {
        let dir = TempDir::new().unwrap();
        let spec = spec(&dir, Placement::Inline, HeaderPlacement::Leading);
        let mut engine = StorageEngine::create(&spec).unwrap();
        engine
            .header
            .extensions
            .descriptions
            .push((0, "grown".to_string()));
        assert!(matches!(
            engine.flush(),
            Err(TimeIndexError::HeaderSizeChanged { .. })
        ));
        engine.header.extensions.descriptions.clear();
        engine.close().unwrap();
    }

    #[test]
    fn test_identity_mismatch() {
        let dir = TempDir::new().unwrap();
        let spec = spec(&dir, Placement::External, HeaderPlacement::Separate).with_store_id(7);
        StorageEngine::create(&spec).unwrap().close().unwrap();

        let wrong_id = spec.clone().with_store_id(8);
        assert!(matches!(
            StorageEngine::open(&wrong_id),
            Err(TimeIndexError::IdentityMismatch { .. })
        ));

        // A data file belonging to another store.
        let other = StoreSpec::new(dir.path(), "other")
            .with_store_id(9)
            .with_config(spec.config.clone());
        StorageEngine::create(&other).unwrap().close().unwrap();
        fs::copy(other.data_path(), spec.data_path()).unwrap();
        match StorageEngine::open(&spec) {
            Err(TimeIndexError::IdentityMismatch { path, .. }) => {
                assert_eq!(path, spec.data_path())
            }
            other => panic!("expected identity mismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_write_lock_and_read_only() {
        let dir = TempDir::new().unwrap();
        let spec = spec(&dir, Placement::Inline, HeaderPlacement::Leading);
        let mut writer = StorageEngine::create(&spec).unwrap();
        assert!(matches!(
            StorageEngine::open(&spec),
            Err(TimeIndexError::AlreadyWriteLocked(_))
        ));

        writer.write_item(&mut item(1, 4)).unwrap();
        writer.flush().unwrap();
        let mut reader = StorageEngine::open_read_only(&spec).unwrap();
        assert!(reader.is_read_only());
        assert!(matches!(
            reader.write_item(&mut item(2, 4)),
            Err(TimeIndexError::ReadOnly)
        ));
        assert_eq!(reader.len(), 1);
        reader.close().unwrap();

        writer.close().unwrap();
        assert!(matches!(writer.close(), Err(TimeIndexError::Closed)));
        StorageEngine::open(&spec).unwrap().close().unwrap();
    }

    #[test]
    fn test_time_order_flag_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let spec = spec(&dir, Placement::Inline, HeaderPlacement::Separate);
        let mut engine = StorageEngine::create(&spec).unwrap();
        engine.write_item(&mut item(200, 1)).unwrap();
        engine.write_item(&mut item(100, 1)).unwrap();
        engine.close().unwrap();

        let engine = StorageEngine::open_read_only(&spec).unwrap();
        assert!(!engine.header().in_time_order());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_flush_never_writes_header_ahead() {
        let Ok(full) = OpenOptions::new().write(true).open("/dev/full") else {
            return;
        };
        let dir = TempDir::new().unwrap();
        let spec = StoreSpec::new(dir.path(), "s1").with_config(
            StoreConfig::default()
                .with_placement(Placement::Inline)
                .with_header_placement(HeaderPlacement::Separate)
                .with_buffers(2, 64 * 1024)
                .with_sync_mode(SyncMode::None),
        );
        let mut engine = StorageEngine::create(&spec).unwrap();
        for ms in 1..=3 {
            engine.write_item(&mut item(ms, 10)).unwrap();
        }

        // Records cannot reach the disk, so the header must not claim them.
        let real = engine.index.replace_file(full);
        assert!(engine.flush().is_err());
        let on_disk = Header::read_expecting(
            &mut File::open(spec.header_path()).unwrap(),
            FileType::Header,
        )
        .unwrap();
        assert_eq!(on_disk.item_count, 0);
        assert_eq!(StorageEngine::open_read_only(&spec).unwrap().len(), 0);

        engine.index.replace_file(real);
        engine.flush().unwrap();
        let mut reader = StorageEngine::open_read_only(&spec).unwrap();
        assert_eq!(reader.len(), 3);
        assert_eq!(reader.read_item(2, true).unwrap().payload().unwrap(), &[3; 10]);
        engine.close().unwrap();
    }

    #[test]
    fn test_recover_header_ahead_of_records() {
        for placement in [Placement::Inline, Placement::External] {
            let dir = TempDir::new().unwrap();
            let spec = spec(&dir, placement, HeaderPlacement::Separate);
            let mut engine = StorageEngine::create(&spec).unwrap();
            for ms in 1..=3 {
                engine.write_item(&mut item(ms, 8)).unwrap();
            }
            engine.flush().unwrap();
            let third_record = engine.header().last_item_offset;
            crash(engine);

            // The header counts three records but the third lost its tail.
            let index_path = spec.index_path(placement);
            OpenOptions::new()
                .write(true)
                .open(&index_path)
                .unwrap()
                .set_len(third_record + 20)
                .unwrap();

            let mut engine = StorageEngine::open(&spec).unwrap();
            assert_eq!(engine.len(), 2);
            assert_eq!(engine.append_offset(), third_record);
            assert_eq!(fs::metadata(&index_path).unwrap().len(), third_record);
            assert_eq!(engine.header().last_time, Timestamp::from_millis(2).unwrap());
            assert!(matches!(
                engine.read_item(2, false),
                Err(TimeIndexError::PositionOutOfBounds { position: 2, length: 2 })
            ));

            engine.write_item(&mut item(4, 8)).unwrap();
            assert_eq!(engine.read_item(2, true).unwrap().payload().unwrap(), &[4; 8]);
            engine.close().unwrap();
        }
    }

    #[test]
    fn test_read_item_far_past_end() {
        for placement in [Placement::Inline, Placement::External] {
            let dir = TempDir::new().unwrap();
            let mut engine =
                StorageEngine::create(&spec(&dir, placement, HeaderPlacement::Separate)).unwrap();
            engine.write_item(&mut item(1, 4)).unwrap();
            for position in [1, u64::MAX / ITEM_SIZE as u64 + 1, u64::MAX] {
                assert!(matches!(
                    engine.read_item(position, false),
                    Err(TimeIndexError::PositionOutOfBounds { length: 1, .. })
                ));
            }
            engine.close().unwrap();
        }
    }

    #[test]
    fn test_unencodable_item_leaves_store_untouched() {
        let dir = TempDir::new().unwrap();
        let spec = spec(&dir, Placement::Inline, HeaderPlacement::Trailing);
        let mut engine = StorageEngine::create(&spec).unwrap();
        engine.write_item(&mut item(1, 4)).unwrap();
        engine.flush().unwrap();
        let index_len = engine.index.len();

        let mut bad = item(2, 4);
        bad.data_timestamp = Timestamp::Elapsed {
            scale: Scale::Second,
            negative: false,
            magnitude: u64::MAX,
        };
        assert!(matches!(
            engine.write_item(&mut bad),
            Err(TimeIndexError::TimestampOverflow { .. })
        ));
        assert_eq!((bad.data_offset, bad.data_size), (0, 4));
        assert_eq!(engine.index.len(), index_len);
        assert!(engine.trailer_at.is_some());

        assert_eq!(StorageEngine::open_read_only(&spec).unwrap().len(), 1);
        engine.close().unwrap();
    }

    #[test]
    fn test_hollow_item_outside_shadow_store() {
        let dir = TempDir::new().unwrap();
        let spec = spec(&dir, Placement::External, HeaderPlacement::Separate);
        let mut engine = StorageEngine::create(&spec).unwrap();

        let mut hollow = item(1, 6).to_hollow();
        assert!(matches!(
            engine.write_item(&mut hollow),
            Err(TimeIndexError::MissingPayload { size: 6 })
        ));
        assert_eq!(engine.len(), 0);
        assert_eq!(engine.append_offset(), MAGIC_SIZE as u64);
        engine.close().unwrap();
    }
}
