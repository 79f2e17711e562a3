//! Buffered append-only files.
//!
//! Appends land in a small ring of fixed-size buffers. A full buffer is
//! queued as pending and the next free one becomes active; pending buffers
//! reach the file when the ring runs out, on [`AppendFile::flush`], or when a
//! read touches bytes that only exist in memory.
//!
//! ```text
//!   file: [ durable bytes ][ pending 0 ][ pending 1 ][ active ]
//!         0            durable                            len
//! ```

use crate::config::SyncMode;
use crate::error::{Result, TimeIndexError};
use crate::format::Payload;
use memmap2::MmapOptions;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Take, Write};
use std::path::{Path, PathBuf};
use tracing::trace;

/// Exclusive upper bound on a single payload.
pub(crate) const PAYLOAD_LIMIT: u64 = isize::MAX as u64;

/// Fixed set of write buffers.
struct FlushRing {
    active: Vec<u8>,
    pending: VecDeque<Vec<u8>>,
    free: Vec<Vec<u8>>,
    buffer_size: usize,
    buffer_count: usize,
}

impl FlushRing {
    fn new(buffer_count: usize, buffer_size: usize) -> Self {
        let buffer_count = buffer_count.max(1);
        let buffer_size = buffer_size.max(1);
        Self {
            active: Vec::with_capacity(buffer_size),
            pending: VecDeque::with_capacity(buffer_count),
            free: Vec::with_capacity(buffer_count),
            buffer_size,
            buffer_count,
        }
    }

    /// Bytes held in memory.
    fn buffered(&self) -> u64 {
        self.pending.iter().map(|b| b.len() as u64).sum::<u64>() + self.active.len() as u64
    }

    fn is_empty(&self) -> bool {
        self.active.is_empty() && self.pending.is_empty()
    }

    /// Returns true once every buffer of the ring is full.
    fn is_exhausted(&self) -> bool {
        self.pending.len() + 1 >= self.buffer_count
    }

    /// Queues the active buffer and takes a free one in its place.
    fn rotate(&mut self) {
        let fresh = self
            .free
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_size));
        let full = std::mem::replace(&mut self.active, fresh);
        self.pending.push_back(full);
    }

    /// Returns a drained buffer to the free list.
    fn recycle(&mut self, mut buf: Vec<u8>) {
        buf.clear();
        if self.free.len() < self.buffer_count {
            self.free.push(buf);
        }
    }
}

/// An append-only file with a buffered tail.
pub(crate) struct AppendFile {
    file: File,
    path: PathBuf,
    /// Logical length including buffered bytes.
    len: u64,
    /// Bytes below this offset are in the file.
    durable: u64,
    ring: FlushRing,
    sync_mode: SyncMode,
    writable: bool,
}

impl AppendFile {
    /// Creates (or truncates) `path` for appending.
    pub(crate) fn create(
        path: &Path,
        buffer_count: usize,
        buffer_size: usize,
        sync_mode: SyncMode,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self::from_file(file, path, 0, buffer_count, buffer_size, sync_mode, true))
    }

    /// Opens an existing file for appending at its current end.
    pub(crate) fn open(
        path: &Path,
        buffer_count: usize,
        buffer_size: usize,
        sync_mode: SyncMode,
    ) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self::from_file(file, path, len, buffer_count, buffer_size, sync_mode, true))
    }

    /// Opens an existing file for reading only.
    pub(crate) fn open_read_only(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self::from_file(file, path, len, 1, 1, SyncMode::None, false))
    }

    fn from_file(
        file: File,
        path: &Path,
        len: u64,
        buffer_count: usize,
        buffer_size: usize,
        sync_mode: SyncMode,
        writable: bool,
    ) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
            len,
            durable: len,
            ring: FlushRing::new(buffer_count, buffer_size),
            sync_mode,
            writable,
        }
    }

    /// Logical length of the file.
    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    /// Path of the underlying file.
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `bytes` and returns the offset they start at.
    pub(crate) fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        if !self.writable {
            return Err(TimeIndexError::ReadOnly);
        }
        let offset = self.len;

        if bytes.len() > self.ring.buffer_size {
            // Oversized writes bypass the ring once everything before them
            // is on disk.
            self.drain()?;
            self.write_through(bytes)?;
        } else {
            if self.ring.active.len() + bytes.len() > self.ring.buffer_size {
                self.ring.rotate();
                if self.ring.is_exhausted() {
                    self.drain_pending()?;
                }
            }
            self.ring.active.extend_from_slice(bytes);
        }

        self.len += bytes.len() as u64;
        Ok(offset)
    }

    /// Overwrites bytes at `offset` in place. The range must lie within the
    /// current length.
    pub(crate) fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(TimeIndexError::ReadOnly);
        }
        debug_assert!(offset + bytes.len() as u64 <= self.len);
        self.drain()?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        Ok(())
    }

    /// Cuts the file to `len` bytes.
    pub(crate) fn truncate(&mut self, len: u64) -> Result<()> {
        if !self.writable {
            return Err(TimeIndexError::ReadOnly);
        }
        self.drain()?;
        self.file.set_len(len)?;
        self.len = len;
        self.durable = len;
        Ok(())
    }

    /// Reads up to `size` bytes at `offset`; fewer are returned when the
    /// file ends first.
    pub(crate) fn read_at(&mut self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let available = self.len.saturating_sub(offset).min(size as u64) as usize;
        if available == 0 {
            return Ok(Vec::new());
        }
        if offset + available as u64 > self.durable {
            self.drain()?;
        }
        let mut buf = vec![0u8; available];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads a payload range, through a memory map when `size` reaches
    /// `mmap_threshold`.
    pub(crate) fn read_payload(
        &mut self,
        offset: u64,
        size: u64,
        mmap_threshold: u64,
    ) -> Result<Payload> {
        if offset.saturating_add(size) > self.durable {
            self.drain()?;
        }
        read_range(&self.file, offset, size, mmap_threshold)
    }

    /// Returns a reader over the bytes from `offset` to the logical end.
    pub(crate) fn reader_at(&mut self, offset: u64) -> Result<Take<&File>> {
        self.drain()?;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        Ok(file.take(self.len.saturating_sub(offset)))
    }

    /// Writes all buffered bytes and syncs according to the sync mode.
    pub(crate) fn flush(&mut self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        self.drain()?;
        self.file.flush()?;
        match self.sync_mode {
            SyncMode::Fsync => self.file.sync_all()?,
            SyncMode::Fdatasync => self.file.sync_data()?,
            SyncMode::None => {}
        }
        Ok(())
    }

    /// Writes pending and active buffers to the file.
    fn drain(&mut self) -> Result<()> {
        if self.ring.is_empty() {
            return Ok(());
        }
        if !self.ring.active.is_empty() {
            self.ring.rotate();
        }
        self.drain_pending()
    }

    /// Writes pending buffers to the file in order.
    fn drain_pending(&mut self) -> Result<()> {
        if self.ring.pending.is_empty() {
            return Ok(());
        }
        trace!(
            "Draining {} buffers ({} bytes) to {}",
            self.ring.pending.len(),
            self.ring.buffered() - self.ring.active.len() as u64,
            self.path.display()
        );
        self.file.seek(SeekFrom::Start(self.durable))?;
        // A buffer leaves the queue only once written, so a failed write is
        // retried at the same offset.
        while let Some(buf) = self.ring.pending.front() {
            self.file.write_all(buf)?;
            self.durable += buf.len() as u64;
            if let Some(buf) = self.ring.pending.pop_front() {
                self.ring.recycle(buf);
            }
        }
        Ok(())
    }

    fn write_through(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.durable))?;
        self.file.write_all(bytes)?;
        self.durable += bytes.len() as u64;
        Ok(())
    }

    #[cfg(test)]
    fn durable(&self) -> u64 {
        self.durable
    }

    /// Swaps the underlying file handle, returning the previous one.
    #[cfg(test)]
    pub(crate) fn replace_file(&mut self, file: File) -> File {
        std::mem::replace(&mut self.file, file)
    }
}

/// Reads `size` bytes at `offset` of `file`.
///
/// # Errors
///
/// Returns `TruncatedItem` if the file ends before the range does and
/// `PayloadTooLarge` if `size` cannot be addressed.
pub(crate) fn read_range(file: &File, offset: u64, size: u64, mmap_threshold: u64) -> Result<Payload> {
    if size >= PAYLOAD_LIMIT {
        return Err(TimeIndexError::PayloadTooLarge {
            size,
            limit: PAYLOAD_LIMIT,
        });
    }
    let file_len = file.metadata()?.len();
    if offset.saturating_add(size) > file_len {
        return Err(TimeIndexError::TruncatedItem {
            offset,
            needed: size,
            available: file_len.saturating_sub(offset),
        });
    }

    if size > 0 && size >= mmap_threshold {
        // SAFETY: the mapping is read-only and covers bytes below the file's
        // current length. The store only appends; bytes already written are
        // never rewritten, so the mapped range stays valid while the map is
        // alive.
        let map = unsafe {
            MmapOptions::new()
                .offset(offset)
                .len(size as usize)
                .map(file)?
        };
        return Ok(Payload::from(map));
    }

    let mut buf = vec![0u8; size as usize];
    let mut reader = file;
    reader.seek(SeekFrom::Start(offset))?;
    reader.read_exact(&mut buf)?;
    Ok(Payload::from(buf))
}
