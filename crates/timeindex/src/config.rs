//! Store configuration.
//!
//! [`StoreConfig`] holds the engine tunables; [`StoreSpec`] names one
//! logical store on disk and carries the header metadata written at create.

use crate::format::{
    DataTypeEntry, Placement, DATA_EXTENSION, EXTERNAL_INDEX_EXTENSION, HEADER_EXTENSION,
    INLINE_EXTENSION,
};
use crate::timestamp::DEFAULT_UNITS_PER_SECOND;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use xxhash_rust::xxh64::xxh64;

/// Default number of write buffers in the flush ring.
pub const DEFAULT_BUFFER_COUNT: usize = 4;

/// Default size of one write buffer (64 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default payload size from which reads are served by a memory map (one page).
pub const DEFAULT_MMAP_THRESHOLD: u64 = 4096;

/// Sync mode for durability on flush and close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fsync file data and metadata (default, highest durability).
    #[default]
    Fsync,
    /// Use fdatasync (skip metadata update, faster).
    Fdatasync,
    /// No sync (fastest, lowest durability - for testing only).
    None,
}

/// Where the store header is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderPlacement {
    /// In its own `.tih` file (default).
    #[default]
    Separate,
    /// Inside the index file, directly after its magic.
    Leading,
    /// After the last item, followed by a trailer.
    Trailing,
}

/// Configuration for store behavior.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Payload placement used when creating a store.
    pub placement: Placement,
    /// Header placement used when creating a store.
    pub header_placement: HeaderPlacement,
    /// Number of buffers in each file's flush ring.
    pub buffer_count: usize,
    /// Size of one flush buffer.
    pub buffer_size: usize,
    /// Payloads of at least this many bytes are read through a memory map.
    pub mmap_threshold: u64,
    /// Sync mode for durability guarantees.
    pub sync_mode: SyncMode,
    /// Rate used to decode units timestamps.
    pub units_per_second: u64,
    /// Whether an external data file starts with its own header.
    pub data_file_header: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            placement: Placement::default(),
            header_placement: HeaderPlacement::default(),
            buffer_count: DEFAULT_BUFFER_COUNT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            mmap_threshold: DEFAULT_MMAP_THRESHOLD,
            sync_mode: SyncMode::default(),
            units_per_second: DEFAULT_UNITS_PER_SECOND,
            data_file_header: true,
        }
    }
}

impl StoreConfig {
    /// Sets the payload placement.
    pub fn with_placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    /// Sets the header placement.
    pub fn with_header_placement(mut self, header_placement: HeaderPlacement) -> Self {
        self.header_placement = header_placement;
        self
    }

    /// Sets the flush ring geometry. Zero values are raised to one.
    pub fn with_buffers(mut self, count: usize, size: usize) -> Self {
        self.buffer_count = count.max(1);
        self.buffer_size = size.max(1);
        self
    }

    /// Sets the memory-map threshold.
    pub fn with_mmap_threshold(mut self, threshold: u64) -> Self {
        self.mmap_threshold = threshold;
        self
    }

    /// Sets the sync mode.
    pub fn with_sync_mode(mut self, sync_mode: SyncMode) -> Self {
        self.sync_mode = sync_mode;
        self
    }

    /// Sets the rate used to decode units timestamps.
    pub fn with_units_per_second(mut self, units_per_second: u64) -> Self {
        self.units_per_second = units_per_second;
        self
    }

    /// Sets whether an external data file carries a leading header.
    pub fn with_data_file_header(mut self, enabled: bool) -> Self {
        self.data_file_header = enabled;
        self
    }
}

/// Names one logical store and the metadata it is created with.
///
/// The store's files share `base`: `base.tih`, `base.tii` or `base.tix`,
/// and `base.tid` unless a data path is supplied.
#[derive(Debug, Clone)]
pub struct StoreSpec {
    /// Path prefix of the store's files.
    pub base: PathBuf,
    /// Store name, written to the header and checked on open.
    pub name: String,
    /// ID assigned at create, or the ID the header must carry on open.
    pub store_id: Option<u64>,
    /// External data file override.
    pub data_path: Option<PathBuf>,
    /// Description of the store's default data type.
    pub description: Option<String>,
    /// Data type registrations.
    pub data_types: Vec<DataTypeEntry>,
    /// Reference map from ID to URI.
    pub references: Vec<(u64, String)>,
    /// Engine configuration.
    pub config: StoreConfig,
}

impl StoreSpec {
    /// Describes the store `name` inside `dir`.
    pub fn new(dir: impl AsRef<Path>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            base: dir.as_ref().join(&name),
            name,
            store_id: None,
            data_path: None,
            description: None,
            data_types: Vec::new(),
            references: Vec::new(),
            config: StoreConfig::default(),
        }
    }

    /// Sets the engine configuration.
    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the store ID.
    pub fn with_store_id(mut self, store_id: u64) -> Self {
        self.store_id = Some(store_id);
        self
    }

    /// Sets the external data file path.
    pub fn with_data_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_path = Some(path.into());
        self
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Registers a data type.
    pub fn with_data_type(mut self, id: u32, mime: impl Into<String>) -> Self {
        self.data_types.push(DataTypeEntry {
            id,
            mime: mime.into(),
        });
        self
    }

    /// Adds a reference mapping.
    pub fn with_reference(mut self, id: u64, uri: impl Into<String>) -> Self {
        self.references.push((id, uri.into()));
        self
    }

    /// Path of the separate header file.
    pub fn header_path(&self) -> PathBuf {
        self.file_path(HEADER_EXTENSION)
    }

    /// Path of the index file for `placement`.
    pub fn index_path(&self, placement: Placement) -> PathBuf {
        self.file_path(placement.index_extension())
    }

    /// Path of the external data file.
    pub fn data_path(&self) -> PathBuf {
        self.data_path
            .clone()
            .unwrap_or_else(|| self.file_path(DATA_EXTENSION))
    }

    /// Index files that may exist for this store, inline first.
    pub(crate) fn index_candidates(&self) -> [PathBuf; 2] {
        [
            self.file_path(INLINE_EXTENSION),
            self.file_path(EXTERNAL_INDEX_EXTENSION),
        ]
    }

    /// Appends `.ext` to the base path; dots already in the name are kept.
    fn file_path(&self, ext: &str) -> PathBuf {
        let mut path = self.base.clone().into_os_string();
        path.push(".");
        path.push(ext);
        PathBuf::from(path)
    }

    /// Returns the configured ID or derives one from the name and `now`.
    pub fn resolve_store_id(&self, now: SystemTime) -> u64 {
        self.store_id.unwrap_or_else(|| generate_store_id(&self.name, now))
    }
}

/// Derives a store ID by hashing the name with the creation time.
pub fn generate_store_id(name: &str, created: SystemTime) -> u64 {
    let nanos = created
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut seed_bytes = Vec::with_capacity(name.len() + 8);
    seed_bytes.extend_from_slice(name.as_bytes());
    seed_bytes.extend_from_slice(&nanos.to_be_bytes());
    xxh64(&seed_bytes, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.placement, Placement::Inline);
        assert_eq!(config.header_placement, HeaderPlacement::Separate);
        assert_eq!(config.buffer_count, DEFAULT_BUFFER_COUNT);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.mmap_threshold, DEFAULT_MMAP_THRESHOLD);
        assert_eq!(config.sync_mode, SyncMode::Fsync);
        assert!(config.data_file_header);
    }

    #[test]
    fn test_config_builders() {
        let config = StoreConfig::default()
            .with_placement(Placement::Shadow)
            .with_header_placement(HeaderPlacement::Trailing)
            .with_buffers(0, 0)
            .with_sync_mode(SyncMode::None);
        assert_eq!(config.placement, Placement::Shadow);
        assert_eq!(config.header_placement, HeaderPlacement::Trailing);
        assert_eq!(config.buffer_count, 1);
        assert_eq!(config.buffer_size, 1);
        assert_eq!(config.sync_mode, SyncMode::None);
    }

    #[test]
    fn test_spec_paths() {
        let spec = StoreSpec::new("/data", "s1");
        assert_eq!(spec.header_path(), PathBuf::from("/data/s1.tih"));
        assert_eq!(spec.index_path(Placement::Inline), PathBuf::from("/data/s1.tii"));
        assert_eq!(spec.index_path(Placement::External), PathBuf::from("/data/s1.tix"));
        assert_eq!(spec.data_path(), PathBuf::from("/data/s1.tid"));

        let dotted = StoreSpec::new("/data", "cam.1");
        assert_eq!(dotted.header_path(), PathBuf::from("/data/cam.1.tih"));

        let spec = spec.with_data_path("/media/feed.bin");
        assert_eq!(spec.data_path(), PathBuf::from("/media/feed.bin"));
    }

    #[test]
    fn test_store_id_generation() {
        let t0 = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let t1 = t0 + Duration::from_nanos(1);
        assert_eq!(generate_store_id("s1", t0), generate_store_id("s1", t0));
        assert_ne!(generate_store_id("s1", t0), generate_store_id("s1", t1));
        assert_ne!(generate_store_id("s1", t0), generate_store_id("s2", t0));

        let spec = StoreSpec::new("/data", "s1").with_store_id(9);
        assert_eq!(spec.resolve_store_id(t0), 9);
    }
}
