//! Store header codec.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Magic 'T' 'I' 0x03 <type>                       (4 bytes)   │
//! │  Version major, minor                            (1 + 1)     │
//! │  Store ID                                        (8)         │
//! │  Name: len(u16, incl. NUL) + bytes + NUL                     │
//! │  Placement                                       (1)         │
//! │  Start, end, first, last, first data, last data  (6 × 8)     │
//! │  Item size                                       (4)         │
//! │  Data size, item count                           (8 + 8)     │
//! │  First item offset, last item offset             (8 + 8)     │
//! │  Terminated                                      (1)         │
//! │  Extension block size                            (4)         │
//! │  Extensions: tag(1) + body, repeated                         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The header is serialized into a buffer sized by [`Header::encoded_len`]
//! and written in one call, so a leading header can be rewritten in place.

use super::item::{IndexItem, ITEM_SIZE};
use super::{read_magic, read_string, string_len, write_magic, write_string, FileType, Placement};
use super::MAGIC_SIZE;
use crate::error::{Result, TimeIndexError};
use crate::timestamp::Timestamp;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;
use tracing::debug;

/// Major format version written by this crate.
pub const VERSION_MAJOR: u8 = 1;

/// Minor format version written by this crate.
pub const VERSION_MINOR: u8 = 0;

/// Fixed bytes between the store ID and the name.
const PREFIX_SIZE: usize = 1 + 1 + 8;

/// Fixed bytes after the name, including the extension size prefix.
const FIXED_SIZE: usize = 1 + 6 * 8 + 4 + 8 + 8 + 8 + 8 + 1 + 4;

const EXT_DESCRIPTION: u8 = 1;
const EXT_INDEX_PATH: u8 = 2;
const EXT_DATA_PATH: u8 = 3;
const EXT_DATA_TYPE: u8 = 4;
const EXT_IN_TIME_ORDER: u8 = 5;
const EXT_NO_DATA_FILE_HEADER: u8 = 6;
const EXT_REFERENCE_MAPPING: u8 = 7;

/// A registered payload data type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataTypeEntry {
    /// Data type ID used in item records.
    pub id: u32,
    /// MIME type of payloads with this ID.
    pub mime: String,
}

/// Optional header fields carried in the extension block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HeaderExtensions {
    /// Human-readable descriptions keyed by data type ID.
    pub descriptions: Vec<(u32, String)>,
    /// Index file path override.
    pub index_path: Option<String>,
    /// Data file path override.
    pub data_path: Option<String>,
    /// Data type registrations.
    pub data_types: Vec<DataTypeEntry>,
    /// Whether index timestamps are non-decreasing in position order.
    pub in_time_order: Option<bool>,
    /// Whether the external data file omits its leading header.
    pub no_data_file_header: Option<bool>,
    /// Reference map from ID to URI.
    pub references: Vec<(u64, String)>,
}

impl HeaderExtensions {
    /// Encoded size of the extension block, excluding its size prefix.
    pub fn encoded_len(&self) -> usize {
        let mut len = 0;
        for (_, text) in &self.descriptions {
            len += 1 + 4 + string_len(text);
        }
        if let Some(path) = &self.index_path {
            len += 1 + string_len(path);
        }
        if let Some(path) = &self.data_path {
            len += 1 + string_len(path);
        }
        for entry in &self.data_types {
            len += 1 + 4 + string_len(&entry.mime);
        }
        if self.in_time_order.is_some() {
            len += 2;
        }
        if self.no_data_file_header.is_some() {
            len += 2;
        }
        if !self.references.is_empty() {
            len += 1 + 2;
            for (_, uri) in &self.references {
                len += 8 + string_len(uri);
            }
        }
        len
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        for (data_type, text) in &self.descriptions {
            writer.write_all(&[EXT_DESCRIPTION])?;
            writer.write_all(&data_type.to_be_bytes())?;
            write_string(writer, text)?;
        }
        if let Some(path) = &self.index_path {
            writer.write_all(&[EXT_INDEX_PATH])?;
            write_string(writer, path)?;
        }
        if let Some(path) = &self.data_path {
            writer.write_all(&[EXT_DATA_PATH])?;
            write_string(writer, path)?;
        }
        for entry in &self.data_types {
            writer.write_all(&[EXT_DATA_TYPE])?;
            writer.write_all(&entry.id.to_be_bytes())?;
            write_string(writer, &entry.mime)?;
        }
        if let Some(flag) = self.in_time_order {
            writer.write_all(&[EXT_IN_TIME_ORDER, flag as u8])?;
        }
        if let Some(flag) = self.no_data_file_header {
            writer.write_all(&[EXT_NO_DATA_FILE_HEADER, flag as u8])?;
        }
        if !self.references.is_empty() {
            let count = u16::try_from(self.references.len()).map_err(|_| {
                TimeIndexError::CorruptHeader(format!(
                    "{} references exceed the 16-bit count",
                    self.references.len()
                ))
            })?;
            writer.write_all(&[EXT_REFERENCE_MAPPING])?;
            writer.write_all(&count.to_be_bytes())?;
            for (id, uri) in &self.references {
                writer.write_all(&id.to_be_bytes())?;
                write_string(writer, uri)?;
            }
        }
        Ok(())
    }

    /// Parses an extension block. Parsing stops at the first unknown tag;
    /// the rest of the block is ignored.
    fn parse(block: &[u8]) -> Result<Self> {
        let mut ext = Self::default();
        let mut cursor = Cursor::new(block);

        while (cursor.position() as usize) < block.len() {
            let mut tag = [0u8; 1];
            cursor.read_exact(&mut tag)?;
            match tag[0] {
                EXT_DESCRIPTION => {
                    let data_type = read_u32(&mut cursor)?;
                    ext.descriptions.push((data_type, read_string(&mut cursor)?));
                }
                EXT_INDEX_PATH => ext.index_path = Some(read_string(&mut cursor)?),
                EXT_DATA_PATH => ext.data_path = Some(read_string(&mut cursor)?),
                EXT_DATA_TYPE => {
                    let id = read_u32(&mut cursor)?;
                    let mime = read_string(&mut cursor)?;
                    ext.data_types.push(DataTypeEntry { id, mime });
                }
                EXT_IN_TIME_ORDER => ext.in_time_order = Some(read_u8(&mut cursor)? != 0),
                EXT_NO_DATA_FILE_HEADER => {
                    ext.no_data_file_header = Some(read_u8(&mut cursor)? != 0)
                }
                EXT_REFERENCE_MAPPING => {
                    let mut count = [0u8; 2];
                    cursor.read_exact(&mut count)?;
                    for _ in 0..u16::from_be_bytes(count) {
                        let id = read_u64(&mut cursor)?;
                        ext.references.push((id, read_string(&mut cursor)?));
                    }
                }
                unknown => {
                    debug!(
                        "Unknown header extension tag {}, skipping {} bytes",
                        unknown,
                        block.len() - cursor.position() as usize + 1
                    );
                    break;
                }
            }
        }
        Ok(ext)
    }
}

/// Header of a logical store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Format major version.
    pub version_major: u8,
    /// Format minor version.
    pub version_minor: u8,
    /// Store ID.
    pub store_id: u64,
    /// Store name.
    pub name: String,
    /// Payload placement.
    pub placement: Placement,
    /// Index timestamp of the first item.
    pub start_time: Timestamp,
    /// Index timestamp of the most recent item.
    pub end_time: Timestamp,
    /// Index timestamp of the first item.
    pub first_time: Timestamp,
    /// Index timestamp of the last item.
    pub last_time: Timestamp,
    /// Data timestamp of the first item.
    pub first_data_time: Timestamp,
    /// Data timestamp of the last item.
    pub last_data_time: Timestamp,
    /// Size of one item record.
    pub item_size: u32,
    /// Total payload bytes.
    pub data_size: u64,
    /// Number of items.
    pub item_count: u64,
    /// Offset of the first item record in the index file.
    pub first_item_offset: u64,
    /// Offset of the last item record in the index file.
    pub last_item_offset: u64,
    /// Set on clean close.
    pub terminated: bool,
    /// Optional fields.
    pub extensions: HeaderExtensions,
}

impl Header {
    /// Creates the header of an empty store.
    pub fn new(store_id: u64, name: impl Into<String>, placement: Placement) -> Self {
        Self {
            version_major: VERSION_MAJOR,
            version_minor: VERSION_MINOR,
            store_id,
            name: name.into(),
            placement,
            start_time: Timestamp::Zero,
            end_time: Timestamp::Zero,
            first_time: Timestamp::Zero,
            last_time: Timestamp::Zero,
            first_data_time: Timestamp::Zero,
            last_data_time: Timestamp::Zero,
            item_size: ITEM_SIZE as u32,
            data_size: 0,
            item_count: 0,
            first_item_offset: 0,
            last_item_offset: 0,
            terminated: false,
            extensions: HeaderExtensions {
                in_time_order: Some(true),
                ..HeaderExtensions::default()
            },
        }
    }

    /// Returns the encoded size of the header including its magic.
    pub fn encoded_len(&self) -> usize {
        MAGIC_SIZE
            + PREFIX_SIZE
            + string_len(&self.name)
            + FIXED_SIZE
            + self.extensions.encoded_len()
    }

    /// Serializes the header with the magic for `file_type`.
    pub fn to_bytes(&self, file_type: FileType) -> Result<Vec<u8>> {
        let len = self.encoded_len();
        let mut buf = Vec::with_capacity(len);

        write_magic(&mut buf, file_type)?;
        // Version (2 bytes)
        buf.push(self.version_major);
        buf.push(self.version_minor);
        // Store ID (8 bytes)
        buf.extend_from_slice(&self.store_id.to_be_bytes());
        // Name (variable)
        write_string(&mut buf, &self.name)?;
        // Placement (1 byte)
        buf.push(self.placement as u8);
        // Times (6 × 8 bytes)
        for ts in [
            &self.start_time,
            &self.end_time,
            &self.first_time,
            &self.last_time,
            &self.first_data_time,
            &self.last_data_time,
        ] {
            ts.validate()?;
            buf.extend_from_slice(&ts.encode().to_be_bytes());
        }
        // Item size (4 bytes)
        buf.extend_from_slice(&self.item_size.to_be_bytes());
        // Data size, item count (8 + 8 bytes)
        buf.extend_from_slice(&self.data_size.to_be_bytes());
        buf.extend_from_slice(&self.item_count.to_be_bytes());
        // Item offsets (8 + 8 bytes)
        buf.extend_from_slice(&self.first_item_offset.to_be_bytes());
        buf.extend_from_slice(&self.last_item_offset.to_be_bytes());
        // Terminated (1 byte)
        buf.push(self.terminated as u8);
        // Extensions (4 + variable)
        let ext_len = self.extensions.encoded_len();
        buf.extend_from_slice(&(ext_len as u32).to_be_bytes());
        self.extensions.write_to(&mut buf)?;

        debug_assert_eq!(buf.len(), len);
        Ok(buf)
    }

    /// Writes the header with the magic for `file_type`.
    ///
    /// Returns the number of bytes written.
    pub fn write_to<W: Write>(&self, writer: &mut W, file_type: FileType) -> Result<usize> {
        let buf = self.to_bytes(file_type)?;
        writer.write_all(&buf)?;
        Ok(buf.len())
    }

    /// Reads a header and the file type named by its magic.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMagic` for a foreign file, `UnsupportedVersion` for a
    /// newer major version, `UnknownTimestampTag` for an undecodable time
    /// field and `CorruptHeader` for structural damage.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<(FileType, Self)> {
        let file_type = read_magic(reader)?;

        let mut prefix = [0u8; PREFIX_SIZE];
        reader.read_exact(&mut prefix)?;
        let version_major = prefix[0];
        let version_minor = prefix[1];
        if version_major > VERSION_MAJOR {
            return Err(TimeIndexError::UnsupportedVersion {
                major: version_major,
                minor: version_minor,
            });
        }
        let store_id = u64::from_be_bytes(prefix[2..10].try_into().unwrap());

        let name = read_string(reader)?;

        let mut buf = [0u8; FIXED_SIZE];
        reader.read_exact(&mut buf)?;

        let placement = Placement::from_u8(buf[0]).ok_or_else(|| {
            TimeIndexError::CorruptHeader(format!("unknown placement type {}", buf[0]))
        })?;

        let mut times = [Timestamp::Zero; 6];
        for (i, slot) in times.iter_mut().enumerate() {
            let start = 1 + i * 8;
            let raw = u64::from_be_bytes(buf[start..start + 8].try_into().unwrap());
            *slot = Timestamp::decode(raw)?;
        }
        let [start_time, end_time, first_time, last_time, first_data_time, last_data_time] =
            times;

        let item_size = u32::from_be_bytes(buf[49..53].try_into().unwrap());
        let data_size = u64::from_be_bytes(buf[53..61].try_into().unwrap());
        let item_count = u64::from_be_bytes(buf[61..69].try_into().unwrap());
        let first_item_offset = u64::from_be_bytes(buf[69..77].try_into().unwrap());
        let last_item_offset = u64::from_be_bytes(buf[77..85].try_into().unwrap());
        let terminated = buf[85] != 0;
        let ext_len = u32::from_be_bytes(buf[86..90].try_into().unwrap()) as u64;

        if item_size as usize != ITEM_SIZE {
            return Err(TimeIndexError::CorruptHeader(format!(
                "item size {} (expected {})",
                item_size, ITEM_SIZE
            )));
        }

        let mut block = Vec::new();
        reader.take(ext_len).read_to_end(&mut block)?;
        if block.len() as u64 != ext_len {
            return Err(TimeIndexError::CorruptHeader(format!(
                "extension block truncated: {} of {} bytes",
                block.len(),
                ext_len
            )));
        }
        let extensions = HeaderExtensions::parse(&block).map_err(|e| match e {
            TimeIndexError::IoError(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
                TimeIndexError::CorruptHeader("extension overruns its block".to_string())
            }
            other => other,
        })?;

        Ok((
            file_type,
            Self {
                version_major,
                version_minor,
                store_id,
                name,
                placement,
                start_time,
                end_time,
                first_time,
                last_time,
                first_data_time,
                last_data_time,
                item_size,
                data_size,
                item_count,
                first_item_offset,
                last_item_offset,
                terminated,
                extensions,
            },
        ))
    }

    /// Reads a header and checks its magic names `expected`.
    pub fn read_expecting<R: Read>(reader: &mut R, expected: FileType) -> Result<Self> {
        let (file_type, header) = Self::read_from(reader)?;
        if file_type != expected {
            return Err(TimeIndexError::UnexpectedFileType {
                expected: expected as u8,
                actual: file_type as u8,
            });
        }
        Ok(header)
    }

    /// Identity string `id/name` used in mismatch reports.
    pub fn identity(&self) -> String {
        format_identity(self.store_id, &self.name)
    }

    /// Checks this header belongs to the store named `name` and, when given,
    /// with ID `store_id`.
    ///
    /// # Errors
    ///
    /// Returns `IdentityMismatch` naming `path` otherwise.
    pub fn verify_identity(&self, store_id: Option<u64>, name: &str, path: &Path) -> Result<()> {
        let id_matches = store_id.map_or(true, |id| id == self.store_id);
        if id_matches && self.name == name {
            return Ok(());
        }
        Err(TimeIndexError::IdentityMismatch {
            path: path.to_path_buf(),
            expected: format_identity(store_id.unwrap_or(self.store_id), name),
            found: self.identity(),
        })
    }

    /// Returns true if index timestamps are known to be non-decreasing.
    pub fn in_time_order(&self) -> bool {
        self.extensions.in_time_order.unwrap_or(false)
    }

    /// Returns true if the external data file carries a leading header.
    pub fn has_data_file_header(&self) -> bool {
        !self.extensions.no_data_file_header.unwrap_or(false)
    }

    /// Clears the running totals, keeping identity and extensions.
    pub fn reset_items(&mut self) {
        self.start_time = Timestamp::Zero;
        self.end_time = Timestamp::Zero;
        self.first_time = Timestamp::Zero;
        self.last_time = Timestamp::Zero;
        self.first_data_time = Timestamp::Zero;
        self.last_data_time = Timestamp::Zero;
        self.data_size = 0;
        self.item_count = 0;
        self.last_item_offset = 0;
        self.extensions.in_time_order = Some(true);
    }

    /// Folds an appended item into the running totals.
    pub fn record_item(&mut self, item: &IndexItem, item_offset: u64) {
        if self.item_count == 0 {
            self.start_time = item.index_timestamp;
            self.first_time = item.index_timestamp;
            self.first_data_time = item.data_timestamp;
            self.first_item_offset = item_offset;
        } else if item.index_timestamp.less_than(&self.last_time) {
            if self.in_time_order() {
                debug!(
                    "Store {} no longer in time order at position {}",
                    self.name, self.item_count
                );
            }
            self.extensions.in_time_order = Some(false);
        }
        self.end_time = item.index_timestamp;
        self.last_time = item.index_timestamp;
        self.last_data_time = item.data_timestamp;
        self.last_item_offset = item_offset;
        self.data_size += item.data_size;
        self.item_count += 1;
    }
}

fn format_identity(store_id: u64, name: &str) -> String {
    format!("{:016x}/{}", store_id, name)
}

fn read_u8<R: Read>(reader: &mut R) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timestamp::Scale;
    use std::path::PathBuf;

    fn sample_header() -> Header {
        let mut header = Header::new(0xfeed_beef, "camera-7", Placement::External);
        header.extensions.descriptions.push((0, "front door".to_string()));
        header.extensions.data_path = Some("/var/media/camera-7.tid".to_string());
        header.extensions.data_types.push(DataTypeEntry {
            id: 1,
            mime: "video/h264".to_string(),
        });
        header.extensions.no_data_file_header = Some(true);
        header.extensions.references.push((42, "rtsp://cam7/stream".to_string()));
        header
    }

    #[test]
    fn test_header_round_trip() {
        let mut header = sample_header();
        let item = IndexItem::new(
            Timestamp::from_millis(100).unwrap(),
            Timestamp::elapsed(Scale::Microsecond, 5).unwrap(),
            vec![1u8; 10],
        );
        header.record_item(&item, 400);
        header.terminated = true;

        let mut buf = Vec::new();
        let written = header.write_to(&mut buf, FileType::Header).unwrap();
        assert_eq!(written, buf.len());
        assert_eq!(written, header.encoded_len());

        let (file_type, decoded) = Header::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(file_type, FileType::Header);
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_extension_block_is_size_prefixed() {
        let header = Header::new(1, "s1", Placement::Inline);
        let buf = header.to_bytes(FileType::Header).unwrap();

        // Only IS_IN_TIME_ORDER is present: tag + bool.
        let ext_size_at = buf.len() - 2 - 4;
        assert_eq!(&buf[ext_size_at..ext_size_at + 4], &2u32.to_be_bytes());
        assert_eq!(&buf[buf.len() - 2..], &[EXT_IN_TIME_ORDER, 1]);
    }

    #[test]
    fn test_unknown_extension_skips_rest_of_block() {
        let mut header = Header::new(1, "s1", Placement::Inline);
        header.extensions.in_time_order = None;
        header.extensions.index_path = Some("idx".to_string());
        let mut buf = header.to_bytes(FileType::Header).unwrap();

        // Append an unknown tag followed by garbage, then fix the size prefix.
        let ext_size_at = MAGIC_SIZE + PREFIX_SIZE + string_len("s1") + FIXED_SIZE - 4;
        buf.extend_from_slice(&[0x7e, 0xde, 0xad]);
        let new_len = header.extensions.encoded_len() as u32 + 3;
        buf[ext_size_at..ext_size_at + 4].copy_from_slice(&new_len.to_be_bytes());

        let (_, decoded) = Header::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded.extensions.index_path.as_deref(), Some("idx"));
        assert_eq!(decoded.extensions.in_time_order, None);
    }

    #[test]
    fn test_newer_major_version_rejected() {
        let mut header = Header::new(1, "s1", Placement::Inline);
        header.version_major = VERSION_MAJOR + 1;
        let buf = header.to_bytes(FileType::Header).unwrap();
        assert!(matches!(
            Header::read_from(&mut buf.as_slice()),
            Err(TimeIndexError::UnsupportedVersion { major: 2, minor: 0 })
        ));
    }

    #[test]
    fn test_truncated_extension_block() {
        let header = sample_header();
        let buf = header.to_bytes(FileType::Header).unwrap();
        let cut = &buf[..buf.len() - 3];
        assert!(matches!(
            Header::read_from(&mut &cut[..]),
            Err(TimeIndexError::CorruptHeader(_))
        ));
    }

    #[test]
    fn test_read_expecting_wrong_type() {
        let header = Header::new(1, "s1", Placement::Inline);
        let buf = header.to_bytes(FileType::ExternalData).unwrap();
        assert!(matches!(
            Header::read_expecting(&mut buf.as_slice(), FileType::Header),
            Err(TimeIndexError::UnexpectedFileType { .. })
        ));
    }

    #[test]
    fn test_verify_identity() {
        let header = Header::new(7, "s1", Placement::Inline);
        let path = PathBuf::from("/tmp/s1.tih");
        assert!(header.verify_identity(Some(7), "s1", &path).is_ok());
        assert!(header.verify_identity(None, "s1", &path).is_ok());

        let err = header.verify_identity(Some(8), "s1", &path).unwrap_err();
        match err {
            TimeIndexError::IdentityMismatch {
                expected, found, ..
            } => {
                assert_eq!(expected, "0000000000000008/s1");
                assert_eq!(found, "0000000000000007/s1");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(header.verify_identity(None, "s2", &path).is_err());
    }

    #[test]
    fn test_record_item_tracks_time_order() {
        let mut header = Header::new(1, "s1", Placement::Inline);
        let at = |ms| {
            IndexItem::new(
                Timestamp::from_millis(ms).unwrap(),
                Timestamp::from_millis(ms).unwrap(),
                vec![0u8; 4],
            )
        };

        header.record_item(&at(100), 4);
        header.record_item(&at(200), 60);
        assert!(header.in_time_order());
        assert_eq!(header.start_time, Timestamp::from_millis(100).unwrap());

        header.record_item(&at(150), 116);
        assert!(!header.in_time_order());
        assert_eq!(header.item_count, 3);
        assert_eq!(header.data_size, 12);
        assert_eq!(header.first_item_offset, 4);
        assert_eq!(header.last_item_offset, 116);
        assert_eq!(header.end_time, Timestamp::from_millis(150).unwrap());

        // Once out of order, always out of order.
        header.record_item(&at(300), 172);
        assert!(!header.in_time_order());

        header.reset_items();
        assert_eq!(header.item_count, 0);
        assert_eq!(header.data_size, 0);
        assert_eq!(header.first_item_offset, 4);
        assert!(header.in_time_order());
        header.record_item(&at(50), 4);
        assert_eq!(header.start_time, Timestamp::from_millis(50).unwrap());
    }
}
