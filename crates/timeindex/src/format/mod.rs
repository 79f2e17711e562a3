//! On-disk format of time index files.
//!
//! All multi-byte integers are big-endian. Every file written by the engine
//! starts with a 4-byte magic `'T' 'I' 0x03 <type>` naming its role.
//!
//! ## File Roles
//!
//! ```text
//! ┌────────────┬──────┬──────────────────────────────────────────────┐
//! │ Role       │ Ext  │ Contents                                     │
//! ├────────────┼──────┼──────────────────────────────────────────────┤
//! │ Header     │ .tih │ magic + header                               │
//! │ Inline     │ .tii │ magic [+ header] + (item + payload)* [+ hdr] │
//! │ Ext. index │ .tix │ magic [+ header] + item*              [+ hdr]│
//! │ Ext. data  │ .tid │ magic + header + payload*  (header optional) │
//! └────────────┴──────┴──────────────────────────────────────────────┘
//! ```
//!
//! Items are fixed 52-byte records (see [`item`]). A trailing header is
//! followed by a 24-byte [`Trailer`] pointing back at it.

pub mod header;
pub mod item;
pub mod trailer;

pub use header::{DataTypeEntry, Header, HeaderExtensions, VERSION_MAJOR, VERSION_MINOR};
pub use item::{IndexItem, Payload, ITEM_SIZE};
pub use trailer::{Trailer, TRAILER_MAGIC, TRAILER_SIZE};

use crate::error::{Result, TimeIndexError};
use std::io::{Read, Write};

/// First three bytes of every file magic.
pub const MAGIC_PREFIX: [u8; 3] = [b'T', b'I', 0x03];

/// Size of a file magic in bytes.
pub const MAGIC_SIZE: usize = 4;

/// Extension of a separate header file.
pub const HEADER_EXTENSION: &str = "tih";

/// Extension of an inline index (records and payload in one file).
pub const INLINE_EXTENSION: &str = "tii";

/// Extension of an external or shadow index.
pub const EXTERNAL_INDEX_EXTENSION: &str = "tix";

/// Default extension of an external data file.
pub const DATA_EXTENSION: &str = "tid";

/// Role of a file, stored in the last magic byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FileType {
    /// Separate header file.
    Header = 0x01,
    /// Inline index: records interleaved with payload.
    InlineIndex = 0x02,
    /// External index: records only.
    ExternalIndex = 0x03,
    /// External data file holding payload bytes.
    ExternalData = 0x04,
    /// Shadow index: records only, payload produced elsewhere.
    ShadowIndex = 0x05,
    /// Annotation file.
    Annotations = 0x06,
}

impl FileType {
    /// Creates a FileType from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Header),
            0x02 => Some(Self::InlineIndex),
            0x03 => Some(Self::ExternalIndex),
            0x04 => Some(Self::ExternalData),
            0x05 => Some(Self::ShadowIndex),
            0x06 => Some(Self::Annotations),
            _ => None,
        }
    }

    /// Returns the 4-byte magic for this file type.
    pub fn magic(self) -> [u8; MAGIC_SIZE] {
        [MAGIC_PREFIX[0], MAGIC_PREFIX[1], MAGIC_PREFIX[2], self as u8]
    }
}

/// Where payload bytes live relative to the item records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum Placement {
    /// Payload follows each record in the index file.
    #[default]
    Inline = 1,
    /// Payload lives in a separate data file written by this store.
    External = 2,
    /// Payload lives in a separate data file written by someone else.
    Shadow = 3,
}

impl Placement {
    /// Creates a Placement from a u8 value.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Inline),
            2 => Some(Self::External),
            3 => Some(Self::Shadow),
            _ => None,
        }
    }

    /// File type of the index file for this placement.
    pub fn index_file_type(self) -> FileType {
        match self {
            Self::Inline => FileType::InlineIndex,
            Self::External => FileType::ExternalIndex,
            Self::Shadow => FileType::ShadowIndex,
        }
    }

    /// File extension of the index file for this placement.
    pub fn index_extension(self) -> &'static str {
        match self {
            Self::Inline => INLINE_EXTENSION,
            Self::External | Self::Shadow => EXTERNAL_INDEX_EXTENSION,
        }
    }

    /// Returns true if payload bytes are stored outside the index file.
    pub fn has_data_file(self) -> bool {
        !matches!(self, Self::Inline)
    }
}

/// Writes the magic for `file_type`.
pub fn write_magic<W: Write>(writer: &mut W, file_type: FileType) -> Result<()> {
    writer.write_all(&file_type.magic())?;
    Ok(())
}

/// Reads a magic and returns the file type it names.
///
/// # Errors
///
/// Returns `InvalidMagic` if the prefix is wrong or the type byte is unknown.
pub fn read_magic<R: Read>(reader: &mut R) -> Result<FileType> {
    let mut magic = [0u8; MAGIC_SIZE];
    reader.read_exact(&mut magic)?;
    if magic[..3] != MAGIC_PREFIX {
        return Err(TimeIndexError::InvalidMagic(magic));
    }
    FileType::from_u8(magic[3]).ok_or(TimeIndexError::InvalidMagic(magic))
}

/// Reads a magic and checks it names `expected`.
pub fn expect_magic<R: Read>(reader: &mut R, expected: FileType) -> Result<()> {
    let actual = read_magic(reader)?;
    if actual != expected {
        return Err(TimeIndexError::UnexpectedFileType {
            expected: expected as u8,
            actual: actual as u8,
        });
    }
    Ok(())
}

/// Encoded size of a NUL-terminated, length-prefixed string.
pub(crate) fn string_len(s: &str) -> usize {
    2 + s.len() + 1
}

/// Writes `len(u16, including NUL) + bytes + NUL`.
pub(crate) fn write_string<W: Write>(writer: &mut W, s: &str) -> Result<()> {
    let len = s.len() + 1;
    if len > u16::MAX as usize {
        return Err(TimeIndexError::CorruptHeader(format!(
            "string of {} bytes exceeds the 16-bit length prefix",
            s.len()
        )));
    }
    writer.write_all(&(len as u16).to_be_bytes())?;
    writer.write_all(s.as_bytes())?;
    writer.write_all(&[0u8])?;
    Ok(())
}

/// Reads a string written by [`write_string`].
pub(crate) fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let mut buf2 = [0u8; 2];
    reader.read_exact(&mut buf2)?;
    let len = u16::from_be_bytes(buf2) as usize;
    if len == 0 {
        return Err(TimeIndexError::CorruptHeader(
            "string length must include the NUL terminator".to_string(),
        ));
    }

    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    if bytes.pop() != Some(0) {
        return Err(TimeIndexError::CorruptHeader(
            "string is not NUL-terminated".to_string(),
        ));
    }
    String::from_utf8(bytes)
        .map_err(|e| TimeIndexError::CorruptHeader(format!("invalid UTF-8 in string: {}", e)))
}
