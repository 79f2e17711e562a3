//! Error and Result types for time index operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// A convenience `Result` type for time index operations.
pub type Result<T> = std::result::Result<T, TimeIndexError>;

/// The error type for time index operations.
///
/// Variants fall into four groups: format faults (the bytes on disk are not
/// what the caller believes they are), resource faults (files and locks),
/// bounds faults and value faults. Policy faults never reach the caller; the
/// cache logs and drops them.
#[derive(Debug, Error)]
pub enum TimeIndexError {
    /// File does not start with the `TI\x03` magic prefix.
    #[error("Invalid magic bytes: expected TI\\x03<type>, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// File magic names a file type other than the one expected here.
    #[error("Unexpected file type: expected {expected:#04x}, got {actual:#04x}")]
    UnexpectedFileType {
        /// Expected file type byte.
        expected: u8,
        /// File type byte found on disk.
        actual: u8,
    },

    /// Header version is newer than this implementation understands.
    #[error("Unsupported version: {major}.{minor}")]
    UnsupportedVersion {
        /// Major version found in the header.
        major: u8,
        /// Minor version found in the header.
        minor: u8,
    },

    /// A 64-bit timestamp word carries a tag no variant uses.
    #[error("Unknown timestamp tag in raw value {0:#018x}")]
    UnknownTimestampTag(u64),

    /// A timestamp magnitude does not fit the bit budget of its variant.
    #[error("Timestamp overflow: {magnitude} exceeds {max} for {variant}")]
    TimestampOverflow {
        /// Variant the value was being built for.
        variant: &'static str,
        /// Requested magnitude.
        magnitude: u128,
        /// Largest representable magnitude.
        max: u64,
    },

    /// Fewer bytes than an item record are available at an offset.
    #[error("Truncated item at offset {offset}: need {needed} bytes, {available} available")]
    TruncatedItem {
        /// Byte offset of the read.
        offset: u64,
        /// Bytes required.
        needed: u64,
        /// Bytes actually available.
        available: u64,
    },

    /// Header identity does not match the store the caller expected.
    #[error("Identity mismatch in {path}: expected {expected}, found {found}")]
    IdentityMismatch {
        /// File whose header was checked.
        path: PathBuf,
        /// Expected `id/name`.
        expected: String,
        /// `id/name` found on disk.
        found: String,
    },

    /// Header body is structurally invalid.
    #[error("Corrupt header: {0}")]
    CorruptHeader(String),

    /// A leading header would no longer fit the space reserved for it.
    #[error("Leading header size changed: reserved {reserved} bytes, now {actual}")]
    HeaderSizeChanged {
        /// Size reserved when the store was created.
        reserved: u64,
        /// Size of the header as it would be written now.
        actual: u64,
    },

    /// Another writer holds the store's write lock.
    #[error("Store is already write-locked: {0}")]
    AlreadyWriteLocked(PathBuf),

    /// A write was attempted through a read-only handle.
    #[error("Store was opened read-only")]
    ReadOnly,

    /// The store has been closed.
    #[error("Store is closed")]
    Closed,

    /// Position is negative or past the current end of the store.
    #[error("Position {position} out of bounds (length {length})")]
    PositionOutOfBounds {
        /// Requested position.
        position: u64,
        /// Current number of items.
        length: u64,
    },

    /// Payload size is at or above the addressable buffer limit.
    #[error("Payload of {size} bytes is not supported (limit {limit})")]
    PayloadTooLarge {
        /// Requested payload size.
        size: u64,
        /// Exclusive upper bound.
        limit: u64,
    },

    /// A hollow item declares payload bytes the store has no way to write.
    #[error("Item declares {size} payload bytes but carries none")]
    MissingPayload {
        /// Declared payload size.
        size: u64,
    },

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl TimeIndexError {
    /// Returns true for faults meaning the bytes on disk are not the store
    /// the caller believes they are.
    pub fn is_format_fault(&self) -> bool {
        matches!(
            self,
            Self::InvalidMagic(_)
                | Self::UnexpectedFileType { .. }
                | Self::UnsupportedVersion { .. }
                | Self::UnknownTimestampTag(_)
                | Self::TruncatedItem { .. }
                | Self::IdentityMismatch { .. }
                | Self::CorruptHeader(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TimeIndexError::PositionOutOfBounds {
            position: 7,
            length: 3,
        };
        let display = err.to_string();
        assert!(display.contains("Position 7"));
        assert!(display.contains("length 3"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: TimeIndexError = io_err.into();
        match err {
            TimeIndexError::IoError(e) => assert_eq!(e.kind(), io::ErrorKind::NotFound),
            _ => panic!("Expected IoError"),
        }
    }

    #[test]
    fn test_format_fault_classification() {
        assert!(TimeIndexError::InvalidMagic(*b"XXXX").is_format_fault());
        assert!(TimeIndexError::UnknownTimestampTag(0x0300_0000_0000_0001).is_format_fault());
        assert!(!TimeIndexError::ReadOnly.is_format_fault());
        assert!(!TimeIndexError::PositionOutOfBounds {
            position: 1,
            length: 0
        }
        .is_format_fault());
        assert!(!TimeIndexError::MissingPayload { size: 8 }.is_format_fault());
    }
}
