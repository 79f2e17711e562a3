//! Trailer locating a header written at the end of an index file.
//!
//! ```text
//! ┌───────────────────────────────┬───────┐
//! │ Magic 0x0102030405060708      │ 8     │
//! │ Header size                   │ 8     │
//! │ Header offset                 │ 8     │
//! └───────────────────────────────┴───────┘
//! ```

use crate::error::Result;
use std::io::Write;

/// Trailer magic.
pub const TRAILER_MAGIC: u64 = 0x0102_0304_0506_0708;

/// Size of the trailer in bytes.
pub const TRAILER_SIZE: usize = 24;

/// Points back at a trailing header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    /// Encoded size of the header.
    pub header_size: u64,
    /// Offset of the header within the file.
    pub header_offset: u64,
}

impl Trailer {
    /// Writes the trailer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes())?;
        Ok(())
    }

    /// Encodes the trailer.
    pub fn to_bytes(&self) -> [u8; TRAILER_SIZE] {
        let mut buf = [0u8; TRAILER_SIZE];
        buf[0..8].copy_from_slice(&TRAILER_MAGIC.to_be_bytes());
        buf[8..16].copy_from_slice(&self.header_size.to_be_bytes());
        buf[16..24].copy_from_slice(&self.header_offset.to_be_bytes());
        buf
    }

    /// Decodes the last [`TRAILER_SIZE`] bytes of a file of `file_len`
    /// bytes. Returns `None` if the magic is absent or the trailer points
    /// outside the file.
    pub fn probe(buf: &[u8; TRAILER_SIZE], file_len: u64) -> Option<Self> {
        let magic = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        if magic != TRAILER_MAGIC {
            return None;
        }
        let header_size = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        let header_offset = u64::from_be_bytes(buf[16..24].try_into().unwrap());

        let end = header_offset.checked_add(header_size)?;
        if end != file_len.checked_sub(TRAILER_SIZE as u64)? {
            return None;
        }
        Some(Self {
            header_size,
            header_offset,
        })
    }
}
