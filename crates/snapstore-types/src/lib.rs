#![forbid(unsafe_code)]
//! Core value types and on-disk constants for the snapstore engine.
//!
//! Chunks are the allocation unit on the metadata and snapshot-data devices;
//! sectors (512 bytes) address raw device positions. Both are unit-carrying
//! newtypes to keep the two address spaces from mixing.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 512-byte sectors.
pub const SECTOR_BITS: u32 = 9;
pub const SECTOR_SIZE: u32 = 1 << SECTOR_BITS;

/// Sector of the superblock on the metadata device.
pub const SB_SECTOR: u64 = 8;
/// Bytes reserved for the superblock image on disk.
pub const SB_SIZE: usize = 4096;
/// Superblock magic, bytes 0..8 of the image.
pub const SB_MAGIC: [u8; 8] = *b"SNAPSTOR";
pub const SB_VERSION: u32 = 1;
/// Daemon-active flag in the superblock; still set on restart means the
/// server died without cleanup and the journal must be replayed.
pub const SB_FLAG_BUSY: u32 = 1;

/// Magic at byte 0 of every exception-tree leaf chunk (little-endian u16).
pub const LEAF_MAGIC: u16 = 0x1eaf;
/// First 8 bytes of a journal commit block.
pub const JOURNAL_MAGIC: [u8; 8] = *b"MAGICNUM";

/// Hard limit on live snapshots; share masks are one u64 wide.
pub const MAX_SNAPSHOTS: usize = 64;

/// Snapshot tag reserved to mean "the origin volume".
pub const ORIGIN_TAG: u32 = u32::MAX;

/// Logical chunk address (origin, metadata or snapshot-data space).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Chunk(pub u64);

/// 512-byte sector address on a device.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Sector(pub u64);

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Chunk {
    /// Add a chunk count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, count: u64) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

impl Sector {
    #[must_use]
    pub fn to_bytes(self) -> u64 {
        self.0 << u64::from(SECTOR_BITS)
    }
}

/// Per-space allocation geometry derived from the configured chunk size.
///
/// The chunk size is fixed at format time, independently for the metadata
/// and snapshot-data devices, and must be a power of two of at least one
/// sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocGeometry {
    allocsize_bits: u32,
}

impl AllocGeometry {
    pub fn new(allocsize_bits: u32) -> Result<Self, ParseError> {
        if !(SECTOR_BITS..=20).contains(&allocsize_bits) {
            return Err(ParseError::InvalidField {
                field: "allocsize_bits",
                reason: "chunk size must be between one sector and 1 MiB",
            });
        }
        Ok(Self { allocsize_bits })
    }

    #[must_use]
    pub fn allocsize_bits(self) -> u32 {
        self.allocsize_bits
    }

    /// Chunk size in bytes.
    #[must_use]
    pub fn allocsize(self) -> u32 {
        1 << self.allocsize_bits
    }

    #[must_use]
    pub fn sectors_per_alloc_bits(self) -> u32 {
        self.allocsize_bits - SECTOR_BITS
    }

    #[must_use]
    pub fn sectors_per_alloc(self) -> u64 {
        1 << u64::from(self.sectors_per_alloc_bits())
    }

    /// Device sector holding the first byte of `chunk`.
    #[must_use]
    pub fn chunk_to_sector(self, chunk: Chunk) -> Sector {
        Sector(chunk.0 << u64::from(self.sectors_per_alloc_bits()))
    }

    #[must_use]
    pub fn sector_to_chunk(self, sector: Sector) -> Chunk {
        Chunk(sector.0 >> u64::from(self.sectors_per_alloc_bits()))
    }

    /// Byte offset of a chunk on its device.
    #[must_use]
    pub fn chunk_to_bytes(self, chunk: Chunk) -> u64 {
        chunk.0 << u64::from(self.allocsize_bits)
    }

    /// Number of whole chunks in `bytes` (truncating).
    #[must_use]
    pub fn bytes_to_chunks(self, bytes: u64) -> u64 {
        bytes >> u64::from(self.allocsize_bits)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

// The write-side mirrors of the read helpers. Callers size the destination
// up front (blocks and message bodies have known lengths), so these panic on
// out-of-bounds rather than threading a Result through every field store.

#[inline]
pub fn put_le_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put_le_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn put_le_u64(data: &mut [u8], offset: usize, value: u64) {
    data[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

/// Round `n` up to a multiple of `d` and divide.
#[must_use]
pub fn div_round_up(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_validation() {
        assert!(AllocGeometry::new(12).is_ok());
        assert!(AllocGeometry::new(9).is_ok());
        assert!(AllocGeometry::new(8).is_err());
        assert!(AllocGeometry::new(21).is_err());
    }

    #[test]
    fn geometry_conversions() {
        let geo = AllocGeometry::new(12).unwrap();
        assert_eq!(geo.allocsize(), 4096);
        assert_eq!(geo.sectors_per_alloc(), 8);
        assert_eq!(geo.chunk_to_sector(Chunk(3)), Sector(24));
        assert_eq!(geo.sector_to_chunk(Sector(24)), Chunk(3));
        assert_eq!(geo.chunk_to_bytes(Chunk(2)), 8192);
        assert_eq!(geo.bytes_to_chunks(16 << 20), 4096);
    }

    #[test]
    fn le_round_trip() {
        let mut buf = [0_u8; 16];
        put_le_u16(&mut buf, 0, 0x1eaf);
        put_le_u32(&mut buf, 2, 0xdead_beef);
        put_le_u64(&mut buf, 6, 0x0123_4567_89ab_cdef);
        assert_eq!(read_le_u16(&buf, 0).unwrap(), 0x1eaf);
        assert_eq!(read_le_u32(&buf, 2).unwrap(), 0xdead_beef);
        assert_eq!(read_le_u64(&buf, 6).unwrap(), 0x0123_4567_89ab_cdef);
    }

    #[test]
    fn short_reads_error() {
        let buf = [0_u8; 4];
        assert!(read_le_u64(&buf, 0).is_err());
        assert!(read_le_u32(&buf, 2).is_err());
        assert!(ensure_slice(&buf, usize::MAX, 2).is_err());
    }

    #[test]
    fn div_round_up_basics() {
        assert_eq!(div_round_up(0, 4096), 0);
        assert_eq!(div_round_up(1, 4096), 1);
        assert_eq!(div_round_up(4096, 4096), 1);
        assert_eq!(div_round_up(4097, 4096), 2);
    }
}
