//! On-disk superblock image.
//!
//! The superblock lives at a fixed sector on the metadata device and holds
//! the allocation descriptors for both chunk spaces, the journal window,
//! the exception-tree root and the snapshot table. It is rewritten in full
//! on every flush while the dirty flag is set.

use serde::Serialize;
use snapstore_error::{Result, SnapError};
use snapstore_types::{
    put_le_u16, put_le_u32, put_le_u64, read_fixed, read_le_u32, read_le_u64, AllocGeometry,
    ParseError, Sector, MAX_SNAPSHOTS, SB_MAGIC, SB_SIZE, SB_VERSION,
};

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_FLAGS: usize = 12;
const OFF_CREATE_TIME: usize = 16;
const OFF_ETREE_LEVELS: usize = 20;
const OFF_ETREE_ROOT: usize = 24;
const OFF_ORG_OFFSET: usize = 32;
const OFF_ORG_SECTORS: usize = 40;
const OFF_JOURNAL_BASE: usize = 48;
const OFF_JOURNAL_SIZE: usize = 56;
const OFF_JOURNAL_NEXT: usize = 60;
const OFF_SEQUENCE: usize = 64;
const OFF_SNAPSHOTS: usize = 68;
const OFF_META_USED: usize = 72;
const OFF_SNAP_USED: usize = 80;
const OFF_ALLOC: usize = 88;
const ALLOC_IMAGE_SIZE: usize = 48;
const OFF_SNAPLIST: usize = OFF_ALLOC + 2 * ALLOC_IMAGE_SIZE;
const SNAP_RECORD_SIZE: usize = 16;

/// One snapshot table entry.
///
/// `tag` is the client-visible identifier; `bit` is this snapshot's
/// position in exception share masks. Bits are unique across live
/// snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SnapshotRecord {
    pub tag: u32,
    pub bit: u8,
    pub prio: i8,
    pub ctime: u32,
    pub usecount: u32,
}

/// Allocation descriptor for one chunk space (metadata or snapshot-data).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocSpaceImage {
    pub geometry: AllocGeometry,
    /// Total chunks in the space.
    pub chunks: u64,
    pub freechunks: u64,
    /// First sector of the space's bitmap run on the metadata device.
    pub bitmap_base: Sector,
    pub bitmap_blocks: u64,
    /// Scan cursor: allocation resumes here to amortize the bitmap walk.
    pub last_alloc: u64,
}

impl AllocSpaceImage {
    fn encode(&self, out: &mut [u8], base: usize) {
        put_le_u32(out, base, self.geometry.allocsize_bits());
        put_le_u32(out, base + 4, 0);
        put_le_u64(out, base + 8, self.chunks);
        put_le_u64(out, base + 16, self.freechunks);
        put_le_u64(out, base + 24, self.bitmap_base.0);
        put_le_u64(out, base + 32, self.bitmap_blocks);
        put_le_u64(out, base + 40, self.last_alloc);
    }

    fn decode(raw: &[u8], base: usize) -> Result<Self> {
        Ok(Self {
            geometry: AllocGeometry::new(read_le_u32(raw, base)?)?,
            chunks: read_le_u64(raw, base + 8)?,
            freechunks: read_le_u64(raw, base + 16)?,
            bitmap_base: Sector(read_le_u64(raw, base + 24)?),
            bitmap_blocks: read_le_u64(raw, base + 32)?,
            last_alloc: read_le_u64(raw, base + 40)?,
        })
    }
}

/// In-memory mirror of the persisted superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuperImage {
    pub flags: u32,
    pub create_time: u32,
    pub etree_levels: u32,
    pub etree_root: Sector,
    /// Origin start offset within its device, in sectors.
    pub orgoffset: u64,
    pub orgsectors: u64,
    pub journal_base: Sector,
    pub journal_size: u32,
    pub journal_next: u32,
    /// Monotonic commit sequence; signed on disk so recovery can compute
    /// wrap deltas.
    pub sequence: i32,
    pub meta_chunks_used: u64,
    pub snap_chunks_used: u64,
    /// `alloc[0]` is metadata; `alloc[1]` is snapshot-data when the devices
    /// differ, unused otherwise.
    pub alloc: [AllocSpaceImage; 2],
    pub snaplist: Vec<SnapshotRecord>,
}

impl SuperImage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0_u8; SB_SIZE];
        out[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(&SB_MAGIC);
        put_le_u32(&mut out, OFF_VERSION, SB_VERSION);
        put_le_u32(&mut out, OFF_FLAGS, self.flags);
        put_le_u32(&mut out, OFF_CREATE_TIME, self.create_time);
        put_le_u32(&mut out, OFF_ETREE_LEVELS, self.etree_levels);
        put_le_u64(&mut out, OFF_ETREE_ROOT, self.etree_root.0);
        put_le_u64(&mut out, OFF_ORG_OFFSET, self.orgoffset);
        put_le_u64(&mut out, OFF_ORG_SECTORS, self.orgsectors);
        put_le_u64(&mut out, OFF_JOURNAL_BASE, self.journal_base.0);
        put_le_u32(&mut out, OFF_JOURNAL_SIZE, self.journal_size);
        put_le_u32(&mut out, OFF_JOURNAL_NEXT, self.journal_next);
        put_le_u32(&mut out, OFF_SEQUENCE, self.sequence as u32);
        put_le_u32(&mut out, OFF_SNAPSHOTS, self.snaplist.len() as u32);
        put_le_u64(&mut out, OFF_META_USED, self.meta_chunks_used);
        put_le_u64(&mut out, OFF_SNAP_USED, self.snap_chunks_used);
        self.alloc[0].encode(&mut out, OFF_ALLOC);
        self.alloc[1].encode(&mut out, OFF_ALLOC + ALLOC_IMAGE_SIZE);
        for (i, snap) in self.snaplist.iter().enumerate() {
            let base = OFF_SNAPLIST + i * SNAP_RECORD_SIZE;
            put_le_u32(&mut out, base, snap.tag);
            out[base + 4] = snap.bit;
            out[base + 5] = snap.prio as u8;
            put_le_u16(&mut out, base + 6, 0);
            put_le_u32(&mut out, base + 8, snap.ctime);
            put_le_u32(&mut out, base + 12, snap.usecount);
        }
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let magic = read_fixed::<8>(raw, OFF_MAGIC)?;
        if magic != SB_MAGIC {
            return Err(SnapError::Format(ParseError::InvalidMagic {
                expected: u64::from_le_bytes(SB_MAGIC),
                actual: u64::from_le_bytes(magic),
            }));
        }
        let version = read_le_u32(raw, OFF_VERSION)?;
        if version != SB_VERSION {
            return Err(SnapError::Format(ParseError::InvalidField {
                field: "version",
                reason: "unsupported superblock version",
            }));
        }
        let snapshots = read_le_u32(raw, OFF_SNAPSHOTS)? as usize;
        if snapshots > MAX_SNAPSHOTS {
            return Err(SnapError::Format(ParseError::InvalidField {
                field: "snapshots",
                reason: "snapshot count exceeds the table",
            }));
        }
        let mut snaplist = Vec::with_capacity(snapshots);
        for i in 0..snapshots {
            let base = OFF_SNAPLIST + i * SNAP_RECORD_SIZE;
            snaplist.push(SnapshotRecord {
                tag: read_le_u32(raw, base)?,
                bit: raw
                    .get(base + 4)
                    .copied()
                    .ok_or(ParseError::InsufficientData {
                        needed: 1,
                        offset: base + 4,
                        actual: 0,
                    })?,
                prio: raw
                    .get(base + 5)
                    .copied()
                    .ok_or(ParseError::InsufficientData {
                        needed: 1,
                        offset: base + 5,
                        actual: 0,
                    })? as i8,
                ctime: read_le_u32(raw, base + 8)?,
                usecount: read_le_u32(raw, base + 12)?,
            });
        }
        Ok(Self {
            flags: read_le_u32(raw, OFF_FLAGS)?,
            create_time: read_le_u32(raw, OFF_CREATE_TIME)?,
            etree_levels: read_le_u32(raw, OFF_ETREE_LEVELS)?,
            etree_root: Sector(read_le_u64(raw, OFF_ETREE_ROOT)?),
            orgoffset: read_le_u64(raw, OFF_ORG_OFFSET)?,
            orgsectors: read_le_u64(raw, OFF_ORG_SECTORS)?,
            journal_base: Sector(read_le_u64(raw, OFF_JOURNAL_BASE)?),
            journal_size: read_le_u32(raw, OFF_JOURNAL_SIZE)?,
            journal_next: read_le_u32(raw, OFF_JOURNAL_NEXT)?,
            sequence: read_le_u32(raw, OFF_SEQUENCE)? as i32,
            meta_chunks_used: read_le_u64(raw, OFF_META_USED)?,
            snap_chunks_used: read_le_u64(raw, OFF_SNAP_USED)?,
            alloc: [
                AllocSpaceImage::decode(raw, OFF_ALLOC)?,
                AllocSpaceImage::decode(raw, OFF_ALLOC + ALLOC_IMAGE_SIZE)?,
            ],
            snaplist,
        })
    }

    /// Union of `1 << bit` over the live snapshot table.
    #[must_use]
    pub fn calc_snapmask(&self) -> u64 {
        self.snaplist
            .iter()
            .fold(0, |mask, snap| mask | (1_u64 << snap.bit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_image() -> SuperImage {
        let geo = AllocGeometry::new(12).unwrap();
        SuperImage {
            flags: 1,
            create_time: 1_700_000_000,
            etree_levels: 1,
            etree_root: Sector(0x140),
            orgoffset: 0,
            orgsectors: 32768,
            journal_base: Sector(0x80),
            journal_size: 64,
            journal_next: 3,
            sequence: -5,
            meta_chunks_used: 70,
            snap_chunks_used: 2,
            alloc: [
                AllocSpaceImage {
                    geometry: geo,
                    chunks: 4096,
                    freechunks: 4026,
                    bitmap_base: Sector(16),
                    bitmap_blocks: 1,
                    last_alloc: 69,
                },
                AllocSpaceImage {
                    geometry: geo,
                    chunks: 4096,
                    freechunks: 4094,
                    bitmap_base: Sector(24),
                    bitmap_blocks: 1,
                    last_alloc: 1,
                },
            ],
            snaplist: vec![
                SnapshotRecord {
                    tag: 7,
                    bit: 0,
                    prio: -3,
                    ctime: 1_700_000_100,
                    usecount: 1,
                },
                SnapshotRecord {
                    tag: 9,
                    bit: 1,
                    prio: 0,
                    ctime: 1_700_000_200,
                    usecount: 0,
                },
            ],
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let image = sample_image();
        let raw = image.encode();
        assert_eq!(raw.len(), SB_SIZE);
        assert_eq!(&raw[..8], b"SNAPSTOR");
        let back = SuperImage::decode(&raw).unwrap();
        assert_eq!(back, image);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut raw = sample_image().encode();
        raw[0] = b'X';
        assert!(SuperImage::decode(&raw).is_err());
    }

    #[test]
    fn snapmask_is_union_of_bits() {
        let image = sample_image();
        assert_eq!(image.calc_snapmask(), 0b11);
    }
}
