//! Packed exception-tree leaf format and in-place editing.
//!
//! A leaf fills one metadata chunk. A directory map at the base of the block
//! points at exception records packed upward from the top; the difference
//! between two successive directory offsets gives the number of distinct
//! exceptions for a chunk. Each exception pairs a snapshot-data chunk with a
//! bitmap of the snapshots that see it. Chunk addresses in the directory are
//! relative to `base_chunk`, which keeps them to 32 bits.
//!
//! Layout (all little-endian):
//!
//! ```text
//! 0   u16  magic (0x1eaf)
//! 2   u16  version
//! 4   u32  count
//! 8   u64  base_chunk
//! 16  u64  using_mask
//! 24  {offset: u32, rchunk: u32} x (count + 1)   directory + sentinel
//! ... free space ...
//! top {share: u64, chunk: u64} records, packed downward from block end
//! ```
//!
//! The sentinel directory entry at index `count` holds the upper bound of
//! the exceptions region, so `offset[count]` is the block size on an empty
//! leaf. Editing never reallocates: when an insert does not fit the caller
//! splits the leaf and retries.

use snapstore_error::{Result, SnapError};
use snapstore_types::LEAF_MAGIC;

const HDR_MAGIC: usize = 0;
const HDR_VERSION: usize = 2;
const HDR_COUNT: usize = 4;
const HDR_BASE_CHUNK: usize = 8;
const HDR_USING_MASK: usize = 16;
const MAP_BASE: usize = 24;
const MAP_ENTRY_SIZE: usize = 8;
pub const EXCEPTION_SIZE: usize = 16;

#[inline]
fn get_u16(block: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([block[off], block[off + 1]])
}

#[inline]
fn get_u32(block: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([block[off], block[off + 1], block[off + 2], block[off + 3]])
}

#[inline]
fn get_u64(block: &[u8], off: usize) -> u64 {
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(&block[off..off + 8]);
    u64::from_le_bytes(raw)
}

#[inline]
fn put_u16(block: &mut [u8], off: usize, value: u16) {
    block[off..off + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn put_u32(block: &mut [u8], off: usize, value: u32) {
    block[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn put_u64(block: &mut [u8], off: usize, value: u64) {
    block[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

/// Initialize an all-zero block as an empty leaf.
pub fn init_leaf(block: &mut [u8]) {
    let size = block.len();
    put_u16(block, HDR_MAGIC, LEAF_MAGIC);
    put_u16(block, HDR_VERSION, 0);
    put_u32(block, HDR_COUNT, 0);
    put_u64(block, HDR_BASE_CHUNK, 0);
    put_u64(block, HDR_USING_MASK, 0);
    put_u32(block, MAP_BASE, size as u32); // sentinel upper bound
    put_u32(block, MAP_BASE + 4, 0);
}

#[must_use]
pub fn is_leaf(block: &[u8]) -> bool {
    get_u16(block, HDR_MAGIC) == LEAF_MAGIC
}

pub fn check_magic(block: &[u8]) -> Result<()> {
    let magic = get_u16(block, HDR_MAGIC);
    if magic != LEAF_MAGIC {
        return Err(SnapError::Corruption {
            sector: 0,
            detail: format!("leaf magic {magic:#x}, expected {LEAF_MAGIC:#x}"),
        });
    }
    Ok(())
}

#[must_use]
pub fn leaf_count(block: &[u8]) -> usize {
    get_u32(block, HDR_COUNT) as usize
}

fn set_leaf_count(block: &mut [u8], count: usize) {
    put_u32(block, HDR_COUNT, count as u32);
}

#[must_use]
pub fn base_chunk(block: &[u8]) -> u64 {
    get_u64(block, HDR_BASE_CHUNK)
}

#[inline]
fn map_entry(i: usize) -> usize {
    MAP_BASE + i * MAP_ENTRY_SIZE
}

/// Byte offset of the first exception for directory entry `i`; at
/// `i == count` this is the sentinel upper bound.
#[must_use]
pub fn map_offset(block: &[u8], i: usize) -> usize {
    get_u32(block, map_entry(i)) as usize
}

fn set_map_offset(block: &mut [u8], i: usize, offset: usize) {
    put_u32(block, map_entry(i), offset as u32);
}

#[must_use]
pub fn map_rchunk(block: &[u8], i: usize) -> u32 {
    get_u32(block, map_entry(i) + 4)
}

fn set_map_rchunk(block: &mut [u8], i: usize, rchunk: u32) {
    put_u32(block, map_entry(i) + 4, rchunk);
}

/// Share mask of exception record at byte offset `off`.
#[must_use]
pub fn exception_share(block: &[u8], off: usize) -> u64 {
    get_u64(block, off)
}

/// Snapshot-data chunk of exception record at byte offset `off`.
#[must_use]
pub fn exception_chunk(block: &[u8], off: usize) -> u64 {
    get_u64(block, off + 8)
}

/// Bytes unused between the directory (including sentinel) and the packed
/// exceptions.
#[must_use]
pub fn leaf_freespace(block: &[u8]) -> usize {
    let count = leaf_count(block);
    let maptop = map_entry(count + 1);
    map_offset(block, 0) - maptop
}

/// Bytes of live payload: directory entries plus exception records.
#[must_use]
pub fn leaf_payload(block: &[u8]) -> usize {
    let count = leaf_count(block);
    let lower = count * MAP_ENTRY_SIZE;
    let upper = map_offset(block, count) - map_offset(block, 0);
    lower + upper
}

/// An origin logical chunk is unique iff every live snapshot already has an
/// exception for it. With no snapshots at all every chunk is unique.
#[must_use]
pub fn origin_chunk_unique(block: &[u8], chunk: u64, snapmask: u64) -> bool {
    let target = (chunk - base_chunk(block)) as u32;
    let count = leaf_count(block);
    let Some(i) = (0..count).find(|i| map_rchunk(block, *i) == target) else {
        return snapmask == 0;
    };
    let mut using = 0_u64;
    let mut off = map_offset(block, i);
    let end = map_offset(block, i + 1);
    while off < end {
        using |= exception_share(block, off);
        off += EXCEPTION_SIZE;
    }
    !using & snapmask == 0
}

/// A snapshot chunk is unique iff its exception's share mask contains no
/// other snapshot bit. Reports the exception chunk (zero when absent)
/// whether or not the chunk is unique.
#[must_use]
pub fn snapshot_chunk_unique(block: &[u8], chunk: u64, snapbit: u32, exception: &mut u64) -> bool {
    let mask = 1_u64 << snapbit;
    let target = (chunk - base_chunk(block)) as u32;
    let count = leaf_count(block);
    let Some(i) = (0..count).find(|i| map_rchunk(block, *i) == target) else {
        return false;
    };
    let mut off = map_offset(block, i);
    let end = map_offset(block, i + 1);
    while off < end {
        let share = exception_share(block, off);
        if share & mask != 0 {
            *exception = exception_chunk(block, off);
            return share & !mask == 0;
        }
        off += EXCEPTION_SIZE;
    }
    false
}

/// Insert an exception for `chunk` pointing at snapshot-data chunk
/// `new_exception`.
///
/// `snap` is `None` for an origin write (the new record is shared by every
/// active snapshot without an existing divergence) or `Some(bit)` for a
/// snapshot write (the bit moves from the existing record to the new one).
/// Returns `SnapError::LeafFull` when the record and/or directory slot do
/// not fit; the caller splits the leaf and retries.
pub fn add_exception(
    block: &mut [u8],
    chunk: u64,
    new_exception: u64,
    snap: Option<u32>,
    active: u64,
) -> Result<()> {
    let target = (chunk - base_chunk(block)) as u32;
    let count = leaf_count(block);
    let exceptions_start = map_offset(block, 0);
    let maptop = map_entry(count + 1); // includes sentinel
    let free = exceptions_start - maptop;

    let i = (0..count)
        .find(|i| map_rchunk(block, *i) >= target)
        .unwrap_or(count);

    let sharemap;
    let ins_off;
    if i == count || map_rchunk(block, i) > target {
        // New directory slot: shift the map tail (sentinel included) up one
        // entry and point the slot at the insertion position.
        if free < EXCEPTION_SIZE + MAP_ENTRY_SIZE {
            return Err(SnapError::LeafFull);
        }
        ins_off = map_offset(block, i);
        block.copy_within(map_entry(i)..maptop, map_entry(i + 1));
        set_map_offset(block, i, ins_off);
        set_map_rchunk(block, i, target);
        set_leaf_count(block, count + 1);
        sharemap = match snap {
            None => active,
            Some(bit) => 1 << bit,
        };
    } else {
        if free < EXCEPTION_SIZE {
            return Err(SnapError::LeafFull);
        }
        match snap {
            None => {
                // Origin write: the new version belongs to every active
                // snapshot that has no exception of its own yet.
                let mut using = 0_u64;
                let mut off = map_offset(block, i);
                let end = map_offset(block, i + 1);
                while off < end {
                    using |= exception_share(block, off);
                    off += EXCEPTION_SIZE;
                }
                sharemap = !using & active;
            }
            Some(bit) => {
                // Snapshot write: unshare - clear this snapshot's bit from
                // the record it currently shares.
                let mask = 1_u64 << bit;
                let mut off = map_offset(block, i);
                let end = map_offset(block, i + 1);
                while off < end {
                    let share = exception_share(block, off);
                    if share & mask != 0 {
                        put_u64(block, off, share & !mask);
                        break;
                    }
                    off += EXCEPTION_SIZE;
                }
                sharemap = mask;
            }
        }
        ins_off = map_offset(block, i);
    }

    // Slide the records above the insertion point down one slot and write
    // the new record at the top of this key's run.
    block.copy_within(exceptions_start..ins_off, exceptions_start - EXCEPTION_SIZE);
    put_u64(block, ins_off - EXCEPTION_SIZE, sharemap);
    put_u64(block, ins_off - EXCEPTION_SIZE + 8, new_exception);

    for j in 0..=i {
        let off = map_offset(block, j);
        set_map_offset(block, j, off - EXCEPTION_SIZE);
    }
    Ok(())
}

/// Split `block` roughly at the median directory entry, copying the upper
/// half into the fresh leaf `block2`. Returns the split key (lowest chunk of
/// the right half).
pub fn split_leaf(block: &mut [u8], block2: &mut [u8]) -> u64 {
    let count = leaf_count(block);
    let nhead = (count + 1) / 2;
    let ntail = count - nhead;
    let splitpoint = u64::from(map_rchunk(block, nhead)) + base_chunk(block);

    let phead = map_offset(block, 0);
    let ptail = map_offset(block, nhead);
    let tailsize = map_offset(block, count) - ptail;

    // Header, directory tail (with sentinel) and upper data go to the new
    // leaf; record offsets stay valid because the bytes keep their position.
    block2[..MAP_BASE].copy_from_slice(&block[..MAP_BASE]);
    block2[MAP_BASE..map_entry(ntail + 1)]
        .copy_from_slice(&block[map_entry(nhead)..map_entry(nhead + ntail + 1)]);
    block2[ptail..ptail + tailsize].copy_from_slice(&block[ptail..ptail + tailsize]);
    set_leaf_count(block2, ntail);

    // Pack the lower half against the top of the original block.
    block.copy_within(phead..ptail, phead + tailsize);
    set_leaf_count(block, nhead);
    for i in 0..=nhead {
        let off = map_offset(block, i);
        set_map_offset(block, i, off + tailsize);
    }
    set_map_rchunk(block, nhead, 0); // tidy up the sentinel

    splitpoint
}

/// Merge `src` into `dst`. The caller guarantees
/// `leaf_payload(src) <= leaf_freespace(dst)`; all of `dst`'s keys are below
/// all of `src`'s.
pub fn merge_leaves(dst: &mut [u8], src: &[u8]) {
    let nhead = leaf_count(dst);
    let ntail = leaf_count(src);
    let src_lo = map_offset(src, 0);
    let tailsize = map_offset(src, ntail) - src_lo;
    let phead = map_offset(dst, 0);
    let ptail = map_offset(dst, nhead); // sentinel: top of block

    dst.copy_within(phead..ptail, phead - tailsize);
    for i in 0..=nhead {
        let off = map_offset(dst, i);
        set_map_offset(dst, i, off - tailsize);
    }
    // src's records sit against the block top, so their directory offsets
    // transfer unchanged.
    dst[ptail - tailsize..ptail].copy_from_slice(&src[src_lo..src_lo + tailsize]);
    dst[map_entry(nhead)..map_entry(nhead + ntail + 1)]
        .copy_from_slice(&src[map_entry(0)..map_entry(ntail + 1)]);
    set_leaf_count(dst, nhead + ntail);
}

/// Clear `snapmask` bits from every exception in the leaf, dropping records
/// whose masks go to zero and compacting the directory.
///
/// Works top to bottom through the records, packing survivors against the
/// block top, then bottom to top through the directory, packing nonempty
/// entries down. Returns whether any bit was cleared and the snapshot-data
/// chunks freed by dropped records.
pub fn delete_snapshots_from_leaf(block: &mut [u8], snapmask: u64) -> (bool, Vec<u64>) {
    let count = leaf_count(block);
    let mut any = false;
    let mut freed = Vec::new();

    let mut p = map_offset(block, count);
    let mut dest = p;
    for i in (0..count).rev() {
        let lower = map_offset(block, i);
        while p != lower {
            p -= EXCEPTION_SIZE;
            let share = exception_share(block, p);
            let chunk = exception_chunk(block, p);
            any |= share & snapmask != 0;
            let kept = share & !snapmask;
            if kept != 0 {
                dest -= EXCEPTION_SIZE;
                put_u64(block, dest, kept);
                put_u64(block, dest + 8, chunk);
            } else {
                freed.push(chunk);
            }
        }
        set_map_offset(block, i, dest);
    }

    // Drop directory entries whose runs emptied.
    let mut dmap = 0_usize;
    for i in 0..count {
        if map_offset(block, i) != map_offset(block, i + 1) {
            if dmap != i {
                let off = map_offset(block, i);
                let rchunk = map_rchunk(block, i);
                set_map_offset(block, dmap, off);
                set_map_rchunk(block, dmap, rchunk);
            }
            dmap += 1;
        }
    }
    let top = map_offset(block, count);
    set_map_offset(block, dmap, top);
    set_map_rchunk(block, dmap, 0); // tidy up
    set_leaf_count(block, dmap);

    (any, freed)
}

/// Render the leaf for the offline dump tool.
#[must_use]
pub fn format_leaf(block: &[u8]) -> String {
    use std::fmt::Write as _;
    let count = leaf_count(block);
    let mut out = String::new();
    let _ = write!(
        out,
        "base chunk {:#x}, {count} chunks:",
        base_chunk(block)
    );
    for i in 0..count {
        let _ = write!(out, " {:#x}=", map_rchunk(block, i));
        let mut off = map_offset(block, i);
        let end = map_offset(block, i + 1);
        let mut first = true;
        while off < end {
            if !first {
                let _ = write!(out, ",");
            }
            let _ = write!(
                out,
                "{:#x}/{:016x}",
                exception_chunk(block, off),
                exception_share(block, off)
            );
            first = false;
            off += EXCEPTION_SIZE;
        }
    }
    let _ = write!(
        out,
        " free {} payload {}",
        leaf_freespace(block),
        leaf_payload(block)
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: usize = 4096;

    fn empty_leaf() -> Vec<u8> {
        let mut block = vec![0_u8; BLOCK];
        init_leaf(&mut block);
        block
    }

    /// Every exception for `chunk`, top of the run first.
    fn exceptions_of(block: &[u8], chunk: u64) -> Vec<(u64, u64)> {
        let count = leaf_count(block);
        let target = (chunk - base_chunk(block)) as u32;
        let Some(i) = (0..count).find(|i| map_rchunk(block, *i) == target) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut off = map_offset(block, i);
        let end = map_offset(block, i + 1);
        while off < end {
            out.push((exception_share(block, off), exception_chunk(block, off)));
            off += EXCEPTION_SIZE;
        }
        out
    }

    fn assert_well_formed(block: &[u8]) {
        let count = leaf_count(block);
        assert!(is_leaf(block));
        // Directory strictly ascending, offsets descending run boundaries.
        for i in 1..count {
            assert!(map_rchunk(block, i - 1) < map_rchunk(block, i));
        }
        for i in 0..count {
            assert!(map_offset(block, i) <= map_offset(block, i + 1));
        }
        assert_eq!(map_offset(block, count), BLOCK);
        assert_eq!(
            leaf_payload(block) + leaf_freespace(block) + MAP_BASE + MAP_ENTRY_SIZE,
            BLOCK
        );
    }

    #[test]
    fn empty_leaf_shape() {
        let block = empty_leaf();
        assert_well_formed(&block);
        assert_eq!(leaf_count(&block), 0);
        assert_eq!(leaf_payload(&block), 0);
        assert!(origin_chunk_unique(&block, 5, 0));
        assert!(!origin_chunk_unique(&block, 5, 0b11));
    }

    #[test]
    fn origin_write_shares_with_all_active() {
        let mut block = empty_leaf();
        // Two snapshots live (bits 0 and 1); origin write to chunk 5.
        add_exception(&mut block, 5, 0x30, None, 0b11).unwrap();
        assert_well_formed(&block);
        assert_eq!(exceptions_of(&block, 5), vec![(0b11, 0x30)]);
        // Now covered for both snapshots: origin is unique.
        assert!(origin_chunk_unique(&block, 5, 0b11));
        // A third snapshot appears: no longer unique.
        assert!(!origin_chunk_unique(&block, 5, 0b111));
    }

    #[test]
    fn snapshot_write_unshares() {
        let mut block = empty_leaf();
        add_exception(&mut block, 5, 0x30, None, 0b11).unwrap();
        // Snapshot 0 writes chunk 5: bit 0 moves to a fresh exception.
        add_exception(&mut block, 5, 0x31, Some(0), 0b11).unwrap();
        assert_well_formed(&block);
        assert_eq!(exceptions_of(&block, 5), vec![(0b01, 0x31), (0b10, 0x30)]);

        let mut ex = 0;
        assert!(snapshot_chunk_unique(&block, 5, 0, &mut ex));
        assert_eq!(ex, 0x31);
        ex = 0;
        assert!(snapshot_chunk_unique(&block, 5, 1, &mut ex));
        assert_eq!(ex, 0x30);
    }

    #[test]
    fn snapshot_unique_reports_sharing() {
        let mut block = empty_leaf();
        add_exception(&mut block, 7, 0x40, None, 0b11).unwrap();
        let mut ex = 0;
        // Both snapshots share one exception: not unique, address reported.
        assert!(!snapshot_chunk_unique(&block, 7, 0, &mut ex));
        assert_eq!(ex, 0x40);
        // No entry at all for chunk 8.
        ex = 0;
        assert!(!snapshot_chunk_unique(&block, 8, 0, &mut ex));
        assert_eq!(ex, 0);
    }

    #[test]
    fn origin_uniqueness_union_over_records() {
        let mut block = empty_leaf();
        add_exception(&mut block, 9, 0x50, None, 0b01).unwrap();
        // Snapshot 1 created later; diverges via its own write.
        add_exception(&mut block, 9, 0x51, Some(1), 0b11).unwrap();
        // Union of shares is 0b11, covering the whole snapmask.
        assert!(origin_chunk_unique(&block, 9, 0b11));
        assert!(!origin_chunk_unique(&block, 9, 0b111));
    }

    #[test]
    fn inserts_keep_directory_sorted() {
        let mut block = empty_leaf();
        for chunk in [50_u64, 10, 30, 20, 40] {
            add_exception(&mut block, chunk, 0x100 + chunk, None, 1).unwrap();
        }
        assert_well_formed(&block);
        assert_eq!(leaf_count(&block), 5);
        let keys: Vec<u32> = (0..5).map(|i| map_rchunk(&block, i)).collect();
        assert_eq!(keys, vec![10, 20, 30, 40, 50]);
        for chunk in [10_u64, 20, 30, 40, 50] {
            assert_eq!(exceptions_of(&block, chunk), vec![(1, 0x100 + chunk)]);
        }
    }

    #[test]
    fn insert_returns_full_when_out_of_room() {
        let mut block = vec![0_u8; 128];
        init_leaf(&mut block);
        let mut inserted = 0_u64;
        loop {
            match add_exception(&mut block, inserted, 0x200 + inserted, None, 1) {
                Ok(()) => inserted += 1,
                Err(SnapError::LeafFull) => break,
                Err(err) => panic!("unexpected error: {err}"),
            }
        }
        // 128 - 24 header - 8 sentinel = 96 bytes; 24 per (entry + record).
        assert_eq!(inserted, 4);
        assert!(leaf_freespace(&block) < EXCEPTION_SIZE + MAP_ENTRY_SIZE);
    }

    #[test]
    fn split_partitions_and_preserves_payload() {
        let mut block = empty_leaf();
        for chunk in 0..8_u64 {
            add_exception(&mut block, chunk, 0x300 + chunk, None, 1).unwrap();
        }
        let payload_before = leaf_payload(&block);

        let mut right = vec![0_u8; BLOCK];
        init_leaf(&mut right);
        let splitkey = split_leaf(&mut block, &mut right);

        assert_eq!(splitkey, 4);
        assert_well_formed(&block);
        assert_well_formed(&right);
        assert_eq!(leaf_count(&block), 4);
        assert_eq!(leaf_count(&right), 4);
        assert_eq!(leaf_payload(&block) + leaf_payload(&right), payload_before);
        for chunk in 0..4_u64 {
            assert_eq!(exceptions_of(&block, chunk), vec![(1, 0x300 + chunk)]);
        }
        for chunk in 4..8_u64 {
            assert_eq!(exceptions_of(&right, chunk), vec![(1, 0x300 + chunk)]);
        }
    }

    #[test]
    fn merge_is_split_inverse() {
        let mut block = empty_leaf();
        for chunk in 0..8_u64 {
            add_exception(&mut block, chunk, 0x300 + chunk, None, 1).unwrap();
        }
        let mut right = vec![0_u8; BLOCK];
        init_leaf(&mut right);
        split_leaf(&mut block, &mut right);

        assert!(leaf_payload(&right) <= leaf_freespace(&block));
        merge_leaves(&mut block, &right);
        assert_well_formed(&block);
        assert_eq!(leaf_count(&block), 8);
        for chunk in 0..8_u64 {
            assert_eq!(exceptions_of(&block, chunk), vec![(1, 0x300 + chunk)]);
        }
    }

    #[test]
    fn delete_clears_bits_and_frees_sole_owners() {
        let mut block = empty_leaf();
        add_exception(&mut block, 5, 0x30, None, 0b11).unwrap(); // shared
        add_exception(&mut block, 6, 0x31, None, 0b01).unwrap(); // snap 0 only
        add_exception(&mut block, 7, 0x32, None, 0b10).unwrap(); // snap 1 only

        let (any, freed) = delete_snapshots_from_leaf(&mut block, 0b01);
        assert!(any);
        assert_eq!(freed, vec![0x31]);
        assert_well_formed(&block);
        assert_eq!(leaf_count(&block), 2);
        assert_eq!(exceptions_of(&block, 5), vec![(0b10, 0x30)]);
        assert_eq!(exceptions_of(&block, 6), Vec::new());
        assert_eq!(exceptions_of(&block, 7), vec![(0b10, 0x32)]);

        let (any, freed) = delete_snapshots_from_leaf(&mut block, 0b01);
        assert!(!any);
        assert!(freed.is_empty());
    }

    #[test]
    fn delete_compacts_multi_record_runs() {
        let mut block = empty_leaf();
        add_exception(&mut block, 5, 0x30, None, 0b11).unwrap();
        add_exception(&mut block, 5, 0x31, Some(0), 0b11).unwrap();
        // Deleting snapshot 0 drops its private record, keeps snapshot 1's.
        let (any, freed) = delete_snapshots_from_leaf(&mut block, 0b01);
        assert!(any);
        assert_eq!(freed, vec![0x31]);
        assert_eq!(exceptions_of(&block, 5), vec![(0b10, 0x30)]);
        assert_well_formed(&block);
    }
}
