//! Chunk allocation via bitmaps.
//!
//! Each space (metadata, snapshot-data) owns a contiguous run of bitmap
//! blocks on the metadata device, one bit per chunk. A cursor remembers
//! where the last allocation landed so scans amortize; exhaustion of the
//! snapshot-data space triggers priority eviction before failing.

use crate::leaf;
use crate::store::{SnapStore, Space};
use crate::tree;
use snapstore_block::BufferRef;
use snapstore_error::{Result, SnapError};
use snapstore_types::{div_round_up, Chunk, Sector, SB_SECTOR, SB_SIZE};
use tracing::{trace, warn};

#[inline]
#[must_use]
pub fn get_bitmap_bit(bitmap: &[u8], bit: u64) -> bool {
    bitmap[(bit >> 3) as usize] & (1 << (bit & 7)) != 0
}

#[inline]
pub fn set_bitmap_bit(bitmap: &mut [u8], bit: u64) {
    bitmap[(bit >> 3) as usize] |= 1 << (bit & 7);
}

#[inline]
pub fn clear_bitmap_bit(bitmap: &mut [u8], bit: u64) {
    bitmap[(bit >> 3) as usize] &= !(1 << (bit & 7));
}

impl SnapStore {
    /// Bits per bitmap block; bitmap blocks are metadata chunks.
    fn bitmap_shift(&self) -> u32 {
        self.meta_geometry().allocsize_bits() + 3
    }

    fn calc_bitmap_blocks(&self, chunks: u64) -> u64 {
        div_round_up(chunks, 1 << u64::from(self.bitmap_shift()))
    }

    fn bitmap_sector(&self, space: Space, bitmap_block: u64) -> Sector {
        let base = self.asi(space).bitmap_base;
        Sector(base.0 + (bitmap_block << u64::from(self.meta_geometry().sectors_per_alloc_bits())))
    }

    /// Lay out both bitmap regions and the journal window behind the
    /// superblock, reserving every chunk of the fixed layout in the
    /// metadata bitmap.
    pub(crate) fn init_allocation(&mut self) -> Result<()> {
        let meta_geo = self.meta_geometry();
        let spab = u64::from(meta_geo.sectors_per_alloc_bits());

        // First chunk past the superblock image.
        let sb_end = (SB_SECTOR << u64::from(snapstore_types::SECTOR_BITS)) + SB_SIZE as u64;
        let meta_bitmap_base_chunk = div_round_up(sb_end, u64::from(meta_geo.allocsize()));
        let meta_bitmaps = self.calc_bitmap_blocks(self.asi(Space::Meta).chunks);
        {
            let asi = self.asi_mut(Space::Meta);
            asi.bitmap_blocks = meta_bitmaps;
            asi.bitmap_base = Sector(meta_bitmap_base_chunk << spab);
            asi.last_alloc = 0;
        }

        let journal_size = u64::from(self.image.journal_size);
        let mut reserved = meta_bitmap_base_chunk + meta_bitmaps + journal_size;

        let snap_bitmaps = if self.separate_snapdev {
            let snap_bitmaps = self.calc_bitmap_blocks(self.asi(Space::Snap).chunks);
            let snap_bitmap_base_chunk = meta_bitmap_base_chunk + meta_bitmaps;
            let asi = self.asi_mut(Space::Snap);
            asi.bitmap_blocks = snap_bitmaps;
            asi.bitmap_base = Sector(snap_bitmap_base_chunk << spab);
            asi.last_alloc = 0;
            reserved += snap_bitmaps;
            snap_bitmaps
        } else {
            0
        };

        {
            let chunks = self.asi(Space::Meta).chunks;
            if reserved > chunks {
                return Err(SnapError::NoSpace { space: "metadata" });
            }
            let asi = self.asi_mut(Space::Meta);
            asi.freechunks = chunks - reserved;
        }
        self.image.meta_chunks_used = reserved;

        self.image.journal_base = Sector(
            self.asi(Space::Meta).bitmap_base.0 + ((meta_bitmaps + snap_bitmaps) << spab),
        );

        // Zero the bitmap blocks; the metadata bitmap pre-reserves the whole
        // fixed layout, and each space masks the overrun bits of its partial
        // last byte so they can never be handed out.
        self.init_bitmap_blocks(Space::Meta, reserved)?;
        if self.separate_snapdev {
            // Snapshot-data chunk 0 is reserved so "exception zero" always
            // means "no exception".
            self.init_bitmap_blocks(Space::Snap, 1)?;
            let asi = self.asi_mut(Space::Snap);
            asi.freechunks = asi.chunks - 1;
            self.image.snap_chunks_used = 1;
        }
        Ok(())
    }

    fn init_bitmap_blocks(&mut self, space: Space, reserve: u64) -> Result<()> {
        let blocks = self.asi(space).bitmap_blocks;
        let chunks = self.asi(space).chunks;
        let blocksize = self.cache.blocksize();
        for i in 0..blocks {
            let sector = self.bitmap_sector(space, i);
            let buffer = self.cache.getblk(sector);
            {
                let mut data = buffer.data();
                data.fill(0);
                if i == 0 {
                    for bit in 0..reserve.min(1 << u64::from(self.bitmap_shift())) {
                        set_bitmap_bit(&mut data, bit);
                    }
                }
                if i == blocks - 1 && chunks & 7 != 0 {
                    let byte = ((chunks >> 3) as usize) & (blocksize - 1);
                    data[byte] |= 0xff << (chunks & 7);
                }
            }
            self.cache.mark_dirty(&buffer);
        }
        Ok(())
    }

    /// Scan for a free chunk within `range` chunks starting at `start`,
    /// wrapping to bitmap block 0. Returns the allocated chunk number, or
    /// `None` when the range is exhausted.
    pub(crate) fn alloc_chunk_range(
        &mut self,
        space: Space,
        start: u64,
        range: u64,
    ) -> Result<Option<u64>> {
        let bitmap_shift = self.bitmap_shift();
        let bitmap_mask = (1_u64 << bitmap_shift) - 1;
        let blocksize = self.cache.blocksize();
        let mut blocknum = start >> bitmap_shift;
        let bit = start & 7;
        let mut offset = ((start & bitmap_mask) >> 3) as usize;
        let mut length = (range + bit + 7) >> 3;

        loop {
            let sector = self.bitmap_sector(space, blocknum);
            let buffer = self.cache.bread(sector)?;
            let tail = (blocksize - offset) as u64;
            let n = tail.min(length) as usize;

            let mut found = None;
            {
                let mut data = buffer.data();
                for p in offset..offset + n {
                    let byte = data[p];
                    if byte != 0xff {
                        let free_bit = byte.trailing_ones() as u64;
                        let chunk =
                            free_bit + ((p as u64) << 3) + (blocknum << u64::from(bitmap_shift));
                        set_bitmap_bit(&mut data, chunk & bitmap_mask);
                        found = Some(chunk);
                        break;
                    }
                }
            }
            if let Some(chunk) = found {
                trace!(target: "snapstore::alloc", space = space.name(), chunk, "alloc chunk");
                self.cache.mark_dirty(&buffer);
                self.asi_mut(space).freechunks -= 1;
                self.set_sb_dirty();
                return Ok(Some(chunk));
            }

            length -= n as u64;
            if length == 0 {
                return Ok(None);
            }
            blocknum += 1;
            if blocknum == self.asi(space).bitmap_blocks {
                blocknum = 0;
            }
            offset = 0;
        }
    }

    /// Allocate one chunk, scanning from the cursor and wrapping. When the
    /// snapshot-data space is exhausted, evict the lowest-priority idle
    /// snapshot and retry; metadata exhaustion fails the operation.
    pub fn alloc_chunk(&mut self, space: Space) -> Result<u64> {
        loop {
            let last = self.asi(space).last_alloc;
            let total = self.asi(space).chunks;
            let found = match self.alloc_chunk_range(space, last, total - last)? {
                Some(found) => Some(found),
                None => self.alloc_chunk_range(space, 0, last)?,
            };
            if let Some(found) = found {
                self.asi_mut(space).last_alloc = found;
                self.set_sb_dirty();
                return Ok(found);
            }
            if matches!(space, Space::Meta) {
                warn!(target: "snapstore::alloc", "metadata store exhausted");
                return Err(SnapError::NoSpace { space: "metadata" });
            }
            let Some(victim) = self.find_snapshot_to_delete() else {
                warn!(
                    target: "snapstore::alloc",
                    "unable to find a snapshot candidate to remove, failing I/O"
                );
                return Err(SnapError::NoSpace { space: "snapshot" });
            };
            warn!(
                target: "snapstore::alloc",
                tag = victim,
                "snapshot store full, releasing snapshot"
            );
            self.delete_snapshot(victim)?;
        }
    }

    /// Clear a chunk's bitmap bit. Warns and reports `false` if the chunk
    /// was already free.
    pub(crate) fn free_chunk(&mut self, space: Space, chunk: u64) -> Result<bool> {
        let bitmap_shift = self.bitmap_shift();
        let bitmap_mask = (1_u64 << bitmap_shift) - 1;
        let sector = self.bitmap_sector(space, chunk >> bitmap_shift);
        let buffer = self.cache.bread(sector)?;
        {
            let mut data = buffer.data();
            if !get_bitmap_bit(&data, chunk & bitmap_mask) {
                warn!(target: "snapstore::alloc", space = space.name(), chunk, "chunk already free");
                return Ok(false);
            }
            clear_bitmap_bit(&mut data, chunk & bitmap_mask);
        }
        self.cache.mark_dirty(&buffer);
        self.asi_mut(space).freechunks += 1;
        self.set_sb_dirty();
        Ok(true)
    }

    // ── Metadata and snapshot-store facades ─────────────────────────────

    /// Allocate one metadata chunk and return its sector address.
    pub(crate) fn alloc_block(&mut self) -> Result<Sector> {
        let chunk = self.alloc_chunk(Space::Meta)?;
        self.image.meta_chunks_used += 1;
        Ok(self.meta_geometry().chunk_to_sector(Chunk(chunk)))
    }

    /// Allocate one snapshot-data chunk for a new exception.
    pub(crate) fn alloc_exception(&mut self) -> Result<u64> {
        let chunk = self.alloc_chunk(Space::Snap)?;
        self.image.snap_chunks_used += 1;
        Ok(chunk)
    }

    pub(crate) fn free_block(&mut self, sector: Sector) -> Result<()> {
        let chunk = self.meta_geometry().sector_to_chunk(sector);
        if self.free_chunk(Space::Meta, chunk.0)? {
            self.image.meta_chunks_used -= 1;
        }
        Ok(())
    }

    pub(crate) fn free_exception(&mut self, chunk: u64) -> Result<()> {
        if self.free_chunk(Space::Snap, chunk)? {
            self.image.snap_chunks_used -= 1;
        }
        Ok(())
    }

    fn new_block(&mut self) -> Result<BufferRef> {
        let sector = self.alloc_block()?;
        Ok(self.cache.getblk(sector))
    }

    pub(crate) fn new_leaf(&mut self) -> Result<BufferRef> {
        trace!(target: "snapstore::tree", "new leaf");
        let buffer = self.new_block()?;
        {
            let mut data = buffer.data();
            data.fill(0);
            leaf::init_leaf(&mut data);
        }
        self.cache.mark_dirty(&buffer);
        Ok(buffer)
    }

    pub(crate) fn new_node(&mut self) -> Result<BufferRef> {
        trace!(target: "snapstore::tree", "new node");
        let buffer = self.new_block()?;
        {
            let mut data = buffer.data();
            data.fill(0);
            tree::init_node(&mut data);
        }
        self.cache.mark_dirty(&buffer);
        Ok(buffer)
    }
}
