//! The exception B-tree: an ordered map from origin chunk to exception
//! records, leaves all at one depth.
//!
//! Index nodes hold `(key, child sector)` entries; the first entry's key is
//! never consulted because pivots lie between children. Insertion tracks the
//! descent path so leaf splits can propagate upward, adding a tree level
//! when the root itself splits. Deletion walks the leaves in order, scrubs
//! snapshot bits, and merges neighbors back together, demoting the root
//! when it is left with a single child.

use crate::copyout::SNAP_SOURCE_BIT;
use crate::leaf;
use crate::store::SnapStore;
use snapstore_block::BufferRef;
use snapstore_error::{Result, SnapError};
use snapstore_types::Sector;
use tracing::{trace, warn};

const NODE_HDR: usize = 8;
const INDEX_ENTRY_SIZE: usize = 16;

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
fn put_u32(block: &mut [u8], off: usize, value: u32) {
    block[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
fn put_u64(block: &mut [u8], off: usize, value: u64) {
    block[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

/// `(key, child)` pairs one metadata chunk can hold.
#[must_use]
pub fn alloc_per_node(blocksize: usize) -> usize {
    (blocksize - NODE_HDR) / INDEX_ENTRY_SIZE
}

pub(crate) fn init_node(block: &mut [u8]) {
    put_u32(block, 0, 0);
    put_u32(block, 4, 0);
}

#[must_use]
pub fn node_count(block: &[u8]) -> usize {
    get_u32(block, 0) as usize
}

fn set_node_count(block: &mut [u8], count: usize) {
    put_u32(block, 0, count as u32);
}

#[inline]
fn entry_off(i: usize) -> usize {
    NODE_HDR + i * INDEX_ENTRY_SIZE
}

#[must_use]
pub fn node_key(block: &[u8], i: usize) -> u64 {
    get_u64(block, entry_off(i))
}

fn set_node_key(block: &mut [u8], i: usize, key: u64) {
    put_u64(block, entry_off(i), key);
}

#[must_use]
pub fn node_sector(block: &[u8], i: usize) -> Sector {
    Sector(get_u64(block, entry_off(i) + 8))
}

/// Append an entry; used planting the first root and merging nodes.
pub(crate) fn node_append(block: &mut [u8], key: u64, child: Sector) {
    let count = node_count(block);
    set_node_key(block, count, key);
    put_u64(block, entry_off(count) + 8, child.0);
    set_node_count(block, count + 1);
}

/// Insert `(key, child)` at position `at`, shifting the tail up.
fn insert_child(block: &mut [u8], at: usize, key: u64, child: Sector) {
    let count = node_count(block);
    block.copy_within(entry_off(at)..entry_off(count), entry_off(at + 1));
    set_node_key(block, at, key);
    put_u64(block, entry_off(at) + 8, child.0);
    set_node_count(block, count + 1);
}

/// Append `src`'s entries onto `dst`.
fn merge_nodes(dst: &mut [u8], src: &[u8]) {
    let nhead = node_count(dst);
    let ntail = node_count(src);
    dst[entry_off(nhead)..entry_off(nhead + ntail)]
        .copy_from_slice(&src[entry_off(0)..entry_off(ntail)]);
    set_node_count(dst, nhead + ntail);
}

/// One level of a descent path: the node buffer and the entry index where
/// the descent continued (also the insertion point for a new child).
#[derive(Clone)]
pub struct PathEntry {
    pub buf: BufferRef,
    pub idx: usize,
}

impl SnapStore {
    /// Walk from the root to the leaf covering `chunk`, recording the
    /// descent slot at every level.
    pub fn probe(&mut self, chunk: u64) -> Result<(BufferRef, Vec<PathEntry>)> {
        let levels = self.image.etree_levels as usize;
        let mut path = Vec::with_capacity(levels);
        let mut nodebuf = self.cache.bread(self.image.etree_root)?;
        for _ in 0..levels {
            let (idx, child) = {
                let node = nodebuf.data();
                let count = node_count(&node);
                let mut idx = 1;
                while idx < count && node_key(&node, idx) <= chunk {
                    idx += 1;
                }
                (idx, node_sector(&node, idx - 1))
            };
            path.push(PathEntry {
                buf: nodebuf,
                idx,
            });
            nodebuf = self.cache.bread(child)?;
        }
        leaf::check_magic(&nodebuf.data()).map_err(|_| SnapError::Corruption {
            sector: nodebuf.sector().0,
            detail: "probe landed on a non-leaf block".to_owned(),
        })?;
        Ok((nodebuf, path))
    }

    /// Read-only uniqueness test. Returns `(unique, exception_or_zero)`.
    pub fn test_unique(&mut self, chunk: u64, snap: Option<u32>) -> Result<(bool, u64)> {
        let (leafbuf, _path) = self.probe(chunk)?;
        let data = leafbuf.data();
        let mut exception = 0;
        let unique = match snap {
            None => leaf::origin_chunk_unique(&data, chunk, self.snapmask),
            Some(bit) => leaf::snapshot_chunk_unique(&data, chunk, bit, &mut exception),
        };
        Ok((unique, exception))
    }

    /// Ensure `chunk` is unique for the writing view, copying out and
    /// installing a new exception when it is not. Returns the exception
    /// chunk backing the view (zero for an already-unique origin chunk).
    pub fn make_unique(&mut self, chunk: u64, snap: Option<u32>) -> Result<u64> {
        trace!(target: "snapstore::tree", chunk, ?snap, "make_unique");
        let (leafbuf, path) = self.probe(chunk)?;
        let mut exception = 0;
        let unique = {
            let data = leafbuf.data();
            match snap {
                None => leaf::origin_chunk_unique(&data, chunk, self.snapmask),
                Some(bit) => leaf::snapshot_chunk_unique(&data, chunk, bit, &mut exception),
            }
        };
        if unique {
            return Ok(exception);
        }
        let newex = self.alloc_exception()?;
        let source = if exception != 0 {
            exception | SNAP_SOURCE_BIT
        } else {
            chunk
        };
        self.copyout(source, newex)?;
        if let Err(err) = self.add_exception_to_tree(&leafbuf, chunk, newex, snap, &path) {
            self.free_exception(newex)?;
            warn!(target: "snapstore::tree", chunk, error = %err, "unable to add exception to tree");
            return Err(err);
        }
        Ok(newex)
    }

    /// Insert into the leaf, splitting it (and index nodes above, possibly
    /// growing a new root) when full.
    fn add_exception_to_tree(
        &mut self,
        leafbuf: &BufferRef,
        chunk: u64,
        newex: u64,
        snap: Option<u32>,
        path: &[PathEntry],
    ) -> Result<()> {
        let active = self.snapmask;
        match leaf::add_exception(&mut leafbuf.data(), chunk, newex, snap, active) {
            Ok(()) => {
                self.cache.mark_dirty(leafbuf);
                return Ok(());
            }
            Err(SnapError::LeafFull) => {}
            Err(err) => return Err(err),
        }

        trace!(target: "snapstore::tree", chunk, "splitting leaf");
        let childbuf = self.new_leaf()?;
        let childkey = leaf::split_leaf(&mut leafbuf.data(), &mut childbuf.data());
        let mut childsector = childbuf.sector();

        let target = if chunk < childkey { leafbuf } else { &childbuf };
        if let Err(err) = leaf::add_exception(&mut target.data(), chunk, newex, snap, active) {
            warn!(target: "snapstore::tree", chunk, "new leaf has no space");
            return Err(err);
        }
        self.cache.mark_dirty(leafbuf);
        self.cache.mark_dirty(&childbuf);

        let mut childkey = childkey;
        let alloc_per_node = self.alloc_per_node;
        for level in (0..path.len()).rev() {
            let parentbuf = &path[level].buf;
            let idx = path[level].idx;
            let full = {
                let parent = parentbuf.data();
                node_count(&parent) == alloc_per_node
            };
            if !full {
                insert_child(&mut parentbuf.data(), idx, childkey, childsector);
                self.cache.mark_dirty(parentbuf);
                return Ok(());
            }

            // Split the index node at its midpoint and insert into the half
            // the descent slot lands in; the median key moves up a level.
            let newbuf = self.new_node()?;
            let newkey;
            {
                let mut parent = parentbuf.data();
                let mut newnode = newbuf.data();
                let count = node_count(&parent);
                let half = count / 2;
                newkey = node_key(&parent, half);
                newnode[entry_off(0)..entry_off(count - half)]
                    .copy_from_slice(&parent[entry_off(half)..entry_off(count)]);
                set_node_count(&mut newnode, count - half);
                set_node_count(&mut parent, half);
                if idx > half {
                    insert_child(&mut newnode, idx - half, childkey, childsector);
                } else {
                    insert_child(&mut parent, idx, childkey, childsector);
                }
            }
            self.cache.mark_dirty(parentbuf);
            self.cache.mark_dirty(&newbuf);
            childkey = newkey;
            childsector = newbuf.sector();
        }

        trace!(target: "snapstore::tree", "adding a tree level");
        let newrootbuf = self.new_node()?;
        {
            let mut newroot = newrootbuf.data();
            node_append(&mut newroot, 0, self.image.etree_root);
            node_append(&mut newroot, childkey, childsector);
        }
        self.cache.mark_dirty(&newrootbuf);
        self.image.etree_root = newrootbuf.sector();
        self.image.etree_levels += 1;
        self.set_sb_dirty();
        Ok(())
    }

    // ── Whole-tree walks ────────────────────────────────────────────────

    /// Visit every leaf in key order, read-only.
    pub fn traverse_leaves(&mut self, visit: &mut dyn FnMut(&[u8])) -> Result<()> {
        let levels = self.image.etree_levels;
        let root = self.image.etree_root;
        self.walk_node(root, 0, levels, visit)
    }

    fn walk_node(
        &mut self,
        sector: Sector,
        level: u32,
        levels: u32,
        visit: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        let nodebuf = self.cache.bread(sector)?;
        let children: Vec<Sector> = {
            let node = nodebuf.data();
            (0..node_count(&node))
                .map(|i| node_sector(&node, i))
                .collect()
        };
        drop(nodebuf);
        for child in children {
            if level == levels - 1 {
                let leafbuf = self.cache.bread(child)?;
                visit(&leafbuf.data());
            } else {
                self.walk_node(child, level + 1, levels, visit)?;
            }
        }
        Ok(())
    }

    /// Origin chunks whose content differs between the two snapshots: the
    /// exception sets disagree on membership for one of the masks.
    pub fn gen_changelist(&mut self, bit1: u32, bit2: u32) -> Result<Vec<u64>> {
        let mask1 = 1_u64 << bit1;
        let mask2 = 1_u64 << bit2;
        let mut chunks = Vec::new();
        self.traverse_leaves(&mut |block| {
            let count = leaf::leaf_count(block);
            let base = leaf::base_chunk(block);
            for i in 0..count {
                let mut off = leaf::map_offset(block, i);
                let end = leaf::map_offset(block, i + 1);
                while off < end {
                    let share = leaf::exception_share(block, off);
                    if (share & mask2 == mask2) != (share & mask1 == mask1) {
                        chunks.push(base + u64::from(leaf::map_rchunk(block, i)));
                        break;
                    }
                    off += leaf::EXCEPTION_SIZE;
                }
            }
        })?;
        Ok(chunks)
    }

    /// Sharing statistics: `table[bit][n]` counts exceptions snapshot `bit`
    /// shares with exactly `n` other snapshots.
    pub fn calc_sharing(&mut self, rows: usize) -> Result<Vec<Vec<u64>>> {
        let mut table = vec![vec![0_u64; rows]; rows];
        self.traverse_leaves(&mut |block| {
            let count = leaf::leaf_count(block);
            for i in 0..count {
                let mut off = leaf::map_offset(block, i);
                let end = leaf::map_offset(block, i + 1);
                while off < end {
                    let share = leaf::exception_share(block, off);
                    let share_count = share.count_ones() as usize;
                    if share_count > 0 {
                        for bit in 0..rows.min(64) {
                            if share & (1 << bit) != 0 {
                                table[bit][(share_count - 1).min(rows - 1)] += 1;
                            }
                        }
                    }
                    off += leaf::EXCEPTION_SIZE;
                }
            }
        })?;
        Ok(table)
    }

    // ── Delete traversal ────────────────────────────────────────────────

    /// Remove `snapmask` bits from every exception at or after
    /// `resume_chunk`, freeing orphaned exceptions and merging emptied
    /// leaves and index nodes back together. Commits whenever the dirty set
    /// approaches journal capacity.
    ///
    /// `hold[]` carries the previous (leftmost finished) node per level so
    /// each finished node gets one merge opportunity with its left
    /// neighbor, mirroring the leaf-level `prevleaf`.
    pub fn delete_tree_range(&mut self, snapmask: u64, resume_chunk: u64) -> Result<()> {
        let levels = self.image.etree_levels as usize;
        let (mut leafbuf, mut path) = self.probe(resume_chunk)?;
        let mut hold: Vec<Option<PathEntry>> = vec![None; levels];
        let mut prevleaf: Option<BufferRef> = None;
        let mut level = levels - 1;

        loop {
            // Scrub this leaf.
            let (any, freed) = leaf::delete_snapshots_from_leaf(&mut leafbuf.data(), snapmask);
            if any {
                self.cache.mark_dirty(&leafbuf);
            }
            for chunk in freed {
                self.free_exception(chunk)?;
            }

            // Fold it into the previous leaf when the payload fits.
            let mut merged_into_prev = false;
            if let Some(prev) = &prevleaf {
                let fits = {
                    let this = leafbuf.data();
                    let prevdata = prev.data();
                    leaf::leaf_payload(&this) <= leaf::leaf_freespace(&prevdata)
                };
                if fits {
                    {
                        let this = leafbuf.data();
                        leaf::merge_leaves(&mut prev.data(), &this);
                    }
                    self.remove_index(&mut path, level);
                    let prev = prev.clone();
                    self.cache.mark_dirty(&prev);
                    self.brelse_free(leafbuf)?;
                    leafbuf = prev;
                    merged_into_prev = true;
                }
            }
            if merged_into_prev {
                // prevleaf already holds the merged leaf; drop the extra
                // handle so it stays evictable.
                drop(leafbuf);
            } else {
                prevleaf = Some(leafbuf);
            }

            if finished_level(&path, level) {
                loop {
                    // Pop a finished node, merging it into its left
                    // neighbor at this level when both fit in one block.
                    // `hold` takes over the path's reference either way.
                    let current = path[level].clone();
                    match hold[level].take() {
                        Some(held) => {
                            let fits = {
                                let this = current.buf.data();
                                let prev = held.buf.data();
                                node_count(&this) <= self.alloc_per_node - node_count(&prev)
                            };
                            if fits {
                                {
                                    let this = current.buf.data();
                                    merge_nodes(&mut held.buf.data(), &this);
                                }
                                self.remove_index(&mut path, level - 1);
                                self.cache.mark_dirty(&held.buf);
                                // Release the path's handle on the merged
                                // node before freeing its block.
                                path[level] = PathEntry {
                                    buf: held.buf.clone(),
                                    idx: held.idx,
                                };
                                self.brelse_free(current.buf)?;
                                hold[level] = Some(held);
                            } else {
                                hold[level] = Some(current);
                            }
                        }
                        None => {
                            hold[level] = Some(current);
                        }
                    }

                    if level == 0 {
                        // The walk is done; only `hold` keeps the nodes
                        // alive now.
                        path.clear();
                        // Root demotion: a chain of single-child roots
                        // collapses into its child.
                        while self.image.etree_levels > 1 {
                            let single = match &hold[0] {
                                Some(top) => node_count(&top.buf.data()) == 1,
                                None => false,
                            };
                            if !single {
                                break;
                            }
                            let Some(top) = hold.remove(0) else { break };
                            let Some(next) = hold[0].as_ref() else { break };
                            self.image.etree_root = next.buf.sector();
                            self.brelse_free(top.buf)?;
                            self.image.etree_levels -= 1;
                            self.set_sb_dirty();
                        }
                        return Ok(());
                    }
                    level -= 1;
                    if !finished_level(&path, level) {
                        break;
                    }
                }

                // Push back down to the leaf level.
                while level < levels - 1 {
                    let child = {
                        let node = path[level].buf.data();
                        node_sector(&node, path[level].idx)
                    };
                    path[level].idx += 1;
                    let nodebuf = self.cache.bread(child)?;
                    level += 1;
                    path[level] = PathEntry {
                        buf: nodebuf,
                        idx: 0,
                    };
                }
            }

            if self.cache.dirty_count() >= self.journal_commit_threshold() {
                self.commit_transaction()?;
            }

            let child = {
                let node = path[level].buf.data();
                node_sector(&node, path[level].idx)
            };
            path[level].idx += 1;
            leafbuf = self.cache.bread(child)?;
        }
    }

    /// Remove the child entry the walk just consumed from the node at
    /// `level`, pulling the orphaned pivot key up to the nearest ancestor
    /// that still separates children around it.
    fn remove_index(&mut self, path: &mut [PathEntry], level: usize) {
        let (new_idx, new_count, pivot) = {
            let mut node = path[level].buf.data();
            let count = node_count(&node);
            let idx = path[level].idx;
            let pivot = if idx < count {
                Some(node_key(&node, idx))
            } else {
                None
            };
            node.copy_within(entry_off(idx)..entry_off(count), entry_off(idx - 1));
            set_node_count(&mut node, count - 1);
            (idx - 1, count - 1, pivot)
        };
        path[level].idx = new_idx;
        let levelbuf = path[level].buf.clone();
        self.cache.mark_dirty(&levelbuf);

        // Removed the last entry: no pivot to fix.
        if new_idx == new_count {
            return;
        }
        // Removed the first entry: the pivot that separated it lives in an
        // ancestor; rewrite it there.
        if new_idx == 0 && level > 0 {
            let Some(pivot) = pivot else { return };
            let mut i = level - 1;
            while path[i].idx == 1 {
                if i == 0 {
                    return;
                }
                i -= 1;
            }
            set_node_key(&mut path[i].buf.data(), path[i].idx - 1, pivot);
            let buf = path[i].buf.clone();
            self.cache.mark_dirty(&buf);
        }
    }

    /// Free a tree block once its last handle is gone; a still-pinned block
    /// is left alone with a warning.
    fn brelse_free(&mut self, buf: BufferRef) -> Result<()> {
        let sector = buf.sector();
        // Cache map + this handle.
        if std::sync::Arc::strong_count(&buf) > 2 {
            warn!(target: "snapstore::tree", sector = %sector, "free block still in use");
            return Ok(());
        }
        drop(buf);
        self.free_block(sector)?;
        self.cache.evict(sector)
    }
}

fn finished_level(path: &[PathEntry], level: usize) -> bool {
    let node = path[level].buf.data();
    path[level].idx == node_count(&node)
}
