//! The snapshot store context: devices, cache, superblock and derived
//! geometry, gathered into one value threaded through the engine.

use crate::copyout::CopyoutState;
use crate::superblock::{AllocSpaceImage, SuperImage};
use crate::tree;
use snapstore_block::{BufferCache, ByteDevice};
use snapstore_error::Result;
use snapstore_types::{AllocGeometry, Sector, SB_FLAG_BUSY, SB_SECTOR, SB_SIZE};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Which chunk space an allocation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    Meta,
    Snap,
}

impl Space {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Meta => "metadata",
            Self::Snap => "snapshot",
        }
    }
}

/// Format-time parameters.
#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    /// Metadata chunk size, log2 bytes.
    pub meta_chunksize_bits: u32,
    /// Snapshot-data chunk size, log2 bytes.
    pub snap_chunksize_bits: u32,
    /// Journal window size in bytes, rounded up to whole chunks.
    pub journal_bytes: u32,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            meta_chunksize_bits: 12,
            snap_chunksize_bits: 12,
            journal_bytes: 1 << 20,
        }
    }
}

/// Process-wide snapshot store state. All mutation happens on the server
/// thread; collaborators receive `&mut SnapStore`.
pub struct SnapStore {
    pub(crate) metadev: Arc<dyn ByteDevice>,
    pub(crate) snapdev: Arc<dyn ByteDevice>,
    pub(crate) orgdev: Arc<dyn ByteDevice>,
    pub cache: BufferCache,
    pub image: SuperImage,
    /// Bitmap of live snapshot bits; recomputed from the table on load.
    pub snapmask: u64,
    pub(crate) sb_dirty: bool,
    /// False when the snapshot-data space shares the metadata device (and
    /// its allocator).
    pub(crate) separate_snapdev: bool,
    pub(crate) alloc_per_node: usize,
    pub(crate) copy: CopyoutState,
}

pub(crate) fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

impl SnapStore {
    fn assemble(
        metadev: Arc<dyn ByteDevice>,
        snapdev: Arc<dyn ByteDevice>,
        orgdev: Arc<dyn ByteDevice>,
        image: SuperImage,
        separate_snapdev: bool,
    ) -> Self {
        let meta_geo = image.alloc[0].geometry;
        let snap_index = usize::from(separate_snapdev);
        let snap_geo = image.alloc[snap_index].geometry;
        let cache = BufferCache::new(Arc::clone(&metadev), meta_geo.allocsize());
        let snapmask = image.calc_snapmask();
        let alloc_per_node = tree::alloc_per_node(meta_geo.allocsize() as usize);
        let copy = CopyoutState::new(snap_geo);
        Self {
            metadev,
            snapdev,
            orgdev,
            cache,
            image,
            snapmask,
            sb_dirty: false,
            separate_snapdev,
            alloc_per_node,
            copy,
        }
    }

    /// Load an existing store. The caller decides whether to replay the
    /// journal (busy flag) and to set the busy flag for serving.
    pub fn open(
        metadev: Arc<dyn ByteDevice>,
        snapdev: Arc<dyn ByteDevice>,
        orgdev: Arc<dyn ByteDevice>,
    ) -> Result<Self> {
        let mut raw = vec![0_u8; SB_SIZE];
        metadev.read_exact_at(Sector(SB_SECTOR).to_bytes(), &mut raw)?;
        let image = SuperImage::decode(&raw)?;
        let separate = !Arc::ptr_eq(&metadev, &snapdev);
        let store = Self::assemble(metadev, snapdev, orgdev, image, separate);
        info!(
            target: "snapstore::store",
            snapshots = store.image.snaplist.len(),
            snapmask = format_args!("{:#x}", store.snapmask),
            etree_levels = store.image.etree_levels,
            "superblock loaded"
        );
        Ok(store)
    }

    /// Initialize a fresh snapshot store on the given devices.
    ///
    /// Lays out `[superblock][bitmaps][journal][tree]`, prefills the journal
    /// ring with empty commit blocks so recovery of a virgin store is
    /// well-defined, and plants a one-leaf tree.
    pub fn format(
        metadev: Arc<dyn ByteDevice>,
        snapdev: Arc<dyn ByteDevice>,
        orgdev: Arc<dyn ByteDevice>,
        opts: FormatOptions,
    ) -> Result<Self> {
        let separate = !Arc::ptr_eq(&metadev, &snapdev);
        let meta_geo = AllocGeometry::new(opts.meta_chunksize_bits)?;
        let snap_geo = if separate {
            AllocGeometry::new(opts.snap_chunksize_bits)?
        } else {
            // One device, one allocator, one chunk size.
            meta_geo
        };

        let meta_chunks = meta_geo.bytes_to_chunks(metadev.len_bytes());
        let snap_chunks = snap_geo.bytes_to_chunks(snapdev.len_bytes());
        // Origin size in sectors, rounded down to a whole number of chunks.
        let orgsectors =
            snap_geo.bytes_to_chunks(orgdev.len_bytes()) * snap_geo.sectors_per_alloc();

        // A transaction needs at least one data slot plus its commit block.
        let journal_size = snapstore_types::div_round_up(
            u64::from(opts.journal_bytes),
            u64::from(meta_geo.allocsize()),
        )
        .max(4) as u32;

        let blank = AllocSpaceImage {
            geometry: snap_geo,
            chunks: snap_chunks,
            freechunks: snap_chunks,
            bitmap_base: Sector(0),
            bitmap_blocks: 0,
            last_alloc: 0,
        };
        let image = SuperImage {
            flags: 0,
            create_time: now_secs(),
            etree_levels: 1,
            etree_root: Sector(0),
            orgoffset: 0,
            orgsectors,
            journal_base: Sector(0),
            journal_size,
            journal_next: 0,
            sequence: journal_size as i32,
            meta_chunks_used: 0,
            snap_chunks_used: 0,
            alloc: [
                AllocSpaceImage {
                    geometry: meta_geo,
                    chunks: meta_chunks,
                    freechunks: meta_chunks,
                    bitmap_base: Sector(0),
                    bitmap_blocks: 0,
                    last_alloc: 0,
                },
                blank,
            ],
            snaplist: Vec::new(),
        };

        let mut store = Self::assemble(metadev, snapdev, orgdev, image, separate);
        store.init_allocation()?;
        store.init_journal()?;
        store.plant_tree()?;
        store.set_sb_dirty();
        store.save_state()?;
        info!(
            target: "snapstore::store",
            meta_chunks,
            snap_chunks,
            journal_size,
            orgsectors,
            "store formatted"
        );
        Ok(store)
    }

    fn plant_tree(&mut self) -> Result<()> {
        let leafbuf = self.new_leaf()?;
        let rootbuf = self.new_node()?;
        {
            let mut root = rootbuf.data();
            tree::node_append(&mut root, 0, leafbuf.sector());
        }
        self.cache.mark_dirty(&rootbuf);
        self.image.etree_root = rootbuf.sector();
        self.image.etree_levels = 1;
        Ok(())
    }

    // ── Geometry accessors ──────────────────────────────────────────────

    #[must_use]
    pub fn meta_geometry(&self) -> AllocGeometry {
        self.image.alloc[0].geometry
    }

    #[must_use]
    pub fn snap_geometry(&self) -> AllocGeometry {
        self.image.alloc[self.space_index(Space::Snap)].geometry
    }

    #[must_use]
    pub(crate) fn space_index(&self, space: Space) -> usize {
        match space {
            Space::Meta => 0,
            Space::Snap => usize::from(self.separate_snapdev),
        }
    }

    #[must_use]
    pub fn asi(&self, space: Space) -> &AllocSpaceImage {
        &self.image.alloc[self.space_index(space)]
    }

    pub(crate) fn asi_mut(&mut self, space: Space) -> &mut AllocSpaceImage {
        let index = self.space_index(space);
        &mut self.image.alloc[index]
    }

    #[must_use]
    pub fn alloc_per_node(&self) -> usize {
        self.alloc_per_node
    }

    // ── Superblock persistence ──────────────────────────────────────────

    pub fn set_sb_dirty(&mut self) {
        self.sb_dirty = true;
    }

    #[must_use]
    pub fn busy(&self) -> bool {
        self.image.flags & SB_FLAG_BUSY != 0
    }

    pub fn set_busy(&mut self, busy: bool) {
        if busy {
            self.image.flags |= SB_FLAG_BUSY;
        } else {
            self.image.flags &= !SB_FLAG_BUSY;
        }
        self.set_sb_dirty();
    }

    /// Write the superblock home if it is dirty.
    pub fn save_sb(&mut self) -> Result<()> {
        if self.sb_dirty {
            let raw = self.image.encode();
            if let Err(err) = self.metadev.write_all_at(Sector(SB_SECTOR).to_bytes(), &raw) {
                warn!(target: "snapstore::store", error = %err, "unable to write superblock");
                return Err(err);
            }
            self.sb_dirty = false;
        }
        Ok(())
    }

    /// Flush every dirty buffer, then the superblock.
    pub fn save_state(&mut self) -> Result<()> {
        self.cache.flush()?;
        self.save_sb()
    }

    /// Shutdown path: clear the busy flag and persist everything.
    pub fn cleanup(&mut self) -> Result<()> {
        warn!(target: "snapstore::store", "cleaning up");
        self.set_busy(false);
        self.save_state()
    }
}

impl std::fmt::Debug for SnapStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapStore")
            .field("snapmask", &format_args!("{:#x}", self.snapmask))
            .field("etree_levels", &self.image.etree_levels)
            .field("cache", &self.cache)
            .finish()
    }
}
