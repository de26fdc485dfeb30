#![forbid(unsafe_code)]
//! snapstore engine: a copy-on-write block-level snapshot store.
//!
//! Keeps up to 64 writable snapshots of an origin volume as sparse
//! exception maps in a persistent B-tree keyed by origin chunk. Leaves pack
//! per-chunk exception records with a snapshot sharing bitmap; bitmap
//! allocators manage the metadata and snapshot-data chunk spaces; a
//! write-ahead journal makes metadata updates atomic; a copyout engine
//! moves origin bytes aside before they are overwritten.

pub mod alloc;
pub mod copyout;
pub mod journal;
pub mod leaf;
pub mod snapshot;
pub mod store;
pub mod superblock;
pub mod tree;

pub use store::{FormatOptions, SnapStore, Space};
pub use superblock::{AllocSpaceImage, SnapshotRecord, SuperImage};

#[cfg(test)]
pub(crate) mod testutil {
    use crate::store::{FormatOptions, SnapStore};
    use snapstore_block::MemByteDevice;
    use std::sync::Arc;

    pub fn mem_store_all_devs() -> (
        SnapStore,
        Arc<MemByteDevice>,
        Arc<MemByteDevice>,
        Arc<MemByteDevice>,
    ) {
        let metadev = Arc::new(MemByteDevice::new(16 << 20));
        let snapdev = Arc::new(MemByteDevice::new(16 << 20));
        let orgdev = Arc::new(MemByteDevice::new(16 << 20));
        let store = SnapStore::format(
            metadev.clone(),
            snapdev.clone(),
            orgdev.clone(),
            FormatOptions::default(),
        )
        .expect("format");
        (store, metadev, snapdev, orgdev)
    }

    pub fn mem_store() -> SnapStore {
        mem_store_all_devs().0
    }

    pub fn mem_store_with_dev() -> (SnapStore, Arc<MemByteDevice>) {
        let (store, metadev, _snap, _org) = mem_store_all_devs();
        (store, metadev)
    }

    /// Small metadata chunks (512 B) so leaf and index splits happen after
    /// tens of insertions instead of thousands.
    pub fn small_chunk_store() -> SnapStore {
        let metadev = Arc::new(MemByteDevice::new(4 << 20));
        let snapdev = Arc::new(MemByteDevice::new(4 << 20));
        let orgdev = Arc::new(MemByteDevice::new(4 << 20));
        SnapStore::format(
            metadev,
            snapdev,
            orgdev,
            FormatOptions {
                meta_chunksize_bits: 9,
                snap_chunksize_bits: 9,
                journal_bytes: 64 << 10,
            },
        )
        .expect("format")
    }
}

#[cfg(test)]
mod engine_tests {
    use crate::store::Space;
    use crate::testutil::{mem_store, mem_store_all_devs, small_chunk_store};
    use crate::{FormatOptions, SnapStore};
    use snapstore_block::{ByteDevice, MemByteDevice};
    use std::sync::Arc;

    fn assert_space_accounting(store: &SnapStore) {
        // freechunks + used == chunks for both spaces (used counters
        // include the reserved layout).
        let meta = store.asi(Space::Meta);
        if store.snap_geometry() == store.meta_geometry()
            && std::ptr::eq(meta, store.asi(Space::Snap))
        {
            assert_eq!(
                meta.freechunks + store.image.meta_chunks_used + store.image.snap_chunks_used,
                meta.chunks
            );
        } else {
            assert_eq!(
                meta.freechunks + store.image.meta_chunks_used,
                meta.chunks,
                "metadata space"
            );
            let snap = store.asi(Space::Snap);
            assert_eq!(
                snap.freechunks + store.image.snap_chunks_used,
                snap.chunks,
                "snapshot space"
            );
        }
    }

    #[test]
    fn format_reserves_layout() {
        let store = mem_store();
        assert_space_accounting(&store);
        assert_eq!(store.image.etree_levels, 1);
        assert!(store.image.journal_size >= 4);
        // Snapshot-data chunk 0 is reserved on a split-device store.
        assert_eq!(store.image.snap_chunks_used, 1);
    }

    #[test]
    fn format_then_open_round_trips() {
        let (store, metadev, snapdev, orgdev) = mem_store_all_devs();
        let image = store.image.clone();
        drop(store);
        let reopened = SnapStore::open(metadev, snapdev, orgdev).unwrap();
        assert_eq!(reopened.image, image);
        assert_eq!(reopened.snapmask, 0);
    }

    #[test]
    fn s1_copy_on_write() {
        let (mut store, _meta, snapdev, orgdev) = mem_store_all_devs();
        orgdev.write_all_at(10 << 12, &[0xab; 4096]).unwrap();
        let bit = store.create_snapshot(1).unwrap();

        let used_before = store.image.snap_chunks_used;
        let exception = store.make_unique(10, None).unwrap();
        store.finish_copyout().unwrap();
        store.commit_transaction().unwrap();

        assert_ne!(exception, 0);
        assert_eq!(store.image.snap_chunks_used, used_before + 1);

        // The snapshot sees the copied-out version; the origin is unique.
        assert_eq!(store.test_unique(10, Some(bit)).unwrap(), (true, exception));
        assert_eq!(store.test_unique(10, None).unwrap(), (true, 0));

        let mut copied = vec![0_u8; 4096];
        snapdev
            .read_exact_at(exception << 12, &mut copied)
            .unwrap();
        assert!(copied.iter().all(|b| *b == 0xab));
        assert_space_accounting(&store);
    }

    #[test]
    fn s2_sharing_one_exception_for_all() {
        let (mut store, ..) = mem_store_all_devs();
        let bit1 = store.create_snapshot(1).unwrap();
        let bit2 = store.create_snapshot(2).unwrap();

        let used_before = store.image.snap_chunks_used;
        let exception = store.make_unique(5, None).unwrap();
        assert_ne!(exception, 0);
        assert_eq!(store.image.snap_chunks_used, used_before + 1);

        // Both snapshots share the one exception: neither is unique there.
        assert_eq!(
            store.test_unique(5, Some(bit1)).unwrap(),
            (false, exception)
        );
        assert_eq!(
            store.test_unique(5, Some(bit2)).unwrap(),
            (false, exception)
        );

        // A second origin write is a no-op: already unique.
        assert_eq!(store.make_unique(5, None).unwrap(), 0);
        assert_eq!(store.image.snap_chunks_used, used_before + 1);
    }

    #[test]
    fn s3_snapshot_write_unshares() {
        let (mut store, _meta, snapdev, orgdev) = mem_store_all_devs();
        orgdev.write_all_at(5 << 12, &[0x5a; 4096]).unwrap();
        let bit1 = store.create_snapshot(1).unwrap();
        let bit2 = store.create_snapshot(2).unwrap();

        let shared = store.make_unique(5, None).unwrap();
        let private = store.make_unique(5, Some(bit1)).unwrap();
        store.finish_copyout().unwrap();

        assert_ne!(private, 0);
        assert_ne!(private, shared);
        assert_eq!(store.test_unique(5, Some(bit1)).unwrap(), (true, private));
        assert_eq!(store.test_unique(5, Some(bit2)).unwrap(), (true, shared));

        // The snapshot write copied from the shared exception, which holds
        // the origin's pre-write bytes.
        let mut copied = vec![0_u8; 4096];
        snapdev.read_exact_at(private << 12, &mut copied).unwrap();
        assert!(copied.iter().all(|b| *b == 0x5a));
    }

    #[test]
    fn leaf_splits_preserve_every_exception() {
        let mut store = small_chunk_store();
        let bit = store.create_snapshot(1).unwrap();
        // 512-byte leaves hold ~20 entries; 200 inserts force many splits.
        let mut exceptions = Vec::new();
        for chunk in 0..200_u64 {
            exceptions.push(store.make_unique(chunk, None).unwrap());
        }
        store.finish_copyout().unwrap();
        for (chunk, exception) in exceptions.iter().enumerate() {
            assert_eq!(
                store.test_unique(chunk as u64, Some(bit)).unwrap(),
                (true, *exception),
                "chunk {chunk}"
            );
        }
        assert_space_accounting(&store);
    }

    #[test]
    fn index_split_grows_and_delete_shrinks_the_tree() {
        let mut store = small_chunk_store();
        let bit = store.create_snapshot(1).unwrap();
        // 512-byte nodes hold 31 entries; enough leaves to split the root.
        for chunk in 0..900_u64 {
            store.make_unique(chunk, None).unwrap();
        }
        store.finish_copyout().unwrap();
        assert!(store.image.etree_levels >= 2, "root should have split");
        for chunk in (0..900_u64).step_by(97) {
            let (unique, exception) = store.test_unique(chunk, Some(bit)).unwrap();
            assert!(unique);
            assert_ne!(exception, 0);
        }

        let snap_used_before_delete = store.image.snap_chunks_used;
        assert!(snap_used_before_delete > 900);
        store.delete_snapshot(1).unwrap();
        store.commit_transaction().unwrap();

        // Every exception freed, every leaf emptied and merged away, the
        // root chain demoted back to one level.
        assert_eq!(store.image.snap_chunks_used, 1);
        assert_eq!(store.image.etree_levels, 1);
        let mut entries = 0_usize;
        store
            .traverse_leaves(&mut |block| entries += crate::leaf::leaf_count(block))
            .unwrap();
        assert_eq!(entries, 0);
        assert_space_accounting(&store);
    }

    #[test]
    fn delete_keeps_other_snapshots_intact() {
        let mut store = mem_store();
        let bit1 = store.create_snapshot(1).unwrap();
        let bit2 = store.create_snapshot(2).unwrap();
        store.make_unique(5, None).unwrap(); // shared by both
        let private = store.make_unique(7, Some(bit2)).unwrap(); // snap 2 only
        store.finish_copyout().unwrap();

        store.delete_snapshot(1).unwrap();
        assert_eq!(store.snapmask, 1 << bit2);
        // Snapshot 2 still sees both of its exceptions.
        let (unique, exception) = store.test_unique(5, Some(bit2)).unwrap();
        assert!(unique);
        assert_ne!(exception, 0);
        assert_eq!(store.test_unique(7, Some(bit2)).unwrap(), (true, private));
        // No exception carries the deleted bit: an origin write for a fresh
        // chunk shares only with snapshot 2.
        assert_eq!(store.test_unique(5, Some(bit1)).unwrap(), (false, 0));
        assert_space_accounting(&store);
    }

    #[test]
    fn changelist_is_symmetric_and_irreflexive() {
        let (mut store, ..) = mem_store_all_devs();
        let bit1 = store.create_snapshot(1).unwrap();
        let bit2 = store.create_snapshot(2).unwrap();
        store.make_unique(5, None).unwrap();
        store.make_unique(9, None).unwrap();
        store.make_unique(5, Some(bit1)).unwrap();
        store.finish_copyout().unwrap();

        // Chunk 5 differs (snap 1 unshared it); chunk 9 is still shared.
        assert_eq!(store.gen_changelist(bit1, bit2).unwrap(), vec![5]);
        assert_eq!(store.gen_changelist(bit2, bit1).unwrap(), vec![5]);
        assert!(store.gen_changelist(bit1, bit1).unwrap().is_empty());
    }

    #[test]
    fn sharing_table_counts_by_popcount() {
        let mut store = mem_store();
        let bit1 = store.create_snapshot(1).unwrap();
        let _bit2 = store.create_snapshot(2).unwrap();
        store.make_unique(5, None).unwrap(); // shared by 2
        store.make_unique(9, Some(bit1)).unwrap(); // snap 1 alone
        store.finish_copyout().unwrap();

        let rows = store.max_snapbit() as usize + 1;
        let table = store.calc_sharing(rows).unwrap();
        // Snapshot 1: one private exception, one shared with 1 other.
        assert_eq!(table[0][0], 1);
        assert_eq!(table[0][1], 1);
        // Snapshot 2: only the shared exception.
        assert_eq!(table[1][0], 0);
        assert_eq!(table[1][1], 1);
    }

    #[test]
    fn s6_pressure_evicts_lowest_priority() {
        let metadev = Arc::new(MemByteDevice::new(16 << 20));
        // Four snapshot-data chunks; one reserved, three usable.
        let snapdev = Arc::new(MemByteDevice::new(4 * 4096));
        let orgdev = Arc::new(MemByteDevice::new(16 << 20));
        let mut store = SnapStore::format(
            metadev,
            snapdev,
            orgdev,
            FormatOptions::default(),
        )
        .unwrap();

        let _bit_a = store.create_snapshot(1).unwrap();
        for chunk in 10..13_u64 {
            assert_ne!(store.make_unique(chunk, None).unwrap(), 0);
        }
        store.finish_copyout().unwrap();
        assert_eq!(store.asi(Space::Snap).freechunks, 0);

        // B arrives with a higher priority; A is idle and expendable.
        let bit_b = store.create_snapshot(2).unwrap();
        store.snapshot_by_tag_mut(2).unwrap().prio = 5;

        // The next origin write finds no space, evicts A, and succeeds.
        let exception = store.make_unique(13, None).unwrap();
        store.finish_copyout().unwrap();
        assert_ne!(exception, 0);
        assert!(store.snapshot_by_tag(1).is_none());
        assert_eq!(store.snapmask, 1 << bit_b);
        assert_eq!(
            store.test_unique(13, Some(bit_b)).unwrap(),
            (true, exception)
        );
        assert_space_accounting(&store);
    }

    #[test]
    fn combined_device_store_shares_one_space() {
        let combined: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(16 << 20));
        let orgdev: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(16 << 20));
        let mut store = SnapStore::format(
            Arc::clone(&combined),
            Arc::clone(&combined),
            orgdev,
            FormatOptions::default(),
        )
        .unwrap();
        // One allocator space serves metadata and exceptions alike.
        assert!(std::ptr::eq(store.asi(Space::Meta), store.asi(Space::Snap)));

        let bit = store.create_snapshot(1).unwrap();
        let exception = store.make_unique(3000, None).unwrap();
        store.finish_copyout().unwrap();
        assert_ne!(exception, 0);
        assert_eq!(
            store.test_unique(3000, Some(bit)).unwrap(),
            (true, exception)
        );
        assert_space_accounting(&store);
    }

    #[test]
    fn crash_after_commit_preserves_writes() {
        // Engine-level S5: commit, reopen from the raw devices with the
        // busy flag logic, replay, and observe the committed state.
        let (mut store, metadev, snapdev, orgdev) = mem_store_all_devs();
        let bit = store.create_snapshot(1).unwrap();
        let mut exceptions = Vec::new();
        for chunk in 0..100_u64 {
            exceptions.push(store.make_unique(chunk, None).unwrap());
        }
        store.finish_copyout().unwrap();
        store.set_busy(true);
        store.commit_transaction().unwrap();
        // Kill -9: drop the store without cleanup; the superblock was last
        // persisted by the commit, busy flag included.
        drop(store);

        let mut store = SnapStore::open(metadev, snapdev, orgdev).unwrap();
        assert!(store.busy());
        store.recover_journal().unwrap();
        for (chunk, exception) in exceptions.iter().enumerate() {
            assert_eq!(
                store.test_unique(chunk as u64, Some(bit)).unwrap(),
                (true, *exception),
                "chunk {chunk}"
            );
        }
    }
}
