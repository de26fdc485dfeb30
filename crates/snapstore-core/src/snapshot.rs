//! Snapshot registry: the superblock's snapshot table and its lifecycle.

use crate::store::{now_secs, SnapStore};
use crate::superblock::SnapshotRecord;
use snapstore_error::{Result, SnapError};
use snapstore_types::MAX_SNAPSHOTS;
use tracing::{info, warn};

impl SnapStore {
    #[must_use]
    pub fn snapshot_by_tag(&self, tag: u32) -> Option<&SnapshotRecord> {
        self.image.snaplist.iter().find(|snap| snap.tag == tag)
    }

    pub fn snapshot_by_tag_mut(&mut self, tag: u32) -> Option<&mut SnapshotRecord> {
        self.image.snaplist.iter_mut().find(|snap| snap.tag == tag)
    }

    #[must_use]
    pub fn snapshot_by_bit(&self, bit: u32) -> Option<&SnapshotRecord> {
        self.image
            .snaplist
            .iter()
            .find(|snap| u32::from(snap.bit) == bit)
    }

    pub fn snapshot_by_bit_mut(&mut self, bit: u32) -> Option<&mut SnapshotRecord> {
        self.image
            .snaplist
            .iter_mut()
            .find(|snap| u32::from(snap.bit) == bit)
    }

    /// Highest bit index in use, for sizing sharing tables.
    #[must_use]
    pub fn max_snapbit(&self) -> u32 {
        self.image
            .snaplist
            .iter()
            .map(|snap| u32::from(snap.bit))
            .max()
            .unwrap_or(0)
    }

    /// Create a snapshot with the given tag and the lowest free bit.
    /// Returns the assigned bit.
    pub fn create_snapshot(&mut self, tag: u32) -> Result<u32> {
        if self.snapshot_by_tag(tag).is_some() {
            return Err(SnapError::SnapshotExists(tag));
        }
        let Some(bit) = (0..MAX_SNAPSHOTS as u32).find(|bit| self.snapmask & (1 << bit) == 0)
        else {
            return Err(SnapError::SnapshotLimit);
        };
        info!(target: "snapstore::snapshot", tag, bit, "create snapshot");
        self.image.snaplist.push(SnapshotRecord {
            tag,
            bit: bit as u8,
            prio: 0,
            ctime: now_secs(),
            usecount: 0,
        });
        self.snapmask |= 1 << bit;
        self.set_sb_dirty();
        Ok(bit)
    }

    /// Remove the snapshot and scrub its bit from the whole tree.
    pub fn delete_snapshot(&mut self, tag: u32) -> Result<()> {
        let Some(index) = self.image.snaplist.iter().position(|snap| snap.tag == tag) else {
            return Err(SnapError::InvalidSnapshot(tag));
        };
        let bit = self.image.snaplist[index].bit;
        info!(target: "snapstore::snapshot", tag, bit, "delete snapshot");
        self.image.snaplist.remove(index);
        self.snapmask &= !(1_u64 << bit);
        if let Err(err) = self.delete_tree_range(1_u64 << bit, 0) {
            warn!(
                target: "snapstore::snapshot",
                tag,
                error = %err,
                "unable to delete snapshot exceptions"
            );
        }
        self.set_sb_dirty();
        Ok(())
    }

    /// Pressure eviction candidate: zero use count and minimum priority,
    /// earliest table slot winning ties. `None` when nothing is evictable.
    #[must_use]
    pub fn find_snapshot_to_delete(&self) -> Option<u32> {
        let mut candidate = None;
        let mut min_priority = i16::from(i8::MAX) + 1;
        for snap in self.image.snaplist.iter().rev() {
            if snap.usecount == 0 && i16::from(snap.prio) <= min_priority {
                min_priority = i16::from(snap.prio);
                candidate = Some(snap.tag);
            }
        }
        candidate
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::mem_store;
    use snapstore_error::SnapError;

    #[test]
    fn create_assigns_lowest_free_bit() {
        let mut store = mem_store();
        assert_eq!(store.create_snapshot(10).unwrap(), 0);
        assert_eq!(store.create_snapshot(20).unwrap(), 1);
        assert_eq!(store.snapmask, 0b11);
        store.delete_snapshot(10).unwrap();
        assert_eq!(store.snapmask, 0b10);
        // Bit 0 is free again and gets reused.
        assert_eq!(store.create_snapshot(30).unwrap(), 0);
    }

    #[test]
    fn duplicate_tag_rejected() {
        let mut store = mem_store();
        store.create_snapshot(5).unwrap();
        assert!(matches!(
            store.create_snapshot(5),
            Err(SnapError::SnapshotExists(5))
        ));
    }

    #[test]
    fn delete_unknown_tag_rejected() {
        let mut store = mem_store();
        assert!(matches!(
            store.delete_snapshot(99),
            Err(SnapError::InvalidSnapshot(99))
        ));
    }

    #[test]
    fn eviction_prefers_lowest_priority_idle() {
        let mut store = mem_store();
        store.create_snapshot(1).unwrap();
        store.create_snapshot(2).unwrap();
        store.create_snapshot(3).unwrap();
        store.snapshot_by_tag_mut(1).unwrap().prio = 5;
        store.snapshot_by_tag_mut(2).unwrap().prio = -2;
        store.snapshot_by_tag_mut(3).unwrap().prio = 0;
        assert_eq!(store.find_snapshot_to_delete(), Some(2));

        // Busy snapshots are never candidates.
        store.snapshot_by_tag_mut(2).unwrap().usecount = 1;
        assert_eq!(store.find_snapshot_to_delete(), Some(3));
        store.snapshot_by_tag_mut(3).unwrap().usecount = 1;
        assert_eq!(store.find_snapshot_to_delete(), Some(1));
        store.snapshot_by_tag_mut(1).unwrap().usecount = 1;
        assert_eq!(store.find_snapshot_to_delete(), None);
    }

    #[test]
    fn limit_is_sixty_four() {
        let mut store = mem_store();
        for tag in 0..64 {
            store.create_snapshot(tag).unwrap();
        }
        assert!(matches!(
            store.create_snapshot(64),
            Err(SnapError::SnapshotLimit)
        ));
    }
}
