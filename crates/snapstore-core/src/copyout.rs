//! Copyout engine: moves the current bytes of a chunk into a freshly
//! allocated exception before the original is overwritten.
//!
//! Consecutive `(source, dest)` pairs coalesce into one range so a burst of
//! contiguous origin writes turns into a single large read and write. The
//! high bit of the source address marks a snapshot-store source (a snapshot
//! write unsharing an existing exception); otherwise the source is the
//! origin volume.

use crate::store::SnapStore;
use snapstore_error::Result;
use snapstore_types::AllocGeometry;
use tracing::trace;

/// Source addresses with this bit set name snapshot-data chunks.
pub const SNAP_SOURCE_BIT: u64 = 1 << 63;

/// Chunks the copy buffer holds.
const COPYBUF_CHUNKS: usize = 32;

/// One outstanding copy range plus its bounce buffer.
pub(crate) struct CopyoutState {
    buf: Vec<u8>,
    source_chunk: u64,
    dest_exception: u64,
    count: u32,
}

impl CopyoutState {
    pub(crate) fn new(snap_geo: AllocGeometry) -> Self {
        Self {
            buf: vec![0_u8; COPYBUF_CHUNKS << snap_geo.allocsize_bits()],
            source_chunk: 0,
            dest_exception: 0,
            count: 0,
        }
    }
}

impl SnapStore {
    /// Queue a one-chunk copy. Extends the outstanding range when `source`
    /// and `dest` both continue it and the buffer has room; otherwise the
    /// old range is flushed first.
    pub fn copyout(&mut self, source: u64, dest: u64) -> Result<()> {
        let pending = u64::from(self.copy.count);
        if self.copy.count > 0
            && self.copy.source_chunk.wrapping_add(pending) == source
            && self.copy.dest_exception.wrapping_add(pending) == dest
            && (self.copy.count as usize) < COPYBUF_CHUNKS
        {
            self.copy.count += 1;
            return Ok(());
        }
        self.finish_copyout()?;
        self.copy.source_chunk = source;
        self.copy.dest_exception = dest;
        self.copy.count = 1;
        Ok(())
    }

    /// Flush the outstanding range, if any: read from the origin (or the
    /// snapshot store, by the source high bit) and write to the snapshot
    /// store at the destination exception.
    pub fn finish_copyout(&mut self) -> Result<()> {
        if self.copy.count == 0 {
            return Ok(());
        }
        let geo = self.snap_geometry();
        let is_snap = self.copy.source_chunk & SNAP_SOURCE_BIT != 0;
        let source = self.copy.source_chunk & !SNAP_SOURCE_BIT;
        let size = (self.copy.count as usize) << geo.allocsize_bits();
        trace!(
            target: "snapstore::copyout",
            count = self.copy.count,
            from_snapshot = is_snap,
            source,
            dest = self.copy.dest_exception,
            "copyout flush"
        );
        let buf = &mut self.copy.buf[..size];
        let src_dev = if is_snap { &self.snapdev } else { &self.orgdev };
        src_dev.read_exact_at(source << u64::from(geo.allocsize_bits()), buf)?;
        self.snapdev
            .write_all_at(self.copy.dest_exception << u64::from(geo.allocsize_bits()), buf)?;
        self.copy.count = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::mem_store_all_devs;
    use snapstore_block::ByteDevice;

    #[test]
    fn coalesced_copyout_moves_origin_bytes() {
        let (mut store, _meta, snapdev, orgdev) = mem_store_all_devs();
        // Distinct content in origin chunks 4..7.
        for chunk in 4_u64..7 {
            orgdev
                .write_all_at(chunk << 12, &vec![chunk as u8; 4096])
                .unwrap();
        }
        // Contiguous on both sides: one flush.
        store.copyout(4, 100).unwrap();
        store.copyout(5, 101).unwrap();
        store.copyout(6, 102).unwrap();
        store.finish_copyout().unwrap();

        for (chunk, dest) in [(4_u64, 100_u64), (5, 101), (6, 102)] {
            let mut back = vec![0_u8; 4096];
            snapdev.read_exact_at(dest << 12, &mut back).unwrap();
            assert!(back.iter().all(|b| *b == chunk as u8), "chunk {chunk}");
        }
    }

    #[test]
    fn discontiguous_dest_breaks_the_range() {
        let (mut store, _meta, snapdev, orgdev) = mem_store_all_devs();
        orgdev.write_all_at(4 << 12, &[1_u8; 4096]).unwrap();
        orgdev.write_all_at(5 << 12, &[2_u8; 4096]).unwrap();
        store.copyout(4, 100).unwrap();
        // Source continues but dest jumps: first range must flush now.
        store.copyout(5, 200).unwrap();
        let mut back = vec![0_u8; 4096];
        snapdev.read_exact_at(100 << 12, &mut back).unwrap();
        assert!(back.iter().all(|b| *b == 1));
        store.finish_copyout().unwrap();
        snapdev.read_exact_at(200 << 12, &mut back).unwrap();
        assert!(back.iter().all(|b| *b == 2));
    }

    #[test]
    fn snapshot_source_reads_snapshot_store() {
        let (mut store, _meta, snapdev, _org) = mem_store_all_devs();
        snapdev.write_all_at(50 << 12, &[9_u8; 4096]).unwrap();
        store.copyout(50 | SNAP_SOURCE_BIT, 60).unwrap();
        store.finish_copyout().unwrap();
        let mut back = vec![0_u8; 4096];
        snapdev.read_exact_at(60 << 12, &mut back).unwrap();
        assert!(back.iter().all(|b| *b == 9));
    }
}
