#![forbid(unsafe_code)]
//! Block I/O layer: positioned byte devices and the buffered block cache
//! over the metadata device.
//!
//! The cache hands out reference-counted buffer handles keyed by sector and
//! keeps a FIFO dirty list; the journal drains that list as one transaction.
//! Buffers are fixed-size (one metadata chunk) and zero-filled on first
//! `getblk`. All mutation happens on the single server thread; the
//! per-buffer mutex only guards the data bytes while a handle is held.

use parking_lot::{Mutex, MutexGuard};
use snapstore_error::{Result, SnapError};
use snapstore_types::Sector;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{trace, warn};

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not touch the shared
/// seek position, so one handle serves the whole process.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let in_bounds = offset
            .checked_add(buf.len() as u64)
            .is_some_and(|end| end <= self.len);
        if !in_bounds {
            return Err(SnapError::Corruption {
                sector: offset >> 9,
                detail: format!("read out of bounds: len={} device={}", buf.len(), self.len),
            });
        }
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(SnapError::Io(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            )));
        }
        let in_bounds = offset
            .checked_add(buf.len() as u64)
            .is_some_and(|end| end <= self.len);
        if !in_bounds {
            return Err(SnapError::Corruption {
                sector: offset >> 9,
                detail: format!("write out of bounds: len={} device={}", buf.len(), self.len),
            });
        }
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device for tests and offline tooling.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
        }
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.lock().len() as u64
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        let start = usize::try_from(offset).map_err(|_| SnapError::Corruption {
            sector: offset >> 9,
            detail: "offset does not fit usize".to_owned(),
        })?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| SnapError::Corruption {
                sector: offset >> 9,
                detail: "read out of bounds".to_owned(),
            })?;
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        let start = usize::try_from(offset).map_err(|_| SnapError::Corruption {
            sector: offset >> 9,
            detail: "offset does not fit usize".to_owned(),
        })?;
        let end = start
            .checked_add(buf.len())
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| SnapError::Corruption {
                sector: offset >> 9,
                detail: "write out of bounds".to_owned(),
            })?;
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// One cached metadata block.
///
/// Invariant: `data` is exactly one metadata chunk long.
#[derive(Debug)]
pub struct Buffer {
    sector: Sector,
    data: Mutex<Vec<u8>>,
}

impl Buffer {
    /// Home sector of this buffer on the metadata device.
    #[must_use]
    pub fn sector(&self) -> Sector {
        self.sector
    }

    /// Lock the block bytes for reading or in-place editing.
    ///
    /// Mutating the bytes does not mark the buffer dirty; callers pair edits
    /// with [`BufferCache::mark_dirty`].
    pub fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock()
    }
}

/// Shared handle to a cached buffer. Dropping the last outside handle
/// unpins the block.
pub type BufferRef = Arc<Buffer>;

/// Buffered, dirty-tracked cache over the metadata device.
///
/// Guarantees:
/// - a dirty buffer is written at least once before eviction,
/// - pinned buffers (outstanding handles) are never evicted,
/// - the dirty list preserves first-dirtied order for the journal.
pub struct BufferCache {
    dev: Arc<dyn ByteDevice>,
    blocksize: usize,
    blocks: HashMap<u64, BufferRef>,
    dirty: VecDeque<u64>,
}

impl BufferCache {
    #[must_use]
    pub fn new(dev: Arc<dyn ByteDevice>, blocksize: u32) -> Self {
        Self {
            dev,
            blocksize: blocksize as usize,
            blocks: HashMap::new(),
            dirty: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn blocksize(&self) -> usize {
        self.blocksize
    }

    /// Return the buffer for `sector`, allocating a zeroed one without
    /// reading the device. For blocks about to be fully overwritten.
    pub fn getblk(&mut self, sector: Sector) -> BufferRef {
        if let Some(buf) = self.blocks.get(&sector.0) {
            return Arc::clone(buf);
        }
        let buf = Arc::new(Buffer {
            sector,
            data: Mutex::new(vec![0_u8; self.blocksize]),
        });
        self.blocks.insert(sector.0, Arc::clone(&buf));
        buf
    }

    /// Return the buffer for `sector` with its on-disk contents loaded.
    pub fn bread(&mut self, sector: Sector) -> Result<BufferRef> {
        if let Some(buf) = self.blocks.get(&sector.0) {
            return Ok(Arc::clone(buf));
        }
        let mut data = vec![0_u8; self.blocksize];
        self.dev.read_exact_at(sector.to_bytes(), &mut data)?;
        trace!(target: "snapstore::cache", sector = %sector, "bread");
        let buf = Arc::new(Buffer {
            sector,
            data: Mutex::new(data),
        });
        self.blocks.insert(sector.0, Arc::clone(&buf));
        Ok(buf)
    }

    /// Append `buffer` to the dirty list if it is not already queued.
    pub fn mark_dirty(&mut self, buffer: &BufferRef) {
        let sector = buffer.sector.0;
        if !self.dirty.contains(&sector) {
            self.dirty.push_back(sector);
        }
    }

    #[must_use]
    pub fn is_dirty(&self, sector: Sector) -> bool {
        self.dirty.contains(&sector.0)
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Dirty sectors ordered from oldest to newest dirty mark.
    #[must_use]
    pub fn dirty_sectors(&self) -> Vec<Sector> {
        self.dirty.iter().copied().map(Sector).collect()
    }

    /// Write the buffer's bytes to an arbitrary sector, leaving its dirty
    /// state untouched. Used to stage dirty blocks into journal slots.
    pub fn write_buffer_to(&self, buffer: &BufferRef, sector: Sector) -> Result<()> {
        let data = buffer.data();
        self.dev.write_all_at(sector.to_bytes(), &data)
    }

    /// Write the buffer home and remove it from the dirty list.
    pub fn write_buffer(&mut self, buffer: &BufferRef) -> Result<()> {
        self.write_buffer_to(buffer, buffer.sector)?;
        self.dirty.retain(|sector| *sector != buffer.sector.0);
        Ok(())
    }

    /// Write out every dirty buffer in dirty order.
    pub fn flush(&mut self) -> Result<()> {
        while let Some(sector) = self.dirty.front().copied() {
            let Some(buf) = self.blocks.get(&sector).map(Arc::clone) else {
                // A dirty entry always has a resident block.
                warn!(target: "snapstore::cache", sector, "dirty entry without block");
                self.dirty.pop_front();
                continue;
            };
            self.write_buffer(&buf)?;
        }
        Ok(())
    }

    /// Drop `sector` from the cache. Dirty contents are written first;
    /// pinned buffers are kept with a warning.
    pub fn evict(&mut self, sector: Sector) -> Result<()> {
        let Some(buf) = self.blocks.get(&sector.0).map(Arc::clone) else {
            return Ok(());
        };
        if self.is_dirty(sector) {
            self.write_buffer(&buf)?;
        }
        // One reference held by the map, one by `buf` above.
        if Arc::strong_count(&buf) > 2 {
            warn!(target: "snapstore::cache", sector = %sector, "evict of pinned buffer skipped");
            return Ok(());
        }
        self.blocks.remove(&sector.0);
        Ok(())
    }

    /// Flush and drop every unpinned buffer. Used at shutdown.
    pub fn evict_all(&mut self) -> Result<()> {
        self.flush()?;
        let sectors: Vec<u64> = self.blocks.keys().copied().collect();
        for sector in sectors {
            self.evict(Sector(sector))?;
        }
        Ok(())
    }

    /// Number of resident buffers.
    #[must_use]
    pub fn resident(&self) -> usize {
        self.blocks.len()
    }

    pub fn sync(&self) -> Result<()> {
        self.dev.sync()
    }
}

impl std::fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferCache")
            .field("blocksize", &self.blocksize)
            .field("resident", &self.blocks.len())
            .field("dirty", &self.dirty.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(len: usize) -> BufferCache {
        BufferCache::new(Arc::new(MemByteDevice::new(len)), 4096)
    }

    #[test]
    fn getblk_returns_zeroed_block() {
        let mut cache = cache(1 << 20);
        let buf = cache.getblk(Sector(8));
        assert_eq!(buf.sector(), Sector(8));
        assert!(buf.data().iter().all(|b| *b == 0));
    }

    #[test]
    fn bread_reads_device_contents() {
        let dev = Arc::new(MemByteDevice::new(1 << 20));
        dev.write_all_at(8 * 512, &[0xab; 4096]).unwrap();
        let mut cache = BufferCache::new(dev, 4096);
        let buf = cache.bread(Sector(8)).unwrap();
        assert!(buf.data().iter().all(|b| *b == 0xab));
    }

    #[test]
    fn bread_returns_cached_copy() {
        let mut cache = cache(1 << 20);
        let a = cache.getblk(Sector(8));
        a.data()[0] = 7;
        let b = cache.bread(Sector(8)).unwrap();
        assert_eq!(b.data()[0], 7);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn dirty_list_keeps_first_dirtied_order() {
        let mut cache = cache(1 << 20);
        let a = cache.getblk(Sector(8));
        let b = cache.getblk(Sector(16));
        cache.mark_dirty(&b);
        cache.mark_dirty(&a);
        cache.mark_dirty(&b); // re-mark must not reorder
        assert_eq!(cache.dirty_sectors(), vec![Sector(16), Sector(8)]);
        assert_eq!(cache.dirty_count(), 2);
    }

    #[test]
    fn write_buffer_clears_dirty() {
        let mut cache = cache(1 << 20);
        let buf = cache.getblk(Sector(8));
        buf.data()[0] = 1;
        cache.mark_dirty(&buf);
        cache.write_buffer(&buf).unwrap();
        assert_eq!(cache.dirty_count(), 0);
    }

    #[test]
    fn flush_persists_in_order() {
        let dev = Arc::new(MemByteDevice::new(1 << 20));
        let mut cache = BufferCache::new(Arc::clone(&dev) as Arc<dyn ByteDevice>, 4096);
        let a = cache.getblk(Sector(8));
        a.data()[0] = 0x55;
        cache.mark_dirty(&a);
        drop(a);
        cache.flush().unwrap();
        let mut back = [0_u8; 1];
        dev.read_exact_at(8 * 512, &mut back).unwrap();
        assert_eq!(back[0], 0x55);
    }

    #[test]
    fn evict_writes_dirty_and_skips_pinned() {
        let dev = Arc::new(MemByteDevice::new(1 << 20));
        let mut cache = BufferCache::new(Arc::clone(&dev) as Arc<dyn ByteDevice>, 4096);

        let pinned = cache.getblk(Sector(8));
        cache.evict(Sector(8)).unwrap();
        assert_eq!(cache.resident(), 1); // still pinned

        pinned.data()[0] = 9;
        cache.mark_dirty(&pinned);
        drop(pinned);
        cache.evict(Sector(8)).unwrap();
        assert_eq!(cache.resident(), 0);
        let mut back = [0_u8; 1];
        dev.read_exact_at(8 * 512, &mut back).unwrap();
        assert_eq!(back[0], 9); // dirty data reached the device before eviction
    }

    #[test]
    fn file_device_round_trip() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(1 << 20).unwrap();
        let dev = FileByteDevice::open(file.path()).unwrap();
        dev.write_all_at(4096, b"snapstore").unwrap();
        let mut back = [0_u8; 9];
        dev.read_exact_at(4096, &mut back).unwrap();
        assert_eq!(&back, b"snapstore");
        assert!(dev.read_exact_at(1 << 20, &mut back).is_err());
    }
}
