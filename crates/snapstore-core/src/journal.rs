//! Write-ahead journal: a fixed ring of metadata chunks.
//!
//! A transaction is the current dirty list: each dirty block is staged into
//! successive journal slots, then a commit block records their home sectors
//! in the same order. Only after the commit block is down do the buffers go
//! to their real locations. The commit block checksum is the complement of
//! the block's u32 word sum, so a valid block sums to zero.

use crate::store::SnapStore;
use snapstore_error::{Result, SnapError};
use snapstore_types::{put_le_u32, put_le_u64, Sector, JOURNAL_MAGIC};
use tracing::{debug, error, trace, warn};

const CB_CHECKSUM: usize = 8;
const CB_SEQUENCE: usize = 12;
const CB_ENTRIES: usize = 16;
const CB_SECTORS: usize = 20;

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

#[must_use]
pub fn is_commit_block(block: &[u8]) -> bool {
    block[..8] == JOURNAL_MAGIC
}

#[must_use]
pub fn commit_sequence(block: &[u8]) -> i32 {
    get_u32(block, CB_SEQUENCE) as i32
}

#[must_use]
pub fn commit_entries(block: &[u8]) -> u32 {
    get_u32(block, CB_ENTRIES)
}

#[must_use]
pub fn commit_entry_sector(block: &[u8], i: usize) -> Sector {
    Sector(get_u64(block, CB_SECTORS + i * 8))
}

/// Sum of the block as little-endian u32 words. A well-formed commit block
/// sums to zero.
#[must_use]
pub fn checksum_block(block: &[u8]) -> u32 {
    let mut sum = 0_u32;
    for word in block.chunks_exact(4) {
        sum = sum.wrapping_add(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
    }
    sum
}

/// Fill `block` as a commit block with the given sequence and home-sector
/// list, checksum included.
pub fn build_commit_block(block: &mut [u8], sequence: i32, sectors: &[Sector]) {
    block.fill(0);
    block[..8].copy_from_slice(&JOURNAL_MAGIC);
    put_le_u32(block, CB_SEQUENCE, sequence as u32);
    put_le_u32(block, CB_ENTRIES, sectors.len() as u32);
    for (i, sector) in sectors.iter().enumerate() {
        put_le_u64(block, CB_SECTORS + i * 8, sector.0);
    }
    let sum = checksum_block(block);
    put_le_u32(block, CB_CHECKSUM, 0_u32.wrapping_sub(sum));
}

impl SnapStore {
    #[must_use]
    pub fn journal_sector(&self, slot: u32) -> Sector {
        Sector(
            self.image.journal_base.0
                + (u64::from(slot) << u64::from(self.meta_geometry().sectors_per_alloc_bits())),
        )
    }

    /// Home sectors a single commit block can record.
    #[must_use]
    pub fn max_commit_entries(&self) -> usize {
        (self.cache.blocksize() - CB_SECTORS) / 8
    }

    fn next_journal_slot(&mut self) -> u32 {
        let next = self.image.journal_next;
        self.image.journal_next += 1;
        if self.image.journal_next == self.image.journal_size {
            self.image.journal_next = 0;
        }
        next
    }

    /// Prefill every journal slot with an empty commit block, sequences
    /// `0..journal_size`, so recovery of a never-used store terminates.
    pub(crate) fn init_journal(&mut self) -> Result<()> {
        for slot in 0..self.image.journal_size {
            let sector = self.journal_sector(slot);
            let buffer = self.cache.getblk(sector);
            build_commit_block(&mut buffer.data(), slot as i32, &[]);
            self.cache.mark_dirty(&buffer);
        }
        // These must reach the device outside any transaction.
        self.cache.flush()
    }

    /// Dirty-count threshold at which callers must commit before dirtying
    /// further blocks: one transaction has to fit both the ring and a
    /// single commit block's entry table.
    #[must_use]
    pub fn journal_commit_threshold(&self) -> usize {
        (self.image.journal_size as usize - 1).min(self.max_commit_entries())
    }

    /// Atomically persist the dirty list, then write the buffers home.
    /// Oversized dirty sets close as a train of back-to-back transactions.
    /// Persists the superblock afterwards.
    pub fn commit_transaction(&mut self) -> Result<()> {
        loop {
            let all_dirty = self.cache.dirty_sectors();
            if all_dirty.is_empty() {
                return self.save_sb();
            }
            let batch = self.journal_commit_threshold().min(all_dirty.len());
            self.commit_one(&all_dirty[..batch])?;
        }
    }

    fn commit_one(&mut self, dirty: &[Sector]) -> Result<()> {
        if dirty.is_empty() {
            return Ok(());
        }

        for sector in dirty {
            let slot = self.next_journal_slot();
            let buffer = self.cache.bread(*sector)?;
            trace!(
                target: "snapstore::journal",
                sector = %sector,
                slot,
                "journal data block"
            );
            // The slot may be cached from a previous transaction's commit
            // block; staging foreign bytes under it would leave that entry
            // stale.
            self.cache.evict(self.journal_sector(slot))?;
            self.cache.write_buffer_to(&buffer, self.journal_sector(slot))?;
        }

        let slot = self.next_journal_slot();
        let sequence = self.image.sequence;
        self.image.sequence = self.image.sequence.wrapping_add(1);
        let commit_buffer = self.cache.getblk(self.journal_sector(slot));
        build_commit_block(&mut commit_buffer.data(), sequence, dirty);
        self.cache.write_buffer_to(&commit_buffer, self.journal_sector(slot))?;
        debug!(
            target: "snapstore::journal",
            slot,
            sequence,
            entries = dirty.len(),
            "commit"
        );

        // The commit block is durable; now the real locations may change.
        for sector in dirty {
            let buffer = self.cache.bread(*sector)?;
            self.cache.write_buffer(&buffer)?;
        }
        self.set_sb_dirty();
        Ok(())
    }

    /// Scan the whole ring, find the newest commit, replay its data blocks
    /// to their home sectors, and resume the ring after it.
    ///
    /// Tolerates exactly one torn ("scribbled") commit block at the write
    /// frontier; anything else is fatal. Repeated recovery of the same
    /// journal is idempotent.
    pub fn recover_journal(&mut self) -> Result<()> {
        // Recovery trusts the device, not whatever the cache accumulated.
        self.cache.evict_all()?;
        let size = self.image.journal_size;
        let mut sequence: i32 = -1;
        let mut scribbled: Option<u32> = None;
        let mut last_block: Option<u32> = None;
        let mut newest_block: Option<u32> = None;

        for i in 0..size {
            let buffer = self.cache.bread(self.journal_sector(i))?;
            let data = buffer.data();
            if !is_commit_block(&data) {
                trace!(target: "snapstore::journal", slot = i, "scan: data");
                continue;
            }

            if checksum_block(&data) != 0 {
                warn!(target: "snapstore::journal", slot = i, "block failed checksum");
                if scribbled.is_some() {
                    return Err(SnapError::JournalRecovery(
                        "Too many scribbled blocks in journal",
                    ));
                }
                if let Some(newest) = newest_block {
                    if Some(newest) != last_block {
                        return Err(SnapError::JournalRecovery("Bad block not last written"));
                    }
                }
                scribbled = Some(i);
                if last_block.is_some() {
                    newest_block = last_block;
                }
                sequence = sequence.wrapping_add(1);
                continue;
            }

            let block_sequence = commit_sequence(&data);
            trace!(target: "snapstore::journal", slot = i, sequence = block_sequence, "scan: commit");
            if last_block.is_some() && block_sequence != sequence.wrapping_add(1) {
                let delta = sequence.wrapping_sub(block_sequence);
                if delta <= 0 || delta > size as i32 {
                    return Err(SnapError::JournalRecovery("Bad sequence"));
                }
                if newest_block.is_some() {
                    return Err(SnapError::JournalRecovery("Multiple sequence wraps"));
                }
                if !(scribbled.is_none() || scribbled == i.checked_sub(1)) {
                    return Err(SnapError::JournalRecovery("Bad block not last written"));
                }
                newest_block = last_block;
            }
            last_block = Some(i);
            sequence = block_sequence;
        }

        let Some(last) = last_block else {
            return Err(SnapError::JournalRecovery("No commit blocks found"));
        };
        let newest = newest_block.unwrap_or(last);
        debug!(target: "snapstore::journal", slot = newest, "found newest commit");

        let commit_buffer = self.cache.bread(self.journal_sector(newest))?;
        let (entries, commit_seq) = {
            let data = commit_buffer.data();
            (commit_entries(&data), commit_sequence(&data))
        };
        for i in 0..entries {
            let pos = (newest + size - entries + i) % size;
            let databuf = self.cache.bread(self.journal_sector(pos))?;
            let target = {
                let data = databuf.data();
                if is_commit_block(&data) {
                    error!(
                        target: "snapstore::journal",
                        slot = pos,
                        "data block marked as commit block"
                    );
                    continue;
                }
                commit_entry_sector(&commit_buffer.data(), i as usize)
            };
            debug!(
                target: "snapstore::journal",
                slot = pos,
                sector = %target,
                "replay journal data"
            );
            self.cache.write_buffer_to(&databuf, target)?;
        }

        self.image.journal_next = (newest + 1) % size;
        self.image.sequence = commit_seq.wrapping_add(1);
        self.set_sb_dirty();
        Ok(())
    }
}

/// One-line rendering of a journal slot for the offline dump tool.
#[must_use]
pub fn format_slot(slot: u32, data: &[u8]) -> String {
    if !is_commit_block(data) {
        return format!("[{slot}] <data>");
    }
    let entries = commit_entries(data);
    let mut line = format!(
        "[{slot}] seq={} ({entries}){}",
        commit_sequence(data),
        if checksum_block(data) == 0 {
            ""
        } else {
            " BAD CHECKSUM"
        }
    );
    for i in 0..entries as usize {
        line.push_str(&format!(" {:#x}", commit_entry_sector(data, i).0));
    }
    line
}
