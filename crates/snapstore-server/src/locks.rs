//! Snap-read lock table: serializes origin writes against in-flight
//! snapshot reads.
//!
//! A snapshot read of a chunk with no exception takes a read lock; an
//! origin write that creates an exception for a locked chunk parks its
//! reply as a `Pending` that counts down as the locks release. Locks hash
//! into bins by origin chunk; everything here is in-memory and owned by the
//! single server thread.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{trace, warn};

/// Default hash table width, log2 bins.
pub const SNAPLOCK_HASH_BITS: u32 = 8;

/// A reply deferred until every chunk it depends on is unlocked.
#[derive(Debug)]
pub struct Pending {
    pub holdcount: u32,
    /// Session token the reply goes to.
    pub client: usize,
    /// The framed reply message.
    pub message: Vec<u8>,
}

pub type PendingRef = Arc<Mutex<Pending>>;

#[derive(Debug)]
struct SnapLock {
    chunk: u64,
    /// Session tokens currently reading this chunk.
    holders: Vec<usize>,
    waiters: Vec<PendingRef>,
}

/// Hashed lock set keyed by origin chunk.
#[derive(Debug)]
pub struct LockTable {
    bins: Vec<Vec<SnapLock>>,
    hash_bits: u32,
}

impl LockTable {
    #[must_use]
    pub fn new(hash_bits: u32) -> Self {
        Self {
            bins: (0..1_usize << hash_bits).map(|_| Vec::new()).collect(),
            hash_bits,
        }
    }

    fn bin(&self, chunk: u64) -> usize {
        let hash = chunk.wrapping_mul(3_498_734_713) as u32;
        (hash >> (32 - self.hash_bits)) as usize
    }

    /// Record `client` as a reader of `chunk`, creating the lock if absent.
    pub fn readlock_chunk(&mut self, chunk: u64, client: usize) {
        let bin = self.bin(chunk);
        let locks = &mut self.bins[bin];
        let index = match locks.iter().position(|lock| lock.chunk == chunk) {
            Some(index) => index,
            None => {
                locks.push(SnapLock {
                    chunk,
                    holders: Vec::new(),
                    waiters: Vec::new(),
                });
                locks.len() - 1
            }
        };
        trace!(target: "snapstore::locks", chunk, client, "readlock");
        locks[index].holders.push(client);
    }

    /// If `chunk` is locked, link a waiter for the caller's pending reply,
    /// creating the pending (with its base hold) on first use.
    pub fn waitfor_chunk(&mut self, chunk: u64, pending: &mut Option<PendingRef>) {
        let bin = self.bin(chunk);
        let Some(lock) = self.bins[bin].iter_mut().find(|lock| lock.chunk == chunk) else {
            return;
        };
        let pending = pending.get_or_insert_with(|| {
            Arc::new(Mutex::new(Pending {
                holdcount: 1,
                client: 0,
                message: Vec::new(),
            }))
        });
        trace!(target: "snapstore::locks", chunk, "origin write waits on readers");
        lock.waiters.push(Arc::clone(pending));
        pending.lock().holdcount += 1;
    }

    /// Drop `client`'s hold on `chunk`. When the last holder leaves, every
    /// waiter counts down; pendings that reach zero are returned ready to
    /// send, and the lock is freed.
    pub fn release_chunk(&mut self, chunk: u64, client: usize) -> Vec<PendingRef> {
        let bin = self.bin(chunk);
        let locks = &mut self.bins[bin];
        let Some(index) = locks.iter().position(|lock| lock.chunk == chunk) else {
            warn!(target: "snapstore::locks", chunk, "chunk not locked");
            return Vec::new();
        };
        let lock = &mut locks[index];
        let Some(holder) = lock.holders.iter().position(|holder| *holder == client) else {
            warn!(target: "snapstore::locks", chunk, client, "holder not found");
            return Vec::new();
        };
        lock.holders.remove(holder);
        if !lock.holders.is_empty() {
            return Vec::new();
        }
        let lock = locks.remove(index);
        drain_waiters(lock.waiters)
    }

    /// Disconnect sweep: release every hold `client` still has, anywhere.
    pub fn release_client(&mut self, client: usize) -> Vec<PendingRef> {
        let mut ready = Vec::new();
        for bin in &mut self.bins {
            let mut index = 0;
            while index < bin.len() {
                let lock = &mut bin[index];
                lock.holders.retain(|holder| *holder != client);
                if lock.holders.is_empty() && !lock.waiters.is_empty() {
                    let lock = bin.remove(index);
                    ready.extend(drain_waiters(lock.waiters));
                    continue;
                }
                if lock.holders.is_empty() {
                    bin.remove(index);
                    continue;
                }
                index += 1;
            }
        }
        ready
    }

    /// Whether any lock is outstanding (used by tests and shutdown checks).
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.bins.iter().all(Vec::is_empty)
    }
}

fn drain_waiters(waiters: Vec<PendingRef>) -> Vec<PendingRef> {
    let mut ready = Vec::new();
    for waiter in waiters {
        let done = {
            let mut pending = waiter.lock();
            debug_assert!(pending.holdcount > 0);
            pending.holdcount -= 1;
            pending.holdcount == 0
        };
        if done {
            ready.push(waiter);
        }
    }
    ready
}

/// Balance the base hold a pending was created with; the reply goes out
/// now if every lock already released.
#[must_use]
pub fn settle_pending(pending: &PendingRef) -> bool {
    let mut inner = pending.lock();
    debug_assert!(inner.holdcount > 0);
    inner.holdcount -= 1;
    inner.holdcount == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn park(table: &mut LockTable, chunks: &[u64], client: usize) -> Option<PendingRef> {
        let mut pending = None;
        for chunk in chunks {
            table.waitfor_chunk(*chunk, &mut pending);
        }
        if let Some(pending) = &pending {
            let mut inner = pending.lock();
            inner.client = client;
            inner.message = vec![0xab];
        }
        pending
    }

    #[test]
    fn waitfor_without_lock_is_noop() {
        let mut table = LockTable::new(SNAPLOCK_HASH_BITS);
        let pending = park(&mut table, &[7], 1);
        assert!(pending.is_none());
    }

    #[test]
    fn parked_write_released_by_last_reader() {
        let mut table = LockTable::new(SNAPLOCK_HASH_BITS);
        table.readlock_chunk(7, 1);
        table.readlock_chunk(7, 2);

        let pending = park(&mut table, &[7], 3).expect("lock held, must park");
        // The request finished processing: settle the base hold.
        assert!(!settle_pending(&pending));

        // First reader leaves; the second still pins the chunk.
        assert!(table.release_chunk(7, 1).is_empty());
        let ready = table.release_chunk(7, 2);
        assert_eq!(ready.len(), 1);
        assert!(Arc::ptr_eq(&ready[0], &pending));
        assert!(table.is_idle());
    }

    #[test]
    fn pending_waits_for_every_locked_chunk() {
        let mut table = LockTable::new(SNAPLOCK_HASH_BITS);
        table.readlock_chunk(7, 1);
        table.readlock_chunk(9, 1);

        let pending = park(&mut table, &[7, 9], 2).expect("parked");
        assert!(!settle_pending(&pending));

        assert!(table.release_chunk(7, 1).is_empty());
        let ready = table.release_chunk(9, 1);
        assert_eq!(ready.len(), 1);
    }

    #[test]
    fn immediate_send_when_already_settled() {
        let mut table = LockTable::new(SNAPLOCK_HASH_BITS);
        table.readlock_chunk(7, 1);
        let pending = park(&mut table, &[7], 2).expect("parked");
        // Reader finishes before the write request does.
        assert!(table.release_chunk(7, 1).is_empty());
        // Settling the base hold reports it ready to send inline.
        assert!(settle_pending(&pending));
    }

    #[test]
    fn disconnect_sweep_releases_all_holds() {
        let mut table = LockTable::new(SNAPLOCK_HASH_BITS);
        table.readlock_chunk(7, 1);
        table.readlock_chunk(9, 1);
        table.readlock_chunk(9, 2);

        let pending = park(&mut table, &[7, 9], 3).expect("parked");
        assert!(!settle_pending(&pending));

        // Client 1 dies: chunk 7 frees, chunk 9 still held by client 2.
        let ready = table.release_client(1);
        assert!(ready.is_empty());
        let ready = table.release_chunk(9, 2);
        assert_eq!(ready.len(), 1);
        assert!(table.is_idle());
    }

    #[test]
    fn release_of_unlocked_chunk_is_harmless() {
        let mut table = LockTable::new(SNAPLOCK_HASH_BITS);
        assert!(table.release_chunk(7, 1).is_empty());
        table.readlock_chunk(7, 1);
        assert!(table.release_chunk(7, 2).is_empty()); // wrong client
        assert!(table.release_chunk(7, 1).is_empty()); // no waiters
        assert!(table.is_idle());
    }
}
