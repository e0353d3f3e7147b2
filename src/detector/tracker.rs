//! Per-source tracking table: a fixed-bucket hash index with bounded
//! capacity and LRU eviction.
//!
//! ## Concurrency strategy
//!
//! The table is guarded by one reader-writer lock at table granularity.
//! Readers (stats, the sweeper's expired-scan) run in parallel; any mutation
//! excludes them. Mutators go through [`TrackerWriteGuard`], whose borrowed
//! record references cannot outlive the guard: the rule that a record
//! pointer is only valid while the lock is held is enforced by the borrow
//! checker instead of by convention.
//!
//! A sharded map was considered and rejected: eviction must find the global
//! minimum `last_seen` under the same exclusive section that performs the
//! insert, which a per-shard locking scheme cannot express.

use crate::detector::types::TrackerRecord;
use crate::detector::DetectorError;
use parking_lot::{RwLock, RwLockWriteGuard};
use std::net::Ipv4Addr;

// ── Hashing ──────────────────────────────────────────────────────────────────

/// Integer scrambler applied to addresses before bucket selection, so that
/// sequential or patterned sources still spread across buckets.
fn scramble(ip: u32) -> u32 {
    let mut h = ip;
    h = (h ^ (h >> 16)).wrapping_mul(0x045d_9f3b);
    h = (h ^ (h >> 16)).wrapping_mul(0x045d_9f3b);
    h ^ (h >> 16)
}

// ── Table internals ──────────────────────────────────────────────────────────

struct TableInner {
    /// Chained buckets; `buckets.len()` is a power of two.
    buckets:     Vec<Vec<TrackerRecord>>,
    entry_count: usize,
    max_entries: usize,
}

impl TableInner {
    fn bucket_index(&self, addr: Ipv4Addr) -> usize {
        (scramble(u32::from(addr)) & (self.buckets.len() as u32 - 1)) as usize
    }

    /// Removes the record with the minimum `last_seen_ns`. Ties resolve to
    /// the first such record in bucket-then-chain order, which is stable
    /// within a run.
    fn evict_lru(&mut self) {
        let mut oldest: Option<(usize, usize, u64)> = None;

        for (b, bucket) in self.buckets.iter().enumerate() {
            for (i, rec) in bucket.iter().enumerate() {
                match oldest {
                    Some((_, _, t)) if rec.last_seen_ns >= t => {}
                    _ => oldest = Some((b, i, rec.last_seen_ns)),
                }
            }
        }

        if let Some((b, i, _)) = oldest {
            self.buckets[b].remove(i);
            self.entry_count -= 1;
        }
    }

    fn get_or_create(&mut self, addr: Ipv4Addr, now_ns: u64) -> &mut TrackerRecord {
        let b = self.bucket_index(addr);
        let pos = self.buckets[b].iter().position(|r| r.addr == addr);

        match pos {
            Some(i) => {
                let rec = &mut self.buckets[b][i];
                rec.last_seen_ns = now_ns;
                rec
            }
            None => {
                if self.entry_count >= self.max_entries {
                    self.evict_lru();
                }
                self.buckets[b].push(TrackerRecord::new(addr, now_ns));
                self.entry_count += 1;
                let last = self.buckets[b].len() - 1;
                &mut self.buckets[b][last]
            }
        }
    }

    fn get(&mut self, addr: Ipv4Addr) -> Option<&mut TrackerRecord> {
        let b = self.bucket_index(addr);
        self.buckets[b].iter_mut().find(|r| r.addr == addr)
    }

    fn remove(&mut self, addr: Ipv4Addr) -> bool {
        let b = self.bucket_index(addr);
        match self.buckets[b].iter().position(|r| r.addr == addr) {
            Some(i) => {
                self.buckets[b].remove(i);
                self.entry_count -= 1;
                true
            }
            None => false,
        }
    }
}

// ── Public surface ───────────────────────────────────────────────────────────

/// Snapshot of table occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerStats {
    /// Records currently in the table.
    pub total: usize,
    /// Records currently marked blocked.
    pub blocked: usize,
}

/// Hash-indexed, capacity-bounded table of [`TrackerRecord`]s.
pub struct TrackerTable {
    inner: RwLock<TableInner>,
}

/// Exclusive access to the table for compound mutations. Record references
/// obtained through this guard are valid only while it lives.
pub struct TrackerWriteGuard<'a> {
    inner: RwLockWriteGuard<'a, TableInner>,
}

impl<'a> TrackerWriteGuard<'a> {
    /// Finds the record for `addr`, creating it if absent.
    ///
    /// When the table is at capacity, the least-recently-seen record is
    /// evicted first. Both paths set `last_seen_ns = now_ns`; new records
    /// start with `syn_count = 0` and `window_start_ns = now_ns`.
    pub fn get_or_create(&mut self, addr: Ipv4Addr, now_ns: u64) -> &mut TrackerRecord {
        self.inner.get_or_create(addr, now_ns)
    }

    /// Finds the record for `addr`. Never creates.
    pub fn get(&mut self, addr: Ipv4Addr) -> Option<&mut TrackerRecord> {
        self.inner.get(addr)
    }
}

impl TrackerTable {
    /// Creates an empty table.
    ///
    /// # Errors
    /// `bucket_count` must be a non-zero power of two and `max_entries`
    /// strictly positive; both are validated again here because the table is
    /// also constructed directly by tests.
    pub fn new(bucket_count: usize, max_entries: usize) -> Result<Self, DetectorError> {
        if bucket_count == 0 || !bucket_count.is_power_of_two() {
            return Err(DetectorError::Config(format!(
                "tracker bucket count must be a power of 2, got {}",
                bucket_count
            )));
        }
        if max_entries == 0 {
            return Err(DetectorError::Config(
                "tracker capacity must be strictly positive".to_string(),
            ));
        }

        Ok(Self {
            inner: RwLock::new(TableInner {
                buckets: (0..bucket_count).map(|_| Vec::new()).collect(),
                entry_count: 0,
                max_entries,
            }),
        })
    }

    /// Takes the table's write lock for a compound mutation.
    pub fn write(&self) -> TrackerWriteGuard<'_> {
        TrackerWriteGuard {
            inner: self.inner.write(),
        }
    }

    /// Removes the record for `addr`. Returns whether one existed.
    pub fn remove(&self, addr: Ipv4Addr) -> bool {
        self.inner.write().remove(addr)
    }

    /// Removes every record matching `pred`, returning the removed keys and
    /// whether each was blocked. Used by the supervisor when a reload turns
    /// previously-tracked sources into whitelisted ones.
    pub fn remove_where<F>(&self, pred: F) -> Vec<(Ipv4Addr, bool)>
    where
        F: Fn(Ipv4Addr) -> bool,
    {
        let mut inner = self.inner.write();
        let mut removed = Vec::new();

        for bucket in &mut inner.buckets {
            let mut i = 0;
            while i < bucket.len() {
                if pred(bucket[i].addr) {
                    let rec = bucket.remove(i);
                    removed.push((rec.addr, rec.blocked));
                } else {
                    i += 1;
                }
            }
        }

        inner.entry_count -= removed.len();
        removed
    }

    /// Destroys all records.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        for bucket in &mut inner.buckets {
            bucket.clear();
        }
        inner.entry_count = 0;
    }

    /// Collects up to `cap` addresses whose blocks have expired at `now_ns`
    /// (`blocked && block_expiry_ns <= now_ns`). Pure read; the caller drives
    /// the subsequent state transitions.
    pub fn expired_blocks(&self, now_ns: u64, cap: usize) -> Vec<Ipv4Addr> {
        let inner = self.inner.read();
        let mut expired = Vec::new();

        'scan: for bucket in &inner.buckets {
            for rec in bucket {
                if rec.blocked && rec.block_expiry_ns <= now_ns {
                    expired.push(rec.addr);
                    if expired.len() == cap {
                        break 'scan;
                    }
                }
            }
        }

        expired
    }

    /// Returns current occupancy and blocked-record counts.
    pub fn stats(&self) -> TrackerStats {
        let inner = self.inner.read();
        let blocked = inner
            .buckets
            .iter()
            .flat_map(|b| b.iter())
            .filter(|r| r.blocked)
            .count();
        TrackerStats {
            total: inner.entry_count,
            blocked,
        }
    }
}
