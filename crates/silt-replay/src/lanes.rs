//! The lane table.
//!
//! `L = 2^k` lanes; a timestamp's lane is its low `k` bits. At most one
//! worker holds a lane at a time, and keys produced within a lane share its
//! low `k` bits, so no two concurrent workers can collide on a key.
//!
//! One global read/write lock guards mutations; the occasional read from
//! inside the pick loop is an acquire load of a scalar.

use parking_lot::{RwLock, RwLockWriteGuard};
use silt_types::LaneCount;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

#[derive(Debug)]
struct Lane {
    in_use: AtomicBool,
    last_commit_ts: AtomicU64,
}

#[derive(Debug)]
pub(crate) struct LaneTable {
    lanes: Box<[Lane]>,
    count: LaneCount,
    lock: RwLock<()>,
    /// Stale hint of the maximum committed timestamp; written only under
    /// the lane lock, read lock-free.
    cached_committed: AtomicU64,
    /// Pacing counter for the cheap-scan policy.
    scan_counter: AtomicU32,
}

impl LaneTable {
    pub(crate) fn new(count: LaneCount) -> Self {
        let lanes = (0..count.get())
            .map(|_| Lane {
                in_use: AtomicBool::new(false),
                last_commit_ts: AtomicU64::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            lanes,
            count,
            lock: RwLock::new(()),
            cached_committed: AtomicU64::new(0),
            scan_counter: AtomicU32::new(0),
        }
    }

    pub(crate) fn count(&self) -> LaneCount {
        self.count
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write()
    }

    pub(crate) fn in_use(&self, lane: u32) -> bool {
        self.lanes[lane as usize].in_use.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_use(&self, lane: u32, in_use: bool) {
        self.lanes[lane as usize]
            .in_use
            .store(in_use, Ordering::Release);
    }

    pub(crate) fn last_commit(&self, lane: u32) -> u64 {
        self.lanes[lane as usize]
            .last_commit_ts
            .load(Ordering::Acquire)
    }

    /// Record a lane's commit. Per-lane commit stamps never decrease.
    pub(crate) fn publish_commit(&self, lane: u32, ts: u64) {
        let slot = &self.lanes[lane as usize].last_commit_ts;
        debug_assert!(
            slot.load(Ordering::Relaxed) <= ts,
            "lane {lane} commit stamp would decrease"
        );
        slot.store(ts, Ordering::Release);
    }

    /// Set every lane's commit stamp and the cached committed hint to `ts`.
    /// Callers hold the write lock.
    pub(crate) fn sync_all(&self, ts: u64) {
        for lane in self.lanes.iter() {
            lane.last_commit_ts.store(ts, Ordering::Release);
        }
        self.cached_committed.store(ts, Ordering::Release);
    }

    pub(crate) fn cached_committed(&self) -> u64 {
        self.cached_committed.load(Ordering::Acquire)
    }

    pub(crate) fn store_cached_committed(&self, ts: u64) {
        self.cached_committed.store(ts, Ordering::Release);
    }

    /// Advance the scan pacing counter, returning the new value.
    pub(crate) fn bump_scan_counter(&self) -> u32 {
        self.scan_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Minimum non-zero commit stamp over in-use lanes, starting from `ts`.
    /// Callers hold the write lock.
    pub(crate) fn min_in_use_commit(&self, mut ts: u64) -> u64 {
        for lane in self.lanes.iter() {
            if lane.in_use.load(Ordering::Acquire) {
                let commit_ts = lane.last_commit_ts.load(Ordering::Acquire);
                if commit_ts != 0 {
                    ts = ts.min(commit_ts);
                }
            }
        }
        ts
    }

    /// Number of lanes currently held. Best-effort, for observation only.
    pub(crate) fn in_use_count(&self) -> u32 {
        self.lanes
            .iter()
            .filter(|lane| lane.in_use.load(Ordering::Acquire))
            .count() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_all_sets_every_lane() {
        let table = LaneTable::new(LaneCount::new(8).expect("lanes"));
        table.sync_all(42);
        for lane in 0..8 {
            assert_eq!(table.last_commit(lane), 42);
        }
        assert_eq!(table.cached_committed(), 42);
    }

    #[test]
    fn min_in_use_commit_skips_idle_and_zero() {
        let table = LaneTable::new(LaneCount::new(4).expect("lanes"));
        table.publish_commit(0, 10);
        table.publish_commit(1, 7);
        table.set_in_use(1, true);
        table.set_in_use(2, true); // in use, commit stamp still 0: skipped
        assert_eq!(table.min_in_use_commit(100), 7);
    }
}
