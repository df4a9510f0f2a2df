#![forbid(unsafe_code)]
//! Predictable-replay timestamp scheduling.
//!
//! Predictable replay is the ability to run a stress workload multiple
//! times and always have the same changes made at every timestamp: two runs
//! with the same data seed executed up to the same timestamp compare
//! identically. It requires timestamped transactions with a single
//! operation per transaction.
//!
//! Determinism comes from seeding. Each worker, for each operation, owns a
//! *data* RNG and an *extra* RNG, seeded from the operation's timestamp
//! XOR-ed with the configured data/extra seeds. Data decisions (operation,
//! table, key, value) come from the data RNG; decisions that don't affect
//! on-disk content (pauses, session churn) come from the extra RNG, so
//! changing the extra seed may change how a workload is exercised but never
//! what it writes.
//!
//! Timestamps are doled out atomically, so no two workers ever work on
//! the same one, and a worker that has started an operation can never give it
//! up. After a rollback it retries with the same timestamp, reseeding its
//! RNGs from it, so the consequences of that timestamp are never lost.
//!
//! To keep two workers off the same key, timestamps are partitioned into
//! `L = 2^k` *lanes* (a timestamp's lane is its low `k` bits) and a key's
//! low `k` bits are replaced by the lane number. Only one worker occupies a
//! lane at a time. If a worker stalls long enough that the clock laps its
//! lane, other workers skip the occupied lane's timestamps; the occupant
//! notices on commit that timestamps were left for it, keeps the lane, and
//! works them off before releasing.
//!
//! Because no operation can be abandoned, an operation blocked by a
//! dependency keeps failing until the stable timestamp advances. Under
//! predictable replay the stable timestamp is recomputed far more often
//! than the usual periodic cadence, from the in-use lanes only, and
//! rollback pauses are banded by how far behind the worker is.

mod advancer;
mod clock;
mod lanes;

pub use advancer::{AdvancerConfig, StableTsDaemon};
pub use clock::{CheckpointSink, GlobalClock};

use lanes::LaneTable;
use parking_lot::{RwLock, RwLockReadGuard};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use silt_error::{Result, SiltError};
use silt_types::{LaneCount, WorkerId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace};

/// Scheduler configuration. All of it is input to determinism: two runs
/// agreeing on this struct (plus worker count and schema) replay
/// identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Number of lanes; a power of two.
    pub lane_count: LaneCount,
    /// Seed for data decisions (what is written where).
    pub data_seed: u64,
    /// Seed for non-data decisions (pauses, churn).
    pub extra_seed: u64,
    /// End the run once the stable timestamp reaches this.
    pub stop_timestamp: Option<u64>,
    /// Clock value at the start of the run; must be non-zero (a zero
    /// timestamp means "none" throughout).
    pub start_timestamp: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            lane_count: LaneCount::default(),
            data_seed: 0,
            extra_seed: 0,
            stop_timestamp: None,
            start_timestamp: 5,
        }
    }
}

impl ReplayConfig {
    pub fn validate(self) -> Result<Self> {
        // LaneCount construction and deserialization both enforce this, and
        // the lane mask arithmetic is wrong for any other value, so check
        // again here.
        let lanes = self.lane_count.get();
        if lanes == 0 || !lanes.is_power_of_two() {
            return Err(SiltError::ConfigInvalid {
                field: "replay.lane_count",
                reason: "lane count must be a non-zero power of two",
            });
        }
        if self.start_timestamp == 0 {
            return Err(SiltError::ConfigInvalid {
                field: "replay.start_timestamp",
                reason: "start timestamp must be non-zero",
            });
        }
        if let Some(stop) = self.stop_timestamp {
            if stop <= self.start_timestamp {
                return Err(SiltError::ConfigInvalid {
                    field: "replay.stop_timestamp",
                    reason: "stop timestamp must exceed the start timestamp",
                });
            }
        }
        Ok(self)
    }
}

/// Per-worker replay state. Owned by the worker thread and handed to every
/// scheduler call; nothing here is shared.
#[derive(Debug)]
pub struct WorkerReplay {
    id: WorkerId,
    lane: Option<u32>,
    /// Timestamp being worked, 0 when none.
    replay_ts: u64,
    /// Set when the current timestamp must be (re)tried at loop top.
    replay_again: bool,
    quit: bool,
    /// RNG for data decisions; reseeded from each picked timestamp.
    pub data_rng: ChaCha8Rng,
    /// RNG for non-data decisions; reseeded from each picked timestamp.
    pub extra_rng: ChaCha8Rng,
    /// Key number chosen by the worker, adjusted into the lane.
    pub keyno: u64,
}

impl WorkerReplay {
    #[must_use]
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            lane: None,
            replay_ts: 0,
            replay_again: false,
            quit: false,
            data_rng: ChaCha8Rng::seed_from_u64(0),
            extra_rng: ChaCha8Rng::seed_from_u64(0),
            keyno: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Whether the stop condition told this worker to leave its loop.
    #[must_use]
    pub fn quit(&self) -> bool {
        self.quit
    }

    /// The timestamp being worked, 0 when none.
    #[must_use]
    pub fn replay_ts(&self) -> u64 {
        self.replay_ts
    }

    #[must_use]
    pub fn lane(&self) -> Option<u32> {
        self.lane
    }
}

/// The replay scheduler: clock, lane table, and the per-operation state
/// machine. One instance per engine; tests instantiate their own.
#[derive(Debug)]
pub struct ReplayScheduler {
    config: ReplayConfig,
    clock: GlobalClock,
    lanes: LaneTable,
    /// Serializes engine-level checkpoint pushes against worker
    /// prepare/commit. Workers hold it shared; the advancer exclusively.
    prepare_commit_lock: RwLock<()>,
    workers_finished: AtomicBool,
}

impl ReplayScheduler {
    pub fn new(config: ReplayConfig) -> Result<Self> {
        let config = config.validate()?;
        info!(
            lane_count = config.lane_count.get(),
            data_seed = config.data_seed,
            extra_seed = config.extra_seed,
            stop_timestamp = ?config.stop_timestamp,
            "replay_scheduler_configured"
        );
        Ok(Self {
            config,
            clock: GlobalClock::new(config.start_timestamp),
            lanes: LaneTable::new(config.lane_count),
            prepare_commit_lock: RwLock::new(()),
            workers_finished: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    #[must_use]
    pub fn clock(&self) -> &GlobalClock {
        &self.clock
    }

    /// Synchronize the lanes at the beginning of a run: every lane's commit
    /// stamp starts at the current timestamp.
    pub fn run_begin(&self) {
        self.run_sync();
        debug!(timestamp = self.clock.current(), "replay_run_begin");
    }

    /// Synchronize the lanes when a run finishes processing.
    pub fn run_end(&self) {
        self.run_sync();
        debug!(timestamp = self.clock.current(), "replay_run_end");
    }

    fn run_sync(&self) {
        let _guard = self.lanes.write();
        let ts = self.clock.sync_shadow();
        self.lanes.sync_all(ts);
    }

    /// Top of the worker's operation loop: pick (or keep) a timestamp and
    /// seed the RNGs from it.
    ///
    /// The worker arrives here for one of four reasons: it rolled back and
    /// kept its timestamp (`replay_again` set); it committed but its lane
    /// was lapped, obligating it to the next timestamp in the lane
    /// (`replay_again` set); it committed and released cleanly; or it is
    /// the first iteration. The worker must not be inside a transaction.
    ///
    /// After this returns, either `worker.quit()` is set or the worker has
    /// a timestamp and freshly seeded RNGs.
    pub fn loop_begin(&self, worker: &mut WorkerReplay, in_txn: bool) -> Result<()> {
        if in_txn {
            return Err(self.integrity(worker, "loop_begin entered inside a transaction"));
        }
        if worker.replay_again != (worker.replay_ts != 0) {
            return Err(self.integrity(worker, "replay_again out of step with replay_ts"));
        }

        self.pick_timestamp(worker)?;
        if worker.quit {
            return Ok(());
        }

        debug_assert!(worker.replay_ts != 0);
        worker.data_rng = ChaCha8Rng::seed_from_u64(worker.replay_ts ^ self.config.data_seed);
        worker.extra_rng = ChaCha8Rng::seed_from_u64(worker.replay_ts ^ self.config.extra_seed);
        Ok(())
    }

    /// Pick the next timestamp. That timestamp is used for the commit and
    /// determines the worker's lane; seeding the RNGs from it determines
    /// precisely the nature of the operation.
    fn pick_timestamp(&self, worker: &mut WorkerReplay) -> Result<()> {
        if worker.replay_again {
            // The timestamp is already picked for us.
            if worker.lane != Some(self.config.lane_count.lane_of(worker.replay_ts)) {
                return Err(self.integrity(worker, "held lane does not match replay_ts"));
            }
            worker.replay_again = false;
            return Ok(());
        }

        if worker.lane.is_some() {
            return Err(self.integrity(worker, "lane held without a pending timestamp"));
        }

        if let Some(stop) = self.config.stop_timestamp {
            if self.clock.stable() >= stop && worker.replay_ts == 0 {
                worker.quit = true;
                return Ok(());
            }
        }

        let guard = self.lanes.write();
        let (ts, lane) = loop {
            // The only place the clock advances. Occupied lanes are skipped,
            // deferring their timestamps to the straggling occupant.
            let ts = self.clock.next()?;
            let lane = self.config.lane_count.lane_of(ts);
            if !self.lanes.in_use(lane) {
                break (ts, lane);
            }
        };
        worker.replay_ts = ts;
        self.lanes.set_in_use(lane, true);
        drop(guard);
        worker.lane = Some(lane);

        trace!(worker = worker.id.0, ts, lane, "replay_pick");
        Ok(())
    }

    /// Read timestamp for the operation's begin: the largest timestamp no
    /// longer in use.
    #[must_use]
    pub fn read_ts(&self, worker: &WorkerReplay) -> u64 {
        debug_assert!(worker.replay_ts != 0 && worker.lane.is_some());
        self.maximum_committed()
    }

    /// Timestamp to use for a prepare call.
    ///
    /// The read timestamp cannot advance beyond our lane's previous commit,
    /// which is `replay_ts - lane_count`; anywhere between there and the
    /// eventual commit timestamp is safe, and backing off by half a lane
    /// width exercises prepared transactions without stalling the oldest
    /// checkpoint.
    #[must_use]
    pub fn prepare_ts(&self, worker: &WorkerReplay) -> u64 {
        let prepare_ts = worker.replay_ts;
        if prepare_ts == 0 {
            return 0;
        }
        let lane_count = u64::from(self.config.lane_count.get());
        if prepare_ts > self.config.start_timestamp + lane_count {
            let candidate = prepare_ts - lane_count / 2;
            if candidate > self.clock.oldest() {
                return candidate;
            }
        }
        prepare_ts
    }

    /// Commit timestamp: the picked timestamp, always.
    #[must_use]
    pub fn commit_ts(&self, worker: &WorkerReplay) -> u64 {
        debug_assert!(worker.replay_ts != 0);
        worker.replay_ts
    }

    /// Record a successful commit. Releases the lane unless the clock has
    /// lapped it, in which case this worker is obligated to the next
    /// timestamp in the lane.
    pub fn committed(&self, worker: &mut WorkerReplay) {
        debug_assert!(worker.replay_ts != 0 && !worker.replay_again);
        let Some(lane) = worker.lane else {
            debug_assert!(false, "commit without a lane");
            return;
        };

        let _guard = self.lanes.write();
        // Advancing the lane's commit stamp is what lets read, oldest and
        // stable timestamps move forward.
        self.lanes.publish_commit(lane, worker.replay_ts);
        let lane_count = u64::from(self.config.lane_count.get());
        if self.clock.current() <= worker.replay_ts + lane_count {
            self.lanes.set_in_use(lane, false);
            worker.lane = None;
            worker.replay_ts = 0;
        } else {
            worker.replay_ts += lane_count;
            worker.replay_again = true;
            trace!(
                worker = worker.id.0,
                lane,
                next_ts = worker.replay_ts,
                "replay_lane_obligation"
            );
        }
    }

    /// Record a rollback. The timestamp and lane are retained; the worker
    /// retries at the top of its loop.
    pub fn rollback(&self, worker: &mut WorkerReplay) {
        debug_assert!(worker.replay_ts != 0);
        debug_assert!(worker.lane.is_some_and(|lane| self.lanes.in_use(lane)));
        worker.replay_again = true;
    }

    /// Optional back-off after a rollback. The further behind the worker
    /// is, the less it waits: the furthest-behind group does not wait at
    /// all, the back half yields, and the front half occasionally sleeps.
    pub fn pause_after_rollback(&self, worker: &WorkerReplay, ntries: u32) {
        let low = self.maximum_committed();
        let high = self.clock.current();
        let mid = (high + low) / 2;
        let lane_count = u64::from(self.config.lane_count.get());

        if low + lane_count <= worker.replay_ts {
            return;
        }
        if worker.replay_ts < mid && ntries % 10 != 0 {
            std::thread::yield_now();
        } else {
            let millis = u64::from(ntries).min(100);
            std::thread::sleep(Duration::from_millis(millis));
        }
    }

    /// Force a fully random key number into the worker's lane: the key's
    /// low bits are replaced by the lane number, wrapping away from 0 and
    /// `max_rows`.
    pub fn adjust_key(&self, worker: &mut WorkerReplay, max_rows: u64) {
        let Some(lane) = worker.lane else {
            debug_assert!(false, "adjust_key without a lane");
            return;
        };
        let lane_count = u64::from(self.config.lane_count.get());
        let mut keyno = (worker.keyno & !self.config.lane_count.mask()) | u64::from(lane);
        if keyno == 0 {
            keyno = lane_count;
        } else if keyno >= max_rows {
            keyno -= lane_count;
        }
        worker.keyno = keyno;
    }

    /// The largest timestamp that's no longer in use: the clock, bounded by
    /// the smallest non-zero commit stamp over in-use lanes.
    ///
    /// In-use lanes whose commit stamp is still 0 are skipped, so a fresh
    /// run before any commit returns the clock value; a zero result is
    /// clamped to 1.
    ///
    /// The scan is expensive and doesn't need to be fresh every time, so a
    /// cached value is returned except on every 20th call.
    #[must_use]
    pub fn maximum_committed(&self) -> u64 {
        let ts = self.lanes.cached_committed();
        if ts == 0 || self.lanes.bump_scan_counter() % 20 == 0 {
            return self.fresh_committed();
        }
        ts
    }

    fn fresh_committed(&self) -> u64 {
        let mut ts = self.clock.current();
        let _guard = self.lanes.write();
        ts = self.lanes.min_in_use_commit(ts);
        if ts == 0 {
            ts = 1;
        }
        self.lanes.store_cached_committed(ts);
        ts
    }

    /// Compute and push oldest/stable checkpoints once.
    ///
    /// `stable` becomes the largest timestamp no longer in use; `oldest`
    /// trails halfway behind it when lag is allowed. The push happens under
    /// the prepare-commit lock. A `final_push` forces a fresh scan and
    /// bypasses the halfway rule for the last bump of a run.
    ///
    /// Checkpoints never move backwards. The lane scan can briefly dip
    /// below an earlier push when an idle lane is re-picked before its
    /// first commit at the new timestamp; the earlier push stays valid
    /// (commits never un-commit), so the dip is clamped away.
    pub fn advance_once(&self, sink: &dyn CheckpointSink, allow_lag: bool, final_push: bool) {
        let committed = if final_push {
            self.fresh_committed()
        } else {
            self.maximum_committed()
        };
        let oldest_prev = self.clock.oldest();
        let stable = committed.max(self.clock.stable());
        let mut oldest = committed.max(oldest_prev);
        if !final_push && allow_lag {
            oldest -= (oldest - oldest_prev) / 2;
        }

        {
            let _guard = self.prepare_commit_lock.write();
            sink.set_checkpoints(oldest, stable);
        }
        self.clock.set_mirrors(oldest, stable);
        trace!(oldest, stable, "replay_checkpoints_pushed");
    }

    /// Shared guard workers hold across prepare/commit so checkpoint pushes
    /// never interleave with them.
    #[must_use]
    pub fn prepare_commit_read(&self) -> RwLockReadGuard<'_, ()> {
        self.prepare_commit_lock.read()
    }

    /// Cooperative end-of-run flag, observed by the advancer.
    pub fn set_workers_finished(&self) {
        self.workers_finished.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn workers_finished(&self) -> bool {
        self.workers_finished.load(Ordering::Acquire)
    }

    /// Whether a lane is currently held. Observation only.
    #[must_use]
    pub fn lane_in_use(&self, lane: u32) -> bool {
        self.lanes.in_use(lane)
    }

    /// A lane's last commit stamp. Observation only.
    #[must_use]
    pub fn lane_last_commit(&self, lane: u32) -> u64 {
        self.lanes.last_commit(lane)
    }

    /// Number of lanes currently held. Observation only.
    #[must_use]
    pub fn lanes_in_use(&self) -> u32 {
        self.lanes.in_use_count()
    }

    fn integrity(&self, worker: &WorkerReplay, detail: &str) -> SiltError {
        debug_assert!(false, "worker {}: {detail}", worker.id.0);
        SiltError::ReplayIntegrity {
            detail: format!("worker {}: {detail}", worker.id.0),
        }
    }
}
