#![forbid(unsafe_code)]
//! Worker harness for the predictable-replay scheduler.
//!
//! Drives a pool of worker threads through the scheduler against a toy
//! multi-table store: each iteration performs exactly one operation whose
//! content (operation kind, table, key, value) is a pure function of the
//! operation's timestamp and the data seed. Rollbacks are injected from the
//! extra RNG (a non-data decision), so retry paths are exercised without
//! perturbing what gets written.
//!
//! A run produces a [`RunReport`]: the commit trace in timestamp order plus
//! digests for run-to-run comparison. Two runs with the same
//! [`WorkloadConfig`] must agree on every commit at or before the stop
//! timestamp and on the replayed state digest.

use anyhow::{bail, Context};
use parking_lot::Mutex;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use silt_replay::{
    AdvancerConfig, CheckpointSink, ReplayConfig, ReplayScheduler, StableTsDaemon, WorkerReplay,
};
use silt_types::WorkerId;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use xxhash_rust::xxh64::xxh64;

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// One row: the value and the timestamp that committed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub value: Vec<u8>,
    pub commit_ts: u64,
}

/// A toy multi-table store standing in for the engine under test.
///
/// Per-table locks are all the isolation the harness needs: the lane
/// construction guarantees no two concurrent operations share a key, and a
/// single key's operations arrive in increasing timestamp order.
#[derive(Debug)]
pub struct TableStore {
    tables: Vec<Mutex<BTreeMap<u64, Row>>>,
}

impl TableStore {
    #[must_use]
    pub fn new(table_count: usize) -> Self {
        Self {
            tables: (0..table_count).map(|_| Mutex::new(BTreeMap::new())).collect(),
        }
    }

    fn apply(&self, record: &CommitRecord) {
        let mut table = self.tables[record.table].lock();
        match record.kind {
            OpKind::Upsert => {
                table.insert(
                    record.keyno,
                    Row {
                        value: record.value.clone(),
                        commit_ts: record.ts,
                    },
                );
            }
            OpKind::Remove => {
                table.remove(&record.keyno);
            }
        }
    }

    /// Fold every table's sorted contents through a 64-bit hash.
    #[must_use]
    pub fn digest(&self) -> u64 {
        let mut acc = 0_u64;
        for (index, table) in self.tables.iter().enumerate() {
            let table = table.lock();
            for (keyno, row) in table.iter() {
                let mut buf = Vec::with_capacity(24 + row.value.len());
                buf.extend_from_slice(&(index as u64).to_le_bytes());
                buf.extend_from_slice(&keyno.to_le_bytes());
                buf.extend_from_slice(&row.commit_ts.to_le_bytes());
                buf.extend_from_slice(&row.value);
                acc = xxh64(&buf, acc);
            }
        }
        acc
    }
}

// ---------------------------------------------------------------------------
// Operations and traces
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    Upsert,
    Remove,
}

/// One committed operation, recorded for replay comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub ts: u64,
    pub kind: OpKind,
    pub table: usize,
    pub keyno: u64,
    pub value: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Everything a run depends on. Two runs with equal configs replay
/// identically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub replay: ReplayConfig,
    pub workers: u32,
    pub tables: usize,
    pub max_rows: u64,
    /// Inject a rollback on the first attempt at a timestamp with odds
    /// 1-in-N (0 disables injection). Drawn from the extra RNG.
    pub rollback_one_in: u32,
}

impl WorkloadConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            bail!("workload needs at least one worker");
        }
        if self.tables == 0 {
            bail!("workload needs at least one table");
        }
        if self.replay.stop_timestamp.is_none() {
            bail!("workload runs need a stop timestamp");
        }
        let lane_count = u64::from(self.replay.lane_count.get());
        if self.max_rows <= 2 * lane_count {
            bail!("max_rows must comfortably exceed twice the lane count");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Checkpoint sink
// ---------------------------------------------------------------------------

/// Records the engine-side oldest/stable checkpoint pair.
#[derive(Debug, Default)]
pub struct EngineCheckpoints {
    oldest: AtomicU64,
    stable: AtomicU64,
}

impl EngineCheckpoints {
    #[must_use]
    pub fn oldest(&self) -> u64 {
        self.oldest.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stable(&self) -> u64 {
        self.stable.load(Ordering::Acquire)
    }
}

impl CheckpointSink for EngineCheckpoints {
    fn set_checkpoints(&self, oldest: u64, stable: u64) {
        self.oldest.store(oldest, Ordering::Release);
        self.stable.store(stable, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Runs and reports
// ---------------------------------------------------------------------------

/// Outcome of one workload run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Every committed operation, sorted by timestamp.
    pub trace: Vec<CommitRecord>,
    /// Digest of the live store at the end of the run (includes commits
    /// past the stop timestamp).
    pub final_digest: u64,
    pub stop_timestamp: u64,
    pub final_oldest: u64,
    pub final_stable: u64,
}

impl RunReport {
    /// The trace restricted to commits at or before `stop`.
    #[must_use]
    pub fn trace_until(&self, stop: u64) -> Vec<&CommitRecord> {
        self.trace.iter().filter(|r| r.ts <= stop).collect()
    }

    /// Digest of the state reached by replaying the `ts <= stop` prefix of
    /// the trace into fresh tables. This is the run-to-run comparison
    /// point: overruns past the stop timestamp are excluded.
    #[must_use]
    pub fn replayed_digest(&self, stop: u64, tables: usize) -> u64 {
        let store = TableStore::new(tables);
        for record in self.trace.iter().filter(|r| r.ts <= stop) {
            store.apply(record);
        }
        store.digest()
    }
}

/// Run a workload to its stop timestamp and report the commit trace.
pub fn run_workload(config: &WorkloadConfig) -> anyhow::Result<RunReport> {
    config.validate()?;
    let stop = config
        .replay
        .stop_timestamp
        .context("validated config has a stop timestamp")?;

    let scheduler = Arc::new(ReplayScheduler::new(config.replay)?);
    let store = Arc::new(TableStore::new(config.tables));
    let trace = Arc::new(Mutex::new(Vec::new()));
    let checkpoints = Arc::new(EngineCheckpoints::default());

    scheduler.run_begin();
    let daemon = StableTsDaemon::spawn(
        Arc::clone(&scheduler),
        Arc::clone(&checkpoints) as Arc<dyn CheckpointSink>,
        AdvancerConfig::predictable_replay(),
    )?;

    info!(
        workers = config.workers,
        stop_timestamp = stop,
        lane_count = config.replay.lane_count.get(),
        "workload_started"
    );

    let mut handles = Vec::with_capacity(config.workers as usize);
    for w in 0..config.workers {
        let scheduler = Arc::clone(&scheduler);
        let store = Arc::clone(&store);
        let trace = Arc::clone(&trace);
        let config = config.clone();
        let handle = std::thread::Builder::new()
            .name(format!("silt-worker-{w}"))
            .spawn(move || worker_loop(&scheduler, &store, &trace, &config, WorkerId(w)))
            .with_context(|| format!("spawn worker {w}"))?;
        handles.push(handle);
    }

    let mut failure = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => failure = Some(err),
            Err(_) => bail!("worker thread panicked"),
        }
    }
    scheduler.set_workers_finished();
    daemon.shutdown();
    scheduler.run_end();
    if let Some(err) = failure {
        return Err(err);
    }

    let mut trace = Arc::try_unwrap(trace)
        .map_err(|_| anyhow::anyhow!("trace still shared after join"))?
        .into_inner();
    trace.sort_by_key(|record: &CommitRecord| record.ts);

    debug!(
        commits = trace.len(),
        final_stable = checkpoints.stable(),
        "workload_finished"
    );

    Ok(RunReport {
        final_digest: store.digest(),
        trace,
        stop_timestamp: stop,
        final_oldest: checkpoints.oldest(),
        final_stable: checkpoints.stable(),
    })
}

/// One worker's operation loop: pick a timestamp, derive the operation from
/// the data RNG, commit it, or take an injected rollback and retry the
/// same timestamp.
fn worker_loop(
    scheduler: &ReplayScheduler,
    store: &TableStore,
    trace: &Mutex<Vec<CommitRecord>>,
    config: &WorkloadConfig,
    id: WorkerId,
) -> anyhow::Result<()> {
    let mut worker = WorkerReplay::new(id);
    let mut ntries = 0_u32;

    loop {
        scheduler.loop_begin(&mut worker, false)?;
        if worker.quit() {
            break;
        }

        // Data decisions: everything that ends up in the store.
        let table = worker.data_rng.gen_range(0..config.tables);
        worker.keyno = worker.data_rng.gen_range(1..config.max_rows);
        scheduler.adjust_key(&mut worker, config.max_rows);
        let kind = if worker.data_rng.gen_range(0..10_u32) == 9 {
            OpKind::Remove
        } else {
            OpKind::Upsert
        };
        let mut value = vec![0_u8; worker.data_rng.gen_range(8..=32)];
        worker.data_rng.fill_bytes(&mut value);

        // Non-data decision: inject a rollback on the first attempt.
        if config.rollback_one_in > 0
            && ntries == 0
            && worker.extra_rng.gen_ratio(1, config.rollback_one_in)
        {
            ntries += 1;
            scheduler.rollback(&mut worker);
            scheduler.pause_after_rollback(&worker, ntries);
            continue;
        }

        let read_ts = scheduler.read_ts(&worker);
        let record = {
            let _guard = scheduler.prepare_commit_read();
            let prepare_ts = scheduler.prepare_ts(&worker);
            let commit_ts = scheduler.commit_ts(&worker);
            debug_assert!(read_ts < commit_ts);
            debug_assert!(prepare_ts != 0 && prepare_ts <= commit_ts);
            let record = CommitRecord {
                ts: commit_ts,
                kind,
                table,
                keyno: worker.keyno,
                value,
            };
            store.apply(&record);
            record
        };
        scheduler.committed(&mut worker);
        trace.lock().push(record);
        ntries = 0;
    }

    debug_assert_eq!(worker.replay_ts(), 0, "quit always leaves the lane clean");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_types::LaneCount;

    fn config(stop: u64, workers: u32) -> WorkloadConfig {
        WorkloadConfig {
            replay: ReplayConfig {
                lane_count: LaneCount::new(16).expect("lanes"),
                data_seed: 0x1234,
                extra_seed: 0x5678,
                stop_timestamp: Some(stop),
                start_timestamp: 5,
            },
            workers,
            tables: 3,
            max_rows: 1_000,
            rollback_one_in: 8,
        }
    }

    #[test]
    fn run_commits_every_timestamp_up_to_stop() {
        let cfg = config(200, 2);
        let report = run_workload(&cfg).expect("run");

        assert!(report.final_stable >= 200);
        let prefix = report.trace_until(200);
        // Every timestamp in (start, stop] commits exactly once.
        let expected: Vec<u64> = (6..=200).collect();
        let got: Vec<u64> = prefix.iter().map(|r| r.ts).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn keys_stay_in_their_lanes() {
        let cfg = config(150, 2);
        let report = run_workload(&cfg).expect("run");
        let mask = u64::from(cfg.replay.lane_count.get()) - 1;
        for record in &report.trace {
            let lane = record.ts & mask;
            // Keys wrap away from 0 and max_rows but never change lane.
            assert_eq!(
                record.keyno & mask,
                lane,
                "key {} committed at ts {} escaped its lane",
                record.keyno,
                record.ts
            );
        }
    }

    #[test]
    fn store_digest_tracks_trace_replay() {
        let cfg = config(120, 1);
        let report = run_workload(&cfg).expect("run");
        // Replaying the full trace reproduces the live store exactly.
        let full = report
            .trace
            .last()
            .map(|r| r.ts)
            .expect("nonempty trace");
        assert_eq!(report.replayed_digest(full, cfg.tables), report.final_digest);
    }
}
