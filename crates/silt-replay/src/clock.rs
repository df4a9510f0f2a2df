//! The global logical clock and the checkpoint barrier it pushes through.

use silt_error::{Result, SiltError};
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-side barrier for oldest/stable checkpoint pushes.
///
/// The advancer serializes calls against worker prepare/commit via the
/// scheduler's prepare-commit lock; implementations only need to apply the
/// pair.
pub trait CheckpointSink: Send + Sync {
    fn set_checkpoints(&self, oldest: u64, stable: u64);
}

/// Globally monotonic 64-bit logical clock.
///
/// The clock may only be advanced by timestamp picking; a shadow copy is
/// maintained there, and a divergence between the two means some other code
/// path incremented the clock and the run's integrity is gone.
#[derive(Debug)]
pub struct GlobalClock {
    timestamp: AtomicU64,
    shadow: AtomicU64,
    oldest: AtomicU64,
    stable: AtomicU64,
}

impl GlobalClock {
    #[must_use]
    pub(crate) fn new(start: u64) -> Self {
        Self {
            timestamp: AtomicU64::new(start),
            shadow: AtomicU64::new(start),
            oldest: AtomicU64::new(0),
            stable: AtomicU64::new(0),
        }
    }

    /// Read the current timestamp with acquire ordering.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    /// Advance the clock, returning the new timestamp.
    ///
    /// Must be called with the lane-table write lock held; the lock is what
    /// makes the shadow comparison meaningful.
    pub(crate) fn next(&self) -> Result<u64> {
        let now = self.timestamp.load(Ordering::Relaxed);
        let shadow = self.shadow.load(Ordering::Relaxed);
        if now != shadow {
            debug_assert_eq!(now, shadow, "timestamp advanced outside pick-timestamp");
            return Err(SiltError::ReplayIntegrity {
                detail: format!(
                    "timestamp advanced outside pick-timestamp: clock {now}, shadow {shadow}"
                ),
            });
        }
        let ts = self.timestamp.fetch_add(1, Ordering::AcqRel) + 1;
        self.shadow.store(ts, Ordering::Relaxed);
        Ok(ts)
    }

    /// Re-align the shadow with the clock. Used by run begin/end when no
    /// workers are active.
    pub(crate) fn sync_shadow(&self) -> u64 {
        let ts = self.timestamp.load(Ordering::Acquire);
        self.shadow.store(ts, Ordering::Relaxed);
        ts
    }

    /// Mirror of the last oldest checkpoint pushed to the engine.
    #[must_use]
    pub fn oldest(&self) -> u64 {
        self.oldest.load(Ordering::Acquire)
    }

    /// Mirror of the last stable checkpoint pushed to the engine.
    #[must_use]
    pub fn stable(&self) -> u64 {
        self.stable.load(Ordering::Acquire)
    }

    pub(crate) fn set_mirrors(&self, oldest: u64, stable: u64) {
        self.oldest.store(oldest, Ordering::Release);
        self.stable.store(stable, Ordering::Release);
    }
}
