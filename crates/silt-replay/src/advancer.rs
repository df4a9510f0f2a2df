//! Background stable-timestamp advancer.

use crate::{CheckpointSink, ReplayScheduler};
use silt_error::{Result, SiltError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

/// How often the advancer recomputes and pushes checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdvancerConfig {
    pub interval: Duration,
}

impl AdvancerConfig {
    /// Cadence for ordinary runs: oldest and stable move at least once
    /// every 15 seconds.
    #[must_use]
    pub fn periodic() -> Self {
        Self {
            interval: Duration::from_secs(15),
        }
    }

    /// Cadence for predictable replay: operations blocked on a dependency
    /// keep failing until stable advances, so it must move multiple times
    /// per second.
    #[must_use]
    pub fn predictable_replay() -> Self {
        Self {
            interval: Duration::from_millis(100),
        }
    }
}

impl Default for AdvancerConfig {
    fn default() -> Self {
        Self::periodic()
    }
}

/// Handle for the running advancer thread.
///
/// The thread pushes checkpoints with lag allowed until the workers finish,
/// then performs one final lag-free push so late operations cannot hold
/// verification back.
#[derive(Debug)]
pub struct StableTsDaemon {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl StableTsDaemon {
    pub fn spawn(
        scheduler: Arc<ReplayScheduler>,
        sink: Arc<dyn CheckpointSink>,
        config: AdvancerConfig,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let join = std::thread::Builder::new()
            .name("silt-ts-advancer".to_owned())
            .spawn(move || {
                info!(interval_ms = config.interval.as_millis() as u64, "advancer_started");
                // Sleep in slices so shutdown is prompt even with the long
                // periodic cadence.
                let slice = config.interval.min(Duration::from_millis(10));
                let mut slept = Duration::ZERO;
                loop {
                    if thread_stop.load(Ordering::Acquire) || scheduler.workers_finished() {
                        break;
                    }
                    std::thread::sleep(slice);
                    slept += slice;
                    if slept >= config.interval {
                        slept = Duration::ZERO;
                        scheduler.advance_once(sink.as_ref(), true, false);
                    }
                }
                scheduler.advance_once(sink.as_ref(), false, true);
                debug!(
                    oldest = scheduler.clock().oldest(),
                    stable = scheduler.clock().stable(),
                    "advancer_stopped"
                );
            })
            .map_err(SiltError::Io)?;
        Ok(Self {
            stop,
            join: Some(join),
        })
    }

    /// Request shutdown and block until the final push has happened.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for StableTsDaemon {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
