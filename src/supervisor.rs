/*!
 * Background worker threads
 *
 * Each worker runs a fixed one-second audit loop: attempt recovery on
 * dead slots, emit a throttled heartbeat, and warn when the pool is
 * more than half unhealthy. Workers wake immediately on shutdown via
 * the same condvar the pool signals on recovery, rather than waiting
 * out their own sleep.
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::POOL_SIZE;
use crate::log_event;
use crate::pool::ConnectionPool;
use crate::stats::StatsLedger;

const AUDIT_INTERVAL: Duration = Duration::from_secs(1);

/// Shared shutdown signal workers block on between audit ticks.
pub struct ShutdownSignal {
    flag: AtomicBool,
    gate: Mutex<()>,
    cv: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            gate: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _gate = self.gate.lock().unwrap_or_else(|p| p.into_inner());
        self.cv.notify_all();
    }

    /// Sleep up to `dur`, waking immediately if shutdown is triggered.
    fn wait(&self, dur: Duration) {
        if self.is_set() {
            return;
        }
        let gate = self.gate.lock().unwrap_or_else(|p| p.into_inner());
        let _ = self.cv.wait_timeout(gate, dur);
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn `count` supervisor workers sharing the same pool and stats.
/// `heartbeat_interval` throttles the periodic `INFO` line so a busy
/// pool with many workers does not flood the event sink.
pub fn spawn_workers(
    count: usize,
    pool: Arc<ConnectionPool>,
    stats: Arc<StatsLedger>,
    shutdown: Arc<ShutdownSignal>,
    heartbeat_interval: Duration,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker_id| {
            let pool = pool.clone();
            let stats = stats.clone();
            let shutdown = shutdown.clone();
            std::thread::spawn(move || worker_loop(worker_id, pool, stats, shutdown, heartbeat_interval))
        })
        .collect()
}

fn worker_loop(
    worker_id: usize,
    pool: Arc<ConnectionPool>,
    stats: Arc<StatsLedger>,
    shutdown: Arc<ShutdownSignal>,
    heartbeat_interval: Duration,
) {
    log_event!(crate::events::Level::Info, "worker {worker_id}: started");

    while !shutdown.is_set() {
        pool.recover_dead_slots(&stats);

        let counts = pool.state_counts();
        if counts.dead + counts.permanent_failure > 0 && counts.available < POOL_SIZE / 2 {
            log_event!(
                crate::events::Level::Warn,
                "worker {worker_id}: pool degraded, available={} dead={} permanent_failure={}",
                counts.available,
                counts.dead,
                counts.permanent_failure
            );
        }

        if let Some(since) = stats.seconds_since_last_batch() {
            if since >= heartbeat_interval.as_secs_f64() {
                log_event!(
                    crate::events::Level::Info,
                    "worker {worker_id}: heartbeat, {:.0}s since last batch",
                    since
                );
            }
        }

        shutdown.wait(AUDIT_INTERVAL);
    }

    log_event!(crate::events::Level::Info, "worker {worker_id}: exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::{FakeDriver, FakeDriverFactory};
    use std::sync::Arc as StdArc;

    #[test]
    fn worker_exits_promptly_on_shutdown() {
        let factory: StdArc<dyn crate::driver::DriverFactory> =
            StdArc::new(FakeDriverFactory::new(FakeDriver::default));
        let pool = StdArc::new(ConnectionPool::open("postgres://x", false, factory).unwrap());
        let stats = StdArc::new(StatsLedger::new());
        let shutdown = StdArc::new(ShutdownSignal::new());

        let handles = spawn_workers(1, pool, stats, shutdown.clone(), Duration::from_secs(60));
        shutdown.trigger();
        for h in handles {
            h.join().expect("worker should exit without panicking");
        }
    }
}
