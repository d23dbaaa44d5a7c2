/*!
 * Fixed-size connection pool
 *
 * Ten slots, each independently lockable, each tracking its own
 * connection state and recovery backoff. Acquire blocks on a condvar
 * for up to one second before giving up; release never blocks. Slots
 * are identified by their stable array index rather than by any
 * pointer or handle identity, so a caller can hold an index across a
 * recovery cycle that replaces the underlying driver connection.
 */

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::{
    CONNECTION_DEAD_THRESHOLD, MAX_BACKOFF_ATTEMPTS, MAX_RECOVERY_ATTEMPTS, POOL_SIZE,
    RECOVERY_BACKOFF_BASE_MS,
};
use crate::driver::{ConnStatus, DbDriver, DriverFactory};
use crate::log_event;
use crate::stats::StatsLedger;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Available,
    InUse,
    Dead,
    PermanentFailure,
}

struct SlotInner {
    state: ConnectionState,
    driver: Option<Box<dyn DbDriver>>,
    consecutive_errors: u32,
    recovery_attempts: u32,
    last_recovery_attempt: Option<Instant>,
    last_error: Option<String>,
}

struct PoolSlot {
    index: usize,
    inner: Mutex<SlotInner>,
}

/// Fixed array of [`POOL_SIZE`] connection slots shared by the workers.
pub struct ConnectionPool {
    slots: Vec<PoolSlot>,
    factory: Arc<dyn DriverFactory>,
    conn_string: String,
    require_ssl: bool,
    /// Signaled whenever a slot transitions into `Available`, so a
    /// blocked `acquire` can re-scan without polling.
    available_cv: Condvar,
    available_gate: Mutex<()>,
    healthy_count: AtomicUsize,
    shutdown: AtomicU32,
}

/// An acquired slot. Dropping it without calling [`ConnectionPool::release`]
/// still releases the slot back as `InUse` forever is not an option the
/// type system prevents directly, so callers are expected to always
/// route through `release`; this is documented, not enforced by a guard
/// type, matching how the reference design treats `acquire`/`release`
/// as a plain index handed back to the caller.
pub type SlotIndex = usize;

impl ConnectionPool {
    /// Open all ten slots in parallel, joining before returning. Returns
    /// an error only if every connection attempt fails; a partially
    /// healthy pool is allowed to start, matching the rule that the
    /// system degrades rather than refuses to start on partial outage.
    pub fn open(
        conn_string: &str,
        require_ssl: bool,
        factory: Arc<dyn DriverFactory>,
    ) -> crate::error::Result<Self> {
        let pool = Self {
            slots: (0..POOL_SIZE)
                .map(|index| PoolSlot {
                    index,
                    inner: Mutex::new(SlotInner {
                        state: ConnectionState::Dead,
                        driver: None,
                        consecutive_errors: 0,
                        recovery_attempts: 0,
                        last_recovery_attempt: None,
                        last_error: None,
                    }),
                })
                .collect(),
            factory,
            conn_string: conn_string.to_string(),
            require_ssl,
            available_cv: Condvar::new(),
            available_gate: Mutex::new(()),
            healthy_count: AtomicUsize::new(0),
            shutdown: AtomicU32::new(0),
        };

        let handles: Vec<_> = (0..POOL_SIZE)
            .map(|i| {
                let conn_string = pool.conn_string.clone();
                let factory = pool.factory.clone();
                std::thread::spawn(move || (i, factory.connect(&conn_string)))
            })
            .collect();

        for handle in handles {
            let (i, result) = handle.join().expect("connection open thread panicked");
            let slot = &pool.slots[i];
            let mut inner = slot.inner.lock().unwrap_or_else(|p| p.into_inner());
            match result {
                Ok(driver) => {
                    if require_ssl && !driver.ssl_in_use() {
                        log_event!(
                            crate::events::Level::Error,
                            "slot {i}: SSL required but connection is not using it"
                        );
                        inner.state = ConnectionState::PermanentFailure;
                        inner.last_error = Some("SSL required but not in use".to_string());
                    } else {
                        inner.driver = Some(driver);
                        inner.state = ConnectionState::Available;
                        pool.healthy_count.fetch_add(1, Ordering::SeqCst);
                    }
                }
                Err(e) => {
                    log_event!(crate::events::Level::Warn, "slot {i}: initial connect failed: {e}");
                    inner.state = ConnectionState::Dead;
                    inner.last_error = Some(truncate_error(&e));
                }
            }
        }

        if pool.healthy_count.load(Ordering::SeqCst) == 0 {
            return Err(crate::error::HydrantError::NoHealthyConnections);
        }

        Ok(pool)
    }

    pub fn healthy_connections(&self) -> usize {
        self.healthy_count.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Scan slots in fixed order for one that is `Available`, mark it
    /// `InUse`, and return its index. Blocks on the availability condvar
    /// up to one second if none are free, then gives up and returns
    /// `None` so the caller can retry or report backpressure.
    pub fn acquire(&self) -> Option<SlotIndex> {
        let deadline = Instant::now() + ACQUIRE_TIMEOUT;
        loop {
            if let Some(index) = self.try_acquire_once() {
                return Some(index);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let gate = self.available_gate.lock().unwrap_or_else(|p| p.into_inner());
            let (_gate, _timeout) = self
                .available_cv
                .wait_timeout(gate, deadline - now)
                .unwrap_or_else(|p| p.into_inner());
        }
    }

    fn try_acquire_once(&self) -> Option<SlotIndex> {
        for slot in &self.slots {
            let mut inner = slot.inner.lock().unwrap_or_else(|p| p.into_inner());
            if inner.state == ConnectionState::Available {
                inner.state = ConnectionState::InUse;
                return Some(slot.index);
            }
        }
        None
    }

    /// Return a slot acquired via [`acquire`]. `had_error` marks whether
    /// the caller's use of the connection failed; repeated errors push
    /// the slot toward `Dead` once `CONNECTION_DEAD_THRESHOLD` is hit.
    pub fn release(&self, index: SlotIndex, had_error: bool, error_msg: Option<&str>) {
        let slot = &self.slots[index];
        let mut inner = slot.inner.lock().unwrap_or_else(|p| p.into_inner());
        if had_error {
            inner.consecutive_errors += 1;
            inner.last_error = error_msg.map(truncate_error_str);
            if inner.consecutive_errors >= CONNECTION_DEAD_THRESHOLD {
                inner.state = ConnectionState::Dead;
                self.healthy_count.fetch_sub(1, Ordering::SeqCst);
                log_event!(
                    crate::events::Level::Warn,
                    "slot {index}: marked dead after {} consecutive errors",
                    inner.consecutive_errors
                );
                return;
            }
        } else {
            inner.consecutive_errors = 0;
        }
        inner.state = ConnectionState::Available;
        drop(inner);
        self.notify_available();
    }

    /// Unconditionally mark a slot dead, e.g. on a hard protocol error
    /// mid-COPY. Idempotent: calling it on an already-dead or
    /// permanently-failed slot is a no-op beyond updating `last_error`.
    /// Emits a WARN event on every transition into `Dead`.
    pub fn mark_dead(&self, index: SlotIndex, error: &str) {
        let slot = &self.slots[index];
        let mut inner = slot.inner.lock().unwrap_or_else(|p| p.into_inner());
        let was_healthy = matches!(
            inner.state,
            ConnectionState::Available | ConnectionState::InUse
        );
        inner.last_error = Some(truncate_error_str(error));
        if inner.state == ConnectionState::PermanentFailure {
            return;
        }
        inner.state = ConnectionState::Dead;
        if was_healthy {
            self.healthy_count.fetch_sub(1, Ordering::SeqCst);
        }
        drop(inner);
        log_event!(crate::events::Level::Warn, "slot {index}: marked dead: {error}");
    }

    /// Run one recovery attempt against a `Dead` slot. Gated by an
    /// exponential backoff computed from `recovery_attempts`; returns
    /// `false` without contacting the driver if the backoff window has
    /// not elapsed yet. After `MAX_RECOVERY_ATTEMPTS` failed attempts the
    /// slot is quarantined into `PermanentFailure` and no longer
    /// retried. `stats` is updated with a connection reset on success or
    /// a connection failure on a failed attempt; it is only touched
    /// after the slot's own lock is released, preserving the documented
    /// stats-before-pool lock order (this call never holds both).
    pub fn recover(&self, index: SlotIndex, stats: &StatsLedger) -> bool {
        {
            let inner = self.slots[index].inner.lock().unwrap_or_else(|p| p.into_inner());
            if inner.state != ConnectionState::Dead {
                return false;
            }
            if let Some(last) = inner.last_recovery_attempt {
                let backoff = backoff_for(inner.recovery_attempts);
                if last.elapsed() < backoff {
                    return false;
                }
            }
        }

        let result = self.factory.connect(&self.conn_string);

        let slot = &self.slots[index];
        let mut inner = slot.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.last_recovery_attempt = Some(Instant::now());

        match result {
            Ok(driver) => {
                if self.require_ssl && !driver.ssl_in_use() {
                    inner.last_error = Some("SSL required but not in use".to_string());
                    self.quarantine_or_retry(&mut inner, index);
                    drop(inner);
                    stats.record_connection_failure();
                    return false;
                }
                let mut driver = driver;
                if let Err(e) = driver.prepare_copy_stmt() {
                    inner.last_error = Some(truncate_error_str(&e));
                    self.quarantine_or_retry(&mut inner, index);
                    drop(inner);
                    stats.record_connection_failure();
                    return false;
                }
                inner.driver = Some(driver);
                inner.state = ConnectionState::Available;
                inner.consecutive_errors = 0;
                inner.recovery_attempts = 0;
                self.healthy_count.fetch_add(1, Ordering::SeqCst);
                drop(inner);
                log_event!(crate::events::Level::Info, "slot {index}: recovered");
                self.notify_available();
                stats.record_connection_reset();
                true
            }
            Err(e) => {
                inner.last_error = Some(truncate_error(&e));
                self.quarantine_or_retry(&mut inner, index);
                drop(inner);
                stats.record_connection_failure();
                false
            }
        }
    }

    fn quarantine_or_retry(&self, inner: &mut MutexGuard<'_, SlotInner>, index: SlotIndex) {
        inner.recovery_attempts += 1;
        if inner.recovery_attempts >= MAX_RECOVERY_ATTEMPTS {
            inner.state = ConnectionState::PermanentFailure;
            log_event!(
                crate::events::Level::Error,
                "slot {index}: permanently failed after {} recovery attempts",
                inner.recovery_attempts
            );
        }
    }

    /// Run a closure against the driver held by an `InUse` slot. Panics
    /// if the slot is not currently `InUse` with a live driver, which
    /// would indicate a caller bug (using an index it never acquired).
    pub fn with_driver<R>(&self, index: SlotIndex, f: impl FnOnce(&mut dyn DbDriver) -> R) -> R {
        let slot = &self.slots[index];
        let mut inner = slot.inner.lock().unwrap_or_else(|p| p.into_inner());
        assert_eq!(inner.state, ConnectionState::InUse, "slot not held by caller");
        let driver = inner
            .driver
            .as_deref_mut()
            .expect("InUse slot must hold a driver");
        f(driver)
    }

    pub fn driver_status(&self, index: SlotIndex) -> Option<ConnStatus> {
        let inner = self.slots[index].inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.driver.as_ref().map(|d| d.status())
    }

    pub fn state_counts(&self) -> PoolStateCounts {
        let mut counts = PoolStateCounts::default();
        for slot in &self.slots {
            let inner = slot.inner.lock().unwrap_or_else(|p| p.into_inner());
            match inner.state {
                ConnectionState::Available => counts.available += 1,
                ConnectionState::InUse => counts.in_use += 1,
                ConnectionState::Dead => counts.dead += 1,
                ConnectionState::PermanentFailure => counts.permanent_failure += 1,
            }
        }
        counts
    }

    /// Attempt recovery on every `Dead` slot once. Called periodically
    /// by the supervisor loop.
    pub fn recover_dead_slots(&self, stats: &StatsLedger) {
        for i in 0..self.slots.len() {
            self.recover(i, stats);
        }
    }

    /// Close every driver handle. Called once during shutdown; slots
    /// are left `Dead` afterward since the pool itself is going away.
    pub fn close_all(&self) {
        self.shutdown.store(1, Ordering::SeqCst);
        for slot in &self.slots {
            let mut inner = slot.inner.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(driver) = inner.driver.as_mut() {
                driver.finish();
            }
            inner.driver = None;
            inner.state = ConnectionState::Dead;
        }
        self.notify_available();
    }

    fn notify_available(&self) {
        let _gate = self.available_gate.lock().unwrap_or_else(|p| p.into_inner());
        self.available_cv.notify_all();
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStateCounts {
    pub available: usize,
    pub in_use: usize,
    pub dead: usize,
    pub permanent_failure: usize,
}

fn backoff_for(recovery_attempts: u32) -> Duration {
    let shift = recovery_attempts.min(MAX_BACKOFF_ATTEMPTS);
    Duration::from_millis(RECOVERY_BACKOFF_BASE_MS << shift)
}

fn truncate_error(e: &str) -> String {
    truncate_error_str(e)
}

fn truncate_error_str(e: &str) -> String {
    const MAX: usize = crate::config::MAX_ERROR_LENGTH;
    if e.len() <= MAX {
        e.to_string()
    } else {
        let mut truncated = e.chars().take(MAX).collect::<String>();
        truncated.push('…');
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::{FakeDriver, FakeDriverFactory};

    fn factory_ok() -> Arc<dyn DriverFactory> {
        Arc::new(FakeDriverFactory::new(FakeDriver::default))
    }

    #[test]
    fn opens_all_slots_healthy() {
        let pool = ConnectionPool::open("postgres://x", false, factory_ok()).unwrap();
        assert_eq!(pool.healthy_connections(), POOL_SIZE);
    }

    #[test]
    fn acquire_and_release_round_trip() {
        let pool = ConnectionPool::open("postgres://x", false, factory_ok()).unwrap();
        let idx = pool.acquire().expect("should acquire immediately");
        pool.release(idx, false, None);
        assert_eq!(pool.state_counts().available, POOL_SIZE);
    }

    #[test]
    fn repeated_errors_mark_slot_dead() {
        let pool = ConnectionPool::open("postgres://x", false, factory_ok()).unwrap();
        let idx = pool.acquire().unwrap();
        for _ in 0..CONNECTION_DEAD_THRESHOLD {
            pool.release(idx, true, Some("boom"));
            if pool.state_counts().dead == 1 {
                break;
            }
            let reacquired = pool.try_acquire_once();
            if let Some(i) = reacquired {
                assert_eq!(i, idx);
            }
        }
        assert_eq!(pool.state_counts().dead, 1);
        assert_eq!(pool.healthy_connections(), POOL_SIZE - 1);
    }

    #[test]
    fn recovery_exhausts_into_permanent_failure() {
        let factory = Arc::new(FakeDriverFactory::new(FakeDriver::default));
        factory.fail_connect.store(true, Ordering::SeqCst);
        let good_factory: Arc<dyn DriverFactory> = Arc::new(FakeDriverFactory::new(FakeDriver::default));
        let pool = ConnectionPool::open("postgres://x", false, good_factory).unwrap();
        pool.mark_dead(0, "simulated failure");

        // Swap in a factory that always fails so recovery exhausts.
        let pool = ConnectionPool {
            factory: factory.clone(),
            ..pool
        };
        let stats = StatsLedger::new();
        for _ in 0..MAX_RECOVERY_ATTEMPTS {
            pool.recover(0, &stats);
            // backoff gates immediate re-attempts; force the clock by
            // resetting last_recovery_attempt directly through another
            // mark_dead, which does not reset recovery_attempts.
            let inner_state = pool.slots[0].inner.lock().unwrap();
            if inner_state.state == ConnectionState::PermanentFailure {
                break;
            }
            drop(inner_state);
            let mut inner = pool.slots[0].inner.lock().unwrap();
            inner.last_recovery_attempt = None;
        }
        assert_eq!(pool.state_counts().permanent_failure, 1);
    }

    #[test]
    fn successful_recovery_records_a_connection_reset() {
        let factory: Arc<dyn DriverFactory> = Arc::new(FakeDriverFactory::new(FakeDriver::default));
        let pool = ConnectionPool::open("postgres://x", false, factory).unwrap();
        pool.mark_dead(0, "simulated blip");

        let stats = StatsLedger::new();
        assert!(pool.recover(0, &stats));
        let snapshot = stats.status_snapshot(PoolStateCounts::default(), 0);
        assert_eq!(snapshot.connection_resets, 1);
        assert_eq!(snapshot.connection_failures, 0);
    }
}
