/*!
 * Running counters and the status snapshot document
 *
 * All counters live behind a single mutex; the ring buffer of recent
 * batch outcomes is bounded at [`crate::config::BATCH_STATS_RING_LEN`]
 * entries so memory use does not grow with uptime. Lock order relative
 * to the pool is documented as stats-then-pool: code that needs both
 * locks always acquires the stats lock first.
 */

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::config::BATCH_STATS_RING_LEN;
use crate::pool::PoolStateCounts;

#[derive(Debug, Clone, Copy)]
struct BatchRecord {
    processed: usize,
    failed: usize,
    at: Instant,
}

struct StatsInner {
    total_bytes: u64,
    batches_processed: u64,
    copy_operations: u64,
    failed_bytes: u64,
    failed_batches: u64,
    connection_resets: u64,
    connection_failures: u64,
    avg_batch_time_ms: f64,
    start_time: Instant,
    last_batch: Option<Instant>,
    ring: VecDeque<BatchRecord>,
}

pub struct StatsLedger {
    inner: Mutex<StatsInner>,
}

impl StatsLedger {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsInner {
                total_bytes: 0,
                batches_processed: 0,
                copy_operations: 0,
                failed_bytes: 0,
                failed_batches: 0,
                connection_resets: 0,
                connection_failures: 0,
                avg_batch_time_ms: 0.0,
                start_time: Instant::now(),
                last_batch: None,
                ring: VecDeque::with_capacity(BATCH_STATS_RING_LEN),
            }),
        }
    }

    /// Record the outcome of one flush. `elapsed` updates the running
    /// mean batch time regardless of success, since a failed flush
    /// still consumed wall-clock time worth tracking.
    pub fn record_batch(&self, processed: usize, failed: usize, elapsed: Duration) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        inner.total_bytes += processed as u64;
        inner.failed_bytes += failed as u64;
        // Every recorded flush counts toward batches_processed, including
        // one that fails entirely — the counter tracks flush attempts,
        // not successful ones; failed_batches tracks the failures.
        inner.batches_processed += 1;
        if failed > 0 {
            inner.failed_batches += 1;
        }
        inner.copy_operations += 1;

        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let n = inner.copy_operations as f64;
        inner.avg_batch_time_ms += (elapsed_ms - inner.avg_batch_time_ms) / n;

        let now = Instant::now();
        inner.last_batch = Some(now);
        if inner.ring.len() == BATCH_STATS_RING_LEN {
            inner.ring.pop_front();
        }
        inner.ring.push_back(BatchRecord {
            processed,
            failed,
            at: now,
        });
    }

    pub fn record_connection_reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.connection_resets += 1;
    }

    pub fn record_connection_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.connection_failures += 1;
    }

    /// Seconds since the last recorded batch, or `None` if none yet.
    pub fn seconds_since_last_batch(&self) -> Option<f64> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.last_batch.map(|t| t.elapsed().as_secs_f64())
    }

    /// Build the JSON status document combining counters with the
    /// caller-supplied pool breakdown and current batch buffer size.
    pub fn status_snapshot(&self, pool_counts: PoolStateCounts, current_batch_size: usize) -> StatusSnapshot {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        StatusSnapshot {
            uptime_secs: inner.start_time.elapsed().as_secs(),
            total_bytes: inner.total_bytes,
            batches_processed: inner.batches_processed,
            copy_operations: inner.copy_operations,
            // `errors` is kept as an alias of `failed_bytes` for
            // compatibility with the byte-oriented counter the wire
            // document originally exposed.
            errors: inner.failed_bytes,
            failed_bytes: inner.failed_bytes,
            failed_batches: inner.failed_batches,
            avg_batch_time_ms: inner.avg_batch_time_ms,
            current_batch_size,
            connection_resets: inner.connection_resets,
            connection_failures: inner.connection_failures,
            connections_available: pool_counts.available,
            connections_in_use: pool_counts.in_use,
            connections_dead: pool_counts.dead,
            connections_permanently_failed: pool_counts.permanent_failure,
            unix_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    #[cfg(test)]
    fn ring_len(&self) -> usize {
        self.inner.lock().unwrap().ring.len()
    }
}

impl Default for StatsLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub uptime_secs: u64,
    pub total_bytes: u64,
    pub batches_processed: u64,
    pub copy_operations: u64,
    pub errors: u64,
    pub failed_bytes: u64,
    pub failed_batches: u64,
    pub avg_batch_time_ms: f64,
    pub current_batch_size: usize,
    pub connection_resets: u64,
    pub connection_failures: u64,
    pub connections_available: usize,
    pub connections_in_use: usize,
    pub connections_dead: usize,
    pub connections_permanently_failed: usize,
    pub unix_time: u64,
}

impl StatusSnapshot {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
