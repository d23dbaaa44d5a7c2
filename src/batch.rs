/*!
 * Batch buffer and COPY flush
 *
 * Incoming bytes accumulate in a single bounded buffer under a mutex.
 * `append` rejects whole writes that would overflow the buffer rather
 * than truncating them; the caller is expected to flush and retry.
 * `flush` drains the buffer through a borrowed connection using
 * PostgreSQL's `COPY ... FROM STDIN` protocol: `BEGIN`, `copy_start`,
 * then the buffer in fixed-size chunks (retrying `WouldBlock` with
 * backoff), then `copy_end` and `COMMIT`, rolling back on any hard
 * failure. A mid-batch failure reports the bytes that were already
 * accepted by `copy_put` as processed and the remainder as failed,
 * rather than treating the whole batch as all-or-nothing. The buffer's
 * mutex is never held across the network calls
 * in the flush loop: the bytes are swapped out under the lock, then
 * flushed without it, so `append` can proceed concurrently into the
 * next batch.
 */

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::{COPY_CHUNK_SIZE, COPY_PUT_MAX_RETRIES};
use crate::driver::{CopyPutResult, DbDriver};
use crate::log_event;
use crate::pool::ConnectionPool;
use crate::stats::StatsLedger;

pub struct BatchBuffer {
    capacity: usize,
    inner: Mutex<Vec<u8>>,
}

/// Outcome of one [`BatchBuffer::flush`] call.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlushOutcome {
    pub bytes_processed: usize,
    pub bytes_failed: usize,
    pub elapsed: Duration,
}

impl BatchBuffer {
    pub fn new(capacity: usize) -> crate::error::Result<Self> {
        if capacity == 0 {
            return Err(crate::error::HydrantError::BatchAllocation { requested: capacity });
        }
        Ok(Self {
            capacity,
            inner: Mutex::new(Vec::with_capacity(capacity)),
        })
    }

    /// Append `data` if it fits in the remaining capacity. Rejects the
    /// whole write (never partially copies) when it would overflow.
    pub fn append(&self, data: &[u8]) -> bool {
        let mut buf = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if buf.len() + data.len() > self.capacity {
            return false;
        }
        buf.extend_from_slice(data);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swap the current contents out for an empty buffer, returning
    /// whatever had accumulated. Used by `flush` and by shutdown's
    /// final drain.
    fn take(&self) -> Vec<u8> {
        let mut buf = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut *buf, Vec::with_capacity(self.capacity))
    }

    /// Acquire a connection from `pool`, drain the current buffer
    /// contents through it via COPY, and update `stats`. Returns the
    /// outcome even on failure; a failed flush never panics or
    /// propagates an error, matching the rule that per-batch failures
    /// are recorded rather than raised.
    pub fn flush(&self, pool: &ConnectionPool, stats: &StatsLedger) -> FlushOutcome {
        let data = self.take();
        if data.is_empty() {
            return FlushOutcome::default();
        }

        let total_len = data.len();
        let start = Instant::now();
        let outcome = match pool.acquire() {
            Some(index) => {
                let (accepted, result) = pool.with_driver(index, |driver| copy_data(driver, &data));
                let had_error = match &result {
                    Ok(_) => false,
                    Err(e) => {
                        pool.mark_dead(index, e);
                        true
                    }
                };
                pool.release(index, had_error, result.as_ref().err().map(|s| s.as_str()));

                if let Err(e) = &result {
                    log_event!(crate::events::Level::Error, "flush failed: {e}");
                }
                FlushOutcome {
                    bytes_processed: accepted,
                    bytes_failed: total_len - accepted,
                    elapsed: start.elapsed(),
                }
            }
            None => {
                log_event!(
                    crate::events::Level::Warn,
                    "flush could not acquire a connection within the acquire timeout"
                );
                FlushOutcome {
                    bytes_processed: 0,
                    bytes_failed: data.len(),
                    elapsed: start.elapsed(),
                }
            }
        };

        stats.record_batch(outcome.bytes_processed, outcome.bytes_failed, outcome.elapsed);
        outcome
    }
}

/// Run the COPY protocol for one batch over an already-acquired driver.
/// Returns the number of bytes accepted by `copy_put` before any error,
/// alongside the overall result — a mid-batch failure still reports
/// the bytes that made it through.
fn copy_data(driver: &mut dyn DbDriver, data: &[u8]) -> (usize, Result<(), String>) {
    let mut accepted = 0usize;

    if let Err(e) = driver.begin() {
        return (accepted, Err(e));
    }
    if let Err(e) = driver.copy_start() {
        driver.rollback();
        return (accepted, Err(e));
    }

    for chunk in data.chunks(COPY_CHUNK_SIZE) {
        match put_chunk_with_backoff(driver, chunk) {
            Ok(()) => accepted += chunk.len(),
            Err(e) => {
                driver.rollback();
                return (accepted, Err(e));
            }
        }
    }

    if let Err(e) = driver.copy_end() {
        driver.rollback();
        return (accepted, Err(e));
    }

    if let Err(e) = driver.commit() {
        driver.rollback();
        return (accepted, Err(e));
    }

    (accepted, Ok(()))
}

fn put_chunk_with_backoff(driver: &mut dyn DbDriver, chunk: &[u8]) -> Result<(), String> {
    let mut retries = 0u32;
    loop {
        match driver.copy_put(chunk) {
            CopyPutResult::Accepted => return Ok(()),
            CopyPutResult::Error(e) => return Err(e),
            CopyPutResult::WouldBlock => {
                if retries >= COPY_PUT_MAX_RETRIES {
                    return Err("copy_put backpressure exceeded max retries".to_string());
                }
                while driver.is_busy() {
                    driver.consume_input();
                }
                let shift = retries.min(31);
                std::thread::sleep(Duration::from_millis(1u64 << shift));
                retries += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::{FakeDriver, FakeDriverFactory, ScriptedStep};
    use std::sync::Arc;

    fn pool_with(driver: FakeDriver) -> ConnectionPool {
        let factory = Arc::new(FakeDriverFactory::new(move || FakeDriver {
            ssl_in_use: driver.ssl_in_use,
            copy_put_script: driver.copy_put_script.clone(),
            fail_begin: driver.fail_begin,
            fail_copy_start: driver.fail_copy_start,
            fail_copy_end: driver.fail_copy_end,
            fail_commit: driver.fail_commit,
            ..FakeDriver::default()
        }));
        ConnectionPool::open("postgres://x", false, factory).unwrap()
    }

    #[test]
    fn append_rejects_overflow() {
        let buf = BatchBuffer::new(8).unwrap();
        assert!(buf.append(b"1234"));
        assert!(!buf.append(b"12345"));
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn flush_happy_path_updates_stats() {
        let buf = BatchBuffer::new(1024).unwrap();
        assert!(buf.append(b"hello world"));
        let pool = pool_with(FakeDriver::default());
        let stats = StatsLedger::new();

        let outcome = buf.flush(&pool, &stats);
        assert_eq!(outcome.bytes_processed, 11);
        assert_eq!(outcome.bytes_failed, 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn flush_on_empty_buffer_is_a_noop() {
        let buf = BatchBuffer::new(1024).unwrap();
        let pool = pool_with(FakeDriver::default());
        let stats = StatsLedger::new();
        let outcome = buf.flush(&pool, &stats);
        assert_eq!(outcome.bytes_processed, 0);
        assert_eq!(outcome.bytes_failed, 0);
    }

    #[test]
    fn flush_rolls_back_on_copy_failure() {
        let buf = BatchBuffer::new(1024).unwrap();
        assert!(buf.append(b"payload"));
        let mut driver = FakeDriver::default();
        driver.copy_put_script = vec![ScriptedStep::Fail("stream closed".to_string())];
        let pool = pool_with(driver);
        let stats = StatsLedger::new();

        let outcome = buf.flush(&pool, &stats);
        assert_eq!(outcome.bytes_processed, 0);
        assert_eq!(outcome.bytes_failed, 7);
    }

    #[test]
    fn flush_reports_partial_bytes_on_mid_batch_failure() {
        use crate::config::COPY_CHUNK_SIZE;

        let total = COPY_CHUNK_SIZE * 3;
        let buf = BatchBuffer::new(total).unwrap();
        assert!(buf.append(&vec![b'x'; total]));

        let mut driver = FakeDriver::default();
        driver.copy_put_script = vec![ScriptedStep::Accept, ScriptedStep::Fail("reset".to_string())];
        let pool = pool_with(driver);
        let stats = StatsLedger::new();

        let outcome = buf.flush(&pool, &stats);
        assert_eq!(outcome.bytes_processed, COPY_CHUNK_SIZE);
        assert_eq!(outcome.bytes_failed, total - COPY_CHUNK_SIZE);
    }

    #[test]
    fn flush_retries_through_backpressure() {
        let buf = BatchBuffer::new(1024).unwrap();
        assert!(buf.append(b"payload"));
        let mut driver = FakeDriver::default();
        driver.copy_put_script = vec![ScriptedStep::WouldBlock, ScriptedStep::Accept];
        let pool = pool_with(driver);
        let stats = StatsLedger::new();

        let outcome = buf.flush(&pool, &stats);
        assert_eq!(outcome.bytes_processed, 7);
        assert_eq!(outcome.bytes_failed, 0);
    }
}
