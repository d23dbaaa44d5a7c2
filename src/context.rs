/*!
 * Process lifecycle: build, run, shut down
 *
 * `HydrantContext` owns every long-lived piece — config, pool, batch
 * buffer, stats, workers — and is responsible for bringing them up in
 * the right order and tearing them down cleanly. Workers hold `Arc`
 * clones of the pool and stats rather than owning them, so there is no
 * ownership cycle to break at shutdown.
 */

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use crate::batch::BatchBuffer;
use crate::config::Config;
use crate::driver::DriverFactory;
use crate::error::Result;
use crate::log_event;
use crate::pool::ConnectionPool;
use crate::stats::StatsLedger;
use crate::supervisor::{self, ShutdownSignal};

pub struct HydrantContext {
    pub config: Config,
    pub pool: Arc<ConnectionPool>,
    pub batch: Arc<BatchBuffer>,
    pub stats: Arc<StatsLedger>,
    shutdown: Arc<ShutdownSignal>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl HydrantContext {
    /// Build the full runtime: open the pool, allocate the batch
    /// buffer and stats ledger, and start the supervisor workers.
    /// Fails only if the pool cannot open a single healthy connection
    /// or the batch buffer cannot be allocated.
    pub fn build(config: Config, factory: Arc<dyn DriverFactory>) -> Result<Self> {
        let pool = Arc::new(ConnectionPool::open(
            &config.db_conn_string,
            config.require_ssl,
            factory,
        )?);
        log_event!(
            crate::events::Level::Info,
            "pool opened with {}/{} healthy connections",
            pool.healthy_connections(),
            pool.len()
        );

        let batch = Arc::new(BatchBuffer::new(config.batch_size)?);
        let stats = Arc::new(StatsLedger::new());
        let shutdown = Arc::new(ShutdownSignal::new());

        let workers = supervisor::spawn_workers(
            config.worker_count,
            pool.clone(),
            stats.clone(),
            shutdown.clone(),
            Duration::from_secs(config.heartbeat_interval_secs),
        );

        Ok(Self {
            config,
            pool,
            batch,
            stats,
            shutdown,
            workers,
        })
    }

    /// Read `input` to completion, appending to the batch buffer and
    /// flushing whenever a read would overflow it. Returns the total
    /// bytes read from the source (not necessarily all committed —
    /// failed flushes are recorded in stats, not surfaced here).
    pub fn ingest(&self, input: &mut dyn Read) -> Result<u64> {
        let mut chunk = vec![0u8; self.config.batch_size.min(64 * 1024)];
        let mut total_read = 0u64;

        loop {
            let n = input.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            total_read += n as u64;

            if !self.batch.append(&chunk[..n]) {
                self.batch.flush(&self.pool, &self.stats);
                if !self.batch.append(&chunk[..n]) {
                    // A single read is larger than the whole batch
                    // buffer; flush immediately in capacity-sized
                    // pieces rather than rejecting the input outright.
                    for piece in chunk[..n].chunks(self.config.batch_size) {
                        if !self.batch.append(piece) {
                            self.batch.flush(&self.pool, &self.stats);
                            self.batch.append(piece);
                        }
                    }
                }
            }
        }

        Ok(total_read)
    }

    /// Flush any remaining bytes, stop the workers, and release pool
    /// connections. Safe to call once; calling it twice is harmless
    /// but the second flush will simply see an empty buffer.
    pub fn shutdown(mut self) {
        self.shutdown.trigger();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }

        if !self.batch.is_empty() {
            self.batch.flush(&self.pool, &self.stats);
        }

        self.pool.close_all();
        log_event!(crate::events::Level::Info, "shutdown complete");
    }

    pub fn status_json(&self) -> String {
        let counts = self.pool.state_counts();
        self.stats
            .status_snapshot(counts, self.batch.len())
            .to_json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::{FakeDriver, FakeDriverFactory};
    use std::io::Cursor;

    fn test_config() -> Config {
        Config {
            db_conn_string: "postgres://x".into(),
            batch_size: 1024,
            max_retries: 3,
            retry_delay_ms: 10,
            require_ssl: false,
            worker_count: 1,
            heartbeat_interval_secs: 3600,
        }
    }

    #[test]
    fn build_ingest_and_shutdown_round_trip() {
        let factory: Arc<dyn DriverFactory> = Arc::new(FakeDriverFactory::new(FakeDriver::default));
        let ctx = HydrantContext::build(test_config(), factory).unwrap();

        let mut input = Cursor::new(b"line one\nline two\n".to_vec());
        let read = ctx.ingest(&mut input).unwrap();
        assert_eq!(read, 18);

        let snapshot_before_shutdown = ctx.status_json();
        assert!(snapshot_before_shutdown.contains("\"current_batch_size\":18"));

        ctx.shutdown();
    }

    #[test]
    fn oversized_single_read_flushes_in_pieces() {
        let factory: Arc<dyn DriverFactory> = Arc::new(FakeDriverFactory::new(FakeDriver::default));
        let mut config = test_config();
        config.batch_size = 64 * 1024;
        let ctx = HydrantContext::build(config, factory).unwrap();

        let big = vec![b'x'; 200 * 1024];
        let mut input = Cursor::new(big);
        let read = ctx.ingest(&mut input).unwrap();
        assert_eq!(read, 200 * 1024);
        ctx.shutdown();
    }
}
