/*!
 * Hydrant - bounded-memory bulk ingestion into PostgreSQL
 *
 * Reads a byte stream, batches it into a fixed-capacity buffer, and
 * flushes each batch into the database through a pool of ten
 * connections using `COPY ... FROM STDIN`. The pool recovers failed
 * connections with backoff and quarantines ones that keep failing
 * rather than retrying forever; batch failures are recorded in the
 * stats ledger rather than aborting the process.
 */

pub mod batch;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod events;
pub mod logging;
pub mod pg_driver;
pub mod pool;
pub mod stats;
pub mod supervisor;

pub use batch::BatchBuffer;
pub use config::Config;
pub use context::HydrantContext;
pub use error::{ErrorCategory, HydrantError, Result};
pub use pool::{ConnectionPool, ConnectionState};
pub use stats::{StatsLedger, StatusSnapshot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
