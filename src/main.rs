/*!
 * Hydrant CLI
 *
 * `hydrant [config_file] [input_file]`: reads a byte stream (stdin, or
 * `input_file` if given) and drives it into PostgreSQL through
 * [`hydrant::HydrantContext`]. With no arguments, configuration comes
 * from the `HYDRANT_DB_URL`/`HYDRANT_BATCH_SIZE` environment and input
 * from stdin. Exit code is 0 on a clean run, non-zero if the context
 * fails to start (bad config, no healthy connections) or the input
 * file cannot be opened.
 */

use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use hydrant::config::Config;
use hydrant::context::HydrantContext;
use hydrant::driver::DriverFactory;
use hydrant::pg_driver::PgDriverFactory;

fn main() -> Result<()> {
    hydrant::logging::init_ambient_logging(false);

    let mut args = std::env::args();
    args.next(); // skip argv[0]
    let config_path = args.next().map(PathBuf::from);
    let input_path = args.next().map(PathBuf::from);

    let config = Config::load(config_path.as_deref()).context("failed to load configuration")?;

    let factory: Arc<dyn DriverFactory> = Arc::new(PgDriverFactory);
    let ctx = HydrantContext::build(config, factory).context("failed to start hydrant")?;

    let result = match &input_path {
        Some(path) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open input file {}", path.display()))?;
            let mut reader = BufReader::new(file);
            ctx.ingest(&mut reader)
        }
        None => {
            let stdin = io::stdin();
            let mut lock = stdin.lock();
            ctx.ingest(&mut lock)
        }
    };

    let status_before_shutdown = ctx.status_json();
    ctx.shutdown();

    let bytes_read = result.context("ingestion failed")?;
    eprintln!("{status_before_shutdown}");
    eprintln!("ingested {bytes_read} bytes");

    Ok(())
}
