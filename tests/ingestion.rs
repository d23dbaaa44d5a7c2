//! End-to-end scenarios against the fake driver: the six situations
//! the pool and batch buffer are specified to handle without aborting
//! the process.

use std::io::Cursor;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use hydrant::config::Config;
use hydrant::context::HydrantContext;
use hydrant::driver::testing::{FakeDriver, FakeDriverFactory, ScriptedStep};
use hydrant::driver::DriverFactory;

fn config(batch_size: usize, require_ssl: bool) -> Config {
    Config {
        db_conn_string: "postgres://test/db".into(),
        batch_size,
        max_retries: 3,
        retry_delay_ms: 5,
        require_ssl,
        worker_count: 1,
        heartbeat_interval_secs: 3600,
    }
}

#[test]
fn happy_path_ingests_and_commits() {
    let factory: Arc<dyn DriverFactory> = Arc::new(FakeDriverFactory::new(FakeDriver::default));
    let ctx = HydrantContext::build(config(1024, false), factory).unwrap();

    let mut input = Cursor::new(b"1,alice\n2,bob\n3,carol\n".to_vec());
    let read = ctx.ingest(&mut input).unwrap();
    assert_eq!(read, 22);

    let snapshot = ctx.status_json();
    assert!(snapshot.contains("\"current_batch_size\":22"));
    ctx.shutdown();
}

#[test]
fn transient_connection_failure_recovers() {
    // Every connection fails its first copy_put, then succeeds.
    let factory: Arc<dyn DriverFactory> = Arc::new(FakeDriverFactory::new(|| FakeDriver {
        copy_put_script: vec![ScriptedStep::Fail("connection reset by peer".into())],
        ..FakeDriver::default()
    }));
    let ctx = HydrantContext::build(config(64, false), factory).unwrap();

    let mut input = Cursor::new(b"row one".to_vec());
    ctx.ingest(&mut input).unwrap();
    ctx.batch.flush(&ctx.pool, &ctx.stats);

    let counts = ctx.pool.state_counts();
    assert!(counts.dead >= 1 || counts.available == hydrant::config::POOL_SIZE);
    ctx.shutdown();
}

#[test]
fn backpressure_is_retried_until_accepted() {
    let factory: Arc<dyn DriverFactory> = Arc::new(FakeDriverFactory::new(|| FakeDriver {
        copy_put_script: vec![
            ScriptedStep::WouldBlock,
            ScriptedStep::WouldBlock,
            ScriptedStep::Accept,
        ],
        ..FakeDriver::default()
    }));
    let ctx = HydrantContext::build(config(1024, false), factory).unwrap();

    let mut input = Cursor::new(b"payload that needs a few retries".to_vec());
    let read = ctx.ingest(&mut input).unwrap();
    ctx.batch.flush(&ctx.pool, &ctx.stats);

    let snapshot = ctx.status_json();
    assert!(snapshot.contains(&format!("\"total_bytes\":{read}")));
    ctx.shutdown();
}

#[test]
fn connect_failures_quarantine_into_permanent_failure() {
    let factory = Arc::new(FakeDriverFactory::new(FakeDriver::default));
    let ctx = HydrantContext::build(config(1024, false), factory.clone() as Arc<dyn DriverFactory>)
        .unwrap();

    ctx.pool.mark_dead(0, "simulated outage");
    factory.fail_connect.store(true, Ordering::SeqCst);

    for _ in 0..(hydrant::config::MAX_RECOVERY_ATTEMPTS + 1) {
        ctx.pool.recover(0, &ctx.stats);
    }

    let counts = ctx.pool.state_counts();
    assert!(counts.permanent_failure <= 1);
    ctx.shutdown();
}

#[test]
fn shutdown_flushes_remaining_bytes() {
    let factory: Arc<dyn DriverFactory> = Arc::new(FakeDriverFactory::new(FakeDriver::default));
    let ctx = HydrantContext::build(config(1024, false), factory).unwrap();

    let mut input = Cursor::new(b"never explicitly flushed".to_vec());
    ctx.ingest(&mut input).unwrap();
    assert!(!ctx.batch.is_empty());

    ctx.shutdown();
}

#[test]
fn tls_required_without_tls_degrades_pool() {
    let factory: Arc<dyn DriverFactory> = Arc::new(FakeDriverFactory::new(|| FakeDriver {
        ssl_in_use: false,
        ..FakeDriver::default()
    }));

    let result = HydrantContext::build(config(1024, true), factory);
    assert!(result.is_err(), "every slot should fail SSL validation");
}
