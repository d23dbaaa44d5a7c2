/*!
 * Database driver abstraction
 *
 * The pool and batch buffer are built against a trait rather than a
 * concrete PostgreSQL client so they can be exercised deterministically
 * in tests without a live server. The verbs mirror the reference
 * design's use of `begin`, `prepare`, `copy_start`, `copy_put`,
 * `copy_end`, `commit`, `rollback`, `status`, `error_message`, `finish`
 * and `ssl_in_use`; a real adapter would implement [`DbDriver`] over a
 * PostgreSQL client crate, but shipping one is out of this core's
 * stated boundary (the driver is an external collaborator specified
 * only at its interface).
 */

/// Connection-level status as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Ok,
    Bad,
}

/// Result of one `copy_put` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyPutResult {
    /// Chunk accepted.
    Accepted,
    /// Driver's internal buffer is full; caller should back off and retry.
    WouldBlock,
    /// Hard failure; carries the driver's error message.
    Error(String),
}

/// One live (or formerly live) connection to the database.
///
/// Implementations own whatever resources a concrete client needs
/// (socket, TLS state, prepared statement handle). The pool treats a
/// `Box<dyn DbDriver>` as opaque beyond this interface.
pub trait DbDriver: Send {
    fn status(&self) -> ConnStatus;
    fn error_message(&self) -> String;
    fn ssl_in_use(&self) -> bool;

    /// Prepare the bulk-copy statement under the stable name `copy_stmt`.
    fn prepare_copy_stmt(&mut self) -> Result<(), String>;

    fn begin(&mut self) -> Result<(), String>;
    fn copy_start(&mut self) -> Result<(), String>;
    fn copy_put(&mut self, chunk: &[u8]) -> CopyPutResult;
    fn is_busy(&self) -> bool;
    fn consume_input(&mut self);
    fn copy_end(&mut self) -> Result<(), String>;
    fn commit(&mut self) -> Result<(), String>;
    fn rollback(&mut self);

    /// Release any underlying resources. Called once, when the slot
    /// closes this handle to replace or discard it.
    fn finish(&mut self);
}

/// Opens fresh connections for the pool to populate its slots with.
pub trait DriverFactory: Send + Sync {
    fn connect(&self, conn_string: &str) -> Result<Box<dyn DbDriver>, String>;
}

/// Deterministic fakes for exercising the pool and batch buffer without
/// a live PostgreSQL server. Exposed unconditionally (not test-gated) so
/// integration tests outside this crate can build scenarios against it,
/// the way this codebase's own fixtures (`tempfile`, `assert_fs`) are
/// ordinary library-shaped helpers rather than `#[cfg(test)]` items.
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Scripted behavior for one fake connection's `copy_put` sequence.
    #[derive(Debug, Clone)]
    pub enum ScriptedStep {
        Accept,
        WouldBlock,
        Fail(String),
    }

    /// A fake driver connection whose behavior is scripted up front.
    pub struct FakeDriver {
        pub ssl_in_use: bool,
        pub fail_open: bool,
        pub fail_prepare: bool,
        /// Steps consumed one per `copy_put` call; once exhausted,
        /// further calls accept unconditionally.
        pub copy_put_script: Vec<ScriptedStep>,
        pub fail_begin: bool,
        pub fail_copy_start: bool,
        pub fail_copy_end: bool,
        pub fail_commit: bool,

        status: ConnStatus,
        script_pos: usize,
        pub rollback_count: Arc<AtomicUsize>,
        pub commit_count: Arc<AtomicUsize>,
    }

    impl Default for FakeDriver {
        fn default() -> Self {
            Self {
                ssl_in_use: true,
                fail_open: false,
                fail_prepare: false,
                copy_put_script: Vec::new(),
                fail_begin: false,
                fail_copy_start: false,
                fail_copy_end: false,
                fail_commit: false,
                status: ConnStatus::Ok,
                script_pos: 0,
                rollback_count: Arc::new(AtomicUsize::new(0)),
                commit_count: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl DbDriver for FakeDriver {
        fn status(&self) -> ConnStatus {
            self.status
        }

        fn error_message(&self) -> String {
            "fake driver error".to_string()
        }

        fn ssl_in_use(&self) -> bool {
            self.ssl_in_use
        }

        fn prepare_copy_stmt(&mut self) -> Result<(), String> {
            if self.fail_prepare {
                Err("prepare failed".to_string())
            } else {
                Ok(())
            }
        }

        fn begin(&mut self) -> Result<(), String> {
            if self.fail_begin {
                Err("BEGIN failed".to_string())
            } else {
                Ok(())
            }
        }

        fn copy_start(&mut self) -> Result<(), String> {
            if self.fail_copy_start {
                Err("COPY start failed".to_string())
            } else {
                Ok(())
            }
        }

        fn copy_put(&mut self, _chunk: &[u8]) -> CopyPutResult {
            if self.script_pos >= self.copy_put_script.len() {
                return CopyPutResult::Accepted;
            }
            let step = self.copy_put_script[self.script_pos].clone();
            self.script_pos += 1;
            match step {
                ScriptedStep::Accept => CopyPutResult::Accepted,
                ScriptedStep::WouldBlock => CopyPutResult::WouldBlock,
                ScriptedStep::Fail(msg) => {
                    self.status = ConnStatus::Bad;
                    CopyPutResult::Error(msg)
                }
            }
        }

        fn is_busy(&self) -> bool {
            false
        }

        fn consume_input(&mut self) {}

        fn copy_end(&mut self) -> Result<(), String> {
            if self.fail_copy_end {
                Err("COPY end failed".to_string())
            } else {
                Ok(())
            }
        }

        fn commit(&mut self) -> Result<(), String> {
            if self.fail_commit {
                Err("COMMIT failed".to_string())
            } else {
                self.commit_count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        fn rollback(&mut self) {
            self.rollback_count.fetch_add(1, Ordering::SeqCst);
        }

        fn finish(&mut self) {
            self.status = ConnStatus::Bad;
        }
    }

    /// Builds [`FakeDriver`]s from a template, recording how many
    /// connections were opened and allowing `connect` itself to be
    /// scripted to fail (for recovery-exhaustion tests).
    pub struct FakeDriverFactory {
        pub fail_connect: Arc<std::sync::atomic::AtomicBool>,
        pub connect_attempts: Arc<AtomicUsize>,
        pub template: Arc<dyn Fn() -> FakeDriver + Send + Sync>,
    }

    impl FakeDriverFactory {
        pub fn new(template: impl Fn() -> FakeDriver + Send + Sync + 'static) -> Self {
            Self {
                fail_connect: Arc::new(std::sync::atomic::AtomicBool::new(false)),
                connect_attempts: Arc::new(AtomicUsize::new(0)),
                template: Arc::new(template),
            }
        }
    }

    impl DriverFactory for FakeDriverFactory {
        fn connect(&self, _conn_string: &str) -> Result<Box<dyn DbDriver>, String> {
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err("connection refused".to_string());
            }
            Ok(Box::new((self.template)()))
        }
    }
}
