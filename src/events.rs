/*!
 * Process-wide structured event sink
 *
 * A single mutex-guarded writer emits one JSON object per line to stderr:
 * `{timestamp, level, message, thread}`. Writes are flushed before the
 * lock is released so concurrent emitters never interleave bytes within
 * a record. This schema is a wire contract consumed by downstream log
 * shippers, which is why it is a dedicated writer rather than routed
 * through the ambient `tracing` subscriber installed in [`crate::logging`].
 */

use std::io::{self, Write};
use std::sync::{Mutex, OnceLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
}

impl Level {
    fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
        }
    }
}

struct EventSink {
    writer: Mutex<Box<dyn Write + Send>>,
}

static SINK: OnceLock<EventSink> = OnceLock::new();

fn sink() -> &'static EventSink {
    SINK.get_or_init(|| EventSink {
        writer: Mutex::new(Box::new(io::stderr())),
    })
}

/// Escape a string per the event sink's JSON message rules: quote,
/// backslash, newline, carriage return and tab are escaped, and any
/// other control character below 0x20 becomes `\uXXXX`.
fn json_escape(src: &str, out: &mut String) {
    for c in src.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
}

fn thread_ident() -> String {
    format!("{:?}", std::thread::current().id())
}

/// Emit one structured event line. Intended to be called through the
/// [`log_event!`] macro rather than directly.
pub fn emit(level: Level, message: &str) {
    let timestamp = chrono::Local::now().to_rfc3339();
    let mut escaped = String::with_capacity(message.len());
    json_escape(message, &mut escaped);

    let line = format!(
        "{{\"timestamp\":\"{}\",\"level\":\"{}\",\"message\":\"{}\",\"thread\":\"{}\"}}\n",
        timestamp,
        level.as_str(),
        escaped,
        thread_ident(),
    );

    let s = sink();
    let mut w = s.writer.lock().unwrap_or_else(|poison| poison.into_inner());
    let _ = w.write_all(line.as_bytes());
    let _ = w.flush();
}

/// Flush any buffered output. Safe to call repeatedly; mainly useful
/// before a non-interactive process exits, and in tests.
pub fn flush() {
    let s = sink();
    let mut w = s.writer.lock().unwrap_or_else(|poison| poison.into_inner());
    let _ = w.flush();
}

/// Replace the sink's writer, for tests that want to capture output.
/// Only effective before the sink is first used for real.
#[cfg(test)]
pub fn set_writer_for_test(writer: Box<dyn Write + Send>) {
    let s = sink();
    *s.writer.lock().unwrap() = writer;
}

#[macro_export]
macro_rules! log_event {
    ($level:expr, $($arg:tt)*) => {
        $crate::events::emit($level, &format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_control_characters() {
        let mut out = String::new();
        json_escape("line\nbreak\t\"quoted\"\x01", &mut out);
        assert_eq!(out, "line\\nbreak\\t\\\"quoted\\\"\\u0001");
    }

    #[test]
    fn preserves_plain_text() {
        let mut out = String::new();
        json_escape("no special characters here", &mut out);
        assert_eq!(out, "no special characters here");
    }
}
