/*!
 * Ambient tracing initialization
 *
 * This is separate from the hand-rolled event sink in [`crate::events`]:
 * the event sink is a spec'd wire contract for pool/batch/stats events,
 * while this installs a `tracing-subscriber` registry for diagnostics
 * around the CLI boundary itself (argument errors, config-load narration,
 * panics) the way this codebase's file-copy tool sets up its own logging.
 */

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the ambient tracing subscriber. Safe to call once per
/// process; a second call is a no-op.
pub fn init_ambient_logging(verbose: bool) {
    let default_level = if verbose { Level::DEBUG } else { Level::INFO };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("hydrant={}", default_level)));

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact();

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}
