//! Development-time tracing for debugging the controller.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Dev diagnostics via `LOOPGATE_LOG` (or
//!   `RUST_LOG`), output to stderr. stdout carries the hook protocol only.
//!
//! - **Session artifacts (`io/session`)**: round prompts, review logs and
//!   reviewer command captures under `.loopgate/<session>/`. Always written,
//!   unaffected by the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter variable checked before `RUST_LOG`.
pub const LOG_ENV: &str = "LOOPGATE_LOG";

/// Initialize tracing subscriber for development logging.
///
/// Defaults to `warn` if neither variable is set or parses.
///
/// # Example
/// ```bash
/// LOOPGATE_LOG=loopgate=debug loopgate exit --hook
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    // A second init (e.g. in tests) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
