//! Tracing setup for graphfeed binaries.
//!
//! Only the first [`init_tracing`] call in a process installs a subscriber.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const GRAPHFEED_TARGETS: [&str; 3] = ["graphfeed", "graphfeed_core", "graphfeed_state"];

/// Filter used when `RUST_LOG` is unset: `level` for graphfeed's own
/// crates, `warn` for everything else (the SurrealDB client is chatty).
pub fn default_filter(level: Level) -> String {
    let level = level.as_str().to_ascii_lowercase();
    let mut directives = vec!["warn".to_string()];
    directives.extend(GRAPHFEED_TARGETS.iter().map(|target| format!("{target}={level}")));
    directives.join(",")
}

/// Install the global subscriber, writing to stderr so stdout stays free
/// for command output. `json` switches to newline-delimited JSON.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter(level)));
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(layer.json()).try_init().ok();
    } else {
        registry.with(layer).try_init().ok();
    }
}
