//! Tracing setup for the `prflow` binary.
//!
//! `prflow` prints its results (watch outcomes, PR URLs, JSON reports) on
//! stdout so agents can parse them, so every log line goes to stderr. With
//! `--json` both streams are JSON: events on stderr, results on stdout.
//!
//! Without `RUST_LOG`, only prflow's own crates log at the requested level;
//! everything else is held at `warn`.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const PRFLOW_TARGETS: &[&str] = &["prflow_core", "prflow_ci", "prflow"];

/// Filter directives used when `RUST_LOG` is unset.
fn default_directives(level: Level) -> String {
    let mut directives = vec!["warn".to_string()];
    directives.extend(PRFLOW_TARGETS.iter().map(|target| format!("{target}={level}")));
    directives.join(",")
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_tracing(json: bool, level: Level) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let installed = if json {
        registry.with(layer.json()).try_init()
    } else {
        registry.with(layer).try_init()
    };
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed; keeping it");
    }
}
