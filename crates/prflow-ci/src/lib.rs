//! prflow CI - CI check watching for pull requests
//!
//! Provides a watcher that:
//! - Polls per-check results with classified retries
//! - Tolerates the window before CI registers any checks
//! - Falls back to the PR status rollup when check fetching keeps failing
//! - Filters to required checks and reports a single terminal outcome

pub mod check;
pub mod gate;
pub mod notify;
pub mod source;
pub mod watch;

// Re-export key types
pub use check::{parse_gh_checks, parse_gh_rollup, CheckBucket, CheckResult, RollupStatus};
pub use gate::{CheckGate, CheckStatus, GateVerdict, NoRequiredChecks};
pub use notify::{Notifier, TerminalBell};
pub use source::{CheckSource, GhCheckSource};
pub use watch::{CiWatchOptions, CiWatchOutcome, CiWatcher, ProgressFn, WatchError, WatchStatus};
