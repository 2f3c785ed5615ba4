//! prflow Core Library
//!
//! Resilient building blocks for Git/GitHub automation:
//! - [`classify`]: closed error taxonomy with typed and text-based matching
//! - [`retry`]: generic retry/backoff engine with cancellation
//! - [`exec`]: subprocess execution for `git` and `gh`
//! - [`git`] / [`github`]: push and PR-creation callers built on the above

pub mod classify;
pub mod error;
pub mod exec;
pub mod git;
pub mod github;
pub mod obs;
pub mod retry;
pub mod telemetry;

pub use classify::{classify_message, Classifier, ErrorKind};
pub use error::{PrflowError, Result};
pub use exec::{CommandExecutor, ProcessExecutor};
pub use git::{GitClient, PushReport, PushRequest};
pub use github::{parse_pr_number, GhClient, PrRequest, PullRequest};
pub use retry::{
    execute, execute_classified, sleep_or_cancel, Attempt, BoxError, RetryError, RetryFailure,
    RetryOutcome, RetryPolicy,
};
pub use telemetry::init_tracing;

/// prflow version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
