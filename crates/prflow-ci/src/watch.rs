//! CI watch state machine.
//!
//! ```text
//! GracePeriod ──▶ Polling ──▶ Success | Failure | Timeout | FetchError
//! ```
//!
//! Each iteration checks the overall timeout, fetches checks through the
//! retry engine, interprets fetch failures by kind, filters to the required
//! checks, and aggregates their buckets. Terminal states return immediately.
//!
//! The timeout bounds the whole watch: fetches (with their nested backoff),
//! the rollup fallback, and every wait are cut off at the deadline, which
//! resolves to `Timeout`.
//!
//! Three kinds of result are kept apart:
//! - `Ok` with `Success`/`Failure`: CI gave a definitive answer;
//! - `Ok` with `Timeout`/`FetchError`: the watch could not determine one;
//! - `Err(WatchError)`: the call was misconfigured, unauthorized, or canceled.

use std::sync::Arc;
use std::time::Duration;

use prflow_core::obs;
use prflow_core::{
    execute_classified, sleep_or_cancel, Classifier, ErrorKind, RetryFailure, RetryPolicy,
};
use serde::{Deserialize, Serialize, Serializer};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::check::{CheckResult, RollupStatus};
use crate::gate::{CheckGate, CheckStatus, NoRequiredChecks};
use crate::notify::{Notifier, TerminalBell};
use crate::source::CheckSource;

/// Parameters for one watch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CiWatchOptions {
    /// Pull request number.
    pub target_id: u64,

    /// Wait between polls while checks are pending.
    pub poll_interval: Duration,

    /// Overall deadline, measured from the start of the watch.
    pub timeout: Duration,

    /// Check names to consider; a trailing `*` matches by prefix. Empty means all.
    pub required_checks: Vec<String>,

    /// Window during which "no checks reported" is expected rather than final.
    pub grace_period: Duration,

    /// Wait between polls while inside the grace period with no checks.
    pub grace_poll_interval: Duration,

    /// Ring the notifier once on `Success` or `Failure`.
    pub bell_on_terminal: bool,

    /// Retry policy for each individual fetch.
    pub fetch_policy: RetryPolicy,
}

impl Default for CiWatchOptions {
    fn default() -> Self {
        Self {
            target_id: 0,
            poll_interval: Duration::from_secs(120),
            timeout: Duration::from_secs(30 * 60),
            required_checks: Vec::new(),
            grace_period: Duration::from_secs(120),
            grace_poll_interval: Duration::from_secs(10),
            bell_on_terminal: false,
            fetch_policy: RetryPolicy::ci_fetch(),
        }
    }
}

impl CiWatchOptions {
    pub fn for_target(target_id: u64) -> Self {
        Self {
            target_id,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), WatchError> {
        if self.target_id == 0 {
            return Err(WatchError::InvalidOptions(
                "target_id must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval.is_zero() || self.grace_poll_interval.is_zero() {
            return Err(WatchError::InvalidOptions(
                "poll intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Watch status. Only `Pending` is non-terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WatchStatus {
    Pending,
    Success,
    Failure,
    Timeout,
    FetchError,
}

impl WatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchStatus::Pending => "pending",
            WatchStatus::Success => "success",
            WatchStatus::Failure => "failure",
            WatchStatus::Timeout => "timeout",
            WatchStatus::FetchError => "fetch_error",
        }
    }

    /// `Success` and `Failure` are answers from CI itself.
    pub fn is_definitive(&self) -> bool {
        matches!(self, WatchStatus::Success | WatchStatus::Failure)
    }
}

impl From<CheckStatus> for WatchStatus {
    fn from(status: CheckStatus) -> Self {
        match status {
            CheckStatus::Pending => WatchStatus::Pending,
            CheckStatus::Success => WatchStatus::Success,
            CheckStatus::Failure => WatchStatus::Failure,
        }
    }
}

/// Terminal snapshot of a watch.
#[derive(Debug, Serialize)]
pub struct CiWatchOutcome {
    pub status: WatchStatus,

    /// Required checks from the last successful poll.
    pub checks: Vec<CheckResult>,

    pub elapsed: Duration,

    /// The fetch failure behind a `FetchError`.
    #[serde(serialize_with = "serialize_failure")]
    pub error: Option<RetryFailure>,
}

impl CiWatchOutcome {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().and_then(RetryFailure::kind)
    }
}

fn serialize_failure<S: Serializer>(
    failure: &Option<RetryFailure>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match failure {
        Some(failure) => serializer.serialize_some(&failure.to_string()),
        None => serializer.serialize_none(),
    }
}

/// Why a watch was aborted instead of producing an outcome.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("invalid watch options: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    RequiredChecksNotFound(#[from] NoRequiredChecks),

    #[error("CI watch aborted: {0}")]
    Fatal(#[source] RetryFailure),

    #[error("CI watch canceled")]
    Canceled,
}

/// Observer invoked with `(elapsed, checks)` after every non-terminal poll.
pub type ProgressFn = Box<dyn Fn(Duration, &[CheckResult]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    GracePeriod,
    Polling,
}

enum Next {
    Conclude(WatchStatus, Option<RetryFailure>),
    Sleep(Duration),
}

/// Stands in for "no deadline" when `start + timeout` is not representable.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Drives the watch state machine against a [`CheckSource`].
pub struct CiWatcher {
    source: Arc<dyn CheckSource>,
    classifier: Classifier,
    notifier: Arc<dyn Notifier>,
    progress: Option<ProgressFn>,
}

impl CiWatcher {
    pub fn new(source: Arc<dyn CheckSource>) -> Self {
        Self {
            source,
            classifier: Classifier::github(),
            notifier: Arc::new(TerminalBell),
            progress: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn on_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(Duration, &[CheckResult]) + Send + Sync + 'static,
    {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Watch until CI reaches a terminal state, the timeout passes, or the
    /// watch is aborted.
    pub async fn watch(
        &self,
        options: &CiWatchOptions,
        cancel: &CancellationToken,
    ) -> Result<CiWatchOutcome, WatchError> {
        options.validate()?;
        self.run(options, cancel)
            .instrument(obs::watch_span(options.target_id))
            .await
    }

    async fn run(
        &self,
        options: &CiWatchOptions,
        cancel: &CancellationToken,
    ) -> Result<CiWatchOutcome, WatchError> {
        let gate = CheckGate::new(options.required_checks.clone());
        let start = Instant::now();
        let deadline = start
            .checked_add(options.timeout)
            .unwrap_or_else(|| start + FAR_FUTURE);
        let mut phase = Phase::GracePeriod;
        let mut last_checks: Vec<CheckResult> = Vec::new();

        info!(
            event = "ci.watch_started",
            timeout_secs = options.timeout.as_secs(),
            required = ?gate.patterns(),
        );

        loop {
            if cancel.is_cancelled() {
                return Err(WatchError::Canceled);
            }
            let elapsed = start.elapsed();
            if elapsed > options.timeout {
                return Ok(self.conclude(options, WatchStatus::Timeout, last_checks, elapsed, None));
            }

            let fetch = execute_classified(
                &options.fetch_policy,
                self.classifier,
                cancel,
                "ci.fetch_checks",
                |_| self.source.fetch_checks(options.target_id, cancel),
            );
            let Ok(fetched) = timeout_at(deadline, fetch).await else {
                debug!(event = "ci.deadline", stage = "fetch_checks");
                return Ok(self.timed_out(options, last_checks, start));
            };
            let elapsed = start.elapsed();

            let checks = match fetched {
                Ok(checks) => checks,
                Err(failure) if failure.is_canceled() => return Err(WatchError::Canceled),
                Err(_) if elapsed > options.timeout => {
                    return Ok(self.timed_out(options, last_checks, start));
                }
                Err(failure) => {
                    match self
                        .after_fetch_failure(options, cancel, failure, elapsed, deadline)
                        .await?
                    {
                        Next::Conclude(status, error) => {
                            let elapsed = start.elapsed();
                            return Ok(self.conclude(options, status, last_checks, elapsed, error));
                        }
                        Next::Sleep(interval) => {
                            self.report_progress(elapsed, &last_checks);
                            if !wait(interval, deadline, cancel).await? {
                                return Ok(self.timed_out(options, last_checks, start));
                            }
                            continue;
                        }
                    }
                }
            };

            if phase == Phase::GracePeriod {
                debug!(event = "ci.phase", phase = "polling", elapsed_secs = elapsed.as_secs());
                phase = Phase::Polling;
            }

            if checks.is_empty() {
                info!(event = "ci.no_checks", "fetch returned no checks; treating as no CI");
                return Ok(self.conclude(options, WatchStatus::Success, checks, elapsed, None));
            }

            let required = gate.filter(&checks)?;
            let verdict = CheckGate::evaluate(&required);
            last_checks = required;

            match verdict.status {
                CheckStatus::Pending => {
                    obs::emit_ci_poll(
                        elapsed,
                        last_checks.len(),
                        verdict.pending.len(),
                        verdict.failing.len(),
                    );
                    self.report_progress(elapsed, &last_checks);
                    if !wait(options.poll_interval, deadline, cancel).await? {
                        return Ok(self.timed_out(options, last_checks, start));
                    }
                }
                status => {
                    info!(event = "ci.verdict", message = %verdict.message);
                    return Ok(self.conclude(options, status.into(), last_checks, elapsed, None));
                }
            }
        }
    }

    async fn after_fetch_failure(
        &self,
        options: &CiWatchOptions,
        cancel: &CancellationToken,
        failure: RetryFailure,
        elapsed: Duration,
        deadline: Instant,
    ) -> Result<Next, WatchError> {
        let Some(kind) = failure.kind() else {
            return Err(WatchError::Canceled);
        };

        match kind {
            ErrorKind::NoSignalYet if elapsed <= options.grace_period => {
                obs::emit_ci_grace_wait(elapsed, options.grace_period);
                Ok(Next::Sleep(options.grace_poll_interval))
            }
            ErrorKind::NoSignalYet => {
                info!(
                    event = "ci.no_checks",
                    elapsed_secs = elapsed.as_secs(),
                    "no checks registered after grace period; treating as no CI"
                );
                Ok(Next::Conclude(WatchStatus::Success, None))
            }
            kind if kind.is_fatal() => Err(WatchError::Fatal(failure)),
            kind => {
                obs::emit_ci_fallback(kind, &failure);
                let rollup = timeout_at(deadline, self.source.fetch_rollup(options.target_id, cancel));
                let Ok(rollup) = rollup.await else {
                    debug!(event = "ci.deadline", stage = "fetch_rollup");
                    return Ok(Next::Conclude(WatchStatus::Timeout, None));
                };
                match rollup {
                    Ok(RollupStatus::Success) => Ok(Next::Conclude(WatchStatus::Success, None)),
                    Ok(RollupStatus::Failure) => Ok(Next::Conclude(WatchStatus::Failure, None)),
                    Ok(RollupStatus::Pending) => Ok(Next::Sleep(options.poll_interval)),
                    Err(_) if cancel.is_cancelled() => Err(WatchError::Canceled),
                    Err(err) => {
                        warn!(event = "ci.fallback_failed", error = %err);
                        Ok(Next::Conclude(WatchStatus::FetchError, Some(failure)))
                    }
                }
            }
        }
    }

    fn report_progress(&self, elapsed: Duration, checks: &[CheckResult]) {
        if let Some(progress) = &self.progress {
            progress(elapsed, checks);
        }
    }

    fn timed_out(
        &self,
        options: &CiWatchOptions,
        checks: Vec<CheckResult>,
        start: Instant,
    ) -> CiWatchOutcome {
        self.conclude(options, WatchStatus::Timeout, checks, start.elapsed(), None)
    }

    fn conclude(
        &self,
        options: &CiWatchOptions,
        status: WatchStatus,
        checks: Vec<CheckResult>,
        elapsed: Duration,
        error: Option<RetryFailure>,
    ) -> CiWatchOutcome {
        obs::emit_ci_terminal(status.as_str(), elapsed, checks.len());
        let outcome = CiWatchOutcome {
            status,
            checks,
            elapsed,
            error,
        };
        if options.bell_on_terminal && status.is_definitive() {
            self.notifier.notify(&outcome);
        }
        outcome
    }
}

/// Sleep for `interval`, cut short at `deadline`.
///
/// Returns `Ok(false)` when the deadline ended the wait.
async fn wait(
    interval: Duration,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<bool, WatchError> {
    let now = Instant::now();
    let (wake, within_budget) = match now.checked_add(interval) {
        Some(wake) if wake <= deadline => (wake, true),
        _ => (deadline, false),
    };
    if !sleep_or_cancel(wake.saturating_duration_since(now), cancel).await {
        return Err(WatchError::Canceled);
    }
    Ok(within_budget)
}
