//! Retry engine: attempt, classify, decide, back off, repeat.
//!
//! [`execute`] is the generic loop; [`execute_classified`] wires it to a
//! [`Classifier`] and the observability hooks so call sites only supply the
//! attempt closure.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::classify::{Classifier, ErrorKind};
use crate::error::{PrflowError, Result};
use crate::obs;

/// Boxed error carried by a [`RetryFailure`].
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Backoff schedule for one call site.
///
/// Base delay after attempt `i` is `min(initial_delay * multiplier^(i-1), max_delay)`.
/// `jitter` spreads each actual wait by up to ±`jitter` of the base delay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RetryPolicyFields")]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
}

#[derive(Deserialize)]
struct RetryPolicyFields {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    #[serde(default)]
    jitter: f64,
}

impl TryFrom<RetryPolicyFields> for RetryPolicy {
    type Error = PrflowError;

    fn try_from(fields: RetryPolicyFields) -> Result<Self> {
        Ok(RetryPolicy::new(
            fields.max_attempts,
            fields.initial_delay,
            fields.max_delay,
            fields.multiplier,
        )?
        .with_jitter(fields.jitter))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    ) -> Result<Self> {
        if max_attempts == 0 {
            return Err(PrflowError::InvalidPolicy(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if initial_delay > max_delay {
            return Err(PrflowError::InvalidPolicy(format!(
                "initial_delay {initial_delay:?} exceeds max_delay {max_delay:?}"
            )));
        }
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(PrflowError::InvalidPolicy(format!(
                "multiplier must be a finite value >= 1, got {multiplier}"
            )));
        }
        Ok(Self {
            max_attempts,
            initial_delay,
            max_delay,
            multiplier,
            jitter: 0.0,
        })
    }

    /// Spread waits by ±`fraction` (clamped to `0.0..=1.0`).
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// GitHub CLI calls: 3 attempts, 2s doubling to 30s, ±20% jitter.
    pub fn github() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// `git push`: 3 attempts, 1s doubling to 10s, no jitter.
    pub fn push() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    /// Nested fetch inside the CI watch: 3 attempts, 1s doubling to 5s, ±20% jitter.
    pub fn ci_fetch() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Base (unjittered) delay waited after the given 1-based attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..attempt.max(1) {
            if delay >= self.max_delay {
                break;
            }
            delay = self.advance(delay);
        }
        delay
    }

    fn advance(&self, delay: Duration) -> Duration {
        let nanos = delay.as_nanos() as f64 * self.multiplier;
        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }
        Duration::from_nanos(nanos as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor.max(0.0)).unwrap_or(delay)
    }
}

/// Result of one invocation of the attempt closure.
#[derive(Debug)]
pub enum Attempt<T, E> {
    Done(T),
    /// A failed attempt may still have produced something worth inspecting.
    Failed { partial: Option<T>, error: E },
}

impl<T, E> From<std::result::Result<T, E>> for Attempt<T, E> {
    fn from(result: std::result::Result<T, E>) -> Self {
        match result {
            Ok(value) => Attempt::Done(value),
            Err(error) => Attempt::Failed {
                partial: None,
                error,
            },
        }
    }
}

/// How a retry loop ended.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Succeeded {
        value: T,
        attempts: u32,
    },
    /// The last attempt failed and no further attempt was allowed.
    Failed {
        error: E,
        partial: Option<T>,
        attempts: u32,
    },
    /// Cancellation was observed before an attempt or during a backoff wait.
    Canceled {
        last_error: Option<E>,
        partial: Option<T>,
        attempts: u32,
    },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. }
            | RetryOutcome::Failed { attempts, .. }
            | RetryOutcome::Canceled { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }

    pub fn into_result(self) -> std::result::Result<T, RetryError<E>> {
        match self {
            RetryOutcome::Succeeded { value, .. } => Ok(value),
            RetryOutcome::Failed { error, attempts, .. } => {
                Err(RetryError::Failed { error, attempts })
            }
            RetryOutcome::Canceled { attempts, .. } => Err(RetryError::Canceled { attempts }),
        }
    }
}

/// Error side of [`RetryOutcome::into_result`].
#[derive(Debug)]
pub enum RetryError<E> {
    Failed { error: E, attempts: u32 },
    Canceled { attempts: u32 },
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Failed { error, attempts } => {
                write!(f, "failed after {attempts} attempt(s): {error}")
            }
            RetryError::Canceled { attempts } => {
                write!(f, "canceled after {attempts} attempt(s)")
            }
        }
    }
}

impl<E: StdError + 'static> StdError for RetryError<E> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            RetryError::Failed { error, .. } => Some(error),
            RetryError::Canceled { .. } => None,
        }
    }
}

/// Classified failure returned to callers of [`execute_classified`].
#[derive(Debug, thiserror::Error)]
pub enum RetryFailure {
    #[error("failed after {attempts} attempt(s): {kind}: {source}")]
    Failed {
        kind: ErrorKind,
        attempts: u32,
        #[source]
        source: BoxError,
    },

    #[error("canceled after {attempts} attempt(s)")]
    Canceled { attempts: u32 },
}

impl RetryFailure {
    /// Classification of the final failed attempt; `None` when canceled.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            RetryFailure::Failed { kind, .. } => Some(*kind),
            RetryFailure::Canceled { .. } => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryFailure::Failed { attempts, .. } | RetryFailure::Canceled { attempts } => {
                *attempts
            }
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, RetryFailure::Canceled { .. })
    }
}

/// Sleep for `delay` unless `cancel` fires first. Returns `false` on cancellation.
///
/// Cancellation wins when both are ready.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Run `attempt_fn` until it succeeds, `should_retry` declines, the policy is
/// exhausted, or `cancel` fires.
///
/// `on_wait(attempt, delay, error)` is called before each backoff wait with
/// the base delay from the schedule; jitter only affects the actual sleep.
/// In-flight attempts are never interrupted; cancellation only stops new
/// attempts from being scheduled.
pub async fn execute<T, E, F, Fut, R, W>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut attempt_fn: F,
    mut should_retry: R,
    mut on_wait: W,
) -> RetryOutcome<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T, E>>,
    R: FnMut(&E) -> bool,
    W: FnMut(u32, Duration, &E),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.initial_delay;
    let mut last_error: Option<E> = None;
    let mut last_partial: Option<T> = None;
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return RetryOutcome::Canceled {
                last_error,
                partial: last_partial,
                attempts: attempt,
            };
        }

        attempt += 1;
        let (partial, error) = match attempt_fn(attempt).await {
            Attempt::Done(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts: attempt,
                }
            }
            Attempt::Failed { partial, error } => (partial, error),
        };

        if !should_retry(&error) || attempt >= max_attempts {
            return RetryOutcome::Failed {
                error,
                partial,
                attempts: attempt,
            };
        }

        on_wait(attempt, delay, &error);
        let wait = policy.jittered(delay);
        last_error = Some(error);
        last_partial = partial;

        if !sleep_or_cancel(wait, cancel).await {
            return RetryOutcome::Canceled {
                last_error,
                partial: last_partial,
                attempts: attempt,
            };
        }
        delay = policy.advance(delay);
    }
}

/// [`execute`] with classifier-driven retry decisions and structured logging.
///
/// `operation` names the call site in log events.
pub async fn execute_classified<T, E, F, Fut>(
    policy: &RetryPolicy,
    classifier: Classifier,
    cancel: &CancellationToken,
    operation: &str,
    mut attempt_fn: F,
) -> std::result::Result<T, RetryFailure>
where
    E: StdError + Send + Sync + 'static,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let outcome = execute(
        policy,
        cancel,
        |attempt| {
            let fut = attempt_fn(attempt);
            async move { Attempt::from(fut.await) }
        },
        |err: &E| classifier.should_retry(classifier.classify(err)),
        |attempt, delay, err: &E| {
            obs::emit_retry_wait(operation, attempt, delay, classifier.classify(err), err);
        },
    )
    .await;

    match outcome {
        RetryOutcome::Succeeded { value, .. } => Ok(value),
        RetryOutcome::Failed {
            error, attempts, ..
        } => {
            let kind = classifier.classify(&error);
            obs::emit_retry_gave_up(operation, attempts, kind, &error);
            Err(RetryFailure::Failed {
                kind,
                attempts,
                source: Box::new(error),
            })
        }
        RetryOutcome::Canceled { attempts, .. } => {
            obs::emit_retry_canceled(operation, attempts);
            Err(RetryFailure::Canceled { attempts })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Duration::from_millis(100),
            Duration::from_secs(1),
            2.0,
        )
        .unwrap()
    }

    fn network_error() -> PrflowError {
        PrflowError::CommandFailed {
            program: "gh".to_string(),
            args: vec![],
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "connection reset by peer".to_string(),
        }
    }

    #[test]
    fn test_policy_rejects_inverted_delays() {
        let err = RetryPolicy::new(3, Duration::from_secs(10), Duration::from_secs(1), 2.0)
            .unwrap_err();
        assert!(err.to_string().contains("exceeds max_delay"));
    }

    #[test]
    fn test_policy_rejects_zero_attempts_and_shrinking_multiplier() {
        assert!(RetryPolicy::new(0, Duration::ZERO, Duration::ZERO, 2.0).is_err());
        assert!(RetryPolicy::new(3, Duration::ZERO, Duration::ZERO, 0.5).is_err());
        assert!(RetryPolicy::new(3, Duration::ZERO, Duration::ZERO, f64::NAN).is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let json = r#"{"max_attempts":0,"initial_delay":{"secs":1,"nanos":0},
                       "max_delay":{"secs":2,"nanos":0},"multiplier":2.0}"#;
        assert!(serde_json::from_str::<RetryPolicy>(json).is_err());

        let json = r#"{"max_attempts":4,"initial_delay":{"secs":1,"nanos":0},
                       "max_delay":{"secs":2,"nanos":0},"multiplier":2.0,"jitter":3.0}"#;
        let policy: RetryPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.jitter(), 1.0);
    }

    #[test]
    fn test_delay_schedule_is_capped_and_monotonic() {
        let p = policy(10);
        let expected = [100, 200, 400, 800, 1000, 1000];
        for (i, ms) in expected.iter().enumerate() {
            assert_eq!(p.delay_for_attempt(i as u32 + 1), Duration::from_millis(*ms));
        }
        let mut previous = Duration::ZERO;
        for attempt in 1..=20 {
            let delay = p.delay_for_attempt(attempt);
            assert!(delay >= previous);
            assert!(delay <= p.max_delay());
            previous = delay;
        }
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let p = policy(3).with_jitter(0.2);
        for _ in 0..200 {
            let d = p.jittered(Duration::from_secs(10));
            assert!(d >= Duration::from_secs(8) && d <= Duration::from_secs(12), "{d:?}");
        }
    }

    #[test]
    fn test_jitter_near_duration_max_does_not_overflow() {
        let p = RetryPolicy::new(2, Duration::MAX, Duration::MAX, 2.0)
            .unwrap()
            .with_jitter(1.0);
        for _ in 0..200 {
            let d = p.jittered(Duration::MAX);
            assert!(d <= Duration::MAX);
        }
        assert_eq!(p.delay_for_attempt(5), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_wait_sees_base_delay_under_jitter() {
        let cancel = CancellationToken::new();
        let waits = Mutex::new(Vec::new());
        let p = policy(4).with_jitter(0.5);
        let start = tokio::time::Instant::now();
        let _: RetryOutcome<(), &str> = execute(
            &p,
            &cancel,
            |_| async { Attempt::Failed { partial: None, error: "again" } },
            |_| true,
            |attempt, delay, _| waits.lock().unwrap().push((attempt, delay)),
        )
        .await;
        let waits = waits.into_inner().unwrap();
        assert_eq!(
            waits,
            vec![
                (1, Duration::from_millis(100)),
                (2, Duration::from_millis(200)),
                (3, Duration::from_millis(400)),
            ]
        );
        // Actual sleeps are jittered by up to ±50% of the 700ms total, plus timer rounding.
        let slept = start.elapsed();
        assert!(slept >= Duration::from_millis(340) && slept <= Duration::from_millis(1060));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let cancel = CancellationToken::new();
        let outcome: RetryOutcome<u32, PrflowError> = execute(
            &policy(3),
            &cancel,
            |n| async move { Attempt::Done(n * 10) },
            |_| true,
            |_, _, _| {},
        )
        .await;
        assert!(outcome.is_success());
        assert_eq!(outcome.attempts(), 1);
        assert_eq!(outcome.into_result().unwrap(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let cancel = CancellationToken::new();
        let outcome: RetryOutcome<(), String> = execute(
            &policy(4),
            &cancel,
            |n| async move {
                Attempt::Failed {
                    partial: None,
                    error: format!("failure #{n}"),
                }
            },
            |_| true,
            |_, _, _| {},
        )
        .await;
        match outcome {
            RetryOutcome::Failed {
                error, attempts, ..
            } => {
                assert_eq!(attempts, 4);
                assert_eq!(error, "failure #4");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_makes_one_attempt() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<(), &str> = execute(
            &policy(5),
            &cancel,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Attempt::Failed { partial: None, error: "fatal" } }
            },
            |_| false,
            |_, _, _| panic!("must not wait"),
        )
        .await;
        assert_eq!(outcome.attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_follow_schedule_and_skip_last() {
        let cancel = CancellationToken::new();
        let waits = Mutex::new(Vec::new());
        let p = policy(6);
        let _: RetryOutcome<(), &str> = execute(
            &p,
            &cancel,
            |_| async { Attempt::Failed { partial: None, error: "again" } },
            |_| true,
            |attempt, delay, _| waits.lock().unwrap().push((attempt, delay)),
        )
        .await;
        let waits = waits.into_inner().unwrap();
        assert_eq!(waits.len(), 5);
        for (attempt, delay) in waits {
            assert_eq!(delay, p.delay_for_attempt(attempt));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_value_of_last_failure_is_kept() {
        let cancel = CancellationToken::new();
        let outcome: RetryOutcome<String, &str> = execute(
            &policy(2),
            &cancel,
            |n| async move {
                Attempt::Failed {
                    partial: Some(format!("partial-{n}")),
                    error: "incomplete",
                }
            },
            |_| true,
            |_, _, _| {},
        )
        .await;
        match outcome {
            RetryOutcome::Failed { partial, .. } => assert_eq!(partial.as_deref(), Some("partial-2")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_first_attempt() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome: RetryOutcome<(), &str> = execute(
            &policy(3),
            &cancel,
            |_| async { Attempt::Failed { partial: None, error: "ran anyway" } },
            |_| true,
            |_, _, _| {},
        )
        .await;
        assert!(matches!(outcome, RetryOutcome::Canceled { attempts: 0, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_freezes_attempts() {
        let cancel = CancellationToken::new();
        let p = RetryPolicy::new(5, Duration::from_secs(60), Duration::from_secs(60), 1.0).unwrap();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });
        let started = tokio::time::Instant::now();
        let outcome: RetryOutcome<(), &str> = execute(
            &p,
            &cancel,
            |_| async { Attempt::Failed { partial: None, error: "flaky" } },
            |_| true,
            |_, _, _| {},
        )
        .await;
        match outcome {
            RetryOutcome::Canceled {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 1);
                assert_eq!(last_error, Some("flaky"));
            }
            other => panic!("expected Canceled, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_classified_gives_up_with_kind_and_attempts() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: std::result::Result<(), RetryFailure> =
            execute_classified(&policy(3), Classifier::github(), &cancel, "test.op", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(network_error()) }
            })
            .await;
        let failure = result.unwrap_err();
        assert_eq!(failure.kind(), Some(ErrorKind::Network));
        assert_eq!(failure.attempts(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(failure.to_string().starts_with("failed after 3 attempt(s): network error"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_classified_stops_on_auth() {
        let cancel = CancellationToken::new();
        let result: std::result::Result<(), RetryFailure> =
            execute_classified(&policy(5), Classifier::github(), &cancel, "test.op", |_| async {
                Err::<(), _>(PrflowError::AuthFailed("bad token".into()))
            })
            .await;
        let failure = result.unwrap_err();
        assert_eq!(failure.kind(), Some(ErrorKind::Auth));
        assert_eq!(failure.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_classified_push_does_not_retry_unknown() {
        let cancel = CancellationToken::new();
        let result: std::result::Result<(), RetryFailure> =
            execute_classified(&policy(5), Classifier::push(), &cancel, "test.push", |_| async {
                Err::<(), _>(PrflowError::Git("hook declined".into()))
            })
            .await;
        let failure = result.unwrap_err();
        assert_eq!(failure.kind(), Some(ErrorKind::Other));
        assert_eq!(failure.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_classified_recovers() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let value = execute_classified(&policy(3), Classifier::github(), &cancel, "test.op", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(PrflowError::RateLimited("slow down".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
