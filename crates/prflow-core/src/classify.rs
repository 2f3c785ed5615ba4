//! Error classification into a closed, retry-relevant taxonomy.
//!
//! Classification is two-tier:
//! 1. typed sentinels anywhere in the error's source chain
//!    ([`PrflowError`] variants, deadline errors, an already-classified
//!    [`RetryFailure`]);
//! 2. case-insensitive substring matching of the full error text against
//!    fixed pattern tables, checked in a fixed priority order.
//!
//! Anything that matches neither tier is [`ErrorKind::Other`].

use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PrflowError;
use crate::retry::RetryFailure;

/// Retry-relevant category assigned to every failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No error.
    None,
    Auth,
    RateLimit,
    Network,
    Timeout,
    NotFound,
    NonFastForward,
    /// CI has not registered any checks yet.
    NoSignalYet,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::None => "none",
            ErrorKind::Auth => "authentication failed",
            ErrorKind::RateLimit => "rate limited",
            ErrorKind::Network => "network error",
            ErrorKind::Timeout => "timed out",
            ErrorKind::NotFound => "not found",
            ErrorKind::NonFastForward => "non-fast-forward",
            ErrorKind::NoSignalYet => "no CI signal yet",
            ErrorKind::Other => "unclassified error",
        }
    }

    /// Default retry eligibility. `Other` is retryable here; call sites that
    /// treat unknown errors as structural override it via [`Classifier`].
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit | ErrorKind::Network | ErrorKind::Timeout | ErrorKind::Other
        )
    }

    /// Kinds that no amount of waiting will fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorKind::Auth | ErrorKind::NotFound | ErrorKind::NonFastForward
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit exceeded",
    "api rate limit",
    "secondary rate limit",
    "rate limited",
    "too many requests",
    "http 429",
    "abuse detection",
];

pub const AUTH_PATTERNS: &[&str] = &[
    "authentication required",
    "authentication failed",
    "bad credentials",
    "permission denied",
    "requires authentication",
    "could not read username",
    "invalid username or password",
    "terminal prompts disabled",
    "gh auth login",
    "not logged into any",
    "resource not accessible by integration",
    "http 401",
    "http 403",
];

pub const NETWORK_PATTERNS: &[&str] = &[
    "could not resolve host",
    "temporary failure in name resolution",
    "connection refused",
    "connection reset",
    "connection timed out",
    "operation timed out",
    "i/o timeout",
    "network is unreachable",
    "no route to host",
    "tls handshake timeout",
    "ssl_error",
    "the remote end hung up unexpectedly",
    "unexpected disconnect",
    "early eof",
    "error connecting to",
    "http 500",
    "http 502",
    "http 503",
    "http 504",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
];

pub const NOT_FOUND_PATTERNS: &[&str] = &[
    "not found",
    "does not exist",
    "could not find",
    "couldn't find remote ref",
    "does not appear to be a git repository",
    "no pull requests found",
    "unknown revision",
    "http 404",
];

pub const NON_FAST_FORWARD_PATTERNS: &[&str] = &[
    "non-fast-forward",
    "[rejected]",
    "updates were rejected",
    "fetch first",
    "tip of your current branch is behind",
];

pub const NO_SIGNAL_PATTERNS: &[&str] = &["no checks reported", "no status checks"];

/// Pattern tables in priority order. The first table with a hit wins.
const PATTERN_TABLES: &[(ErrorKind, &[&str])] = &[
    (ErrorKind::RateLimit, RATE_LIMIT_PATTERNS),
    (ErrorKind::Auth, AUTH_PATTERNS),
    (ErrorKind::Network, NETWORK_PATTERNS),
    (ErrorKind::NotFound, NOT_FOUND_PATTERNS),
    (ErrorKind::NonFastForward, NON_FAST_FORWARD_PATTERNS),
    (ErrorKind::NoSignalYet, NO_SIGNAL_PATTERNS),
];

/// Classify free-form error text using the pattern tables only.
pub fn classify_message(message: &str) -> ErrorKind {
    let lowered = message.to_lowercase();
    PATTERN_TABLES
        .iter()
        .find(|(_, patterns)| patterns.iter().any(|p| lowered.contains(p)))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::Other)
}

/// Call-site flavoured classifier.
///
/// GitHub calls treat a deadline as `Network` and retry `Other`; push calls
/// treat a deadline as `Timeout` and do not retry `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classifier {
    deadline_kind: ErrorKind,
    retry_other: bool,
}

impl Classifier {
    pub const fn github() -> Self {
        Self {
            deadline_kind: ErrorKind::Network,
            retry_other: true,
        }
    }

    pub const fn push() -> Self {
        Self {
            deadline_kind: ErrorKind::Timeout,
            retry_other: false,
        }
    }

    /// Classify an optional error; `None` maps to [`ErrorKind::None`].
    pub fn classify_opt(&self, err: Option<&(dyn StdError + 'static)>) -> ErrorKind {
        match err {
            Some(err) => self.classify(err),
            None => ErrorKind::None,
        }
    }

    pub fn classify(&self, err: &(dyn StdError + 'static)) -> ErrorKind {
        if let Some(kind) = chain(err).find_map(|e| self.sentinel_kind(e)) {
            return kind;
        }
        let text = chain(err)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(": ");
        classify_message(&text)
    }

    /// Retry decision for an already-classified failure.
    pub fn should_retry(&self, kind: ErrorKind) -> bool {
        match kind {
            ErrorKind::Other => self.retry_other,
            kind => kind.is_retryable(),
        }
    }

    fn sentinel_kind(&self, err: &(dyn StdError + 'static)) -> Option<ErrorKind> {
        if let Some(err) = err.downcast_ref::<PrflowError>() {
            return match err {
                PrflowError::AuthFailed(_) => Some(ErrorKind::Auth),
                PrflowError::RateLimited(_) => Some(ErrorKind::RateLimit),
                PrflowError::NotFound(_) => Some(ErrorKind::NotFound),
                PrflowError::NonFastForward(_) => Some(ErrorKind::NonFastForward),
                PrflowError::NoChecksReported(_) => Some(ErrorKind::NoSignalYet),
                PrflowError::DeadlineExceeded { .. } | PrflowError::Canceled => {
                    Some(self.deadline_kind)
                }
                _ => None,
            };
        }
        if let Some(failure) = err.downcast_ref::<RetryFailure>() {
            return Some(failure.kind().unwrap_or(self.deadline_kind));
        }
        if err.is::<tokio::time::error::Elapsed>() {
            return Some(self.deadline_kind);
        }
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return Some(self.deadline_kind);
            }
        }
        None
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::github()
    }
}

fn chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |&e| e.source())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn gh_failure(stderr: &str) -> PrflowError {
        PrflowError::CommandFailed {
            program: "gh".to_string(),
            args: vec!["pr".to_string(), "checks".to_string()],
            exit_code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_reference_messages() {
        assert_eq!(classify_message("API rate limit exceeded"), ErrorKind::RateLimit);
        assert_eq!(classify_message("authentication required"), ErrorKind::Auth);
        assert_eq!(classify_message("connection refused"), ErrorKind::Network);
        assert_eq!(classify_message("branch does not exist"), ErrorKind::NotFound);
        assert_eq!(classify_message("some never-seen text"), ErrorKind::Other);
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        assert_eq!(
            classify_message("fatal: Could not resolve host: github.com"),
            ErrorKind::Network
        );
        assert_eq!(
            classify_message("No checks reported on the 'feature/x' branch"),
            ErrorKind::NoSignalYet
        );
    }

    #[test]
    fn test_rate_limit_wins_over_auth_cues() {
        // GitHub reports secondary rate limits as 403s.
        assert_eq!(
            classify_message("HTTP 403: You have exceeded a secondary rate limit"),
            ErrorKind::RateLimit
        );
    }

    #[test]
    fn test_network_wins_over_not_found_cues() {
        assert_eq!(
            classify_message("error connecting to api.github.com: host not found"),
            ErrorKind::Network
        );
    }

    #[test]
    fn test_rejected_push_is_non_fast_forward() {
        let stderr = " ! [rejected]        main -> main (fetch first)\n\
                      error: failed to push some refs to '/tmp/remote.git'\n\
                      hint: Updates were rejected because the remote contains work";
        assert_eq!(classify_message(stderr), ErrorKind::NonFastForward);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let err = gh_failure("HTTP 502: Bad Gateway (https://api.github.com/graphql)");
        let classifier = Classifier::github();
        let first = classifier.classify(&err);
        for _ in 0..10 {
            assert_eq!(classifier.classify(&err), first);
        }
        assert_eq!(first, ErrorKind::Network);
    }

    #[test]
    fn test_no_error_is_none() {
        assert_eq!(Classifier::github().classify_opt(None), ErrorKind::None);
    }

    #[test]
    fn test_typed_sentinel_beats_text() {
        let err = PrflowError::AuthFailed("rate limit exceeded while refreshing token".into());
        assert_eq!(Classifier::github().classify(&err), ErrorKind::Auth);

        let err = PrflowError::NoChecksReported("connection refused".into());
        assert_eq!(Classifier::github().classify(&err), ErrorKind::NoSignalYet);
    }

    #[test]
    fn test_deadline_convention_differs_per_call_site() {
        let err = PrflowError::DeadlineExceeded {
            program: "gh".to_string(),
            limit: Duration::from_secs(30),
        };
        assert_eq!(Classifier::github().classify(&err), ErrorKind::Network);
        assert_eq!(Classifier::push().classify(&err), ErrorKind::Timeout);

        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline");
        assert_eq!(Classifier::github().classify(&io), ErrorKind::Network);
        assert_eq!(Classifier::push().classify(&io), ErrorKind::Timeout);
    }

    #[test]
    fn test_sentinel_found_in_source_chain() {
        let err = PrflowError::Spawn {
            program: "gh".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "spawn stalled"),
        };
        assert_eq!(Classifier::push().classify(&err), ErrorKind::Timeout);
    }

    #[test]
    fn test_unclassified_retry_asymmetry() {
        // Unknown gh noise is retried; unknown push failures are structural.
        let err = gh_failure("something odd happened");
        assert_eq!(Classifier::github().classify(&err), ErrorKind::Other);
        assert!(Classifier::github().should_retry(ErrorKind::Other));
        assert!(!Classifier::push().should_retry(ErrorKind::Other));
    }

    #[test]
    fn test_fatal_kinds_never_retried() {
        for classifier in [Classifier::github(), Classifier::push()] {
            assert!(!classifier.should_retry(ErrorKind::Auth));
            assert!(!classifier.should_retry(ErrorKind::NotFound));
            assert!(!classifier.should_retry(ErrorKind::NonFastForward));
            assert!(!classifier.should_retry(ErrorKind::NoSignalYet));
            assert!(classifier.should_retry(ErrorKind::RateLimit));
            assert!(classifier.should_retry(ErrorKind::Network));
            assert!(classifier.should_retry(ErrorKind::Timeout));
        }
    }
}
