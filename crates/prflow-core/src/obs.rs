//! Structured observability hooks for retries and CI watches.
//!
//! This module provides:
//! - a watch-scoped tracing span via [`watch_span`]
//! - emission functions for retry and CI-watch lifecycle events
//!
//! Events are emitted at `info!`/`warn!` level; filter with `RUST_LOG`.

use std::fmt::Display;
use std::time::Duration;

use tracing::{info, warn, Span};

use crate::classify::ErrorKind;

/// Span tagged with the watched target. Attach with `Instrument::instrument`
/// so it stays correct across `.await` points.
pub fn watch_span(target_id: u64) -> Span {
    tracing::info_span!("prflow.ci_watch", target_id = target_id)
}

/// Emit event: an attempt failed and the engine is about to back off.
pub fn emit_retry_wait(
    operation: &str,
    attempt: u32,
    delay: Duration,
    kind: ErrorKind,
    error: &dyn Display,
) {
    warn!(
        event = "retry.wait",
        operation = %operation,
        attempt = attempt,
        delay_ms = delay.as_millis() as u64,
        kind = %kind,
        error = %error,
    );
}

/// Emit event: the engine stopped after a failed attempt.
pub fn emit_retry_gave_up(operation: &str, attempts: u32, kind: ErrorKind, error: &dyn Display) {
    warn!(
        event = "retry.gave_up",
        operation = %operation,
        attempts = attempts,
        kind = %kind,
        error = %error,
    );
}

/// Emit event: cancellation observed by the retry engine.
pub fn emit_retry_canceled(operation: &str, attempts: u32) {
    info!(event = "retry.canceled", operation = %operation, attempts = attempts);
}

/// Emit event: one CI poll completed with a non-terminal aggregate.
pub fn emit_ci_poll(elapsed: Duration, total: usize, pending: usize, failing: usize) {
    info!(
        event = "ci.poll",
        elapsed_secs = elapsed.as_secs(),
        total = total,
        pending = pending,
        failing = failing,
    );
}

/// Emit event: no checks registered yet, still inside the grace period.
pub fn emit_ci_grace_wait(elapsed: Duration, grace_period: Duration) {
    info!(
        event = "ci.grace_wait",
        elapsed_secs = elapsed.as_secs(),
        grace_secs = grace_period.as_secs(),
    );
}

/// Emit event: primary fetch failed, consulting the coarse status.
pub fn emit_ci_fallback(kind: ErrorKind, error: &dyn Display) {
    warn!(event = "ci.fallback", kind = %kind, error = %error);
}

/// Emit event: watch reached a terminal status.
pub fn emit_ci_terminal(status: &str, elapsed: Duration, checks: usize) {
    info!(
        event = "ci.terminal",
        status = %status,
        elapsed_secs = elapsed.as_secs(),
        checks = checks,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emitters_do_not_panic_without_subscriber() {
        let _entered = watch_span(42).entered();
        emit_retry_wait("gh.pr_checks", 1, Duration::from_secs(1), ErrorKind::Network, &"reset");
        emit_retry_gave_up("gh.pr_checks", 3, ErrorKind::Network, &"reset");
        emit_retry_canceled("gh.pr_checks", 2);
        emit_ci_poll(Duration::from_secs(120), 4, 2, 0);
        emit_ci_grace_wait(Duration::from_secs(10), Duration::from_secs(120));
        emit_ci_fallback(ErrorKind::RateLimit, &"slow down");
        emit_ci_terminal("success", Duration::from_secs(300), 4);
    }
}
