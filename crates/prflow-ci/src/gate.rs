//! Required-check filtering and status aggregation.

use serde::{Deserialize, Serialize};

use crate::check::{CheckBucket, CheckResult};

/// Aggregate status of one poll's (filtered) check set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pending,
    Success,
    Failure,
}

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateVerdict {
    pub status: CheckStatus,

    /// Names of checks in the `Fail` or `Cancel` bucket.
    pub failing: Vec<String>,

    /// Names of checks still `Pending` or `Unknown`.
    pub pending: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// Required-check patterns matched no reported check.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("none of the required checks {patterns:?} matched the reported checks {available:?}")]
pub struct NoRequiredChecks {
    pub patterns: Vec<String>,
    pub available: Vec<String>,
}

/// Required-check filter and aggregation rules.
///
/// A pattern matches a check name exactly, or by prefix when it ends in `*`.
/// An empty pattern list selects every check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckGate {
    patterns: Vec<String>,
}

impl CheckGate {
    pub fn new(patterns: Vec<String>) -> Self {
        let patterns = patterns
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        Self { patterns }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn pattern_matches(pattern: &str, name: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => name == pattern,
        }
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| Self::pattern_matches(p, name))
    }

    /// Keep only required checks.
    ///
    /// Fails when patterns were given, checks exist, and none matched: that is
    /// a misconfigured pattern, not a CI result.
    pub fn filter(&self, checks: &[CheckResult]) -> Result<Vec<CheckResult>, NoRequiredChecks> {
        let selected: Vec<CheckResult> = checks
            .iter()
            .filter(|c| self.is_required(&c.name))
            .cloned()
            .collect();

        if selected.is_empty() && !checks.is_empty() && !self.patterns.is_empty() {
            return Err(NoRequiredChecks {
                patterns: self.patterns.clone(),
                available: checks.iter().map(|c| c.name.clone()).collect(),
            });
        }
        Ok(selected)
    }

    /// Aggregate buckets: any Fail/Cancel is a failure, otherwise any
    /// Pending/Unknown is pending, otherwise success.
    pub fn evaluate(checks: &[CheckResult]) -> GateVerdict {
        let mut failing = Vec::new();
        let mut pending = Vec::new();

        for check in checks {
            match check.bucket {
                CheckBucket::Fail | CheckBucket::Cancel => failing.push(check.name.clone()),
                CheckBucket::Pending | CheckBucket::Unknown => pending.push(check.name.clone()),
                CheckBucket::Pass | CheckBucket::Skip => {}
            }
        }

        let (status, message) = if !failing.is_empty() {
            (
                CheckStatus::Failure,
                format!("{} of {} check(s) failed", failing.len(), checks.len()),
            )
        } else if !pending.is_empty() {
            (
                CheckStatus::Pending,
                format!("{} of {} check(s) pending", pending.len(), checks.len()),
            )
        } else {
            (
                CheckStatus::Success,
                format!("all {} check(s) passed", checks.len()),
            )
        };

        GateVerdict {
            status,
            failing,
            pending,
            message,
        }
    }
}
