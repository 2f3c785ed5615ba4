//! CI check results and parsing of `gh` JSON output.

use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use prflow_core::{PrflowError, Result};
use serde::{Deserialize, Serialize};

/// Categorised state of a single check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckBucket {
    Pass,
    Fail,
    Pending,
    Cancel,
    Skip,
    Unknown,
}

impl CheckBucket {
    /// Parse the `bucket` field emitted by `gh pr checks --json`.
    pub fn from_gh_bucket(bucket: &str) -> Self {
        match bucket.trim().to_ascii_lowercase().as_str() {
            "pass" => CheckBucket::Pass,
            "fail" => CheckBucket::Fail,
            "pending" => CheckBucket::Pending,
            "cancel" => CheckBucket::Cancel,
            "skipping" | "skip" => CheckBucket::Skip,
            _ => CheckBucket::Unknown,
        }
    }

    /// Derive a bucket from a raw check-run conclusion or status-context state.
    pub fn from_state(state: &str) -> Self {
        match state.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" | "PASS" => CheckBucket::Pass,
            "FAILURE" | "ERROR" | "TIMED_OUT" | "ACTION_REQUIRED" | "STARTUP_FAILURE"
            | "STALE" => CheckBucket::Fail,
            "CANCELLED" | "CANCELED" => CheckBucket::Cancel,
            "SKIPPED" | "NEUTRAL" => CheckBucket::Skip,
            "PENDING" | "QUEUED" | "IN_PROGRESS" | "WAITING" | "REQUESTED" | "EXPECTED" => {
                CheckBucket::Pending
            }
            _ => CheckBucket::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CheckBucket::Pass => "pass",
            CheckBucket::Fail => "fail",
            CheckBucket::Pending => "pending",
            CheckBucket::Cancel => "cancel",
            CheckBucket::Skip => "skip",
            CheckBucket::Unknown => "unknown",
        }
    }
}

/// One check as observed on a single poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckResult {
    pub name: String,
    /// State string exactly as reported.
    pub raw_state: String,
    pub bucket: CheckBucket,
    pub url: String,
    pub workflow: String,
    /// Zero until the check has both started and completed.
    pub duration: Duration,
}

impl CheckResult {
    pub fn new(name: impl Into<String>, bucket: CheckBucket) -> Self {
        Self {
            name: name.into(),
            raw_state: bucket.name().to_ascii_uppercase(),
            bucket,
            url: String::new(),
            workflow: String::new(),
            duration: Duration::ZERO,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhCheck {
    name: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    bucket: String,
    #[serde(default)]
    link: String,
    #[serde(default)]
    workflow: String,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    completed_at: Option<DateTime<Utc>>,
}

/// `gh` uses the zero time (`0001-01-01T00:00:00Z`) for unset timestamps.
fn real_time(ts: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    ts.filter(|t| t.year() > 1970)
}

impl From<GhCheck> for CheckResult {
    fn from(check: GhCheck) -> Self {
        let bucket = if check.bucket.is_empty() {
            CheckBucket::from_state(&check.state)
        } else {
            CheckBucket::from_gh_bucket(&check.bucket)
        };
        let duration = match (real_time(check.started_at), real_time(check.completed_at)) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        };
        CheckResult {
            name: check.name,
            raw_state: check.state,
            bucket,
            url: check.link,
            workflow: check.workflow,
            duration,
        }
    }
}

/// Fields requested from `gh pr checks --json`.
pub const GH_CHECK_FIELDS: &str = "name,state,bucket,link,workflow,startedAt,completedAt";

/// Parse `gh pr checks <n> --json ...` output.
pub fn parse_gh_checks(json: &[u8]) -> Result<Vec<CheckResult>> {
    let checks: Vec<GhCheck> = serde_json::from_slice(json)?;
    Ok(checks.into_iter().map(CheckResult::from).collect())
}

/// Coarse status from the PR's status-check rollup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RollupStatus {
    Success,
    Failure,
    Pending,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GhRollup {
    #[serde(default)]
    status_check_rollup: Vec<GhRollupEntry>,
}

#[derive(Debug, Deserialize)]
struct GhRollupEntry {
    /// Check runs carry `status` + `conclusion`.
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    conclusion: Option<String>,
    /// Commit status contexts carry `state`.
    #[serde(default)]
    state: Option<String>,
}

impl GhRollupEntry {
    fn bucket(&self) -> CheckBucket {
        if let Some(state) = self.state.as_deref().filter(|s| !s.is_empty()) {
            return CheckBucket::from_state(state);
        }
        match self.status.as_deref() {
            Some(status) if status.eq_ignore_ascii_case("COMPLETED") => self
                .conclusion
                .as_deref()
                .map(CheckBucket::from_state)
                .unwrap_or(CheckBucket::Unknown),
            Some(status) => CheckBucket::from_state(status),
            None => CheckBucket::Unknown,
        }
    }
}

/// Parse `gh pr view <n> --json statusCheckRollup` output.
///
/// An empty rollup is reported as [`PrflowError::NoChecksReported`]; it says
/// nothing about whether CI exists.
pub fn parse_gh_rollup(json: &[u8]) -> Result<RollupStatus> {
    let rollup: GhRollup = serde_json::from_slice(json)?;
    if rollup.status_check_rollup.is_empty() {
        return Err(PrflowError::NoChecksReported(
            "status check rollup is empty".to_string(),
        ));
    }
    let buckets: Vec<CheckBucket> = rollup
        .status_check_rollup
        .iter()
        .map(GhRollupEntry::bucket)
        .collect();
    if buckets
        .iter()
        .any(|b| matches!(b, CheckBucket::Fail | CheckBucket::Cancel))
    {
        Ok(RollupStatus::Failure)
    } else if buckets
        .iter()
        .any(|b| matches!(b, CheckBucket::Pending | CheckBucket::Unknown))
    {
        Ok(RollupStatus::Pending)
    } else {
        Ok(RollupStatus::Success)
    }
}
