//! Domain-level error taxonomy for prflow.
//!
//! The sentinel variants (`AuthFailed`, `RateLimited`, `NotFound`,
//! `NonFastForward`, `NoChecksReported`, `DeadlineExceeded`, `Canceled`) are
//! recognised by the classifier before any text matching happens.

use std::time::Duration;

/// prflow domain errors.
#[derive(Debug, thiserror::Error)]
pub enum PrflowError {
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("push rejected (non-fast-forward): {0}")]
    NonFastForward(String),

    #[error("no checks reported: {0}")]
    NoChecksReported(String),

    #[error("`{program}` exceeded its deadline of {}ms", .limit.as_millis())]
    DeadlineExceeded { program: String, limit: Duration },

    #[error("operation canceled")]
    Canceled,

    #[error("`{program} {}` exited with {}: {stderr}", .args.join(" "), exit_label(.exit_code))]
    CommandFailed {
        program: String,
        args: Vec<String>,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("git error: {0}")]
    Git(String),

    #[error("unexpected output: {0}")]
    Parse(String),

    #[error("invalid retry policy: {0}")]
    InvalidPolicy(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "signal".to_string(),
    }
}

impl PrflowError {
    /// Exit code of a failed subprocess, if this error came from one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            PrflowError::CommandFailed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

/// Result type for prflow domain operations.
pub type Result<T> = std::result::Result<T, PrflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_display_includes_stderr() {
        let err = PrflowError::CommandFailed {
            program: "gh".to_string(),
            args: vec!["pr".to_string(), "checks".to_string(), "12".to_string()],
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "HTTP 502: Bad Gateway".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("`gh pr checks 12`"));
        assert!(msg.contains("code 1"));
        assert!(msg.contains("Bad Gateway"));
        assert_eq!(err.exit_code(), Some(1));
    }

    #[test]
    fn test_killed_process_reports_signal() {
        let err = PrflowError::CommandFailed {
            program: "git".to_string(),
            args: vec!["push".to_string()],
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(err.to_string().contains("signal"));
    }

    #[test]
    fn test_deadline_display() {
        let err = PrflowError::DeadlineExceeded {
            program: "git".to_string(),
            limit: Duration::from_secs(2),
        };
        assert!(err.to_string().contains("2000ms"));
    }
}
