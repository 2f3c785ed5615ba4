//! Git integration: repository state queries and retried pushes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::classify::Classifier;
use crate::error::{PrflowError, Result};
use crate::exec::CommandExecutor;
use crate::retry::{execute_classified, RetryFailure, RetryPolicy};

/// What to push and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRequest {
    pub remote: String,
    pub branch: String,
    pub set_upstream: bool,
    pub force_with_lease: bool,
}

impl PushRequest {
    pub fn new(remote: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            branch: branch.into(),
            set_upstream: false,
            force_with_lease: false,
        }
    }

    pub fn set_upstream(mut self) -> Self {
        self.set_upstream = true;
        self
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["push".to_string()];
        if self.set_upstream {
            args.push("--set-upstream".to_string());
        }
        if self.force_with_lease {
            args.push("--force-with-lease".to_string());
        }
        args.push(self.remote.clone());
        args.push(self.branch.clone());
        args
    }
}

/// Successful push summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushReport {
    pub remote: String,
    pub branch: String,
}

/// `git` driven through a [`CommandExecutor`].
///
/// Pushes use the push classifier: deadlines are `Timeout` and unclassified
/// failures are not retried.
#[derive(Clone)]
pub struct GitClient {
    executor: Arc<dyn CommandExecutor>,
    repo_dir: PathBuf,
    push_policy: RetryPolicy,
}

impl GitClient {
    pub fn new(executor: Arc<dyn CommandExecutor>, repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            repo_dir: repo_dir.into(),
            push_policy: RetryPolicy::push(),
        }
    }

    pub fn with_push_policy(mut self, policy: RetryPolicy) -> Self {
        self.push_policy = policy;
        self
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    async fn git(&self, cancel: &CancellationToken, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let out = self
            .executor
            .run(cancel, &self.repo_dir, "git", &args)
            .await?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    /// Capture the HEAD commit SHA.
    pub async fn head_sha(&self, cancel: &CancellationToken) -> Result<String> {
        let sha = self.git(cancel, &["rev-parse", "HEAD"]).await?;
        if sha.is_empty() {
            return Err(PrflowError::Git(
                "git rev-parse HEAD returned empty output".to_string(),
            ));
        }
        Ok(sha)
    }

    /// Name of the checked-out branch. Detached HEAD is an error.
    pub async fn current_branch(&self, cancel: &CancellationToken) -> Result<String> {
        let branch = self
            .git(cancel, &["rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        if branch.is_empty() || branch == "HEAD" {
            return Err(PrflowError::Git("HEAD is detached".to_string()));
        }
        Ok(branch)
    }

    /// Push with retries.
    pub async fn push(
        &self,
        cancel: &CancellationToken,
        request: &PushRequest,
    ) -> std::result::Result<PushReport, RetryFailure> {
        let args = request.args();
        execute_classified(
            &self.push_policy,
            Classifier::push(),
            cancel,
            "git.push",
            |_| {
                let args = &args;
                async move {
                    self.executor
                        .run(cancel, &self.repo_dir, "git", args)
                        .await
                        .map(|_| ())
                }
            },
        )
        .await?;

        tracing::info!(
            event = "git.pushed",
            remote = %request.remote,
            branch = %request.branch,
        );
        Ok(PushReport {
            remote: request.remote.clone(),
            branch: request.branch.clone(),
        })
    }
}
