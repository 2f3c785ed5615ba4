//! Pull-request creation through the `gh` CLI.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::classify::Classifier;
use crate::error::{PrflowError, Result};
use crate::exec::CommandExecutor;
use crate::retry::{execute_classified, RetryFailure, RetryPolicy};

/// Parameters for `gh pr create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrRequest {
    pub title: String,
    pub body: String,
    pub base: String,
    pub head: String,
    #[serde(default)]
    pub draft: bool,
}

impl PrRequest {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "pr".to_string(),
            "create".to_string(),
            "--title".to_string(),
            self.title.clone(),
            "--body".to_string(),
            self.body.clone(),
            "--base".to_string(),
            self.base.clone(),
            "--head".to_string(),
            self.head.clone(),
        ];
        if self.draft {
            args.push("--draft".to_string());
        }
        args
    }
}

/// A pull request known to GitHub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    /// `false` when `gh` reported that a PR for the head branch already existed.
    pub created: bool,
}

/// Extract the PR number from a `.../pull/<n>` URL.
pub fn parse_pr_number(url: &str) -> Option<u64> {
    let (_, tail) = url.trim().rsplit_once("/pull/")?;
    tail.split(['/', '#', '?']).next()?.parse().ok()
}

fn find_pr_url(text: &str) -> Option<&str> {
    text.lines()
        .map(str::trim)
        .filter(|line| line.starts_with("https://") || line.starts_with("http://"))
        .find(|line| parse_pr_number(line).is_some())
}

/// `gh` driven through a [`CommandExecutor`].
#[derive(Clone)]
pub struct GhClient {
    executor: Arc<dyn CommandExecutor>,
    repo_dir: PathBuf,
    policy: RetryPolicy,
}

impl GhClient {
    pub fn new(executor: Arc<dyn CommandExecutor>, repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            executor,
            repo_dir: repo_dir.into(),
            policy: RetryPolicy::github(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Create a pull request, retrying transient `gh` failures.
    ///
    /// If `gh` reports that a PR for the head branch already exists, that PR
    /// is returned with `created: false` instead of failing.
    pub async fn create_pr(
        &self,
        cancel: &CancellationToken,
        request: &PrRequest,
    ) -> std::result::Result<PullRequest, RetryFailure> {
        let args = request.args();
        let pr = execute_classified(
            &self.policy,
            Classifier::github(),
            cancel,
            "gh.pr_create",
            |_| self.create_once(cancel, &args),
        )
        .await?;

        tracing::info!(
            event = "gh.pr_ready",
            number = pr.number,
            url = %pr.url,
            created = pr.created,
        );
        Ok(pr)
    }

    async fn create_once(&self, cancel: &CancellationToken, args: &[String]) -> Result<PullRequest> {
        match self.executor.run(cancel, &self.repo_dir, "gh", args).await {
            Ok(stdout) => {
                let stdout = String::from_utf8_lossy(&stdout);
                let url = find_pr_url(&stdout).ok_or_else(|| {
                    PrflowError::Parse(format!("no pull request URL in gh output: {stdout}"))
                })?;
                Ok(PullRequest {
                    number: parse_pr_number(url).unwrap_or_default(),
                    url: url.to_string(),
                    created: true,
                })
            }
            Err(PrflowError::CommandFailed { ref stderr, .. })
                if stderr.to_lowercase().contains("already exists") =>
            {
                match find_pr_url(stderr) {
                    Some(url) => Ok(PullRequest {
                        number: parse_pr_number(url).unwrap_or_default(),
                        url: url.to_string(),
                        created: false,
                    }),
                    None => Err(PrflowError::Parse(format!(
                        "gh reported an existing pull request without a URL: {stderr}"
                    ))),
                }
            }
            Err(err) => Err(err),
        }
    }
}
