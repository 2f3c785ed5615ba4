//! prflow - Git/GitHub workflow automation CLI
//!
//! The `prflow` command pushes branches, opens pull requests, and watches
//! CI, retrying transient failures and failing fast on the rest.
//!
//! ## Commands
//!
//! - `watch-ci`: Poll a pull request's checks until they settle
//! - `push`: Push a branch with retries
//! - `create-pr`: Open a pull request (or find the existing one)
//! - `classify`: Show how an error message would be classified
//!
//! ## Exit codes for `watch-ci`
//!
//! | code | meaning                                  |
//! |------|------------------------------------------|
//! | 0    | all required checks passed (or no CI)    |
//! | 1    | a required check failed                  |
//! | 2    | timed out with checks still pending      |
//! | 3    | checks could not be fetched              |
//! | 4    | invalid configuration or fatal error     |
//! | 130  | interrupted                              |

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use prflow_ci::{CheckBucket, CiWatchOptions, CiWatcher, GhCheckSource, WatchError, WatchStatus};
use prflow_core::{
    classify_message, Classifier, CommandExecutor, ErrorKind, GhClient, GitClient, PrRequest,
    ProcessExecutor, PushRequest,
};

const EXIT_FAILURE: u8 = 1;
const EXIT_TIMEOUT: u8 = 2;
const EXIT_FETCH_ERROR: u8 = 3;
const EXIT_FATAL: u8 = 4;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "prflow")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Resilient Git/GitHub automation for coding agents", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines on stderr and JSON results on stdout
    #[arg(long, global = true, env = "PRFLOW_JSON")]
    json: bool,

    /// Repository to operate on
    #[arg(long, global = true, env = "PRFLOW_REPO", default_value = ".")]
    repo: PathBuf,

    /// Deadline for each individual git/gh invocation, in seconds
    #[arg(long, global = true, env = "PRFLOW_COMMAND_TIMEOUT", default_value_t = 120)]
    command_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch CI checks on a pull request until they pass, fail, or time out
    WatchCi(WatchArgs),

    /// Push a branch, retrying transient network failures
    Push {
        /// Branch to push (default: current branch)
        branch: Option<String>,

        /// Remote to push to
        #[arg(short, long, default_value = "origin")]
        remote: String,

        /// Set the remote as upstream
        #[arg(short = 'u', long)]
        set_upstream: bool,

        /// Use --force-with-lease
        #[arg(long)]
        force_with_lease: bool,
    },

    /// Create a pull request, reusing an existing one for the same head
    CreatePr {
        /// PR title
        #[arg(short, long)]
        title: String,

        /// PR body
        #[arg(short, long, default_value = "")]
        body: String,

        /// Base branch
        #[arg(long, default_value = "main", env = "PRFLOW_BASE")]
        base: String,

        /// Head branch (default: current branch)
        #[arg(long)]
        head: Option<String>,

        /// Open as draft
        #[arg(long)]
        draft: bool,
    },

    /// Classify an error message and show the retry decision
    Classify {
        /// Error text, e.g. captured stderr
        message: String,
    },
}

#[derive(Args, Debug, Clone)]
struct WatchArgs {
    /// Pull request number
    pr: u64,

    /// Required check name; a trailing `*` matches by prefix (repeatable)
    #[arg(long = "require", value_delimiter = ',', env = "PRFLOW_REQUIRED_CHECKS")]
    required: Vec<String>,

    /// Seconds between polls while checks are pending
    #[arg(long, default_value_t = 120, env = "PRFLOW_POLL_INTERVAL")]
    poll_interval: u64,

    /// Overall timeout in seconds
    #[arg(long, default_value_t = 1800, env = "PRFLOW_CI_TIMEOUT")]
    timeout: u64,

    /// Seconds to wait for CI to register checks before assuming there is none
    #[arg(long, default_value_t = 120, env = "PRFLOW_GRACE_PERIOD")]
    grace_period: u64,

    /// Seconds between polls during the grace period
    #[arg(long, default_value_t = 10, env = "PRFLOW_GRACE_POLL_INTERVAL")]
    grace_poll_interval: u64,

    /// Ring the terminal bell when CI passes or fails
    #[arg(long, env = "PRFLOW_BELL")]
    bell: bool,
}

impl WatchArgs {
    fn to_options(&self) -> CiWatchOptions {
        CiWatchOptions {
            target_id: self.pr,
            poll_interval: Duration::from_secs(self.poll_interval),
            timeout: Duration::from_secs(self.timeout),
            required_checks: self.required.clone(),
            grace_period: Duration::from_secs(self.grace_period),
            grace_poll_interval: Duration::from_secs(self.grace_poll_interval),
            bell_on_terminal: self.bell,
            ..CiWatchOptions::default()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    prflow_core::init_tracing(cli.json, level);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let executor: Arc<dyn CommandExecutor> = Arc::new(ProcessExecutor::with_timeout(
        Duration::from_secs(cli.command_timeout),
    ));

    let result = match cli.command {
        Commands::WatchCi(args) => cmd_watch_ci(executor, &cli.repo, &args, cli.json, &cancel).await,
        Commands::Push {
            branch,
            remote,
            set_upstream,
            force_with_lease,
        } => {
            cmd_push(
                executor,
                &cli.repo,
                branch,
                remote,
                set_upstream,
                force_with_lease,
                cli.json,
                &cancel,
            )
            .await
        }
        Commands::CreatePr {
            title,
            body,
            base,
            head,
            draft,
        } => {
            cmd_create_pr(
                executor, &cli.repo, title, body, base, head, draft, cli.json, &cancel,
            )
            .await
        }
        Commands::Classify { message } => cmd_classify(&message, cli.json),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if cancel.is_cancelled() {
                ExitCode::from(EXIT_INTERRUPTED)
            } else {
                ExitCode::from(EXIT_FAILURE)
            }
        }
    }
}

fn cancel_on_ctrl_c(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(event = "cli.interrupted", "received Ctrl-C, canceling");
            cancel.cancel();
        }
    });
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

fn watch_exit_code(status: WatchStatus) -> u8 {
    match status {
        WatchStatus::Success => 0,
        WatchStatus::Failure => EXIT_FAILURE,
        WatchStatus::Timeout | WatchStatus::Pending => EXIT_TIMEOUT,
        WatchStatus::FetchError => EXIT_FETCH_ERROR,
    }
}

fn watch_error_exit_code(err: &WatchError) -> u8 {
    match err {
        WatchError::Canceled => EXIT_INTERRUPTED,
        WatchError::InvalidOptions(_)
        | WatchError::RequiredChecksNotFound(_)
        | WatchError::Fatal(_) => EXIT_FATAL,
    }
}

async fn cmd_watch_ci(
    executor: Arc<dyn CommandExecutor>,
    repo: &Path,
    args: &WatchArgs,
    json: bool,
    cancel: &CancellationToken,
) -> Result<ExitCode> {
    let options = args.to_options();
    let source = Arc::new(GhCheckSource::new(executor, repo));
    let watcher = CiWatcher::new(source).on_progress(move |elapsed, checks| {
        if !json {
            let pending = checks
                .iter()
                .filter(|c| matches!(c.bucket, CheckBucket::Pending | CheckBucket::Unknown))
                .count();
            eprintln!(
                "[{:>4}s] {} check(s), {} pending",
                elapsed.as_secs(),
                checks.len(),
                pending
            );
        }
    });

    let outcome = match watcher.watch(&options, cancel).await {
        Ok(outcome) => outcome,
        Err(err) => {
            eprintln!("Error: {err}");
            return Ok(ExitCode::from(watch_error_exit_code(&err)));
        }
    };

    if json {
        print_json(&outcome)?;
    } else {
        println!(
            "CI {} for PR #{} after {}s",
            outcome.status.as_str(),
            options.target_id,
            outcome.elapsed.as_secs()
        );
        for check in &outcome.checks {
            println!("  {:<8} {}", check.bucket.name(), check.name);
        }
        if let Some(err) = &outcome.error {
            println!("  error: {err}");
        }
    }

    Ok(ExitCode::from(watch_exit_code(outcome.status)))
}

#[allow(clippy::too_many_arguments)]
async fn cmd_push(
    executor: Arc<dyn CommandExecutor>,
    repo: &Path,
    branch: Option<String>,
    remote: String,
    set_upstream: bool,
    force_with_lease: bool,
    json: bool,
    cancel: &CancellationToken,
) -> Result<ExitCode> {
    let git = GitClient::new(executor, repo);
    let branch = match branch {
        Some(branch) => branch,
        None => git
            .current_branch(cancel)
            .await
            .context("Failed to determine current branch")?,
    };

    let mut request = PushRequest::new(remote, branch);
    request.set_upstream = set_upstream;
    request.force_with_lease = force_with_lease;

    let report = git.push(cancel, &request).await.context("Push failed")?;

    if json {
        print_json(&report)?;
    } else {
        println!("Pushed {} to {}", report.branch, report.remote);
    }
    Ok(ExitCode::SUCCESS)
}

#[allow(clippy::too_many_arguments)]
async fn cmd_create_pr(
    executor: Arc<dyn CommandExecutor>,
    repo: &Path,
    title: String,
    body: String,
    base: String,
    head: Option<String>,
    draft: bool,
    json: bool,
    cancel: &CancellationToken,
) -> Result<ExitCode> {
    let head = match head {
        Some(head) => head,
        None => GitClient::new(executor.clone(), repo)
            .current_branch(cancel)
            .await
            .context("Failed to determine head branch")?,
    };

    let request = PrRequest {
        title,
        body,
        base,
        head,
        draft,
    };
    let pr = GhClient::new(executor, repo)
        .create_pr(cancel, &request)
        .await
        .context("Failed to create pull request")?;

    if json {
        print_json(&pr)?;
    } else if pr.created {
        println!("Created PR #{}: {}", pr.number, pr.url);
    } else {
        println!("PR #{} already exists: {}", pr.number, pr.url);
    }
    info!(event = "cli.pr_done", number = pr.number);
    Ok(ExitCode::SUCCESS)
}

#[derive(Debug, Serialize)]
struct ClassifyReport {
    kind: ErrorKind,
    fatal: bool,
    retried_by_github_calls: bool,
    retried_by_push: bool,
}

fn classify_report(message: &str) -> ClassifyReport {
    let kind = classify_message(message);
    ClassifyReport {
        kind,
        fatal: kind.is_fatal(),
        retried_by_github_calls: Classifier::github().should_retry(kind),
        retried_by_push: Classifier::push().should_retry(kind),
    }
}

fn cmd_classify(message: &str, json: bool) -> Result<ExitCode> {
    let report = classify_report(message);
    if json {
        print_json(&report)?;
    } else {
        println!("kind:            {}", report.kind);
        println!("fatal:           {}", report.fatal);
        println!("retry (github):  {}", report.retried_by_github_calls);
        println!("retry (push):    {}", report.retried_by_push);
    }
    Ok(ExitCode::SUCCESS)
}
