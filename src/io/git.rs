//! Git adapter with bounded self-healing.
//!
//! The pipeline must verify that accepted work actually reached the remote,
//! so this wrapper covers status/branch/push inspection plus the three
//! healing moves the scheduler is allowed: clearing a stale `index.lock`,
//! escaping a protected branch, and retrying a push after following a
//! moved-remote redirect or bypassing hooks. Each healing move is attempted
//! at most once per push.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

static MOVED_REMOTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^remote:.*(?:moved|new location).*?(https?://\S+|git@\S+?\.git)")
        .expect("moved-remote regex compiles")
});

/// How a push finally succeeded (or why it failed), including the healing
/// steps taken along the way.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub branch: String,
    pub healed: Vec<String>,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to push)"));
        }
        Ok(name)
    }

    /// Current HEAD short SHA, used as the commit reference in outcomes.
    pub fn head_short_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--short=12", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Checkout `branch`, creating it at HEAD if it does not exist yet.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_or_create(&self, branch: &str) -> Result<()> {
        if self.branch_exists(branch)? {
            self.run_checked(&["checkout", branch])?;
        } else {
            self.run_checked(&["checkout", "-b", branch])?;
        }
        Ok(())
    }

    pub fn remote_url(&self) -> Result<String> {
        let out = self.run_capture(&["remote", "get-url", "origin"])?;
        Ok(out.trim().to_string())
    }

    pub fn set_remote_url(&self, url: &str) -> Result<()> {
        self.run_checked(&["remote", "set-url", "origin", url])?;
        Ok(())
    }

    /// Remove a stale `.git/index.lock` left by a crashed process.
    ///
    /// Only locks older than `max_age` are touched; a younger lock may
    /// belong to a live git invocation.
    #[instrument(skip_all)]
    pub fn heal_stale_index_lock(&self, max_age: Duration) -> Result<bool> {
        let lock_path = self.workdir.join(".git").join("index.lock");
        let metadata = match fs::metadata(&lock_path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("stat index lock {}", lock_path.display()));
            }
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or(Duration::ZERO);
        if age < max_age {
            debug!(age_secs = age.as_secs(), "index.lock too young to heal");
            return Ok(false);
        }
        warn!(age_secs = age.as_secs(), "removing stale index.lock");
        fs::remove_file(&lock_path)
            .with_context(|| format!("remove stale index lock {}", lock_path.display()))?;
        Ok(true)
    }

    /// Verify the current branch is pushed and not diverged from its remote.
    ///
    /// Returns `Ok(true)` when the upstream exists and the branch is neither
    /// ahead nor behind; `Ok(false)` when there is no upstream (needs a
    /// push); an error when the branch has diverged.
    pub fn verify_synced(&self) -> Result<bool> {
        let upstream = self.run(&["rev-parse", "--abbrev-ref", "@{upstream}"])?;
        if !upstream.status.success() {
            return Ok(false);
        }
        let counts = self.run_capture(&["rev-list", "--left-right", "--count", "@{upstream}...HEAD"])?;
        let mut parts = counts.split_whitespace();
        let behind: u64 = parts.next().unwrap_or("0").parse().unwrap_or(0);
        let ahead: u64 = parts.next().unwrap_or("0").parse().unwrap_or(0);
        if behind > 0 {
            return Err(anyhow!(
                "branch diverged from its remote ({behind} behind, {ahead} ahead)"
            ));
        }
        Ok(ahead == 0)
    }

    /// Push the current branch with bounded self-healing.
    ///
    /// Healing sequence, each applied at most once:
    /// 1. If the current branch is protected, switch to `escape_branch`.
    /// 2. If the push failure mentions a moved remote, follow the new URL.
    /// 3. Retry once bypassing hooks (`--no-verify`).
    #[instrument(skip_all)]
    pub fn push_with_healing(
        &self,
        protected_branches: &[String],
        escape_branch: &str,
    ) -> Result<PushReport> {
        let mut report = PushReport::default();
        let mut branch = self.current_branch()?;

        if protected_branches.iter().any(|name| name == &branch) {
            info!(from = %branch, to = escape_branch, "escaping protected branch");
            self.checkout_or_create(escape_branch)?;
            report
                .healed
                .push(format!("switched off protected branch {branch}"));
            branch = escape_branch.to_string();
        }
        report.branch = branch.clone();

        let mut failures: Vec<String> = Vec::new();
        let first = self.push(&branch, false)?;
        if first.status.success() {
            return Ok(report);
        }
        let first_stderr = String::from_utf8_lossy(&first.stderr).to_string();
        failures.push(first_stderr.trim().to_string());

        if let Some(new_url) = moved_remote_url(&first_stderr) {
            warn!(new_url = %new_url, "remote moved, redirecting origin");
            self.set_remote_url(&new_url)?;
            report.healed.push(format!("redirected origin to {new_url}"));
            let retried = self.push(&branch, false)?;
            if retried.status.success() {
                return Ok(report);
            }
            failures.push(String::from_utf8_lossy(&retried.stderr).trim().to_string());
        }

        warn!("retrying push bypassing hooks");
        let hookless = self.push(&branch, true)?;
        if hookless.status.success() {
            report.healed.push("pushed bypassing hooks".to_string());
            return Ok(report);
        }
        failures.push(String::from_utf8_lossy(&hookless.stderr).trim().to_string());

        Err(anyhow!(
            "push of {branch} failed after healing: {}",
            failures.join("; ")
        ))
    }

    fn push(&self, branch: &str, no_verify: bool) -> Result<Output> {
        let mut args = vec!["push", "-u", "origin", branch];
        if no_verify {
            args.insert(1, "--no-verify");
        }
        self.run(&args)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Extract the new location from a "repository moved" push failure.
fn moved_remote_url(stderr: &str) -> Option<String> {
    MOVED_REMOTE
        .captures(stderr)
        .map(|captures| captures[1].trim_end_matches('.').to_string())
}
