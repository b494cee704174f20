//! Lanes configuration stored in `lanes.toml`.
//!
//! The file is edited by humans and must remain stable and automatable:
//! every field defaults via serde, and `validate()` fails fast on values the
//! scheduler cannot run with. `[defaults]` applies to every lane; each
//! `[[lane]]` names an owner, a lane directory, and the pair of working
//! repositories it operates on.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::recovery::RecoveryPolicy;
use crate::core::retry::RetryPolicy;
use crate::core::task::Owner;

/// One validation command with an optional fallback substitute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationCommand {
    /// Command argv, e.g. `["cargo", "test"]`.
    pub command: Vec<String>,
    /// Substitute argv tried when `command` cannot run or keeps failing.
    pub fallback: Vec<String>,
    /// Extra runs granted to flaky, test-like commands. 0 = run once.
    pub retries: u32,
}

impl Default for ValidationCommand {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            fallback: Vec::new(),
            retries: 0,
        }
    }
}

/// Per-owner agent configuration: executable, model ladder, fallback
/// providers, and the scope constraint carried into fallback prompts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnerAgentConfig {
    /// Executable name or path; defaults to the owner name itself.
    pub bin: String,
    /// Models tried in order on the primary executable.
    pub models: Vec<String>,
    /// Providers tried, in order, after the primary's models are exhausted.
    pub fallback_owners: Vec<Owner>,
    /// Role constraint text (e.g. a testing-only scope) threaded through
    /// fallback invocations.
    pub scope: String,
}

impl Default for OwnerAgentConfig {
    fn default() -> Self {
        Self {
            bin: String::new(),
            models: Vec::new(),
            fallback_owners: Vec::new(),
            scope: String::new(),
        }
    }
}

impl OwnerAgentConfig {
    /// Built-in chain for an owner: its own models first, then the other two
    /// providers in rank order.
    pub fn builtin(owner: Owner) -> Self {
        let fallback_owners = Owner::ALL
            .into_iter()
            .filter(|candidate| *candidate != owner)
            .collect();
        Self {
            bin: owner.as_str().to_string(),
            models: Vec::new(),
            fallback_owners,
            scope: String::new(),
        }
    }

    pub fn bin_for(&self, owner: Owner) -> String {
        if self.bin.is_empty() {
            owner.as_str().to_string()
        } else {
            self.bin.clone()
        }
    }
}

/// Settings shared by every lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub max_attempts: u32,
    pub max_retryable_failures: u32,
    pub retry_base_secs: u64,
    pub retry_cap_secs: u64,
    pub attempt_backoff_min_secs: u64,
    pub attempt_backoff_max_secs: u64,
    pub max_recoveries_per_task: u32,
    pub max_reopens_per_task: u32,
    /// Upper bound on a single idle sleep while waiting out cooldowns.
    pub idle_sleep_ceiling_secs: u64,
    pub agent_timeout_secs: u64,
    pub validation_timeout_secs: u64,
    /// Heartbeat rewrite interval during blocking child waits.
    pub heartbeat_tick_secs: u64,
    /// Heartbeat age after which the supervisor declares the child stale.
    pub stale_heartbeat_secs: u64,
    /// Supervisor heartbeat poll interval.
    pub poll_interval_secs: u64,
    /// Grace period between SIGTERM and SIGKILL.
    pub termination_grace_secs: u64,
    pub restart_backoff_base_secs: u64,
    pub restart_backoff_cap_secs: u64,
    /// Restarts allowed before the supervisor gives up; absent = unbounded.
    pub max_restarts: Option<u32>,
    /// Continuous mode: recycle stalled/blocked tasks instead of exiting.
    pub continuous: bool,
    pub recycle_cooldown_secs: u64,
    /// Cycle budget for one `run` invocation; absent = unbounded.
    pub max_cycles: Option<u64>,
    pub output_limit_bytes: usize,
    /// Branch names the pipeline refuses to push to directly.
    pub protected_branches: Vec<String>,
    pub validation: Vec<ValidationCommand>,
    /// Shared directory for handoff digests and dependency snapshots.
    pub coordination_dir: Option<PathBuf>,
    /// Per-owner agent settings; missing owners use the built-in chain.
    pub owners: BTreeMap<String, OwnerAgentConfig>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_retryable_failures: 5,
            retry_base_secs: 60,
            retry_cap_secs: 3600,
            attempt_backoff_min_secs: 30,
            attempt_backoff_max_secs: 120,
            max_recoveries_per_task: 2,
            max_reopens_per_task: 2,
            idle_sleep_ceiling_secs: 300,
            agent_timeout_secs: 1800,
            validation_timeout_secs: 1800,
            heartbeat_tick_secs: 15,
            stale_heartbeat_secs: 900,
            poll_interval_secs: 30,
            termination_grace_secs: 10,
            restart_backoff_base_secs: 5,
            restart_backoff_cap_secs: 300,
            max_restarts: None,
            continuous: false,
            recycle_cooldown_secs: 300,
            max_cycles: None,
            output_limit_bytes: 200_000,
            protected_branches: vec!["main".to_string(), "master".to_string()],
            validation: vec![ValidationCommand {
                command: vec!["cargo".to_string(), "test".to_string()],
                fallback: Vec::new(),
                retries: 2,
            }],
            coordination_dir: None,
            owners: BTreeMap::new(),
        }
    }
}

impl Defaults {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            max_retryable_failures: self.max_retryable_failures,
            retry_base_secs: self.retry_base_secs,
            retry_cap_secs: self.retry_cap_secs,
            attempt_backoff_min_secs: self.attempt_backoff_min_secs,
            attempt_backoff_max_secs: self.attempt_backoff_max_secs,
        }
    }

    pub fn recovery_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            max_recoveries_per_task: self.max_recoveries_per_task,
            max_reopens_per_task: self.max_reopens_per_task,
        }
    }

    /// Resolve the agent configuration for an owner, falling back to the
    /// built-in chain when the config file does not mention it.
    pub fn owner_agent(&self, owner: Owner) -> OwnerAgentConfig {
        match self.owners.get(owner.as_str()) {
            Some(config) => {
                let mut resolved = config.clone();
                if resolved.bin.is_empty() {
                    resolved.bin = owner.as_str().to_string();
                }
                if resolved.fallback_owners.is_empty() {
                    resolved.fallback_owners = OwnerAgentConfig::builtin(owner).fallback_owners;
                }
                resolved
            }
            None => OwnerAgentConfig::builtin(owner),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be > 0"));
        }
        if self.retry_base_secs == 0 {
            return Err(anyhow!("retry_base_secs must be > 0"));
        }
        if self.retry_cap_secs < self.retry_base_secs {
            return Err(anyhow!("retry_cap_secs must be >= retry_base_secs"));
        }
        if self.attempt_backoff_max_secs < self.attempt_backoff_min_secs {
            return Err(anyhow!(
                "attempt_backoff_max_secs must be >= attempt_backoff_min_secs"
            ));
        }
        if self.agent_timeout_secs == 0 {
            return Err(anyhow!("agent_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        for (name, _) in &self.owners {
            Owner::parse(name).context("invalid owner key in [defaults.owners]")?;
        }
        for validation in &self.validation {
            if validation.command.is_empty() || validation.command[0].trim().is_empty() {
                return Err(anyhow!("validation command must be a non-empty array"));
            }
        }
        Ok(())
    }
}

/// One lane: an isolated scheduler instance scoped to one owner and one pair
/// of working repositories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaneConfig {
    pub id: String,
    pub owner: Owner,
    /// Directory holding the lane's runtime files (created lazily).
    pub dir: PathBuf,
    /// Repository the agent works in.
    pub repo: PathBuf,
    /// Companion repository (plans, docs); optional.
    #[serde(default)]
    pub planning_repo: Option<PathBuf>,
    /// Override for the task definitions file; defaults to `<dir>/tasks.json`.
    #[serde(default)]
    pub tasks_file: Option<PathBuf>,
}

/// Canonical runtime file paths for one lane.
#[derive(Debug, Clone)]
pub struct LanePaths {
    pub dir: PathBuf,
    pub tasks_path: PathBuf,
    pub state_path: PathBuf,
    pub heartbeat_path: PathBuf,
    pub lock_path: PathBuf,
    pub audit_path: PathBuf,
    pub paused_path: PathBuf,
    pub supervisor_pid_path: PathBuf,
    pub supervisor_log_path: PathBuf,
}

impl LanePaths {
    pub fn new(lane: &LaneConfig) -> Self {
        let dir = lane.dir.clone();
        Self {
            tasks_path: lane
                .tasks_file
                .clone()
                .unwrap_or_else(|| dir.join("tasks.json")),
            state_path: dir.join("state.json"),
            heartbeat_path: dir.join("heartbeat.json"),
            lock_path: dir.join("lane.lock"),
            audit_path: dir.join("audit.jsonl"),
            paused_path: dir.join("paused"),
            supervisor_pid_path: dir.join("supervisor.pid"),
            supervisor_log_path: dir.join("supervisor.log"),
            dir,
        }
    }
}

/// Parsed `lanes.toml`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LanesFile {
    pub defaults: Defaults,
    #[serde(rename = "lane")]
    pub lanes: Vec<LaneConfig>,
}

impl LanesFile {
    pub fn validate(&self) -> Result<()> {
        self.defaults.validate()?;
        let mut seen = std::collections::BTreeSet::new();
        for lane in &self.lanes {
            if lane.id.trim().is_empty() {
                return Err(anyhow!("lane id must be non-empty"));
            }
            if !seen.insert(lane.id.as_str()) {
                return Err(anyhow!("duplicate lane id '{}'", lane.id));
            }
        }
        Ok(())
    }

    pub fn lane(&self, id: &str) -> Result<&LaneConfig> {
        self.lanes
            .iter()
            .find(|lane| lane.id == id)
            .ok_or_else(|| anyhow!("unknown lane '{id}'"))
    }
}

/// Load and validate `lanes.toml`. Fatal-configuration errors surface here
/// and abort startup; nothing in this path is retried.
pub fn load_lanes(path: &Path) -> Result<LanesFile> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read lanes config {}", path.display()))?;
    let file: LanesFile =
        toml::from_str(&contents).with_context(|| format!("parse lanes config {}", path.display()))?;
    file.validate()
        .with_context(|| format!("validate lanes config {}", path.display()))?;
    Ok(file)
}

/// Atomically write a lanes file (used by `init` scaffolding).
pub fn write_lanes(path: &Path, file: &LanesFile) -> Result<()> {
    file.validate()?;
    let mut payload = toml::to_string_pretty(file).context("serialize lanes config")?;
    payload.push('\n');
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, payload)
        .with_context(|| format!("write temp lanes config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace lanes config {}", path.display()))?;
    Ok(())
}
