//! Shared fixtures and scripted doubles for tests.
//!
//! Unit tests reach this via `#[cfg(test)]`; integration tests enable the
//! `test-support` feature.

use std::collections::VecDeque;
use std::fs;
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde_json::json;
use tempfile::TempDir;

use crate::core::task::{Owner, Task};
use crate::io::agent::{AgentRaw, AgentRequest, AgentRunner, FallbackStep};
use crate::io::config::{Defaults, LaneConfig, LanePaths};
use crate::io::validate::{ValidationResult, Validator};

/// Minimal task with the fields tests usually vary.
pub fn task(id: &str, owner: Owner, priority: i64, deps: &[&str]) -> Task {
    Task {
        id: id.to_string(),
        owner,
        priority,
        title: format!("task {id}"),
        description: String::new(),
        depends_on: deps.iter().map(|dep| dep.to_string()).collect(),
        acceptance: Vec::new(),
    }
}

/// Agent double that replays scripted responses and records the prompts it
/// was given.
pub struct ScriptedAgent {
    responses: Mutex<VecDeque<AgentRaw>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedAgent {
    pub fn new(responses: Vec<AgentRaw>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Response claiming success with the given summary.
    pub fn done(summary: &str) -> AgentRaw {
        payload_raw(json!({ "status": "done", "summary": summary }))
    }

    /// Response claiming partial progress.
    pub fn partial(summary: &str) -> AgentRaw {
        payload_raw(json!({ "status": "partial", "summary": summary }))
    }

    /// Response reporting a blocker.
    pub fn blocked(blocker: &str) -> AgentRaw {
        payload_raw(json!({ "status": "blocked", "blocker": blocker }))
    }

    /// Non-zero exit with the given stderr.
    pub fn crashed(stderr: &str) -> AgentRaw {
        AgentRaw {
            exit_ok: false,
            stdout: String::new(),
            stderr: stderr.to_string(),
            timed_out: false,
        }
    }

    /// Prompts seen so far, in invocation order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().expect("prompts lock").len()
    }
}

fn payload_raw(payload: serde_json::Value) -> AgentRaw {
    AgentRaw {
        exit_ok: true,
        stdout: payload.to_string(),
        stderr: String::new(),
        timed_out: false,
    }
}

impl AgentRunner for ScriptedAgent {
    fn run(
        &self,
        _step: &FallbackStep,
        request: &AgentRequest,
        _on_tick: &mut dyn FnMut(),
    ) -> Result<AgentRaw> {
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(request.prompt.clone());
        Ok(self
            .responses
            .lock()
            .expect("responses lock")
            .pop_front()
            // Running out of script means a test drove more attempts than
            // it planned for; fail loudly as a blocker.
            .unwrap_or_else(|| ScriptedAgent::crashed("scripted responses exhausted")))
    }
}

/// Validator double replaying scripted results; passes once the script runs
/// out.
pub struct ScriptedValidator {
    results: Mutex<VecDeque<ValidationResult>>,
}

impl ScriptedValidator {
    pub fn passing() -> Self {
        Self::new(Vec::new())
    }

    pub fn new(results: Vec<ValidationResult>) -> Self {
        Self {
            results: Mutex::new(results.into_iter().collect()),
        }
    }

    pub fn failure(detail: &str) -> ValidationResult {
        ValidationResult::Failed {
            command: "scripted check".to_string(),
            detail: detail.to_string(),
        }
    }
}

impl Validator for ScriptedValidator {
    fn validate(
        &self,
        _workdir: &std::path::Path,
        _on_tick: &mut dyn FnMut(),
    ) -> Result<ValidationResult> {
        Ok(self
            .results
            .lock()
            .expect("results lock")
            .pop_front()
            .unwrap_or(ValidationResult::Passed))
    }
}

/// Temporary lane with its runtime directory, a plain working directory as
/// the repository, and defaults tuned for fast tests (no real backoffs).
pub struct TestLane {
    pub temp: TempDir,
    pub lane: LaneConfig,
    pub defaults: Defaults,
}

impl TestLane {
    pub fn new(id: &str, owner: Owner) -> Result<Self> {
        let temp = TempDir::new().context("create tempdir")?;
        let lane = LaneConfig {
            id: id.to_string(),
            owner,
            dir: temp.path().join("lane"),
            repo: temp.path().join("repo"),
            planning_repo: None,
            tasks_file: None,
        };
        fs::create_dir_all(&lane.dir).context("create lane dir")?;
        fs::create_dir_all(&lane.repo).context("create repo dir")?;

        let mut defaults = Defaults::default();
        defaults.retry_base_secs = 1;
        defaults.retry_cap_secs = 1;
        defaults.attempt_backoff_min_secs = 0;
        defaults.attempt_backoff_max_secs = 0;
        defaults.idle_sleep_ceiling_secs = 1;
        defaults.heartbeat_tick_secs = 1;
        defaults.agent_timeout_secs = 10;
        defaults.validation_timeout_secs = 10;
        defaults.recycle_cooldown_secs = 1;
        defaults.max_cycles = Some(50);
        Ok(Self {
            temp,
            lane,
            defaults,
        })
    }

    pub fn paths(&self) -> LanePaths {
        LanePaths::new(&self.lane)
    }

    /// Enable cross-lane coordination under the fixture's tempdir.
    pub fn with_coordination(mut self) -> Self {
        let dir = self.temp.path().join("coordination");
        self.defaults.coordination_dir = Some(dir);
        self
    }

    pub fn write_tasks(&self, tasks: &[Task]) -> Result<()> {
        let mut payload = serde_json::to_string_pretty(tasks).context("serialize tasks")?;
        payload.push('\n');
        fs::write(self.paths().tasks_path, payload).context("write tasks.json")?;
        Ok(())
    }
}
