//! Single-task execution pipeline: prompt, agent chain, validation, push.
//!
//! The pipeline owns everything between "task selected" and "outcome
//! produced". It never mutates task state; the scheduler folds the returned
//! [`Outcome`] into the state map. Validation and push failures are folded
//! into a blocked outcome carrying the failure text, so one classification
//! path downstream handles agent, validation, and git failures alike.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::core::outcome::{Outcome, OutcomeStatus};
use crate::core::state::TaskState;
use crate::core::task::{Owner, Task};
use crate::io::agent::{AgentRequest, AgentRunner, ChainResult, build_chain, invoke_with_fallback};
use crate::io::audit::{AuditEvent, AuditLog};
use crate::io::config::Defaults;
use crate::io::git::Git;
use crate::io::handoff::{Coordination, HandoffEvent};
use crate::io::heartbeat::HeartbeatFile;
use crate::io::prompt::{PromptBuilder, PromptInputs, merge_hint, repo_profile};
use crate::io::validate::{ValidationResult, Validator};

/// Index locks younger than this may belong to a live git process.
const STALE_INDEX_LOCK: Duration = Duration::from_secs(600);
/// Most recent cross-lane notes folded into a prompt.
const HANDOFF_DIGEST_LIMIT: usize = 10;

/// One lane's task executor.
pub struct Pipeline<'a> {
    pub lane_id: &'a str,
    pub owner: Owner,
    pub defaults: &'a Defaults,
    pub runner: &'a dyn AgentRunner,
    pub validator: &'a dyn Validator,
    pub audit: &'a AuditLog,
    pub heartbeat: &'a HeartbeatFile,
    pub coordination: Option<&'a Coordination>,
    git: Git,
    prompts: PromptBuilder,
}

impl<'a> Pipeline<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lane_id: &'a str,
        owner: Owner,
        repo: &Path,
        defaults: &'a Defaults,
        runner: &'a dyn AgentRunner,
        validator: &'a dyn Validator,
        audit: &'a AuditLog,
        heartbeat: &'a HeartbeatFile,
        coordination: Option<&'a Coordination>,
    ) -> Self {
        Self {
            lane_id,
            owner,
            defaults,
            runner,
            validator,
            audit,
            heartbeat,
            coordination,
            git: Git::new(repo),
            prompts: PromptBuilder::new(),
        }
    }

    /// Execute one attempt of `task` and return its normalized outcome.
    ///
    /// Errors here are environmental (unreadable coordination dir, audit log
    /// unwritable); failures of the work itself always come back as a
    /// non-done [`Outcome`].
    #[instrument(skip_all, fields(lane = self.lane_id, task_id = %task.id, cycle))]
    pub fn execute(&self, task: &Task, state: &TaskState, cycle: u64) -> Result<Outcome> {
        if self.git.heal_stale_index_lock(STALE_INDEX_LOCK)? {
            self.record(cycle, &task.id, "git_healed", "removed stale index.lock")?;
        }

        let prompt = self.build_prompt(task, state)?;
        let chain = build_chain(task.owner, self.defaults);
        let request = AgentRequest {
            workdir: self.git.workdir().to_path_buf(),
            prompt,
            timeout: Duration::from_secs(self.defaults.agent_timeout_secs),
            output_limit_bytes: self.defaults.output_limit_bytes,
            tick_interval: Duration::from_secs(self.defaults.heartbeat_tick_secs),
        };

        let mut beat = |agent: String| {
            // A failed heartbeat write must not abort a running attempt.
            if let Err(err) = self.heartbeat.beat("agent", cycle, &task.id, &agent) {
                warn!(err = %err, "heartbeat write failed");
            }
        };
        let result = invoke_with_fallback(self.runner, &chain, &request, &mut beat)?;

        let mut outcome = match result {
            ChainResult::Parsed {
                payload,
                step,
                prior_failures,
            } => {
                if !prior_failures.is_empty() {
                    self.record(cycle, &task.id, "agent_fallback", &prior_failures.join("\n"))?;
                }
                info!(agent = %step.describe(), "agent produced a payload");
                Outcome::normalize(&payload)
            }
            ChainResult::Exhausted { failures } => {
                let blocker = if failures.is_empty() {
                    "agent fallback chain was empty".to_string()
                } else {
                    failures.join("\n")
                };
                self.record(cycle, &task.id, "agent_exhausted", &blocker)?;
                return Ok(Outcome::blocked(blocker));
            }
        };
        self.record_outcome(cycle, &task.id, &outcome)?;

        if outcome.status == OutcomeStatus::Done {
            outcome = self.accept(task, cycle, outcome)?;
        }
        Ok(outcome)
    }

    /// Gate a `done` claim behind validation and a verified push.
    fn accept(&self, task: &Task, cycle: u64, mut outcome: Outcome) -> Result<Outcome> {
        self.heartbeat
            .beat("validation", cycle, &task.id, "running validation")
            .unwrap_or_else(|err| warn!(err = %err, "heartbeat write failed"));
        let mut beat = || {
            if let Err(err) = self
                .heartbeat
                .beat("validation", cycle, &task.id, "running validation")
            {
                warn!(err = %err, "heartbeat write failed");
            }
        };
        match self.validator.validate(self.git.workdir(), &mut beat)? {
            ValidationResult::Passed => {}
            ValidationResult::Failed { command, detail } => {
                let blocker = format!("validation '{command}' failed: {detail}");
                self.record(cycle, &task.id, "validation_failed", &blocker)?;
                return Ok(Outcome::blocked(blocker));
            }
        }

        if outcome.commit.is_empty()
            && let Ok(sha) = self.git.head_short_sha()
        {
            outcome.commit = sha;
        }

        match self.push(task, cycle)? {
            Ok(()) => {}
            Err(blocker) => return Ok(Outcome::blocked(blocker)),
        }

        if let Some(coordination) = self.coordination {
            let summary = if outcome.summary.is_empty() {
                format!("completed {}", task.title)
            } else {
                outcome.summary.clone()
            };
            coordination.publish_handoff(&task.id, &summary, Utc::now())?;
        }
        Ok(outcome)
    }

    /// Push the work, healing where allowed. A repository without an
    /// `origin` remote is local-only and skips the push entirely.
    fn push(&self, task: &Task, cycle: u64) -> Result<Result<(), String>> {
        if self.git.remote_url().is_err() {
            debug!("no origin remote, skipping push");
            return Ok(Ok(()));
        }
        if self.git.verify_synced().unwrap_or(false) {
            debug!("branch already synced with remote");
            return Ok(Ok(()));
        }
        self.heartbeat
            .beat("push", cycle, &task.id, "pushing work")
            .unwrap_or_else(|err| warn!(err = %err, "heartbeat write failed"));

        let escape_branch = format!("lane/{}", self.lane_id);
        match self
            .git
            .push_with_healing(&self.defaults.protected_branches, &escape_branch)
        {
            Ok(report) => {
                if !report.healed.is_empty() {
                    self.record(cycle, &task.id, "push_healed", &report.healed.join("; "))?;
                }
                Ok(Ok(()))
            }
            Err(err) => {
                let blocker = format!("{err:#}");
                self.record(cycle, &task.id, "push_failed", &blocker)?;
                Ok(Err(blocker))
            }
        }
    }

    fn build_prompt(&self, task: &Task, state: &TaskState) -> Result<String> {
        let handoff = match self.coordination {
            Some(coordination) => {
                format_digest(&coordination.read_digest(HANDOFF_DIGEST_LIMIT)?)
            }
            None => String::new(),
        };
        let inputs = PromptInputs {
            repo_profile: repo_profile(self.git.workdir()),
            merge_hint: merge_hint(self.git.workdir()),
            prev_summary: state.last_summary.clone(),
            prev_error: state.last_error.clone(),
            handoff,
            scope: self.defaults.owner_agent(task.owner).scope,
        };
        self.prompts
            .render(task, &inputs)
            .with_context(|| format!("render prompt for task {}", task.id))
    }

    fn record(&self, cycle: u64, task_id: &str, event: &str, content: &str) -> Result<()> {
        self.audit
            .append(&AuditEvent::new(cycle, task_id, Some(self.owner), event, content))
    }

    fn record_outcome(&self, cycle: u64, task_id: &str, outcome: &Outcome) -> Result<()> {
        let mut meta = json!({
            "status": outcome.status.as_str(),
            "commit": outcome.commit,
            "blocker": outcome.blocker,
        });
        if let Some(usage) = &outcome.usage {
            meta["usage"] = usage.clone();
        }
        let event = AuditEvent::new(
            cycle,
            task_id,
            Some(self.owner),
            "agent_outcome",
            &outcome.summary,
        )
        .with_meta(meta);
        self.audit.append(&event)
    }
}

/// Render cross-lane notes as prompt lines, oldest first.
fn format_digest(events: &[HandoffEvent]) -> String {
    events
        .iter()
        .map(|event| {
            format!(
                "[{} / {}] {}: {}",
                event.lane, event.owner, event.task_id, event.summary
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    #[test]
    fn digest_renders_one_line_per_event() {
        let events = vec![
            HandoffEvent {
                timestamp: DateTime::from_timestamp(1_700_000_000, 0).expect("timestamp"),
                lane: "tests".to_string(),
                owner: Owner::Gemini,
                task_id: "t-9".to_string(),
                summary: "added regression tests".to_string(),
            },
            HandoffEvent {
                timestamp: DateTime::from_timestamp(1_700_000_100, 0).expect("timestamp"),
                lane: "review".to_string(),
                owner: Owner::Codex,
                task_id: "t-12".to_string(),
                summary: "approved the parser change".to_string(),
            },
        ];
        let digest = format_digest(&events);
        assert_eq!(
            digest,
            "[tests / gemini] t-9: added regression tests\n[review / codex] t-12: approved the parser change"
        );
    }

    #[test]
    fn empty_digest_is_empty() {
        assert_eq!(format_digest(&[]), "");
    }
}
