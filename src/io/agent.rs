//! Agent invocation: CLI backends, tolerant output parsing, and the
//! per-owner cross-provider fallback chain.
//!
//! The [`AgentRunner`] trait decouples the pipeline from the actual
//! executables (`claude`, `codex`, `gemini`). Tests use scripted runners
//! that return predetermined outputs without spawning processes.

use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::retry::is_capacity_signature;
use crate::core::task::Owner;
use crate::io::config::{Defaults, OwnerAgentConfig};
use crate::io::process::run_command_with_timeout;

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Prompt text fed to the agent.
    pub prompt: String,
    /// Wall-clock budget for the invocation.
    pub timeout: Duration,
    /// Truncate captured output beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Heartbeat rewrite interval while blocked on the child.
    pub tick_interval: Duration,
}

/// Raw result of one agent invocation, before parsing.
#[derive(Debug, Clone)]
pub struct AgentRaw {
    pub exit_ok: bool,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl AgentRaw {
    /// Text describing the failure (stderr first, then stdout).
    pub fn failure_text(&self) -> String {
        let mut text = self.stderr.trim().to_string();
        if text.is_empty() {
            text = self.stdout.trim().to_string();
        }
        if self.timed_out {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str("[agent timed out]");
        }
        text
    }
}

/// One step of a fallback chain: which executable, which model, and the
/// scope constraint carried into its prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackStep {
    pub owner: Owner,
    pub bin: String,
    pub model: Option<String>,
    pub scope: String,
}

impl FallbackStep {
    pub fn describe(&self) -> String {
        match &self.model {
            Some(model) => format!("{} ({model})", self.owner),
            None => self.owner.to_string(),
        }
    }
}

/// Build the ordered fallback chain for an owner.
///
/// Primary executable with each configured model (default model first when
/// none are configured), then each fallback provider's default model. The
/// primary owner's scope constraint is carried into every step.
pub fn build_chain(owner: Owner, defaults: &Defaults) -> Vec<FallbackStep> {
    let primary = defaults.owner_agent(owner);
    let mut steps = Vec::new();

    if primary.models.is_empty() {
        steps.push(step_for(owner, &primary, None));
    } else {
        for model in &primary.models {
            steps.push(step_for(owner, &primary, Some(model.clone())));
        }
    }

    for fallback in &primary.fallback_owners {
        let agent = defaults.owner_agent(*fallback);
        let mut step = step_for(*fallback, &agent, agent.models.first().cloned());
        // Role constraints follow the task's owner, not the substitute.
        step.scope = primary.scope.clone();
        steps.push(step);
    }

    steps
}

fn step_for(owner: Owner, agent: &OwnerAgentConfig, model: Option<String>) -> FallbackStep {
    FallbackStep {
        owner,
        bin: agent.bin_for(owner),
        model,
        scope: agent.scope.clone(),
    }
}

/// Abstraction over agent execution backends.
pub trait AgentRunner {
    fn run(
        &self,
        step: &FallbackStep,
        request: &AgentRequest,
        on_tick: &mut dyn FnMut(),
    ) -> Result<AgentRaw>;
}

/// Runner that spawns the real CLI executables.
pub struct CliAgentRunner;

impl AgentRunner for CliAgentRunner {
    #[instrument(skip_all, fields(agent = %step.describe(), timeout_secs = request.timeout.as_secs()))]
    fn run(
        &self,
        step: &FallbackStep,
        request: &AgentRequest,
        on_tick: &mut dyn FnMut(),
    ) -> Result<AgentRaw> {
        info!(workdir = %request.workdir.display(), "invoking agent");
        let mut cmd = Command::new(&step.bin);
        match step.owner {
            Owner::Claude => {
                cmd.arg("-p").arg("--output-format").arg("json");
                if let Some(model) = &step.model {
                    cmd.arg("--model").arg(model);
                }
                cmd.arg("--dangerously-skip-permissions");
            }
            Owner::Codex => {
                cmd.arg("exec")
                    .arg("--sandbox")
                    .arg("danger-full-access")
                    .arg("--skip-git-repo-check");
                if let Some(model) = &step.model {
                    cmd.arg("-m").arg(model);
                }
                cmd.arg("-");
            }
            Owner::Gemini => {
                cmd.arg("--yolo");
                if let Some(model) = &step.model {
                    cmd.arg("-m").arg(model);
                }
            }
        }
        cmd.current_dir(&request.workdir);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
            request.tick_interval,
            on_tick,
        )
        .with_context(|| format!("run agent {}", step.describe()))?;

        Ok(AgentRaw {
            exit_ok: output.status.success() && !output.timed_out,
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
            timed_out: output.timed_out,
        })
    }
}

/// Result of driving a fallback chain to completion.
#[derive(Debug, Clone)]
pub enum ChainResult {
    /// Some step produced a parseable payload.
    Parsed {
        payload: Value,
        step: FallbackStep,
        /// Failure texts from earlier steps that were skipped over.
        prior_failures: Vec<String>,
    },
    /// Every step failed; the concatenated failure texts form the blocker.
    Exhausted { failures: Vec<String> },
}

/// Drive the fallback chain: try each step in order, advancing only past
/// capacity/overload failures. Any other failure stops the chain: it is
/// the task's problem, not the provider's.
#[instrument(skip_all, fields(steps = chain.len()))]
pub fn invoke_with_fallback(
    runner: &dyn AgentRunner,
    chain: &[FallbackStep],
    request: &AgentRequest,
    on_tick: &mut dyn FnMut(String),
) -> Result<ChainResult> {
    let mut failures: Vec<String> = Vec::new();

    for step in chain {
        let label = step.describe();
        let mut tick = || on_tick(label.clone());
        tick();
        let raw = runner.run(step, request, &mut tick)?;

        if raw.exit_ok
            && let Some(payload) = parse_agent_payload(&raw.stdout)
        {
            debug!(step = %label, "agent produced parseable payload");
            return Ok(ChainResult::Parsed {
                payload,
                step: step.clone(),
                prior_failures: failures,
            });
        }

        let failure = raw.failure_text();
        if raw.exit_ok {
            // Clean exit but unparseable output: not a capacity problem,
            // surface it as the blocker immediately.
            failures.push(format!("{label}: unparseable agent output: {failure}"));
            return Ok(ChainResult::Exhausted { failures });
        }

        if is_capacity_signature(&failure) || raw.timed_out {
            warn!(step = %label, "capacity/overload failure, trying next fallback");
            failures.push(format!("{label}: {failure}"));
            continue;
        }

        failures.push(format!("{label}: {failure}"));
        return Ok(ChainResult::Exhausted { failures });
    }

    Ok(ChainResult::Exhausted { failures })
}

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fenced json regex compiles")
});

/// Parse an agent payload tolerant of surrounding non-JSON text.
///
/// Tries, in order: a direct parse, a fenced ```json block, and the first
/// balanced top-level object anywhere in the text. Returns `None` when no
/// JSON object can be recovered.
pub fn parse_agent_payload(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && value.is_object()
    {
        return Some(value);
    }

    if let Some(captures) = FENCED_JSON.captures(trimmed)
        && let Ok(value) = serde_json::from_str::<Value>(&captures[1])
    {
        return Some(value);
    }

    first_json_object(trimmed).and_then(|candidate| serde_json::from_str(candidate).ok())
}

/// Find the first balanced `{...}` span, respecting strings and escapes.
fn first_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_direct_json() {
        let payload = parse_agent_payload(r#"{"status":"done","summary":"ok"}"#).expect("parse");
        assert_eq!(payload["status"], "done");
    }

    #[test]
    fn parses_fenced_block() {
        let text = "Here is my result:\n```json\n{\"status\": \"done\"}\n```\nthanks";
        let payload = parse_agent_payload(text).expect("parse");
        assert_eq!(payload["status"], "done");
    }

    #[test]
    fn parses_first_embedded_object() {
        let text = "chatter before {\"status\":\"blocked\",\"blocker\":\"a {nested} brace\"} after";
        let payload = parse_agent_payload(text).expect("parse");
        assert_eq!(payload["status"], "blocked");
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scanner() {
        let text = r#"note {"summary":"uses } and { in text","status":"done"} trailing"#;
        let payload = parse_agent_payload(text).expect("parse");
        assert_eq!(payload["status"], "done");
    }

    #[test]
    fn garbage_yields_none() {
        assert!(parse_agent_payload("no json here").is_none());
        assert!(parse_agent_payload("{ broken").is_none());
    }

    #[test]
    fn chain_covers_models_then_fallback_providers() {
        let mut defaults = Defaults::default();
        defaults.owners.insert(
            "claude".to_string(),
            OwnerAgentConfig {
                bin: String::new(),
                models: vec!["opus".to_string(), "sonnet".to_string()],
                fallback_owners: vec![Owner::Codex],
                scope: "implementation lane".to_string(),
            },
        );
        let chain = build_chain(Owner::Claude, &defaults);
        let labels: Vec<String> = chain.iter().map(FallbackStep::describe).collect();
        assert_eq!(labels, vec!["claude (opus)", "claude (sonnet)", "codex"]);
        assert!(chain.iter().all(|step| step.scope == "implementation lane"));
    }

    struct ScriptedChainRunner {
        responses: std::sync::Mutex<std::collections::VecDeque<AgentRaw>>,
    }

    impl ScriptedChainRunner {
        fn new(responses: Vec<AgentRaw>) -> Self {
            Self {
                responses: std::sync::Mutex::new(responses.into_iter().collect()),
            }
        }
    }

    impl AgentRunner for ScriptedChainRunner {
        fn run(
            &self,
            _step: &FallbackStep,
            _request: &AgentRequest,
            _on_tick: &mut dyn FnMut(),
        ) -> Result<AgentRaw> {
            Ok(self
                .responses
                .lock()
                .expect("lock")
                .pop_front()
                .expect("scripted response available"))
        }
    }

    fn request() -> AgentRequest {
        AgentRequest {
            workdir: PathBuf::from("."),
            prompt: "do the thing".to_string(),
            timeout: Duration::from_secs(1),
            output_limit_bytes: 10_000,
            tick_interval: Duration::from_secs(1),
        }
    }

    fn chain_of(n: usize) -> Vec<FallbackStep> {
        build_chain(Owner::Claude, &Defaults::default())
            .into_iter()
            .take(n)
            .collect()
    }

    fn ok_raw(payload: Value) -> AgentRaw {
        AgentRaw {
            exit_ok: true,
            stdout: payload.to_string(),
            stderr: String::new(),
            timed_out: false,
        }
    }

    fn failed_raw(stderr: &str) -> AgentRaw {
        AgentRaw {
            exit_ok: false,
            stdout: String::new(),
            stderr: stderr.to_string(),
            timed_out: false,
        }
    }

    #[test]
    fn capacity_failure_advances_to_next_provider() {
        let runner = ScriptedChainRunner::new(vec![
            failed_raw("error: API overloaded (529)"),
            ok_raw(json!({"status": "done", "summary": "fallback worked"})),
        ]);
        let result =
            invoke_with_fallback(&runner, &chain_of(3), &request(), &mut |_| {}).expect("invoke");
        match result {
            ChainResult::Parsed {
                payload,
                step,
                prior_failures,
            } => {
                assert_eq!(payload["summary"], "fallback worked");
                assert_eq!(step.owner, Owner::Codex);
                assert_eq!(prior_failures.len(), 1);
            }
            ChainResult::Exhausted { .. } => panic!("expected parsed result"),
        }
    }

    #[test]
    fn non_capacity_failure_stops_the_chain() {
        let runner = ScriptedChainRunner::new(vec![failed_raw("segmentation fault")]);
        let result =
            invoke_with_fallback(&runner, &chain_of(3), &request(), &mut |_| {}).expect("invoke");
        match result {
            ChainResult::Exhausted { failures } => {
                assert_eq!(failures.len(), 1);
                assert!(failures[0].contains("segmentation fault"));
            }
            ChainResult::Parsed { .. } => panic!("expected exhausted result"),
        }
    }

    #[test]
    fn exhausted_chain_concatenates_all_failures() {
        let runner = ScriptedChainRunner::new(vec![
            failed_raw("rate limit exceeded"),
            failed_raw("quota exceeded"),
            failed_raw("model unavailable due to capacity"),
        ]);
        let result =
            invoke_with_fallback(&runner, &chain_of(3), &request(), &mut |_| {}).expect("invoke");
        match result {
            ChainResult::Exhausted { failures } => assert_eq!(failures.len(), 3),
            ChainResult::Parsed { .. } => panic!("expected exhausted result"),
        }
    }
}
