//! Normalized result of one agent execution attempt.
//!
//! Agents report loosely structured JSON; everything the scheduler consumes
//! goes through [`Outcome::normalize`], which enforces the status enum and
//! defaults every optional field. Outcomes are never persisted directly;
//! they are folded into `TaskState` and into audit/handoff records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Agent-declared status for the executed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Done,
    Partial,
    Blocked,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeStatus::Done => "done",
            OutcomeStatus::Partial => "partial",
            OutcomeStatus::Blocked => "blocked",
        }
    }
}

/// Normalized execution outcome.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    pub summary: String,
    /// Commit reference the agent claims to have produced, if any.
    pub commit: String,
    pub validation: Vec<String>,
    pub next_actions: Vec<String>,
    pub blocker: String,
    /// Optional usage/telemetry metrics passed through untouched.
    pub usage: Option<Value>,
}

impl Outcome {
    /// Build a blocked outcome from a raw failure text.
    pub fn blocked(blocker: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Blocked,
            summary: String::new(),
            commit: String::new(),
            validation: Vec::new(),
            next_actions: Vec::new(),
            blocker: blocker.into(),
            usage: None,
        }
    }

    /// Normalize a raw agent payload.
    ///
    /// Unknown or missing status text coerces to `blocked` with an
    /// explanatory blocker, so malformed output can never masquerade as
    /// success.
    pub fn normalize(raw: &Value) -> Self {
        let status_text = raw
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        let status = match status_text.as_str() {
            "done" | "complete" | "completed" => OutcomeStatus::Done,
            "partial" | "in_progress" | "incomplete" => OutcomeStatus::Partial,
            "blocked" | "failed" | "error" => OutcomeStatus::Blocked,
            _ => OutcomeStatus::Blocked,
        };

        let mut blocker = string_field(raw, "blocker");
        if blocker.is_empty()
            && status == OutcomeStatus::Blocked
            && !matches!(status_text.as_str(), "blocked" | "failed" | "error")
        {
            blocker = format!("unrecognized agent status '{status_text}'");
        }

        Self {
            status,
            summary: string_field(raw, "summary"),
            commit: string_field(raw, "commit"),
            validation: string_list(raw, "validation"),
            next_actions: string_list(raw, "next_actions"),
            blocker,
            usage: raw.get("usage").filter(|v| !v.is_null()).cloned(),
        }
    }

    /// The text fed to the failure classifier for a non-done outcome.
    pub fn failure_text(&self) -> String {
        if self.blocker.is_empty() {
            self.summary.clone()
        } else {
            self.blocker.clone()
        }
    }
}

fn string_field(raw: &Value, key: &str) -> String {
    raw.get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string()
}

fn string_list(raw: &Value, key: &str) -> Vec<String> {
    raw.get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalize_reads_all_fields() {
        let outcome = Outcome::normalize(&json!({
            "status": "done",
            "summary": "implemented feature",
            "commit": "abc123",
            "validation": ["cargo test passed"],
            "next_actions": ["review"],
            "usage": {"tokens": 1200}
        }));
        assert_eq!(outcome.status, OutcomeStatus::Done);
        assert_eq!(outcome.commit, "abc123");
        assert_eq!(outcome.validation, vec!["cargo test passed"]);
        assert!(outcome.usage.is_some());
    }

    #[test]
    fn normalize_coerces_unknown_status_to_blocked() {
        let outcome = Outcome::normalize(&json!({"status": "maybe", "summary": "eh"}));
        assert_eq!(outcome.status, OutcomeStatus::Blocked);
        assert!(outcome.blocker.contains("unrecognized agent status"));
    }

    #[test]
    fn normalize_accepts_status_synonyms() {
        assert_eq!(
            Outcome::normalize(&json!({"status": "COMPLETED"})).status,
            OutcomeStatus::Done
        );
        assert_eq!(
            Outcome::normalize(&json!({"status": "incomplete"})).status,
            OutcomeStatus::Partial
        );
    }

    #[test]
    fn failure_text_prefers_blocker() {
        let outcome = Outcome::normalize(&json!({
            "status": "blocked",
            "summary": "could not finish",
            "blocker": "dependency missing"
        }));
        assert_eq!(outcome.failure_text(), "dependency missing");
    }
}
