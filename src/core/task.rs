//! Immutable task definitions and owner roles.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Executor role a task is assigned to.
///
/// The owner determines which external coding-agent CLI handles the task and
/// contributes a fixed rank to selection tie-breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Owner {
    Claude,
    Codex,
    Gemini,
}

impl Owner {
    pub const ALL: [Owner; 3] = [Owner::Claude, Owner::Codex, Owner::Gemini];

    /// Fixed rank used as the second key in selection tie-breaks.
    pub fn rank(self) -> u8 {
        match self {
            Owner::Claude => 0,
            Owner::Codex => 1,
            Owner::Gemini => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Owner::Claude => "claude",
            Owner::Codex => "codex",
            Owner::Gemini => "gemini",
        }
    }

    pub fn parse(value: &str) -> Result<Owner> {
        match value.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(Owner::Claude),
            "codex" => Ok(Owner::Codex),
            "gemini" => Ok(Owner::Gemini),
            other => Err(anyhow!(
                "unsupported owner '{other}' (expected one of: claude, codex, gemini)"
            )),
        }
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable task definition, loaded once per run and never mutated.
///
/// All mutable bookkeeping lives in [`super::state::TaskState`], keyed by
/// `id`. Lower `priority` means more urgent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub owner: Owner,
    pub priority: i64,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub acceptance: Vec<String>,
}
