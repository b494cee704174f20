//! Append-only audit log: one JSON event per line.
//!
//! Product artifact, always written regardless of `RUST_LOG`. Content is
//! truncated so a runaway agent transcript cannot bloat the log.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::task::Owner;

const MAX_CONTENT_CHARS: usize = 2000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    pub task_id: String,
    pub owner: Option<Owner>,
    pub event: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl AuditEvent {
    pub fn new(cycle: u64, task_id: &str, owner: Option<Owner>, event: &str, content: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            cycle,
            task_id: task_id.to_string(),
            owner,
            event: event.to_string(),
            content: truncate(content, MAX_CONTENT_CHARS),
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Appender bound to one lane's audit log file.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, event: &AuditEvent) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open audit log {}", self.path.display()))?;
        let line = serde_json::to_string(event).context("serialize audit event")?;
        writeln!(file, "{line}")
            .with_context(|| format!("append audit log {}", self.path.display()))?;
        Ok(())
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{kept}… [truncated]")
}
