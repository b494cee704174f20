//! Scheduler liveness record, overwritten on every phase transition.
//!
//! The supervisor judges liveness purely from the heartbeat file's
//! timestamp, so the scheduler also rewrites it periodically while blocked
//! on a long agent or validation call.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    pub phase: String,
    pub cycle: u64,
    pub task_id: String,
    pub message: String,
}

/// Age of a heartbeat relative to `now`.
pub fn heartbeat_age(heartbeat: &Heartbeat, now: DateTime<Utc>) -> TimeDelta {
    now.signed_duration_since(heartbeat.timestamp)
}

/// Writer bound to one lane's heartbeat file.
#[derive(Debug, Clone)]
pub struct HeartbeatFile {
    path: PathBuf,
}

impl HeartbeatFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the heartbeat (atomic temp + rename).
    pub fn beat(&self, phase: &str, cycle: u64, task_id: &str, message: &str) -> Result<()> {
        let heartbeat = Heartbeat {
            timestamp: Utc::now(),
            pid: std::process::id(),
            phase: phase.to_string(),
            cycle,
            task_id: task_id.to_string(),
            message: message.to_string(),
        };
        debug!(phase, cycle, task_id, "heartbeat");
        write_heartbeat(&self.path, &heartbeat)
    }

    pub fn read(&self) -> Result<Heartbeat> {
        read_heartbeat(&self.path)
    }
}

pub fn write_heartbeat(path: &Path, heartbeat: &Heartbeat) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("heartbeat path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut payload = serde_json::to_string_pretty(heartbeat)?;
    payload.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, payload)
        .with_context(|| format!("write temp heartbeat {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace heartbeat {}", path.display()))?;
    Ok(())
}

pub fn read_heartbeat(path: &Path) -> Result<Heartbeat> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read heartbeat {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse heartbeat {}", path.display()))
}
