//! Cross-lane coordination through a shared directory.
//!
//! Lanes never talk to each other directly. Each lane appends handoff notes
//! to `handoff/<owner>.jsonl` and publishes its task statuses to
//! `deps/<lane>.json` after every state save. Readers merge the other lanes'
//! snapshots to resolve cross-lane dependencies and fold recent notes from
//! other owners into prompts.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::selector::DepsSnapshot;
use crate::core::task::Owner;

/// One note published for other lanes; appended, never rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffEvent {
    pub timestamp: DateTime<Utc>,
    pub lane: String,
    pub owner: Owner,
    pub task_id: String,
    pub summary: String,
}

/// Accessor for one lane's view of the coordination directory.
#[derive(Debug, Clone)]
pub struct Coordination {
    dir: PathBuf,
    lane_id: String,
    owner: Owner,
}

impl Coordination {
    pub fn new(dir: impl Into<PathBuf>, lane_id: impl Into<String>, owner: Owner) -> Self {
        Self {
            dir: dir.into(),
            lane_id: lane_id.into(),
            owner,
        }
    }

    fn handoff_path(&self, owner: Owner) -> PathBuf {
        self.dir.join("handoff").join(format!("{owner}.jsonl"))
    }

    fn deps_path(&self, lane_id: &str) -> PathBuf {
        self.dir.join("deps").join(format!("{lane_id}.json"))
    }

    /// Append a completion note to this owner's handoff stream.
    #[instrument(skip_all, fields(task_id))]
    pub fn publish_handoff(&self, task_id: &str, summary: &str, now: DateTime<Utc>) -> Result<()> {
        let event = HandoffEvent {
            timestamp: now,
            lane: self.lane_id.clone(),
            owner: self.owner,
            task_id: task_id.to_string(),
            summary: summary.to_string(),
        };
        let path = self.handoff_path(self.owner);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(&event).context("serialize handoff event")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open handoff log {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append handoff log {}", path.display()))?;
        Ok(())
    }

    /// Most recent notes from OTHER owners, oldest first, capped at `limit`.
    ///
    /// Corrupt lines are skipped; a coordination directory shared across
    /// machines can hold partially written records.
    #[instrument(skip_all)]
    pub fn read_digest(&self, limit: usize) -> Result<Vec<HandoffEvent>> {
        let mut events = Vec::new();
        for owner in Owner::ALL {
            if owner == self.owner {
                continue;
            }
            let path = self.handoff_path(owner);
            let contents = match fs::read_to_string(&path) {
                Ok(contents) => contents,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("read handoff log {}", path.display()));
                }
            };
            for line in contents.lines() {
                match serde_json::from_str::<HandoffEvent>(line) {
                    Ok(event) => events.push(event),
                    Err(err) => {
                        warn!(path = %path.display(), err = %err, "skipping corrupt handoff line");
                    }
                }
            }
        }
        events.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.lane.cmp(&b.lane)));
        if events.len() > limit {
            events.drain(..events.len() - limit);
        }
        Ok(events)
    }

    /// Atomically publish this lane's task statuses for other lanes to read.
    #[instrument(skip_all)]
    pub fn publish_deps(&self, snapshot: &DepsSnapshot) -> Result<()> {
        let path = self.deps_path(&self.lane_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut payload = serde_json::to_string_pretty(snapshot).context("serialize deps snapshot")?;
        payload.push('\n');
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, payload)
            .with_context(|| format!("write temp deps snapshot {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("replace deps snapshot {}", path.display()))?;
        Ok(())
    }

    /// Merge the other lanes' published snapshots into one dependency view.
    ///
    /// This lane's own snapshot is excluded: local state is always fresher.
    #[instrument(skip_all)]
    pub fn load_deps(&self) -> Result<DepsSnapshot> {
        let mut merged = DepsSnapshot::new();
        let deps_dir = self.dir.join("deps");
        let entries = match fs::read_dir(&deps_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(merged),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read deps directory {}", deps_dir.display()));
            }
        };
        let own_file = format!("{}.json", self.lane_id);
        for entry in entries {
            let entry = entry.context("read deps directory entry")?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.ends_with(".json") || name == own_file {
                continue;
            }
            let path = entry.path();
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read deps snapshot {}", path.display()))?;
            match serde_json::from_str::<DepsSnapshot>(&contents) {
                Ok(snapshot) => {
                    debug!(lane = %name, entries = snapshot.len(), "merged deps snapshot");
                    merged.extend(snapshot);
                }
                Err(err) => {
                    warn!(path = %path.display(), err = %err, "skipping corrupt deps snapshot");
                }
            }
        }
        Ok(merged)
    }
}
