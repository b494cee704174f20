//! Task store: immutable definitions plus persisted mutable state.
//!
//! Definitions are schema-checked on load and fail fast on duplicate ids or
//! unsupported owners: a bad task file is a configuration error, never
//! retried. State is persisted as a whole-file atomic rewrite so a
//! concurrent reader can never observe a partial write.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result, bail};
use jsonschema::Draft;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::state::{ReconcileSummary, StateMap, TaskState, reconcile};
use crate::core::task::Task;

const TASKS_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/tasks.schema.json"
));

/// Loaded task store for one lane.
#[derive(Debug, Clone)]
pub struct TaskStore {
    pub tasks: Vec<Task>,
    pub states: StateMap,
}

impl TaskStore {
    /// Load definitions, then reconcile persisted state against them.
    #[instrument(skip_all, fields(tasks_path = %tasks_path.display()))]
    pub fn load(tasks_path: &Path, state_path: &Path) -> Result<(TaskStore, ReconcileSummary)> {
        let tasks = load_tasks(tasks_path)?;
        let persisted = load_state(state_path)?;
        let (states, summary) = reconcile(&tasks, persisted);
        debug!(
            tasks = tasks.len(),
            added = summary.added.len(),
            downgraded = summary.downgraded.len(),
            "task store loaded"
        );
        Ok((TaskStore { tasks, states }, summary))
    }
}

/// Parse and validate the task definitions file.
pub fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read tasks {}", path.display()))?;
    let instance: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse tasks json {}", path.display()))?;
    validate_schema(&instance)?;
    let tasks: Vec<Task> = serde_json::from_value(instance)
        .with_context(|| format!("parse tasks {} as task list", path.display()))?;

    let mut seen = BTreeSet::new();
    for task in &tasks {
        if !seen.insert(task.id.as_str()) {
            bail!("duplicate task id '{}' in {}", task.id, path.display());
        }
        for dep in &task.depends_on {
            if dep == &task.id {
                bail!("task '{}' depends on itself", task.id);
            }
        }
    }
    Ok(tasks)
}

/// Load persisted state; a missing file means a fresh lane (empty map).
///
/// Entries that no longer deserialize (an unknown status string, a field of
/// the wrong type) are reset to defaults rather than aborting the run; only
/// a file that is not valid JSON at all is an error.
pub fn load_state(path: &Path) -> Result<StateMap> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(StateMap::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("read state {}", path.display()));
        }
    };
    let raw: BTreeMap<String, Value> = serde_json::from_str(&contents)
        .with_context(|| format!("parse state {}", path.display()))?;
    let mut states = StateMap::new();
    for (id, value) in raw {
        match serde_json::from_value::<TaskState>(value) {
            Ok(state) => {
                states.insert(id, state);
            }
            Err(err) => {
                warn!(task = %id, err = %err, "unreadable state entry, resetting to defaults");
                states.insert(id, TaskState::default());
            }
        }
    }
    Ok(states)
}

/// Atomically rewrite the whole state file (temp file + fsync + rename).
pub fn save_state(path: &Path, states: &StateMap) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("state path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut payload = serde_json::to_string_pretty(states).context("serialize state")?;
    payload.push('\n');

    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp_path)
            .with_context(|| format!("create temp state {}", tmp_path.display()))?;
        use std::io::Write;
        file.write_all(payload.as_bytes())
            .with_context(|| format!("write temp state {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("fsync temp state {}", tmp_path.display()))?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("replace state {}", path.display()))?;
    Ok(())
}

/// Validate the tasks instance against the embedded JSON Schema
/// (Draft 2020-12).
fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(TASKS_SCHEMA).context("parse embedded tasks schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile tasks schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("tasks schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{TaskState, TaskStatus};
    use crate::core::task::Owner;

    fn write_tasks(path: &Path, json: &str) {
        fs::write(path, json).expect("write tasks");
    }

    #[test]
    fn load_tasks_accepts_well_formed_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");
        write_tasks(
            &path,
            r#"[
                {"id":"a","owner":"claude","priority":1,"title":"A"},
                {"id":"b","owner":"codex","priority":2,"title":"B","depends_on":["a"]}
            ]"#,
        );
        let tasks = load_tasks(&path).expect("load");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].depends_on, vec!["a"]);
    }

    #[test]
    fn load_tasks_rejects_duplicate_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");
        write_tasks(
            &path,
            r#"[
                {"id":"a","owner":"claude","priority":1,"title":"A"},
                {"id":"a","owner":"codex","priority":2,"title":"A again"}
            ]"#,
        );
        let err = load_tasks(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate task id"));
    }

    #[test]
    fn load_tasks_rejects_unsupported_owner() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");
        write_tasks(
            &path,
            r#"[{"id":"a","owner":"cursor","priority":1,"title":"A"}]"#,
        );
        let err = load_tasks(&path).unwrap_err();
        assert!(err.to_string().contains("schema validation failed"));
    }

    #[test]
    fn load_tasks_rejects_self_dependency() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");
        write_tasks(
            &path,
            r#"[{"id":"a","owner":"claude","priority":1,"title":"A","depends_on":["a"]}]"#,
        );
        let err = load_tasks(&path).unwrap_err();
        assert!(err.to_string().contains("depends on itself"));
    }

    #[test]
    fn missing_state_file_is_empty_map() {
        let temp = tempfile::tempdir().expect("tempdir");
        let states = load_state(&temp.path().join("state.json")).expect("load");
        assert!(states.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        let mut states = StateMap::new();
        states.insert(
            "a".to_string(),
            TaskState {
                status: TaskStatus::Done,
                attempts: 2,
                last_summary: "shipped".to_string(),
                owner: Some(Owner::Claude),
                ..TaskState::default()
            },
        );
        save_state(&path, &states).expect("save");
        let loaded = load_state(&path).expect("load");
        assert_eq!(loaded, states);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn unreadable_state_entry_resets_without_losing_the_rest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        fs::write(
            &path,
            r#"{
                "a": {"status": "done", "attempts": 2, "last_summary": "shipped"},
                "b": {"status": "paused", "attempts": "three"}
            }"#,
        )
        .expect("write state");

        let states = load_state(&path).expect("load");
        assert_eq!(states["a"].status, TaskStatus::Done);
        assert_eq!(states["a"].attempts, 2);
        assert_eq!(states["b"], TaskState::default());
    }

    #[test]
    fn state_file_that_is_not_json_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");
        fs::write(&path, "not json at all").expect("write state");
        assert!(load_state(&path).is_err());
    }

    #[test]
    fn store_load_reconciles_in_progress_to_pending() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tasks_path = temp.path().join("tasks.json");
        let state_path = temp.path().join("state.json");
        write_tasks(
            &tasks_path,
            r#"[{"id":"a","owner":"claude","priority":1,"title":"A"}]"#,
        );
        let mut states = StateMap::new();
        states.insert(
            "a".to_string(),
            TaskState {
                status: TaskStatus::InProgress,
                ..TaskState::default()
            },
        );
        save_state(&state_path, &states).expect("save");

        let (store, summary) = TaskStore::load(&tasks_path, &state_path).expect("load");
        assert_eq!(store.states["a"].status, TaskStatus::Pending);
        assert_eq!(summary.downgraded, vec!["a".to_string()]);
    }
}
