//! Mutable per-task state and the transitions the scheduler applies to it.
//!
//! Every [`Task`](super::task::Task) has exactly one [`TaskState`], keyed by
//! task id in the persisted state map. Status only ever changes through the
//! transition helpers here, which keeps the state machine auditable.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::retry::Disposition;
use super::task::{Owner, Task};

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Partial,
    Blocked,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Partial => "partial",
            TaskStatus::Blocked => "blocked",
        }
    }
}

/// Persisted mutable bookkeeping for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskState {
    pub status: TaskStatus,
    pub attempts: u32,
    pub retryable_failures: u32,
    pub deadlock_recoveries: u32,
    pub deadlock_reopens: u32,
    /// Cooldown: the task is not selectable before this instant.
    pub not_before: Option<DateTime<Utc>>,
    pub last_update: String,
    pub last_summary: String,
    pub last_error: String,
    pub owner: Option<Owner>,
}

impl Default for TaskState {
    fn default() -> Self {
        Self {
            status: TaskStatus::Pending,
            attempts: 0,
            retryable_failures: 0,
            deadlock_recoveries: 0,
            deadlock_reopens: 0,
            not_before: None,
            last_update: String::new(),
            last_summary: String::new(),
            last_error: String::new(),
            owner: None,
        }
    }
}

/// Map of task id to its mutable state.
pub type StateMap = BTreeMap<String, TaskState>;

/// What reconciliation changed, for audit logging and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Ids added with a fresh default state.
    pub added: Vec<String>,
    /// Ids dropped because no task definition matches.
    pub dropped: Vec<String>,
    /// Ids downgraded from `in_progress` to `pending` (crash recovery).
    pub downgraded: Vec<String>,
}

impl ReconcileSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.dropped.is_empty() && self.downgraded.is_empty()
    }
}

/// Merge persisted state with the definition set.
///
/// Missing entries get defaults, entries for unknown ids are dropped, and any
/// lingering `in_progress` entry is downgraded to `pending`; a previous
/// process died mid-execution and the attempt must not be trusted.
pub fn reconcile(tasks: &[Task], mut persisted: StateMap) -> (StateMap, ReconcileSummary) {
    let mut summary = ReconcileSummary::default();
    let mut states = StateMap::new();

    for task in tasks {
        let mut state = match persisted.remove(&task.id) {
            Some(state) => state,
            None => {
                summary.added.push(task.id.clone());
                TaskState::default()
            }
        };
        if state.status == TaskStatus::InProgress {
            state.status = TaskStatus::Pending;
            state.not_before = None;
            state.last_update = "downgraded from in_progress on startup".to_string();
            summary.downgraded.push(task.id.clone());
        }
        state.owner = Some(task.owner);
        states.insert(task.id.clone(), state);
    }

    summary.dropped.extend(persisted.into_keys());
    (states, summary)
}

/// Enter `in_progress`: attempts increments exactly once per execution start,
/// and any cooldown is cleared.
pub fn begin_attempt(state: &mut TaskState, now: DateTime<Utc>) {
    state.status = TaskStatus::InProgress;
    state.attempts += 1;
    state.not_before = None;
    state.last_update = format!("attempt {} started at {}", state.attempts, now.to_rfc3339());
}

/// Record a successful, validated completion.
///
/// Resets the retryable-failure counter so a later transient failure starts
/// its backoff from the base value again.
pub fn record_done(state: &mut TaskState, summary: &str, now: DateTime<Utc>) {
    state.status = TaskStatus::Done;
    state.retryable_failures = 0;
    state.not_before = None;
    state.last_summary = summary.to_string();
    state.last_error = String::new();
    state.last_update = format!("done at {}", now.to_rfc3339());
}

/// Fold a failure disposition into the state.
pub fn record_failure(
    state: &mut TaskState,
    disposition: Disposition,
    summary: &str,
    error: &str,
    now: DateTime<Utc>,
) {
    state.last_summary = summary.to_string();
    state.last_error = error.to_string();
    match disposition {
        Disposition::RetryTransient { delay } => {
            state.status = TaskStatus::Pending;
            state.retryable_failures += 1;
            state.not_before = Some(now + TimeDelta::seconds(delay.as_secs() as i64));
            state.last_update = format!(
                "transient failure {} rescheduled at {}",
                state.retryable_failures,
                now.to_rfc3339()
            );
        }
        Disposition::RetryBounded { delay } => {
            state.status = TaskStatus::Pending;
            state.not_before = Some(now + TimeDelta::seconds(delay.as_secs() as i64));
            state.last_update = format!(
                "attempt {} failed, rescheduled at {}",
                state.attempts,
                now.to_rfc3339()
            );
        }
        Disposition::Block => {
            state.status = TaskStatus::Blocked;
            state.not_before = None;
            state.last_update = format!("blocked at {}", now.to_rfc3339());
        }
    }
}

/// Recycle a stalled or blocked task back to pending with a fresh cooldown
/// (continuous mode only).
pub fn recycle(state: &mut TaskState, cooldown_secs: u64, now: DateTime<Utc>) {
    state.status = TaskStatus::Pending;
    state.not_before = Some(now + TimeDelta::seconds(cooldown_secs as i64));
    state.last_update = format!("recycled in continuous mode at {}", now.to_rfc3339());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::retry::Disposition;
    use crate::test_support::task;
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        "2026-02-10T12:00:00Z".parse().expect("timestamp")
    }

    #[test]
    fn reconcile_downgrades_in_progress_entries() {
        let tasks = vec![task("a", Owner::Claude, 1, &[])];
        let mut persisted = StateMap::new();
        persisted.insert(
            "a".to_string(),
            TaskState {
                status: TaskStatus::InProgress,
                attempts: 2,
                ..TaskState::default()
            },
        );

        let (states, summary) = reconcile(&tasks, persisted);
        let state = &states["a"];
        assert_eq!(state.status, TaskStatus::Pending);
        assert_eq!(state.attempts, 2);
        assert_eq!(summary.downgraded, vec!["a".to_string()]);
    }

    #[test]
    fn reconcile_adds_missing_and_drops_unknown() {
        let tasks = vec![task("a", Owner::Claude, 1, &[])];
        let mut persisted = StateMap::new();
        persisted.insert("ghost".to_string(), TaskState::default());

        let (states, summary) = reconcile(&tasks, persisted);
        assert!(states.contains_key("a"));
        assert!(!states.contains_key("ghost"));
        assert_eq!(summary.added, vec!["a".to_string()]);
        assert_eq!(summary.dropped, vec!["ghost".to_string()]);
    }

    #[test]
    fn begin_attempt_increments_once_and_clears_cooldown() {
        let mut state = TaskState {
            not_before: Some(now()),
            ..TaskState::default()
        };
        begin_attempt(&mut state, now());
        assert_eq!(state.status, TaskStatus::InProgress);
        assert_eq!(state.attempts, 1);
        assert!(state.not_before.is_none());
    }

    #[test]
    fn record_done_resets_retryable_failures() {
        let mut state = TaskState {
            retryable_failures: 3,
            last_error: "boom".to_string(),
            ..TaskState::default()
        };
        record_done(&mut state, "all green", now());
        assert_eq!(state.status, TaskStatus::Done);
        assert_eq!(state.retryable_failures, 0);
        assert!(state.last_error.is_empty());
    }

    #[test]
    fn record_transient_failure_sets_cooldown() {
        let mut state = TaskState::default();
        record_failure(
            &mut state,
            Disposition::RetryTransient {
                delay: Duration::from_secs(60),
            },
            "",
            "rate limit",
            now(),
        );
        assert_eq!(state.status, TaskStatus::Pending);
        assert_eq!(state.retryable_failures, 1);
        assert_eq!(state.not_before, Some(now() + TimeDelta::seconds(60)));
    }

    #[test]
    fn record_block_is_terminal() {
        let mut state = TaskState {
            attempts: 3,
            ..TaskState::default()
        };
        record_failure(&mut state, Disposition::Block, "", "fatal", now());
        assert_eq!(state.status, TaskStatus::Blocked);
        assert_eq!(state.last_error, "fatal");
        assert!(state.not_before.is_none());
    }
}
