//! Graph-level deadlock recovery.
//!
//! Invoked only when the scheduler has no ready task and no pending
//! cooldown. Recovery reopens blocked tasks (and, where it helps, one of
//! their completed dependencies) back to pending, bounded by per-task caps
//! so a genuinely impossible task set eventually reports as stalled instead
//! of cycling forever.

use chrono::{DateTime, Utc};

use super::state::{StateMap, TaskStatus};
use super::task::Task;

/// Per-task caps on automated recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Times a blocked task may be reopened by recovery.
    pub max_recoveries_per_task: u32,
    /// Times a done dependency may be reopened to unstick a dependent.
    pub max_reopens_per_task: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_recoveries_per_task: 2,
            max_reopens_per_task: 2,
        }
    }
}

/// What a recovery pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Blocked tasks reopened to pending.
    pub reopened_blocked: Vec<String>,
    /// Done dependencies reopened to pending.
    pub reopened_deps: Vec<String>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.reopened_blocked.is_empty() && self.reopened_deps.is_empty()
    }
}

/// Run one deadlock-recovery pass over the state map.
///
/// Blocked tasks are visited in the scheduler's deterministic order
/// `(priority, owner rank, id)`. For each one still under its recovery cap,
/// a done dependency under its reopen cap is reopened first (preferring one
/// owned by a *different* role, since cross-lane feedback loops are the
/// usual culprit) and then the blocked task itself is reopened.
///
/// An empty report means every blocked task has exhausted its cap: the lane
/// is genuinely stalled.
pub fn recover_deadlock(
    tasks: &[Task],
    states: &mut StateMap,
    policy: &RecoveryPolicy,
    now: DateTime<Utc>,
) -> RecoveryReport {
    let mut report = RecoveryReport::default();

    let mut blocked: Vec<&Task> = tasks
        .iter()
        .filter(|task| {
            states
                .get(&task.id)
                .is_some_and(|state| state.status == TaskStatus::Blocked)
        })
        .collect();
    blocked.sort_by_key(|task| (task.priority, task.owner.rank(), task.id.clone()));

    for task in blocked {
        let recoveries = states
            .get(&task.id)
            .map(|state| state.deadlock_recoveries)
            .unwrap_or(0);
        if recoveries >= policy.max_recoveries_per_task {
            continue;
        }

        if let Some(dep_id) = pick_reopenable_dep(task, tasks, states, policy) {
            let dep_state = states.get_mut(&dep_id).expect("dep state exists");
            dep_state.status = TaskStatus::Pending;
            dep_state.deadlock_reopens += 1;
            dep_state.not_before = None;
            dep_state.last_update = format!(
                "reopened at {} to unstick blocked task {}",
                now.to_rfc3339(),
                task.id
            );
            report.reopened_deps.push(dep_id);
        }

        let state = states.get_mut(&task.id).expect("blocked state exists");
        state.status = TaskStatus::Pending;
        state.deadlock_recoveries += 1;
        state.not_before = None;
        state.last_update = format!("reopened by deadlock recovery at {}", now.to_rfc3339());
        report.reopened_blocked.push(task.id.clone());
    }

    report
}

/// Choose a done dependency of `task` whose reopen count is under the cap,
/// preferring one owned by a different role.
fn pick_reopenable_dep(
    task: &Task,
    tasks: &[Task],
    states: &StateMap,
    policy: &RecoveryPolicy,
) -> Option<String> {
    let mut candidates: Vec<&Task> = task
        .depends_on
        .iter()
        .filter_map(|dep| tasks.iter().find(|t| &t.id == dep))
        .filter(|dep| {
            states.get(&dep.id).is_some_and(|state| {
                state.status == TaskStatus::Done
                    && state.deadlock_reopens < policy.max_reopens_per_task
            })
        })
        .collect();
    // `false` sorts first, so cross-role dependencies lead.
    candidates.sort_by_key(|dep| (dep.owner == task.owner, dep.id.clone()));
    candidates.first().map(|dep| dep.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{TaskState, reconcile};
    use crate::core::task::Owner;
    use crate::test_support::task;

    fn now() -> DateTime<Utc> {
        "2026-02-10T12:00:00Z".parse().expect("timestamp")
    }

    fn states_for(tasks: &[Task]) -> StateMap {
        reconcile(tasks, StateMap::new()).0
    }

    fn set_status(states: &mut StateMap, id: &str, status: TaskStatus) {
        states.get_mut(id).expect("state").status = status;
    }

    #[test]
    fn no_blocked_tasks_is_a_noop() {
        let tasks = vec![task("a", Owner::Claude, 0, &[])];
        let mut states = states_for(&tasks);
        let before = states.clone();

        let report = recover_deadlock(&tasks, &mut states, &RecoveryPolicy::default(), now());
        assert!(report.is_empty());
        assert_eq!(states, before);
    }

    #[test]
    fn reopens_blocked_task_and_done_dependency() {
        let tasks = vec![
            task("dep", Owner::Claude, 0, &[]),
            task("stuck", Owner::Codex, 0, &["dep"]),
        ];
        let mut states = states_for(&tasks);
        set_status(&mut states, "dep", TaskStatus::Done);
        set_status(&mut states, "stuck", TaskStatus::Blocked);

        let report = recover_deadlock(&tasks, &mut states, &RecoveryPolicy::default(), now());
        assert_eq!(report.reopened_blocked, vec!["stuck".to_string()]);
        assert_eq!(report.reopened_deps, vec!["dep".to_string()]);
        assert_eq!(states["stuck"].status, TaskStatus::Pending);
        assert_eq!(states["stuck"].deadlock_recoveries, 1);
        assert_eq!(states["dep"].status, TaskStatus::Pending);
        assert_eq!(states["dep"].deadlock_reopens, 1);
    }

    #[test]
    fn prefers_cross_role_dependency() {
        let tasks = vec![
            task("same-role-dep", Owner::Codex, 0, &[]),
            task("cross-role-dep", Owner::Claude, 0, &[]),
            task("stuck", Owner::Codex, 0, &["same-role-dep", "cross-role-dep"]),
        ];
        let mut states = states_for(&tasks);
        set_status(&mut states, "same-role-dep", TaskStatus::Done);
        set_status(&mut states, "cross-role-dep", TaskStatus::Done);
        set_status(&mut states, "stuck", TaskStatus::Blocked);

        let report = recover_deadlock(&tasks, &mut states, &RecoveryPolicy::default(), now());
        assert_eq!(report.reopened_deps, vec!["cross-role-dep".to_string()]);
        assert_eq!(states["same-role-dep"].status, TaskStatus::Done);
    }

    #[test]
    fn respects_per_task_recovery_cap() {
        let tasks = vec![task("stuck", Owner::Claude, 0, &[])];
        let mut states = states_for(&tasks);
        let policy = RecoveryPolicy {
            max_recoveries_per_task: 1,
            max_reopens_per_task: 1,
        };

        set_status(&mut states, "stuck", TaskStatus::Blocked);
        let first = recover_deadlock(&tasks, &mut states, &policy, now());
        assert_eq!(first.reopened_blocked, vec!["stuck".to_string()]);

        set_status(&mut states, "stuck", TaskStatus::Blocked);
        let second = recover_deadlock(&tasks, &mut states, &policy, now());
        assert!(second.is_empty(), "cap must stop a second recovery");
        assert_eq!(states["stuck"].deadlock_recoveries, 1);
    }

    #[test]
    fn respects_dependency_reopen_cap() {
        let tasks = vec![
            task("dep", Owner::Claude, 0, &[]),
            task("stuck", Owner::Codex, 0, &["dep"]),
        ];
        let mut states = states_for(&tasks);
        set_status(&mut states, "dep", TaskStatus::Done);
        set_status(&mut states, "stuck", TaskStatus::Blocked);
        states.get_mut("dep").expect("dep").deadlock_reopens = 2;

        let report = recover_deadlock(&tasks, &mut states, &RecoveryPolicy::default(), now());
        assert!(report.reopened_deps.is_empty());
        assert_eq!(report.reopened_blocked, vec!["stuck".to_string()]);
        assert_eq!(states["dep"].status, TaskStatus::Done);
    }

    #[test]
    fn visits_blocked_tasks_in_deterministic_order() {
        let tasks = vec![
            task("zz", Owner::Claude, 0, &[]),
            task("aa", Owner::Claude, 1, &[]),
        ];
        let mut states = states_for(&tasks);
        set_status(&mut states, "zz", TaskStatus::Blocked);
        set_status(&mut states, "aa", TaskStatus::Blocked);

        let report = recover_deadlock(&tasks, &mut states, &RecoveryPolicy::default(), now());
        assert_eq!(
            report.reopened_blocked,
            vec!["zz".to_string(), "aa".to_string()]
        );
    }

    #[test]
    fn stale_state_entries_do_not_panic() {
        let tasks = vec![task("a", Owner::Claude, 0, &["missing"])];
        let mut states = StateMap::new();
        states.insert(
            "a".to_string(),
            TaskState {
                status: TaskStatus::Blocked,
                ..TaskState::default()
            },
        );

        let report = recover_deadlock(&tasks, &mut states, &RecoveryPolicy::default(), now());
        assert_eq!(report.reopened_blocked, vec!["a".to_string()]);
        assert!(report.reopened_deps.is_empty());
    }
}
