//! Deterministic next-task selection.
//!
//! A task is ready iff it is pending, its cooldown has elapsed, and every
//! dependency is done, resolved first against the local state map and then
//! against an optional cross-lane dependency snapshot. Among ready tasks the
//! minimum by `(priority, owner rank, id)` wins, a fixed tie-break so
//! selection is reproducible under test.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::state::{StateMap, TaskStatus};
use super::task::Task;

/// Statuses of tasks owned by other lanes, read from the shared snapshot.
pub type DepsSnapshot = BTreeMap<String, TaskStatus>;

/// Pick the next runnable task, if any.
pub fn select_next<'a>(
    tasks: &'a [Task],
    states: &StateMap,
    snapshot: Option<&DepsSnapshot>,
    now: DateTime<Utc>,
) -> Option<&'a Task> {
    tasks
        .iter()
        .filter(|task| is_ready(task, states, snapshot, now))
        .min_by_key(|task| (task.priority, task.owner.rank(), task.id.as_str()))
}

fn is_ready(task: &Task, states: &StateMap, snapshot: Option<&DepsSnapshot>, now: DateTime<Utc>) -> bool {
    let Some(state) = states.get(&task.id) else {
        return false;
    };
    if state.status != TaskStatus::Pending {
        return false;
    }
    if let Some(not_before) = state.not_before
        && not_before > now
    {
        return false;
    }
    task.depends_on
        .iter()
        .all(|dep| dep_is_done(dep, states, snapshot))
}

/// Resolve a dependency: local state wins; the cross-lane snapshot is only
/// consulted for ids this lane does not track.
fn dep_is_done(dep: &str, states: &StateMap, snapshot: Option<&DepsSnapshot>) -> bool {
    if let Some(state) = states.get(dep) {
        return state.status == TaskStatus::Done;
    }
    matches!(
        snapshot.and_then(|snap| snap.get(dep)),
        Some(TaskStatus::Done)
    )
}

/// Soonest future cooldown expiry among pending-but-cooling tasks.
///
/// Returns `None` when no pending task is waiting on a cooldown, in which
/// case the lane is either finished or deadlocked.
pub fn next_cooldown_expiry(states: &StateMap, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    states
        .values()
        .filter(|state| state.status == TaskStatus::Pending)
        .filter_map(|state| state.not_before)
        .filter(|not_before| *not_before > now)
        .min()
}

/// True when every tracked task is done.
pub fn all_done(states: &StateMap) -> bool {
    states.values().all(|state| state.status == TaskStatus::Done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{TaskState, reconcile};
    use crate::core::task::Owner;
    use crate::test_support::task;
    use chrono::TimeDelta;

    fn now() -> DateTime<Utc> {
        "2026-02-10T12:00:00Z".parse().expect("timestamp")
    }

    fn fresh_states(tasks: &[Task]) -> StateMap {
        reconcile(tasks, StateMap::new()).0
    }

    #[test]
    fn selects_priority_then_dependency_order() {
        // A(priority 1), B(priority 1, depends on A), C(priority 0):
        // first C, then A, then B.
        let tasks = vec![
            task("a", Owner::Claude, 1, &[]),
            task("b", Owner::Claude, 1, &["a"]),
            task("c", Owner::Claude, 0, &[]),
        ];
        let mut states = fresh_states(&tasks);

        let first = select_next(&tasks, &states, None, now()).expect("ready task");
        assert_eq!(first.id, "c");
        states.get_mut("c").expect("c").status = TaskStatus::Done;

        let second = select_next(&tasks, &states, None, now()).expect("ready task");
        assert_eq!(second.id, "a");
        states.get_mut("a").expect("a").status = TaskStatus::Done;

        let third = select_next(&tasks, &states, None, now()).expect("ready task");
        assert_eq!(third.id, "b");
    }

    #[test]
    fn selection_is_deterministic_across_calls() {
        let tasks = vec![
            task("beta", Owner::Codex, 1, &[]),
            task("alpha", Owner::Codex, 1, &[]),
        ];
        let states = fresh_states(&tasks);
        for _ in 0..10 {
            let picked = select_next(&tasks, &states, None, now()).expect("ready task");
            assert_eq!(picked.id, "alpha");
        }
    }

    #[test]
    fn owner_rank_breaks_priority_ties() {
        let tasks = vec![
            task("g", Owner::Gemini, 1, &[]),
            task("c", Owner::Claude, 1, &[]),
        ];
        let states = fresh_states(&tasks);
        let picked = select_next(&tasks, &states, None, now()).expect("ready task");
        assert_eq!(picked.owner, Owner::Claude);
    }

    #[test]
    fn unsatisfied_dependency_is_never_selected() {
        let tasks = vec![task("b", Owner::Claude, 0, &["a"])];
        let states = fresh_states(&tasks);
        assert!(select_next(&tasks, &states, None, now()).is_none());
    }

    #[test]
    fn dependency_resolved_via_snapshot_only() {
        let tasks = vec![task("b", Owner::Claude, 0, &["other-lane-task"])];
        let states = fresh_states(&tasks);

        assert!(select_next(&tasks, &states, None, now()).is_none());

        let mut snapshot = DepsSnapshot::new();
        snapshot.insert("other-lane-task".to_string(), TaskStatus::Done);
        let picked = select_next(&tasks, &states, Some(&snapshot), now()).expect("ready");
        assert_eq!(picked.id, "b");

        snapshot.insert("other-lane-task".to_string(), TaskStatus::Pending);
        assert!(select_next(&tasks, &states, Some(&snapshot), now()).is_none());
    }

    #[test]
    fn local_state_shadows_snapshot() {
        // The dependency exists locally as blocked; a done entry in the
        // snapshot must not override it.
        let tasks = vec![
            task("a", Owner::Claude, 0, &[]),
            task("b", Owner::Claude, 0, &["a"]),
        ];
        let mut states = fresh_states(&tasks);
        states.get_mut("a").expect("a").status = TaskStatus::Blocked;

        let mut snapshot = DepsSnapshot::new();
        snapshot.insert("a".to_string(), TaskStatus::Done);
        let picked = select_next(&tasks, &states, Some(&snapshot), now());
        assert!(picked.is_none());
    }

    #[test]
    fn cooldown_defers_selection() {
        let tasks = vec![task("a", Owner::Claude, 0, &[])];
        let mut states = fresh_states(&tasks);
        states.get_mut("a").expect("a").not_before = Some(now() + TimeDelta::seconds(60));

        assert!(select_next(&tasks, &states, None, now()).is_none());
        assert!(
            select_next(&tasks, &states, None, now() + TimeDelta::seconds(61)).is_some()
        );
    }

    #[test]
    fn next_cooldown_expiry_finds_soonest_pending() {
        let tasks = vec![
            task("a", Owner::Claude, 0, &[]),
            task("b", Owner::Claude, 0, &[]),
        ];
        let mut states = fresh_states(&tasks);
        states.get_mut("a").expect("a").not_before = Some(now() + TimeDelta::seconds(300));
        states.get_mut("b").expect("b").not_before = Some(now() + TimeDelta::seconds(60));

        assert_eq!(
            next_cooldown_expiry(&states, now()),
            Some(now() + TimeDelta::seconds(60))
        );
    }

    #[test]
    fn next_cooldown_expiry_ignores_blocked_and_past() {
        let tasks = vec![
            task("a", Owner::Claude, 0, &[]),
            task("b", Owner::Claude, 0, &[]),
        ];
        let mut states = fresh_states(&tasks);
        let a = states.get_mut("a").expect("a");
        a.status = TaskStatus::Blocked;
        a.not_before = Some(now() + TimeDelta::seconds(10));
        states.get_mut("b").expect("b").not_before = Some(now() - TimeDelta::seconds(10));

        assert_eq!(next_cooldown_expiry(&states, now()), None);
    }

    #[test]
    fn all_done_requires_every_task() {
        let tasks = vec![
            task("a", Owner::Claude, 0, &[]),
            task("b", Owner::Claude, 0, &[]),
        ];
        let mut states = fresh_states(&tasks);
        assert!(!all_done(&states));
        for state in states.values_mut() {
            state.status = TaskStatus::Done;
        }
        assert!(all_done(&states));
    }

    #[test]
    fn missing_state_entry_is_not_ready() {
        let tasks = vec![task("a", Owner::Claude, 0, &[])];
        let states = StateMap::new();
        let state_of_a: Option<&TaskState> = states.get("a");
        assert!(state_of_a.is_none());
        assert!(select_next(&tasks, &states, None, now()).is_none());
    }
}
