//! Lane scheduler: the cycle loop that drives a task queue to completion.
//!
//! One scheduler instance owns one lane. It holds the lane lock for the
//! whole run, reloads tasks and state every cycle so external edits are
//! picked up, and persists state before and after every attempt so a crash
//! mid-attempt is observable (the task is left `in_progress` and reconciled
//! back to `pending` on the next start).

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::core::outcome::OutcomeStatus;
use crate::core::recovery::recover_deadlock;
use crate::core::retry::{Disposition, FailureKind, classify, decide};
use crate::core::selector::{DepsSnapshot, all_done, next_cooldown_expiry, select_next};
use crate::core::state::{
    StateMap, TaskStatus, begin_attempt, record_done, record_failure, recycle,
};
use crate::io::agent::AgentRunner;
use crate::io::audit::{AuditEvent, AuditLog};
use crate::io::config::{Defaults, LaneConfig, LanePaths};
use crate::io::handoff::Coordination;
use crate::io::heartbeat::HeartbeatFile;
use crate::io::lock::RunnerLock;
use crate::io::store::{TaskStore, save_state};
use crate::io::validate::Validator;
use crate::pipeline::Pipeline;

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnd {
    /// Every task reached `done`.
    AllDone,
    /// No task is runnable and recovery is exhausted (or the lane was
    /// paused mid-run).
    Stalled,
    /// The configured cycle budget ran out.
    MaxCycles,
}

/// Scheduler for one lane. Agent and validation backends are injected so
/// tests drive the full loop without spawning real processes.
pub struct Scheduler<'a> {
    lane: &'a LaneConfig,
    paths: LanePaths,
    defaults: &'a Defaults,
    runner: &'a dyn AgentRunner,
    validator: &'a dyn Validator,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        lane: &'a LaneConfig,
        defaults: &'a Defaults,
        runner: &'a dyn AgentRunner,
        validator: &'a dyn Validator,
    ) -> Self {
        Self {
            lane,
            paths: LanePaths::new(lane),
            defaults,
            runner,
            validator,
        }
    }

    /// Run cycles until the lane finishes, stalls, or hits its budget.
    #[instrument(skip_all, fields(lane = %self.lane.id))]
    pub fn run(&self) -> Result<RunEnd> {
        std::fs::create_dir_all(&self.paths.dir)
            .with_context(|| format!("create lane directory {}", self.paths.dir.display()))?;
        let _lock = RunnerLock::acquire(&self.paths.lock_path)?;
        let heartbeat = HeartbeatFile::new(&self.paths.heartbeat_path);
        let audit = AuditLog::new(&self.paths.audit_path);
        let coordination = self.defaults.coordination_dir.as_ref().map(|dir| {
            Coordination::new(dir.clone(), self.lane.id.clone(), self.lane.owner)
        });
        let pipeline = Pipeline::new(
            &self.lane.id,
            self.lane.owner,
            &self.lane.repo,
            self.defaults,
            self.runner,
            self.validator,
            &audit,
            &heartbeat,
            coordination.as_ref(),
        );

        let mut cycle: u64 = 0;
        loop {
            cycle += 1;
            if let Some(max_cycles) = self.defaults.max_cycles
                && cycle > max_cycles
            {
                info!(max_cycles, "cycle budget exhausted");
                heartbeat.beat("max_cycles", cycle, "", "cycle budget exhausted")?;
                return Ok(RunEnd::MaxCycles);
            }
            if self.paths.paused_path.exists() {
                warn!("pause marker present, stopping");
                audit.append(&AuditEvent::new(cycle, "", None, "paused", "pause marker present"))?;
                heartbeat.beat("paused", cycle, "", "lane paused")?;
                return Ok(RunEnd::Stalled);
            }
            heartbeat.beat("select", cycle, "", "loading tasks")?;

            let (mut store, reconciled) =
                TaskStore::load(&self.paths.tasks_path, &self.paths.state_path)?;
            if !reconciled.is_empty() {
                audit.append(
                    &AuditEvent::new(cycle, "", None, "reconciled", "state reconciled with tasks")
                        .with_meta(json!({
                            "added": reconciled.added,
                            "dropped": reconciled.dropped,
                            "downgraded": reconciled.downgraded,
                        })),
                )?;
                self.save(&store.states, coordination.as_ref())?;
            }

            if all_done(&store.states) {
                info!(cycle, "all tasks done");
                heartbeat.beat("done", cycle, "", "all tasks done")?;
                self.save(&store.states, coordination.as_ref())?;
                return Ok(RunEnd::AllDone);
            }

            let snapshot = match &coordination {
                Some(coordination) => Some(coordination.load_deps()?),
                None => None,
            };
            let now = Utc::now();
            let Some(task) = select_next(&store.tasks, &store.states, snapshot.as_ref(), now)
            else {
                if let Some(expiry) = next_cooldown_expiry(&store.states, now) {
                    self.idle_until(&heartbeat, cycle, (expiry - now).num_seconds().max(1) as u64)?;
                    continue;
                }
                let report = recover_deadlock(
                    &store.tasks,
                    &mut store.states,
                    &self.defaults.recovery_policy(),
                    now,
                );
                if !report.is_empty() {
                    warn!(
                        reopened = report.reopened_blocked.len(),
                        deps = report.reopened_deps.len(),
                        "deadlock recovery reopened tasks"
                    );
                    audit.append(
                        &AuditEvent::new(cycle, "", None, "deadlock_recovery", "reopened tasks")
                            .with_meta(json!({
                                "reopened_blocked": report.reopened_blocked,
                                "reopened_deps": report.reopened_deps,
                            })),
                    )?;
                    self.save(&store.states, coordination.as_ref())?;
                    continue;
                }
                if self.defaults.continuous {
                    self.recycle_blocked(&mut store.states, cycle, &audit)?;
                    self.save(&store.states, coordination.as_ref())?;
                    self.idle_until(&heartbeat, cycle, self.defaults.recycle_cooldown_secs)?;
                    continue;
                }
                warn!(cycle, "lane stalled: nothing runnable, recovery exhausted");
                heartbeat.beat("stalled", cycle, "", "recovery exhausted")?;
                return Ok(RunEnd::Stalled);
            };

            let task = task.clone();
            info!(task_id = %task.id, attempts = store.states[&task.id].attempts, "task selected");
            audit.append(&AuditEvent::new(
                cycle,
                &task.id,
                Some(task.owner),
                "attempt_started",
                &task.title,
            ))?;
            {
                let state = store.states.get_mut(&task.id).expect("selected task has state");
                state.owner = Some(task.owner);
                begin_attempt(state, now);
            }
            // Persist `in_progress` before executing so a crash is visible.
            self.save(&store.states, coordination.as_ref())?;

            let state_before = store.states[&task.id].clone();
            let outcome = pipeline.execute(&task, &state_before, cycle)?;

            let now = Utc::now();
            let state = store.states.get_mut(&task.id).expect("selected task has state");
            match outcome.status {
                OutcomeStatus::Done => {
                    record_done(state, &outcome.summary, now);
                    audit.append(&AuditEvent::new(
                        cycle,
                        &task.id,
                        Some(task.owner),
                        "task_done",
                        &outcome.summary,
                    ))?;
                }
                OutcomeStatus::Partial | OutcomeStatus::Blocked => {
                    let failure = outcome.failure_text();
                    // A partial is the agent's own progress report, not an
                    // infrastructure failure: it always consumes an attempt,
                    // even when its summary happens to mention a timeout.
                    let kind = if outcome.status == OutcomeStatus::Partial {
                        FailureKind::Terminal
                    } else {
                        classify(&failure)
                    };
                    let disposition = decide(
                        kind,
                        state.attempts,
                        state.retryable_failures,
                        &self.defaults.retry_policy(),
                    );
                    debug!(?kind, ?disposition, "failure classified");
                    record_failure(state, disposition, &outcome.summary, &failure, now);
                    audit.append(
                        &AuditEvent::new(
                            cycle,
                            &task.id,
                            Some(task.owner),
                            "task_failed",
                            &failure,
                        )
                        .with_meta(json!({
                            "kind": format!("{kind:?}"),
                            "disposition": disposition_name(disposition),
                        })),
                    )?;
                }
            }
            self.save(&store.states, coordination.as_ref())?;
        }
    }

    /// Sleep while beating the heartbeat, bounded by the idle ceiling.
    fn idle_until(&self, heartbeat: &HeartbeatFile, cycle: u64, secs: u64) -> Result<()> {
        let total = secs.min(self.defaults.idle_sleep_ceiling_secs).max(1);
        let tick = self.defaults.heartbeat_tick_secs.max(1);
        debug!(total, "idling until next cooldown expiry");
        let mut remaining = total;
        while remaining > 0 {
            heartbeat.beat("idle", cycle, "", &format!("idle, {remaining}s remaining"))?;
            let slice = remaining.min(tick);
            thread::sleep(Duration::from_secs(slice));
            remaining -= slice;
        }
        Ok(())
    }

    fn recycle_blocked(&self, states: &mut StateMap, cycle: u64, audit: &AuditLog) -> Result<()> {
        let now = Utc::now();
        let mut recycled = Vec::new();
        for (id, state) in states.iter_mut() {
            if state.status == TaskStatus::Blocked {
                recycle(state, self.defaults.recycle_cooldown_secs, now);
                recycled.push(id.clone());
            }
        }
        if !recycled.is_empty() {
            info!(count = recycled.len(), "recycled blocked tasks (continuous mode)");
            audit.append(
                &AuditEvent::new(cycle, "", None, "recycled", "continuous mode recycle")
                    .with_meta(json!({ "tasks": recycled })),
            )?;
        }
        Ok(())
    }

    /// Save state and mirror it to the coordination directory.
    fn save(&self, states: &StateMap, coordination: Option<&Coordination>) -> Result<()> {
        save_state(&self.paths.state_path, states)?;
        if let Some(coordination) = coordination {
            coordination.publish_deps(&snapshot_of(states))?;
        }
        Ok(())
    }
}

fn snapshot_of(states: &StateMap) -> DepsSnapshot {
    states
        .iter()
        .map(|(id, state)| (id.clone(), state.status))
        .collect()
}

fn disposition_name(disposition: Disposition) -> &'static str {
    match disposition {
        Disposition::RetryTransient { .. } => "retry_transient",
        Disposition::RetryBounded { .. } => "retry_bounded",
        Disposition::Block => "block",
    }
}
