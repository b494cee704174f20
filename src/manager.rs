//! Lane lifecycle: start, stop, and status across the configured lanes.
//!
//! `start` preflights a lane and spawns a detached supervisor for it;
//! `stop` drops a pause marker (the scheduler exits at its next cycle
//! boundary) and then terminates the supervisor and any running scheduler;
//! `status` reports what each lane's runtime files say right now.

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::core::state::TaskStatus;
use crate::io::config::{Defaults, LaneConfig, LanePaths, LanesFile};
use crate::io::heartbeat::read_heartbeat;
use crate::io::lock::RunnerLock;
use crate::io::ps::{is_pid_alive, terminate_with_grace};
use crate::io::store::{load_state, load_tasks};
use crate::io::validate::{find_on_path, preflight};

/// A pause marker older than this no longer blocks `start`.
const PAUSE_MARKER_STALE: Duration = Duration::from_secs(24 * 3600);

/// Start supervisors for the named lanes (all lanes when empty).
#[instrument(skip_all)]
pub fn start(file: &LanesFile, config_path: &Path, lane_ids: &[String], force: bool) -> Result<()> {
    for lane in selected(file, lane_ids)? {
        start_lane(lane, &file.defaults, config_path, force)?;
    }
    Ok(())
}

fn start_lane(
    lane: &LaneConfig,
    defaults: &Defaults,
    config_path: &Path,
    force: bool,
) -> Result<()> {
    let paths = LanePaths::new(lane);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create lane directory {}", paths.dir.display()))?;

    if let Some(pid) = read_pid(&paths.supervisor_pid_path)
        && is_pid_alive(pid)
    {
        info!(lane = %lane.id, pid, "supervisor already running");
        return Ok(());
    }

    if paths.paused_path.exists() {
        let stale = marker_age(&paths.paused_path)
            .map(|age| age >= PAUSE_MARKER_STALE)
            .unwrap_or(true);
        if !force && !stale {
            return Err(anyhow!(
                "lane '{}' is paused; resume with --force or remove {}",
                lane.id,
                paths.paused_path.display()
            ));
        }
        warn!(lane = %lane.id, forced = force, "clearing pause marker");
        fs::remove_file(&paths.paused_path)
            .with_context(|| format!("remove pause marker {}", paths.paused_path.display()))?;
    }

    preflight_lane(lane, defaults)?;

    let exe = std::env::current_exe().context("resolve current executable")?;
    let child = Command::new(exe)
        .arg("supervise")
        .arg("--config")
        .arg(config_path)
        .arg("--lane")
        .arg(&lane.id)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("spawn supervisor for lane '{}'", lane.id))?;
    info!(lane = %lane.id, pid = child.id(), "supervisor started");
    Ok(())
}

/// Everything that must hold before a lane is allowed to run.
fn preflight_lane(lane: &LaneConfig, defaults: &Defaults) -> Result<()> {
    if !lane.repo.is_dir() {
        return Err(anyhow!(
            "lane '{}': repository {} does not exist",
            lane.id,
            lane.repo.display()
        ));
    }
    let paths = LanePaths::new(lane);
    load_tasks(&paths.tasks_path)
        .with_context(|| format!("lane '{}': tasks file is not runnable", lane.id))?;
    let agent = defaults.owner_agent(lane.owner);
    let bin = agent.bin_for(lane.owner);
    if find_on_path(&bin).is_none() {
        return Err(anyhow!(
            "lane '{}': agent executable '{bin}' not found on PATH",
            lane.id
        ));
    }
    preflight(&defaults.validation).with_context(|| format!("lane '{}'", lane.id))?;
    Ok(())
}

/// Stop the named lanes (all lanes when empty).
#[instrument(skip_all)]
pub fn stop(file: &LanesFile, lane_ids: &[String]) -> Result<()> {
    let grace = Duration::from_secs(file.defaults.termination_grace_secs);
    for lane in selected(file, lane_ids)? {
        stop_lane(lane, grace)?;
    }
    Ok(())
}

fn stop_lane(lane: &LaneConfig, grace: Duration) -> Result<()> {
    let paths = LanePaths::new(lane);
    if !paths.dir.is_dir() {
        info!(lane = %lane.id, "lane directory absent, nothing to stop");
        return Ok(());
    }
    // Marker first: a scheduler that survives the signals still exits at
    // its next cycle boundary.
    fs::write(&paths.paused_path, format!("paused at {}\n", Utc::now().to_rfc3339()))
        .with_context(|| format!("write pause marker {}", paths.paused_path.display()))?;

    if let Some(pid) = read_pid(&paths.supervisor_pid_path) {
        if is_pid_alive(pid) {
            info!(lane = %lane.id, pid, "terminating supervisor");
            terminate_with_grace(pid, grace)?;
        }
        let _ = fs::remove_file(&paths.supervisor_pid_path);
    }

    if let Some(pid) = RunnerLock::holder(&paths.lock_path)?
        && is_pid_alive(pid)
    {
        info!(lane = %lane.id, pid, "terminating scheduler");
        terminate_with_grace(pid, grace)?;
    }
    Ok(())
}

/// Point-in-time view of one lane, assembled from its runtime files.
#[derive(Debug, Clone, Serialize)]
pub struct LaneStatus {
    pub lane: String,
    pub owner: String,
    pub paused: bool,
    pub supervisor_pid: Option<u32>,
    pub supervisor_alive: bool,
    pub scheduler_pid: Option<u32>,
    pub scheduler_alive: bool,
    pub heartbeat_phase: Option<String>,
    pub heartbeat_cycle: Option<u64>,
    pub heartbeat_age_secs: Option<i64>,
    pub tasks_pending: usize,
    pub tasks_in_progress: usize,
    pub tasks_done: usize,
    pub tasks_partial: usize,
    pub tasks_blocked: usize,
}

/// Collect status for the named lanes (all lanes when empty).
pub fn status(file: &LanesFile, lane_ids: &[String], now: DateTime<Utc>) -> Result<Vec<LaneStatus>> {
    selected(file, lane_ids)?
        .into_iter()
        .map(|lane| lane_status(lane, now))
        .collect()
}

fn lane_status(lane: &LaneConfig, now: DateTime<Utc>) -> Result<LaneStatus> {
    let paths = LanePaths::new(lane);
    let supervisor_pid = read_pid(&paths.supervisor_pid_path);
    let scheduler_pid = RunnerLock::holder(&paths.lock_path)?;

    let (heartbeat_phase, heartbeat_cycle, heartbeat_age_secs) =
        match read_heartbeat(&paths.heartbeat_path) {
            Ok(heartbeat) => (
                Some(heartbeat.phase),
                Some(heartbeat.cycle),
                Some((now - heartbeat.timestamp).num_seconds()),
            ),
            Err(_) => (None, None, None),
        };

    let mut status = LaneStatus {
        lane: lane.id.clone(),
        owner: lane.owner.to_string(),
        paused: paths.paused_path.exists(),
        supervisor_alive: supervisor_pid.is_some_and(is_pid_alive),
        supervisor_pid,
        scheduler_alive: scheduler_pid.is_some_and(is_pid_alive),
        scheduler_pid,
        heartbeat_phase,
        heartbeat_cycle,
        heartbeat_age_secs,
        tasks_pending: 0,
        tasks_in_progress: 0,
        tasks_done: 0,
        tasks_partial: 0,
        tasks_blocked: 0,
    };
    if let Ok(states) = load_state(&paths.state_path) {
        for state in states.values() {
            match state.status {
                TaskStatus::Pending => status.tasks_pending += 1,
                TaskStatus::InProgress => status.tasks_in_progress += 1,
                TaskStatus::Done => status.tasks_done += 1,
                TaskStatus::Partial => status.tasks_partial += 1,
                TaskStatus::Blocked => status.tasks_blocked += 1,
            }
        }
    }
    Ok(status)
}

fn selected<'a>(file: &'a LanesFile, lane_ids: &[String]) -> Result<Vec<&'a LaneConfig>> {
    if lane_ids.is_empty() {
        return Ok(file.lanes.iter().collect());
    }
    lane_ids.iter().map(|id| file.lane(id)).collect()
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn marker_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}
