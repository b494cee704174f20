//! Heartbeat supervision: keeps one lane's scheduler alive.
//!
//! The supervisor spawns the scheduler as a child process (`run` subcommand
//! of this same binary), polls the lane heartbeat file, and kills/restarts
//! the child when the heartbeat goes stale. A scheduler that exits with a
//! deliberate code (all done, stalled, cycle budget) ends supervision;
//! crashes restart it with exponential backoff.

use std::fs::{self, OpenOptions};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::exit_codes;
use crate::io::config::{Defaults, LaneConfig, LanePaths};
use crate::io::heartbeat::read_heartbeat;
use crate::io::ps::terminate_with_grace;

/// Exit codes the scheduler uses on purpose; the supervisor must not treat
/// them as crashes.
pub fn is_deliberate_exit(code: i32) -> bool {
    matches!(
        code,
        exit_codes::OK | exit_codes::STALLED | exit_codes::MAX_CYCLES
    )
}

/// Exponential restart backoff: `min(cap, base * 2^restarts)`.
pub fn restart_backoff(base_secs: u64, cap_secs: u64, restarts: u32) -> Duration {
    let exp = restarts.min(32);
    Duration::from_secs(base_secs.saturating_mul(1u64 << exp).min(cap_secs))
}

/// Decide whether a heartbeat age means the child is wedged.
pub fn is_stale(age_secs: i64, stale_after_secs: u64) -> bool {
    age_secs >= 0 && age_secs as u64 >= stale_after_secs
}

/// Judge a child's liveness from its heartbeat and spawn time.
///
/// A heartbeat written before the child was spawned is a leftover from an
/// earlier incarnation and must not get a fresh child killed; until the
/// child writes its first beat, staleness is measured from the spawn
/// instant instead. One staleness event therefore terminates one child.
pub fn judge_stale(
    beat: Option<DateTime<Utc>>,
    spawned_at: DateTime<Utc>,
    now: DateTime<Utc>,
    stale_after_secs: u64,
) -> bool {
    let reference = match beat {
        Some(beat) if beat >= spawned_at => beat,
        _ => spawned_at,
    };
    is_stale((now - reference).num_seconds(), stale_after_secs)
}

/// What one poll of a running child concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Poll {
    Running,
    Stale,
    Exited(i32),
}

pub struct Supervisor<'a> {
    lane: &'a LaneConfig,
    paths: LanePaths,
    defaults: &'a Defaults,
    config_path: &'a Path,
}

impl<'a> Supervisor<'a> {
    pub fn new(lane: &'a LaneConfig, defaults: &'a Defaults, config_path: &'a Path) -> Self {
        Self {
            lane,
            paths: LanePaths::new(lane),
            defaults,
            config_path,
        }
    }

    /// Supervise until the scheduler finishes deliberately or the restart
    /// budget runs out. Returns the exit code the supervisor should use.
    #[instrument(skip_all, fields(lane = %self.lane.id))]
    pub fn supervise(&self) -> Result<i32> {
        fs::create_dir_all(&self.paths.dir)
            .with_context(|| format!("create lane directory {}", self.paths.dir.display()))?;
        fs::write(&self.paths.supervisor_pid_path, format!("{}\n", std::process::id()))
            .with_context(|| {
                format!("write pid file {}", self.paths.supervisor_pid_path.display())
            })?;
        let result = self.supervise_inner();
        let _ = fs::remove_file(&self.paths.supervisor_pid_path);
        result
    }

    fn supervise_inner(&self) -> Result<i32> {
        let mut restarts: u32 = 0;
        loop {
            let mut child = self.spawn_scheduler()?;
            let spawned_at = Utc::now();
            info!(pid = child.id(), "scheduler started");

            let code = loop {
                match self.poll(&mut child, spawned_at)? {
                    Poll::Running => {
                        thread::sleep(Duration::from_secs(self.defaults.poll_interval_secs.max(1)));
                    }
                    Poll::Exited(code) => break code,
                    Poll::Stale => {
                        warn!(pid = child.id(), "heartbeat stale, terminating scheduler");
                        terminate_with_grace(
                            child.id(),
                            Duration::from_secs(self.defaults.termination_grace_secs),
                        )?;
                        child.wait().context("reap terminated scheduler")?;
                        break -1;
                    }
                }
            };

            if code >= 0 && is_deliberate_exit(code) {
                info!(code, "scheduler finished deliberately, ending supervision");
                return Ok(code);
            }

            restarts += 1;
            if let Some(max_restarts) = self.defaults.max_restarts
                && restarts > max_restarts
            {
                warn!(restarts, "restart budget exhausted, giving up");
                return Ok(exit_codes::STALLED);
            }
            let backoff = restart_backoff(
                self.defaults.restart_backoff_base_secs,
                self.defaults.restart_backoff_cap_secs,
                restarts - 1,
            );
            warn!(code, restarts, backoff_secs = backoff.as_secs(), "restarting scheduler");
            thread::sleep(backoff);
        }
    }

    fn poll(&self, child: &mut Child, spawned_at: DateTime<Utc>) -> Result<Poll> {
        if let Some(status) = child.try_wait().context("poll scheduler")? {
            // Killed by a signal reports no code; treat it as a crash.
            return Ok(Poll::Exited(status.code().unwrap_or(-1)));
        }
        let beat = match read_heartbeat(&self.paths.heartbeat_path) {
            Ok(heartbeat) => Some(heartbeat.timestamp),
            // No heartbeat yet right after spawn is normal; the child gets
            // until the staleness window to write its first one.
            Err(err) => {
                if self.paths.heartbeat_path.exists() {
                    warn!(err = %err, "heartbeat unreadable");
                }
                None
            }
        };
        if judge_stale(beat, spawned_at, Utc::now(), self.defaults.stale_heartbeat_secs) {
            return Ok(Poll::Stale);
        }
        Ok(Poll::Running)
    }

    fn spawn_scheduler(&self) -> Result<Child> {
        let exe = std::env::current_exe().context("resolve current executable")?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.paths.supervisor_log_path)
            .with_context(|| {
                format!("open supervisor log {}", self.paths.supervisor_log_path.display())
            })?;
        Command::new(exe)
            .arg("run")
            .arg("--config")
            .arg(self.config_path)
            .arg("--lane")
            .arg(&self.lane.id)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone().context("clone log handle")?))
            .stderr(Stdio::from(log))
            .spawn()
            .context("spawn scheduler child")
    }
}
