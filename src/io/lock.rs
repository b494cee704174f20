//! Exclusive lane lock with dead-owner reclaim.
//!
//! Exactly one scheduler process may mutate a lane's state file. The lock is
//! an atomically created file recording the owning PID; a lock left behind
//! by a dead process is reclaimed rather than treated as fatal, so a crashed
//! scheduler never wedges its lane.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::ps::is_pid_alive;

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub lock_file_path: String,
}

/// Held lane lock. Released on [`RunnerLock::release`] or best-effort on drop.
#[derive(Debug)]
pub struct RunnerLock {
    path: PathBuf,
    released: bool,
}

impl RunnerLock {
    /// Acquire the lane lock.
    ///
    /// Fails if a live process already holds it. A lock whose recorded PID is
    /// dead is reclaimed: the stale file is removed and acquisition retried
    /// once.
    pub fn acquire(path: &Path) -> Result<RunnerLock> {
        for reclaimed in [false, true] {
            match try_create(path) {
                Ok(()) => {
                    debug!(path = %path.display(), "lane lock acquired");
                    return Ok(RunnerLock {
                        path: path.to_path_buf(),
                        released: false,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let holder = read_lock(path)?;
                    if let Some(record) = &holder
                        && is_pid_alive(record.pid)
                    {
                        return Err(anyhow!(
                            "lane lock {} held by live pid {} since {}",
                            path.display(),
                            record.pid,
                            record.created_at.to_rfc3339()
                        ));
                    }
                    if reclaimed {
                        return Err(anyhow!(
                            "lane lock {} could not be reclaimed",
                            path.display()
                        ));
                    }
                    warn!(
                        path = %path.display(),
                        stale_pid = holder.map(|r| r.pid),
                        "reclaiming lock left by dead process"
                    );
                    fs::remove_file(path)
                        .with_context(|| format!("remove stale lock {}", path.display()))?;
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("create lock file {}", path.display()));
                }
            }
        }
        unreachable!("lock acquisition loop always returns");
    }

    /// Release the lock by removing its file.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        info!(path = %self.path.display(), "releasing lane lock");
        fs::remove_file(&self.path)
            .with_context(|| format!("remove lock file {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// PID recorded in an existing lock file, without acquiring anything.
    pub fn holder(path: &Path) -> Result<Option<u32>> {
        Ok(read_lock(path)?.map(|record| record.pid))
    }
}

impl Drop for RunnerLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn try_create(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let record = LockRecord {
        pid: std::process::id(),
        created_at: Utc::now(),
        lock_file_path: path.display().to_string(),
    };
    let mut payload =
        serde_json::to_string_pretty(&record).expect("lock record serializes to json");
    payload.push('\n');
    file.write_all(payload.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Read the lock record, tolerating an unreadable/corrupt file (treated as a
/// stale lock with no known holder).
fn read_lock(path: &Path) -> Result<Option<LockRecord>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(serde_json::from_str(&contents).ok()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read lock file {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_record_and_release_removes_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("lane.lock");

        let lock = RunnerLock::acquire(&path).expect("acquire");
        let record: LockRecord =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("parse");
        assert_eq!(record.pid, std::process::id());
        assert_eq!(
            RunnerLock::holder(&path).expect("holder"),
            Some(std::process::id())
        );

        lock.release().expect("release");
        assert!(!path.exists());
        assert_eq!(RunnerLock::holder(&path).expect("holder"), None);
    }

    #[test]
    fn second_acquire_by_live_holder_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("lane.lock");

        let _held = RunnerLock::acquire(&path).expect("acquire");
        let err = RunnerLock::acquire(&path).unwrap_err();
        assert!(err.to_string().contains("held by live pid"));
    }

    #[test]
    fn lock_from_dead_pid_is_reclaimed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("lane.lock");

        let record = LockRecord {
            pid: u32::MAX - 2,
            created_at: Utc::now(),
            lock_file_path: path.display().to_string(),
        };
        fs::write(&path, serde_json::to_string(&record).expect("serialize")).expect("write");

        let lock = RunnerLock::acquire(&path).expect("reclaim");
        let reread: LockRecord =
            serde_json::from_str(&fs::read_to_string(&path).expect("read")).expect("parse");
        assert_eq!(reread.pid, std::process::id());
        drop(lock);
        assert!(!path.exists(), "drop removes the lock file");
    }

    #[test]
    fn corrupt_lock_file_is_reclaimed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("lane.lock");
        fs::write(&path, "not json").expect("write");

        let lock = RunnerLock::acquire(&path).expect("reclaim corrupt lock");
        lock.release().expect("release");
    }
}
