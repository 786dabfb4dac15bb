//! Run lock
//!
//! Concurrent pipelines against the same state directory would break the
//! backup invariant, so a run holds `idreset.lock` (containing its pid) for
//! its whole lifetime. The pid is written to a staging file first and
//! hard-linked into place, so the lock never exists without its pid. A lock
//! left behind by a dead process is reclaimed.

use crate::error::{IdResetError, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};
use uuid::Uuid;

pub const LOCK_FILE_NAME: &str = "idreset.lock";

/// A lock without a readable pid younger than this is assumed held
const UNREADABLE_GRACE: Duration = Duration::from_secs(10);

/// Held lock; released on drop
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

/// Who owns an existing lock file
#[derive(Debug, PartialEq, Eq)]
enum Holder {
    Alive(u32),
    /// Content unreadable and recently written
    Unknown,
    Stale(Option<u32>),
}

impl RunLock {
    /// Acquire the lock in `state_dir`, creating the directory if needed
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)?;
        let path = state_dir.join(LOCK_FILE_NAME);
        let staged = stage_pid_file(state_dir)?;
        let result = Self::link(&staged, path);
        if let Err(e) = fs::remove_file(&staged) {
            debug!("failed to remove {}: {}", staged.display(), e);
        }
        result
    }

    fn link(staged: &Path, path: PathBuf) -> Result<Self> {
        // One retry: the first attempt may find a stale lock and clear it
        for _ in 0..2 {
            match fs::hard_link(staged, &path) {
                Ok(()) => {
                    debug!("acquired run lock {}", path.display());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match holder(&path) {
                    Holder::Alive(pid) => return Err(IdResetError::Locked { path, pid }),
                    Holder::Unknown => return Err(IdResetError::Locked { path, pid: 0 }),
                    Holder::Stale(pid) => clear_stale(&path, pid)?,
                },
                Err(e) => return Err(e.into()),
            }
        }
        Err(IdResetError::Locked {
            pid: read_pid(&path).unwrap_or(0),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("failed to release run lock {}: {}", self.path.display(), e);
        }
    }
}

/// Write this process's pid to a uniquely named file next to the lock
fn stage_pid_file(state_dir: &Path) -> Result<PathBuf> {
    let staged = state_dir.join(format!(
        "{}.{}.{}.tmp",
        LOCK_FILE_NAME,
        std::process::id(),
        Uuid::new_v4().simple()
    ));
    let mut file = OpenOptions::new().write(true).create_new(true).open(&staged)?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()?;
    Ok(staged)
}

fn holder(path: &Path) -> Holder {
    match read_pid(path) {
        Some(pid) if is_process_alive(pid) => Holder::Alive(pid),
        Some(pid) => Holder::Stale(Some(pid)),
        None if recently_modified(path) => Holder::Unknown,
        None => Holder::Stale(None),
    }
}

fn recently_modified(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age < UNREADABLE_GRACE)
}

/// Move a stale lock aside, handing it back if another run replaced it meanwhile
fn clear_stale(path: &Path, expected: Option<u32>) -> Result<()> {
    let parked = path.with_file_name(format!("{}.stale.{}", LOCK_FILE_NAME, Uuid::new_v4().simple()));
    match fs::rename(path, &parked) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    let moved = read_pid(&parked);
    if moved != expected {
        if let Err(e) = fs::hard_link(&parked, path) {
            debug!("lock {} was taken again: {}", path.display(), e);
        }
        fs::remove_file(&parked)?;
        return Err(IdResetError::Locked {
            path: path.to_path_buf(),
            pid: moved.unwrap_or(0),
        });
    }

    warn!("removing stale run lock {} (pid {:?})", path.display(), expected);
    fs::remove_file(&parked)?;
    Ok(())
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether a process exists (zombies count as dead)
#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if signal::kill(Pid::from_raw(raw), None).is_err() {
        return false;
    }
    if let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) {
        // Third field is the state; Z = zombie, X = dead
        if let Some(state) = stat.split_whitespace().nth(2) {
            return !matches!(state, "Z" | "X");
        }
    }
    true
}

/// No portable liveness probe; a lock with a readable pid is treated as held
#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}
