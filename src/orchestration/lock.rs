use crate::orchestration::error::OrchestratorError;
use crate::orchestration::run_store::io_error;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
#[cfg(unix)]
use std::process::{Command, Stdio};

pub const RUN_LOCK_FILE: &str = "run.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOwner {
    Free,
    Alive { pid: u32 },
    /// The recorded writer is gone, or the file names no pid at all.
    Stale { pid: Option<u32> },
}

/// Exclusive writer guard for one run directory. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    reclaimed_from: Option<u32>,
}

impl RunLock {
    /// Takes the run lock. A lock left behind by a dead process is taken
    /// over; [`RunLock::reclaimed_from`] then reports the previous pid.
    pub fn acquire(run_dir: &Path, run_id: &str) -> Result<Self, OrchestratorError> {
        fs::create_dir_all(run_dir).map_err(|source| io_error(run_dir, source))?;
        let path = run_dir.join(RUN_LOCK_FILE);
        match create_lock_file(&path) {
            Ok(()) => {
                return Ok(Self {
                    path,
                    reclaimed_from: None,
                })
            }
            Err(source) if source.kind() == ErrorKind::AlreadyExists => {}
            Err(source) => return Err(io_error(&path, source)),
        }

        let previous = match lock_owner(&path)? {
            LockOwner::Alive { .. } => return Err(locked(run_id, &path)),
            LockOwner::Stale { pid: Some(pid) } => pid,
            // Either released meanwhile or still being written by its owner.
            LockOwner::Free | LockOwner::Stale { pid: None } => {
                return Err(locked(run_id, &path))
            }
        };
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(source) if source.kind() == ErrorKind::NotFound => {}
            Err(source) => return Err(io_error(&path, source)),
        }
        // Two reclaimers race on create_new; the loser sees AlreadyExists.
        match create_lock_file(&path) {
            Ok(()) => Ok(Self {
                path,
                reclaimed_from: Some(previous),
            }),
            Err(source) if source.kind() == ErrorKind::AlreadyExists => {
                Err(locked(run_id, &path))
            }
            Err(source) => Err(io_error(&path, source)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn reclaimed_from(&self) -> Option<u32> {
        self.reclaimed_from
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub fn lock_owner(path: &Path) -> Result<LockOwner, OrchestratorError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(source) if source.kind() == ErrorKind::NotFound => return Ok(LockOwner::Free),
        Err(source) => return Err(io_error(path, source)),
    };
    let pid = raw
        .lines()
        .find_map(|line| line.strip_prefix("pid="))
        .and_then(|value| value.trim().parse::<u32>().ok());
    Ok(match pid {
        Some(pid) if is_process_alive(pid) => LockOwner::Alive { pid },
        pid => LockOwner::Stale { pid },
    })
}

pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    if pid == std::process::id() {
        return true;
    }

    #[cfg(unix)]
    {
        Command::new("kill")
            .arg("-0")
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(unix))]
    {
        true
    }
}

fn create_lock_file(path: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let body = format!(
        "pid={}\nacquired_at={}\n",
        std::process::id(),
        crate::shared::now_rfc3339()
    );
    if let Err(err) = file.write_all(body.as_bytes()) {
        let _ = fs::remove_file(path);
        return Err(err);
    }
    Ok(())
}

fn locked(run_id: &str, path: &Path) -> OrchestratorError {
    OrchestratorError::RunLocked {
        run_id: run_id.to_string(),
        path: path.display().to_string(),
    }
}
