//! Advisory lock serializing invocations against one archive directory.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::utils::errors::{EngineError, Result};

const LOCK_FILE: &str = "lockfile";
const STALE_LOCK_SECS: i64 = 6 * 60 * 60; // 6 hours

#[derive(Debug, Serialize, Deserialize)]
struct LockEntry {
    hostname: String,
    pid: u32,
    time: String,
}

impl LockEntry {
    fn current() -> Self {
        Self {
            hostname: current_hostname(),
            pid: std::process::id(),
            time: Utc::now().to_rfc3339(),
        }
    }

    fn is_stale(&self) -> bool {
        let age_exceeded = DateTime::parse_from_rfc3339(&self.time)
            .map(|t| Utc::now().signed_duration_since(t) > Duration::seconds(STALE_LOCK_SECS))
            .unwrap_or(true);
        if age_exceeded {
            return true;
        }
        self.hostname == current_hostname() && !pid_alive(self.pid)
    }
}

fn current_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn pid_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Held for the lifetime of one backup/restore/maintenance run.
#[derive(Debug)]
pub struct ArchiveLock {
    path: PathBuf,
}

impl ArchiveLock {
    pub fn acquire(archive_dir: &Path) -> Result<Self> {
        let path = archive_dir.join(LOCK_FILE);
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let entry = serde_json::to_vec(&LockEntry::current())?;
                    file.write_all(&entry)?;
                    file.sync_all()?;
                    debug!("Acquired lock {}", path.display());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let holder = fs::read(&path)
                        .ok()
                        .and_then(|b| serde_json::from_slice::<LockEntry>(&b).ok());
                    match holder {
                        Some(entry) if !entry.is_stale() => {
                            return Err(EngineError::Locked(format!(
                                "{} (pid {}, since {})",
                                entry.hostname, entry.pid, entry.time
                            )));
                        }
                        _ => {
                            warn!("Removing stale lock {}", path.display());
                            match fs::remove_file(&path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                                Err(e) => return Err(e.into()),
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Locked(path.display().to_string()))
    }
}

impl Drop for ArchiveLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_is_locked() -> Result<()> {
        let dir = TempDir::new()?;
        let guard = ArchiveLock::acquire(dir.path())?;
        assert!(matches!(
            ArchiveLock::acquire(dir.path()),
            Err(EngineError::Locked(_))
        ));
        drop(guard);
        let _again = ArchiveLock::acquire(dir.path())?;
        Ok(())
    }

    #[test]
    fn test_old_lock_is_stale() -> Result<()> {
        let dir = TempDir::new()?;
        let old = LockEntry {
            hostname: current_hostname(),
            pid: std::process::id(),
            time: (Utc::now() - Duration::hours(7)).to_rfc3339(),
        };
        fs::write(dir.path().join(LOCK_FILE), serde_json::to_vec(&old)?)?;
        let _guard = ArchiveLock::acquire(dir.path())?;
        Ok(())
    }

    #[test]
    fn test_garbage_lock_is_replaced() -> Result<()> {
        let dir = TempDir::new()?;
        fs::write(dir.path().join(LOCK_FILE), b"not json")?;
        let _guard = ArchiveLock::acquire(dir.path())?;
        Ok(())
    }
}
