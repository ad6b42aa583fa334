//! Cross-process single-session lock using advisory file locking (fs2 flock).
//!
//! Only one lockdown session may run per workstation: two engines fighting over
//! the same hooks and killing each other's whitelist would leave the machine in
//! an undefined state.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Advisory lock file, normally `<runtime_dir>/session.lock`.
#[derive(Debug, Clone)]
pub struct SessionLock {
    path: PathBuf,
}

/// RAII guard that releases the lock on drop.
pub struct SessionLockGuard {
    file: File,
}

impl Drop for SessionLockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl SessionLock {
    pub fn new() -> Result<Self> {
        let paths = crate::paths::Paths::resolve()?;
        Self::at(paths.session_lock())
    }

    pub fn at(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Non-blocking acquire. `None` means another session is running.
    ///
    /// The holder's PID is written into the file for diagnostics.
    pub fn try_acquire(&self) -> Result<Option<SessionLockGuard>> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                file.set_len(0)?;
                writeln!(file, "{}", std::process::id())?;
                Ok(Some(SessionLockGuard { file }))
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            #[cfg(unix)]
            Err(ref e) if e.raw_os_error() == Some(35) || e.raw_os_error() == Some(11) => {
                // EAGAIN(11) / EWOULDBLOCK(35 on macOS)
                Ok(None)
            }
            #[cfg(windows)]
            Err(ref e) if e.raw_os_error() == Some(33) => {
                // ERROR_LOCK_VIOLATION
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// PID recorded by the current (or last) holder.
    pub fn holder_pid(&self) -> Option<u32> {
        fs::read_to_string(&self.path).ok()?.trim().parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_held() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = SessionLock::at(tmp.path().join("session.lock")).unwrap();

        let guard = lock.try_acquire().unwrap();
        assert!(guard.is_some());
        assert_eq!(lock.holder_pid(), Some(std::process::id()));

        let other = SessionLock::at(tmp.path().join("session.lock")).unwrap();
        assert!(other.try_acquire().unwrap().is_none());

        drop(guard);
        assert!(other.try_acquire().unwrap().is_some());
    }

    #[test]
    fn creates_missing_parent() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = SessionLock::at(tmp.path().join("run/nested/session.lock")).unwrap();
        assert!(lock.try_acquire().unwrap().is_some());
        assert!(lock.path().exists());
    }
}
