//! Lockfiles shared between fabric processes.
//!
//! Two kinds live here:
//!
//! * [`InitLock`] — a short-lived exclusive lock taken around schema
//!   bring-up, so concurrent processes do not race migrations. A lock file
//!   older than 30 seconds is treated as abandoned, deleted, and retried.
//! * [`DaemonLockfile`] — written by a running daemon after binding its
//!   ports; supervising scripts read it to discover the local HTTP surface.
//!   Stale entries (dead pid) are removed automatically.
//!
//! Both use `O_CREAT | O_EXCL` so two racing processes have exactly one
//! winner.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Age beyond which an init lock is considered abandoned.
pub const INIT_LOCK_STALE_AFTER: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// InitLock
// ---------------------------------------------------------------------------

/// RAII guard around schema initialization. Dropped = released.
pub struct InitLock {
    path: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum InitLockError {
    #[error("lock held by another process: {0}")]
    Held(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl InitLock {
    /// Acquire the init lock next to the store file (`<store>.init-lock`).
    ///
    /// Retries once after removing a stale lock; a live lock yields
    /// [`InitLockError::Held`] and the caller should wait and re-run
    /// initialization (the winner will have completed it).
    pub fn acquire(store_path: &Path) -> Result<Self, InitLockError> {
        let path = Self::lock_path(store_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if attempt == 0 && Self::is_stale(&path) {
                        tracing::info!(path = %path.display(), "removing stale init lock");
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    return Err(InitLockError::Held(path.display().to_string()));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(InitLockError::Held(path.display().to_string()))
    }

    fn lock_path(store_path: &Path) -> PathBuf {
        let mut os = store_path.as_os_str().to_os_string();
        os.push(".init-lock");
        PathBuf::from(os)
    }

    fn is_stale(path: &Path) -> bool {
        match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(modified) => SystemTime::now()
                .duration_since(modified)
                .map(|age| age > INIT_LOCK_STALE_AFTER)
                .unwrap_or(false),
            // Unreadable metadata: assume the holder just removed it.
            Err(_) => false,
        }
    }
}

impl Drop for InitLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// ---------------------------------------------------------------------------
// DaemonLockfile
// ---------------------------------------------------------------------------

/// Runtime state written by a daemon after binding its local HTTP port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonLockfile {
    pub pid: u32,
    pub port: u16,
    pub host: String,
    pub matrix_id: String,
    pub started_at: String,
    pub version: String,
}

/// Result of trying to acquire the daemon lockfile.
pub enum AcquireResult {
    /// We created the lockfile — we own it.
    Acquired,
    /// Another live daemon holds the lockfile.
    AlreadyRunning(DaemonLockfile),
    /// Stale lockfile was cleaned up — retry.
    StaleRemoved,
}

impl DaemonLockfile {
    /// Canonical lockfile path: `~/.matrix-fabric/daemon.lock`.
    pub fn path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home).join(".matrix-fabric").join("daemon.lock")
    }

    /// Try to exclusively create and write the lockfile.
    pub fn acquire(&self) -> std::io::Result<AcquireResult> {
        self.acquire_at(&Self::path())
    }

    /// Same as [`acquire`](Self::acquire) with an explicit path (tests).
    pub fn acquire_at(&self, path: &Path) -> std::io::Result<AcquireResult> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let json = serde_json::to_string_pretty(self)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                file.write_all(json.as_bytes())?;
                file.sync_all()?;
                Ok(AcquireResult::Acquired)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                match Self::read_at(path) {
                    Some(existing) if existing.is_alive() => {
                        Ok(AcquireResult::AlreadyRunning(existing))
                    }
                    _ => {
                        tracing::info!("removing stale daemon lockfile");
                        let _ = std::fs::remove_file(path);
                        Ok(AcquireResult::StaleRemoved)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Read the lockfile. Returns `None` if missing or unparseable.
    pub fn read() -> Option<Self> {
        Self::read_at(&Self::path())
    }

    pub fn read_at(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Read the lockfile, validate the pid is alive, auto-remove stale entries.
    pub fn read_valid() -> Option<Self> {
        let lock = Self::read()?;
        if lock.is_alive() {
            Some(lock)
        } else {
            tracing::info!(pid = lock.pid, "removing stale daemon lockfile (process not running)");
            Self::remove();
            None
        }
    }

    pub fn remove() {
        let _ = std::fs::remove_file(Self::path());
    }

    pub fn is_alive(&self) -> bool {
        pid_alive(self.pid)
    }

    pub fn local_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 checks existence without sending a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("fabric.db");

        let lock = InitLock::acquire(&store).unwrap();
        match InitLock::acquire(&store) {
            Err(InitLockError::Held(_)) => {}
            _ => panic!("second acquire should fail while held"),
        }
        drop(lock);
        // Released on drop — can be taken again.
        let _again = InitLock::acquire(&store).unwrap();
    }

    #[test]
    fn init_lock_removes_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = dir.path().join("fabric.db");
        let lock_path = dir.path().join("fabric.db.init-lock");

        std::fs::write(&lock_path, "0").unwrap();
        let old = SystemTime::now() - Duration::from_secs(120);
        let times = std::fs::File::options()
            .write(true)
            .open(&lock_path)
            .unwrap();
        times.set_modified(old).unwrap();
        drop(times);

        let _lock = InitLock::acquire(&store).expect("stale lock should be reclaimed");
    }

    #[test]
    fn daemon_lockfile_roundtrip_and_liveness() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.lock");
        let lock = DaemonLockfile {
            pid: std::process::id(),
            port: 37888,
            host: "127.0.0.1".into(),
            matrix_id: "alpha".into(),
            started_at: "2026-08-01T00:00:00Z".into(),
            version: "0.1.0".into(),
        };

        match lock.acquire_at(&path).unwrap() {
            AcquireResult::Acquired => {}
            _ => panic!("expected clean acquire"),
        }

        let read = DaemonLockfile::read_at(&path).unwrap();
        assert_eq!(read.port, 37888);
        assert_eq!(read.local_url(), "http://127.0.0.1:37888");
        assert!(read.is_alive());

        // Second acquire sees the live holder.
        match lock.acquire_at(&path).unwrap() {
            AcquireResult::AlreadyRunning(existing) => assert_eq!(existing.pid, lock.pid),
            _ => panic!("expected AlreadyRunning"),
        }
    }

    #[test]
    fn bogus_pid_is_dead() {
        assert!(!pid_alive(4_000_000));
    }
}
