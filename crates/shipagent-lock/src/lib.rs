//! Runtime lock (§5): at most one worker process may hold a given state
//! directory open for writing at a time. Multi-worker deployment against
//! the same store is unsupported and must be refused at startup rather
//! than silently corrupting state. The lock is a PID/hostname-stamped file
//! written atomically (temp file + rename) next to the state store, the
//! same pattern the teacher uses to guard a publish working directory.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const LOCK_FILE: &str = "shipagent.lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
            acquired_at: Utc::now(),
        }
    }
}

/// A held lock on a state directory. Released on drop.
pub struct LockFile {
    path: PathBuf,
    held: bool,
}

impl LockFile {
    /// Acquires the lock immediately, failing if another process already
    /// holds it.
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("creating state directory {}", state_dir.display()))?;
        let path = lock_path(state_dir);

        if path.exists() {
            let info = read_lock_info_from_path(&path).ok();
            match info {
                Some(info) => bail!(
                    "lock already held by pid {} on {} since {}",
                    info.pid,
                    info.hostname,
                    info.acquired_at
                ),
                None => bail!("lock already held (lock file present but unreadable)"),
            }
        }

        write_lock_file(&path, &LockInfo::current())?;
        tracing::debug!(path = %path.display(), "acquired runtime lock");
        Ok(Self { path, held: true })
    }

    /// Acquires the lock, first removing it if it is stale (older than
    /// `timeout`) or corrupt. A fresh lock held by a live process still
    /// causes this to fail.
    pub fn acquire_with_timeout(state_dir: &Path, timeout: Duration) -> Result<Self> {
        let path = lock_path(state_dir);
        if path.exists() {
            let stale = match read_lock_info_from_path(&path) {
                Ok(info) => {
                    let age = Utc::now().signed_duration_since(info.acquired_at);
                    age.to_std().map(|age| age > timeout).unwrap_or(false)
                }
                Err(_) => true,
            };
            if stale {
                tracing::warn!(path = %path.display(), "removing stale runtime lock");
                fs::remove_file(&path)
                    .with_context(|| format!("removing stale lock {}", path.display()))?;
            }
        }
        Self::acquire(state_dir)
    }

    pub fn release(&mut self) -> Result<()> {
        if self.held && self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("removing lock {}", self.path.display()))?;
        }
        self.held = false;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if self.held {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Returns whether `state_dir` currently has a live lock file, without
/// acquiring or modifying it.
pub fn is_locked(state_dir: &Path) -> bool {
    lock_path(state_dir).exists()
}

pub fn read_lock_info(state_dir: &Path) -> Result<LockInfo> {
    read_lock_info_from_path(&lock_path(state_dir))
}

fn read_lock_info_from_path(path: &Path) -> Result<LockInfo> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading lock file {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing lock file {}", path.display()))
}

fn write_lock_file(path: &Path, info: &LockInfo) -> Result<()> {
    let tmp_path = path.with_extension("lock.tmp");
    let json = serde_json::to_string_pretty(info)?;
    {
        let mut tmp = File::create(&tmp_path)
            .with_context(|| format!("creating {}", tmp_path.display()))?;
        tmp.write_all(json.as_bytes())?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)
        .with_context(|| format!("renaming {} to {}", tmp_path.display(), path.display()))?;
    Ok(())
}

fn lock_path(state_dir: &Path) -> PathBuf {
    state_dir.join(LOCK_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lock_path_returns_expected_path() {
        let dir = tempdir().unwrap();
        assert_eq!(lock_path(dir.path()), dir.path().join("shipagent.lock"));
    }

    #[test]
    fn acquire_creates_lock_file() {
        let dir = tempdir().unwrap();
        let lock = LockFile::acquire(dir.path()).unwrap();
        assert!(lock.path().exists());
    }

    #[test]
    fn acquire_fails_when_already_locked() {
        let dir = tempdir().unwrap();
        let _first = LockFile::acquire(dir.path()).unwrap();
        let second = LockFile::acquire(dir.path());
        assert!(second.is_err());
    }

    #[test]
    fn drop_releases_lock() {
        let dir = tempdir().unwrap();
        {
            let _lock = LockFile::acquire(dir.path()).unwrap();
            assert!(is_locked(dir.path()));
        }
        assert!(!is_locked(dir.path()));
    }

    #[test]
    fn read_lock_info_returns_current_pid() {
        let dir = tempdir().unwrap();
        let _lock = LockFile::acquire(dir.path()).unwrap();
        let info = read_lock_info(dir.path()).unwrap();
        assert_eq!(info.pid, std::process::id());
    }

    #[test]
    fn is_locked_reflects_lock_state() {
        let dir = tempdir().unwrap();
        assert!(!is_locked(dir.path()));
        let _lock = LockFile::acquire(dir.path()).unwrap();
        assert!(is_locked(dir.path()));
    }

    #[test]
    fn acquire_with_timeout_removes_stale_lock() {
        let dir = tempdir().unwrap();
        let stale_info = LockInfo {
            pid: 999_999,
            hostname: "stale-host".into(),
            acquired_at: Utc::now() - chrono::Duration::hours(1),
        };
        write_lock_file(&lock_path(dir.path()), &stale_info).unwrap();

        let lock = LockFile::acquire_with_timeout(dir.path(), Duration::from_secs(60)).unwrap();
        let info = read_lock_info_from_path(lock.path()).unwrap();
        assert_eq!(info.pid, std::process::id());
    }

    #[test]
    fn acquire_with_timeout_fails_on_fresh_lock() {
        let dir = tempdir().unwrap();
        let _first = LockFile::acquire(dir.path()).unwrap();
        let second = LockFile::acquire_with_timeout(dir.path(), Duration::from_secs(3600));
        assert!(second.is_err());
    }

    #[test]
    fn release_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut lock = LockFile::acquire(dir.path()).unwrap();
        lock.release().unwrap();
        assert!(!is_locked(dir.path()));
        lock.release().unwrap();
    }
}
