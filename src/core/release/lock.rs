//! Per-target activation lock.
//!
//! Each target has a persistent `<target>.lock` file under the state
//! directory. Holding the lock means holding an exclusive `flock` on it; the
//! kernel drops the lock when the holder exits, crashed or not, so there is
//! no stale-lock recovery. The file body (pid, holder, time) is diagnostic
//! only and never decides ownership.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::defaults::LockDefaults;
use crate::error::{Error, Result};
use crate::paths;

#[derive(Debug, Clone)]
pub struct ActivationLocks {
    dir: PathBuf,
    wait: Duration,
    poll: Duration,
}

impl ActivationLocks {
    pub fn new(dir: impl Into<PathBuf>, defaults: &LockDefaults) -> Self {
        Self {
            dir: dir.into(),
            wait: defaults.wait(),
            poll: defaults.poll(),
        }
    }

    pub fn open_default(defaults: &LockDefaults) -> Result<Self> {
        Ok(Self::new(paths::locks()?, defaults))
    }

    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    fn path(&self, target_id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", target_id))
    }

    /// Acquire the lock for `target_id`, waiting up to the configured bound.
    /// `holder` describes the owner (e.g. the run id) for conflict reports.
    pub fn acquire(&self, target_id: &str, holder: &str) -> Result<TargetLock> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("create {}", self.dir.display())))
        })?;

        let path = self.path(target_id);
        let deadline = Instant::now() + self.wait;
        let mut announced = false;

        loop {
            let file = open_lock_file(&path)?;
            let locked = try_flock_exclusive(&file).map_err(|e| {
                Error::internal_io(e.to_string(), Some(format!("lock {}", path.display())))
            })?;

            if locked {
                if let Err(e) = write_holder(&file, holder) {
                    log_status!("lock", "Could not record holder in {}: {}", path.display(), e);
                }
                return Ok(TargetLock {
                    target_id: target_id.to_string(),
                    file,
                });
            }
            drop(file);

            if Instant::now() >= deadline {
                return Err(Error::release_conflict(target_id, read_holder(&path)));
            }
            if !announced {
                log_status!(
                    "lock",
                    "Target '{}' is locked by another activation; waiting up to {}s",
                    target_id,
                    self.wait.as_secs()
                );
                announced = true;
            }
            std::thread::sleep(self.poll);
        }
    }
}

/// Held activation lock. Dropping it releases the target.
#[derive(Debug)]
pub struct TargetLock {
    target_id: String,
    file: File,
}

impl TargetLock {
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub(crate) fn ensure_for(&self, target_id: &str) -> Result<()> {
        if self.target_id != target_id {
            return Err(Error::internal_unexpected(format!(
                "lock for '{}' presented for target '{}'",
                self.target_id, target_id
            )));
        }
        Ok(())
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        // Clear the diagnostic body while still holding the lock; closing the
        // descriptor afterwards releases it.
        let _ = self.file.set_len(0);
        unlock(&self.file);
    }
}

/// The lock file is never removed, so every contender locks the same inode.
fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| Error::internal_io(e.to_string(), Some(format!("open {}", path.display()))))
}

fn write_holder(mut file: &File, holder: &str) -> io::Result<()> {
    let content = format!(
        "{}\n{}\n{}\n",
        std::process::id(),
        holder,
        Utc::now().to_rfc3339()
    );
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(content.as_bytes())
}

fn read_holder(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let mut lines = content.lines();
    let pid = lines.next().filter(|l| !l.trim().is_empty())?;
    let holder = lines.next().unwrap_or("unknown");
    Some(format!("{} (pid {})", holder, pid))
}

/// `Ok(false)` when another open description of the file holds the lock.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}

fn unlock(file: &File) {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        // SAFETY: as above.
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_UN);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = file;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locks(dir: &Path, wait_secs: u64) -> ActivationLocks {
        ActivationLocks::new(
            dir,
            &LockDefaults {
                wait_secs,
                poll_millis: 20,
            },
        )
    }

    #[test]
    fn second_acquire_conflicts_until_first_drops() {
        let dir = tempfile::tempdir().unwrap();
        let locks = locks(dir.path(), 0);

        let first = locks.acquire("web", "run-1").unwrap();
        let err = locks.acquire("web", "run-2").unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::ReleaseConflict);
        assert!(err.details["holder"].as_str().unwrap().contains("run-1"));

        drop(first);
        assert!(locks.acquire("web", "run-2").is_ok());
    }

    #[test]
    fn distinct_targets_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let locks = locks(dir.path(), 0);
        let _a = locks.acquire("a", "run-1").unwrap();
        assert!(locks.acquire("b", "run-1").is_ok());
    }

    #[test]
    fn waiter_gets_lock_when_released() {
        let dir = tempfile::tempdir().unwrap();
        let locks = locks(dir.path(), 5);
        let first = locks.acquire("web", "run-1").unwrap();

        std::thread::scope(|s| {
            let waiter = s.spawn(|| locks.acquire("web", "run-2").map(|l| l.target_id().to_string()));
            std::thread::sleep(Duration::from_millis(100));
            drop(first);
            assert_eq!(waiter.join().unwrap().unwrap(), "web");
        });
    }

    #[test]
    fn leftover_lock_file_naming_a_live_pid_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        // pid 1 is always alive; only the flock decides ownership.
        std::fs::write(dir.path().join("web.lock"), "1\ncrashed-run\n").unwrap();
        let locks = locks(dir.path(), 0);

        for _ in 0..3 {
            let lock = locks.acquire("web", "run-2").unwrap();
            drop(lock);
        }
        assert!(dir.path().join("web.lock").exists());
    }

    #[cfg(unix)]
    #[test]
    fn lock_held_through_another_descriptor_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let locks = locks(dir.path(), 0);

        // A second open file description behaves like another rollout process.
        let other = open_lock_file(&dir.path().join("web.lock")).unwrap();
        assert!(try_flock_exclusive(&other).unwrap());
        write_holder(&other, "run-elsewhere").unwrap();

        let err = locks.acquire("web", "run-2").unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::ReleaseConflict);
        assert!(err.details["holder"].as_str().unwrap().contains("run-elsewhere"));

        drop(other);
        assert!(locks.acquire("web", "run-2").is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn held_lock_blocks_other_descriptors() {
        let dir = tempfile::tempdir().unwrap();
        let lock = locks(dir.path(), 0).acquire("web", "run-1").unwrap();

        let other = open_lock_file(&dir.path().join("web.lock")).unwrap();
        assert!(!try_flock_exclusive(&other).unwrap());

        drop(lock);
        assert!(try_flock_exclusive(&other).unwrap());
    }

    #[test]
    fn guard_rejects_other_targets() {
        let dir = tempfile::tempdir().unwrap();
        let lock = locks(dir.path(), 0).acquire("web", "run-1").unwrap();
        assert!(lock.ensure_for("web").is_ok());
        assert!(lock.ensure_for("db").is_err());
    }
}
