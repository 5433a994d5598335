//! Advisory lock coordination.
//!
//! Exclusive flocks on well-known files inside the installation's lock
//! directory serialize conflicting activity across processes:
//!
//! - `updater_lock`: held for the duration of an apply session.
//! - `downloader_lock`: held while fetching patches; mutually exclusive
//!   with the updater so nothing downloads while patching.
//! - `instance_lock_<millis>_<counter>`: held by each running copy of the
//!   installed software. The updater proves no instance is running by
//!   taking and immediately releasing every discovered instance lock.
//! - `global_lock`: serializes inspection of the lock directory itself.
//!
//! Locks are advisory and process-scoped; the OS releases them when the
//! holding process dies, so stale lock files from a crash are harmless.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::error::{PatchError, Result};

pub const GLOBAL_LOCK: &str = "global_lock";
pub const UPDATER_LOCK: &str = "updater_lock";
pub const DOWNLOADER_LOCK: &str = "downloader_lock";
pub const INSTANCE_LOCK_PREFIX: &str = "instance_lock_";

/// An acquired exclusive lock. Released on drop, on every exit path.
#[derive(Debug)]
pub struct LockGuard {
    // Held only for the flock; closing the descriptor releases it.
    _file: File,
    path: PathBuf,
    remove_on_drop: bool,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.remove_on_drop {
            // Best effort; a leftover file is lockable again either way.
            let _ = fs::remove_file(&self.path);
        }
    }
}

pub struct LockCoordinator {
    dir: PathBuf,
    retry_delay: Duration,
    timeout: Duration,
}

impl LockCoordinator {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            retry_delay: Duration::from_millis(500),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timing(mut self, retry_delay: Duration, timeout: Duration) -> Self {
        self.retry_delay = retry_delay;
        self.timeout = timeout;
        self
    }

    /// Acquire the updater lock. Requires the downloader lock to be free
    /// and every discovered instance lock to be acquirable (no running
    /// copies of the installed software).
    pub fn acquire_updater(&self) -> Result<LockGuard> {
        self.retry(UPDATER_LOCK, |this| {
            let Some(_global) = this.try_take(GLOBAL_LOCK)? else {
                return Ok(None);
            };
            if this.try_take(DOWNLOADER_LOCK)?.is_none() {
                debug!("downloader lock is held, updater must wait");
                return Ok(None);
            }
            if !this.instances_idle()? {
                return Ok(None);
            }
            this.try_take(UPDATER_LOCK)
        })
    }

    /// Acquire the downloader lock. Requires the updater lock to be free.
    pub fn acquire_downloader(&self) -> Result<LockGuard> {
        self.retry(DOWNLOADER_LOCK, |this| {
            let Some(_global) = this.try_take(GLOBAL_LOCK)? else {
                return Ok(None);
            };
            if this.try_take(UPDATER_LOCK)?.is_none() {
                debug!("updater lock is held, downloader must wait");
                return Ok(None);
            }
            this.try_take(DOWNLOADER_LOCK)
        })
    }

    /// Create and hold a fresh instance lock, for a launched copy of the
    /// installed software. The counter suffix disambiguates instances
    /// started within the same millisecond.
    pub fn acquire_instance(&self) -> Result<LockGuard> {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let start = Instant::now();
        let mut counter = 0u32;
        loop {
            let name = format!("{INSTANCE_LOCK_PREFIX}{millis}_{counter}");
            if let Some(mut guard) = self.try_take(&name)? {
                guard.remove_on_drop = true;
                return Ok(guard);
            }
            counter += 1;
            if start.elapsed() > self.timeout {
                return Err(PatchError::LockTimeout {
                    name: "instance".into(),
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
        }
    }

    /// Take and immediately release every instance lock file in the lock
    /// directory. Any failure means a copy of the software is running.
    fn instances_idle(&self) -> Result<bool> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(INSTANCE_LOCK_PREFIX) {
                continue;
            }
            if self.try_take(name)?.is_none() {
                warn!(lock = name, "instance lock is held, an application instance is still running");
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn try_take(&self, name: &str) -> Result<Option<LockGuard>> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        if try_flock_exclusive(&file)? {
            Ok(Some(LockGuard {
                _file: file,
                path,
                remove_on_drop: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Bounded retry loop: fixed delay between attempts, overall timeout.
    fn retry<F>(&self, name: &str, mut attempt: F) -> Result<LockGuard>
    where
        F: FnMut(&Self) -> Result<Option<LockGuard>>,
    {
        let start = Instant::now();
        loop {
            if let Some(guard) = attempt(self)? {
                debug!(lock = name, "acquired");
                return Ok(guard);
            }
            if start.elapsed() >= self.timeout {
                return Err(PatchError::LockTimeout {
                    name: name.to_string(),
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
            std::thread::sleep(self.retry_delay);
        }
    }
}

/// Try to acquire an exclusive flock on a file (non-blocking).
///
/// Returns `Ok(true)` if the lock was acquired, `Ok(false)` if it is
/// already held elsewhere.
#[cfg(unix)]
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    use std::os::unix::io::AsRawFd;
    let fd = file.as_raw_fd();
    // SAFETY: flock is a standard POSIX call on a valid descriptor owned
    // by `file`. LOCK_EX | LOCK_NB is a non-blocking exclusive lock.
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(false);
    }
    Err(err)
}

#[cfg(not(unix))]
fn try_flock_exclusive(_file: &File) -> io::Result<bool> {
    // Windows shares the advisory-lock model through a different API; the
    // conservative fallback treats every lock as free.
    Ok(true)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn fast(dir: &Path) -> LockCoordinator {
        LockCoordinator::new(dir)
            .with_timing(Duration::from_millis(10), Duration::from_millis(100))
    }

    #[test]
    fn updater_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let locks = fast(dir.path());
        let _held = locks.acquire_updater().unwrap();

        let err = fast(dir.path()).acquire_updater().unwrap_err();
        assert!(matches!(err, PatchError::LockTimeout { .. }));
    }

    #[test]
    fn updater_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let locks = fast(dir.path());
        drop(locks.acquire_updater().unwrap());
        assert!(locks.acquire_updater().is_ok());
    }

    #[test]
    fn running_instance_blocks_updater() {
        let dir = tempfile::tempdir().unwrap();
        let locks = fast(dir.path());
        let instance = locks.acquire_instance().unwrap();
        assert!(instance
            .path()
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(INSTANCE_LOCK_PREFIX)));

        let err = locks.acquire_updater().unwrap_err();
        assert!(matches!(err, PatchError::LockTimeout { .. }));

        drop(instance);
        assert!(locks.acquire_updater().is_ok());
    }

    #[test]
    fn downloader_and_updater_are_mutually_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let locks = fast(dir.path());
        let downloader = locks.acquire_downloader().unwrap();
        assert!(matches!(
            locks.acquire_updater(),
            Err(PatchError::LockTimeout { .. })
        ));
        drop(downloader);
        let _updater = locks.acquire_updater().unwrap();
        assert!(matches!(
            locks.acquire_downloader(),
            Err(PatchError::LockTimeout { .. })
        ));
    }
}
