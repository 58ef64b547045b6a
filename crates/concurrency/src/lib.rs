//! Cross-process coordination for the rewind transaction manager
//!
//! One advisory file lock on a sidecar path serializes managers across
//! processes. Routine operations take the lock shared; recovery takes it
//! exclusive. The lock is never taken on the database file itself, which
//! would collide with SQLite's own OS-level locking.

#![warn(missing_docs)]

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Linear backoff between non-blocking attempts: 1+2+3+4+5 = 15 seconds
/// worst case before giving up.
pub const RETRY_SCHEDULE_SECS: [u64; 5] = [1, 2, 3, 4, 5];

/// Errors from lock acquisition.
#[derive(Debug, Error)]
pub enum LockError {
    /// Could not open or lock the sidecar file.
    #[error("lock file error: {0}")]
    Io(#[from] std::io::Error),

    /// Every attempt found the lock held by someone else. The usual cause
    /// is another manager's recovery holding the exclusive lock.
    #[error(
        "could not acquire lock on {} within {waited:?} (a recovery may be in progress)",
        .path.display()
    )]
    Timeout {
        /// The sidecar path.
        path: PathBuf,
        /// Total time spent waiting.
        waited: Duration,
    },
}

/// Result alias for lock operations.
pub type Result<T> = std::result::Result<T, LockError>;

/// The flavor of lock held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Shared: routine operations, many holders.
    Shared,
    /// Exclusive: recovery, single holder.
    Exclusive,
}

/// Advisory file lock on a sidecar path.
///
/// `acquire` tries non-blocking first and retries on the linear backoff
/// schedule; `release` drops the lock and is safe to call when nothing is
/// held. Dropping the locker releases any held lock.
///
/// Acquisition nests: re-acquiring while already held bumps a depth counter
/// instead of touching the file, and each `release` pops one level. An
/// exclusive hold satisfies a nested shared request (a function invoked
/// during recovery may re-enter the manager, which locks shared). This is
/// what lets a callee call back into the manager while an operation is in
/// flight without dropping the operation's lock.
#[derive(Debug)]
pub struct Locker {
    path: PathBuf,
    file: Option<File>,
    held: Option<LockKind>,
    depth: u32,
    retry: Vec<Duration>,
}

impl Locker {
    /// Create a locker for the given sidecar path with the default retry
    /// schedule.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_retry(
            path,
            RETRY_SCHEDULE_SECS.iter().map(|s| Duration::from_secs(*s)),
        )
    }

    /// Create a locker with a custom retry schedule. Tests use millisecond
    /// schedules; production uses [`RETRY_SCHEDULE_SECS`].
    pub fn with_retry(
        path: impl AsRef<Path>,
        retry: impl IntoIterator<Item = Duration>,
    ) -> Self {
        Locker {
            path: path.as_ref().to_path_buf(),
            file: None,
            held: None,
            depth: 0,
            retry: retry.into_iter().collect(),
        }
    }

    /// The sidecar path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// What is currently held, if anything.
    pub fn held(&self) -> Option<LockKind> {
        self.held
    }

    /// Acquire the lock, shared or exclusive.
    ///
    /// A hold that already satisfies the request (same kind, or exclusive
    /// covering a shared request) nests: the depth counter is bumped and the
    /// file is untouched. Otherwise each attempt is non-blocking;
    /// contention sleeps per the retry schedule, then fails with
    /// [`LockError::Timeout`].
    pub fn acquire(&mut self, kind: LockKind) -> Result<()> {
        if let Some(held) = self.held {
            if held == kind || held == LockKind::Exclusive {
                self.depth += 1;
                return Ok(());
            }
            // Shared -> exclusive has no in-place upgrade; start over.
            self.force_release();
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        let mut waited = Duration::ZERO;
        let mut delays = self.retry.iter().copied();
        loop {
            // Qualified calls: std's own File locking methods (1.89+) shadow
            // the fs2 trait methods and return a different error type.
            let attempt = match kind {
                LockKind::Shared => FileExt::try_lock_shared(&file),
                LockKind::Exclusive => FileExt::try_lock_exclusive(&file),
            };
            match attempt {
                Ok(()) => {
                    debug!(path = %self.path.display(), ?kind, "lock acquired");
                    self.file = Some(file);
                    self.held = Some(kind);
                    self.depth = 1;
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => match delays.next() {
                    Some(delay) => {
                        debug!(path = %self.path.display(), ?kind, ?delay, "lock contended, backing off");
                        std::thread::sleep(delay);
                        waited += delay;
                    }
                    None => {
                        warn!(path = %self.path.display(), ?kind, "lock acquisition timed out");
                        return Err(LockError::Timeout {
                            path: self.path.clone(),
                            waited,
                        });
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Pop one level of acquisition; the file is unlocked when the last
    /// level is released. A no-op when nothing is held.
    pub fn release(&mut self) {
        if self.depth > 1 {
            self.depth -= 1;
            return;
        }
        self.force_release();
    }

    fn force_release(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = FileExt::unlock(&file) {
                warn!(path = %self.path.display(), error = %e, "failed to unlock");
            }
        }
        self.held = None;
        self.depth = 0;
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        self.force_release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fast_locker(path: &Path) -> Locker {
        Locker::with_retry(path, [Duration::from_millis(5), Duration::from_millis(5)])
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.lck");
        let mut a = fast_locker(&path);
        let mut b = fast_locker(&path);
        a.acquire(LockKind::Shared).unwrap();
        b.acquire(LockKind::Shared).unwrap();
        assert_eq!(a.held(), Some(LockKind::Shared));
        assert_eq!(b.held(), Some(LockKind::Shared));
    }

    #[test]
    fn test_exclusive_excludes_and_times_out() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.lck");
        let mut a = fast_locker(&path);
        let mut b = fast_locker(&path);
        a.acquire(LockKind::Exclusive).unwrap();

        match b.acquire(LockKind::Shared) {
            Err(LockError::Timeout { .. }) => {}
            other => panic!("expected timeout, got {:?}", other),
        }

        a.release();
        b.acquire(LockKind::Shared).unwrap();
    }

    #[test]
    fn test_acquisition_nests() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.lck");
        let mut a = fast_locker(&path);
        a.acquire(LockKind::Shared).unwrap();
        a.acquire(LockKind::Shared).unwrap();
        a.release();
        // Still held: the inner release only popped one level.
        assert_eq!(a.held(), Some(LockKind::Shared));
        a.release();
        assert_eq!(a.held(), None);
    }

    #[test]
    fn test_exclusive_satisfies_nested_shared() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.lck");
        let mut a = fast_locker(&path);
        a.acquire(LockKind::Exclusive).unwrap();
        a.acquire(LockKind::Shared).unwrap();
        a.release();
        assert_eq!(a.held(), Some(LockKind::Exclusive));

        // Another process still cannot get in until the outer release.
        let mut b = fast_locker(&path);
        assert!(matches!(
            b.acquire(LockKind::Shared),
            Err(LockError::Timeout { .. })
        ));
        a.release();
        b.acquire(LockKind::Shared).unwrap();
    }

    #[test]
    fn test_release_without_hold_is_noop() {
        let dir = tempdir().unwrap();
        let mut a = fast_locker(&dir.path().join("x.lck"));
        a.release();
        assert_eq!(a.held(), None);
    }

    #[test]
    fn test_timeout_message_mentions_recovery() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.lck");
        let mut a = fast_locker(&path);
        let mut b = fast_locker(&path);
        a.acquire(LockKind::Exclusive).unwrap();
        let err = b.acquire(LockKind::Exclusive).unwrap_err();
        assert!(err.to_string().contains("recovery may be in progress"));
    }

    #[test]
    fn test_drop_releases() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.lck");
        {
            let mut a = fast_locker(&path);
            a.acquire(LockKind::Exclusive).unwrap();
        }
        let mut b = fast_locker(&path);
        b.acquire(LockKind::Exclusive).unwrap();
    }
}
