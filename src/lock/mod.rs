//! Advisory file locks shared between independent processes.
//!
//! Locks are BSD `flock` locks, which belong to an open file description.
//! Two threads that open the same path separately therefore contend exactly
//! like two processes would, and the kernel drops every lock held by a process
//! that exits.
//!
//! Named lock files have an inherent race: a process may open the path, get
//! descheduled while the holder unlocks and unlinks the file, and then lock a
//! file that no longer has a name. [`delete_lock_file`] writes a marker byte
//! before unlinking, and every acquisition re-validates the file it locked
//! against the path, reopening when the two disagree.

mod substitution;

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::thread;
use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use nix::errno::Errno;
use nix::fcntl::FlockArg;
use tracing::{debug, info};

use crate::error::LockError;
use crate::interrupt::Interrupt;

pub use substitution::{SubstitutionLocks, with_substitution_lock};

const POLL_MIN: Duration = Duration::from_millis(1);
const POLL_MAX: Duration = Duration::from_millis(50);

/// The state an advisory lock can be put in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    /// Release whatever lock the file description holds.
    None,
    /// Shared lock, any number of readers may hold it at once.
    Read,
    /// Exclusive lock.
    Write,
}

impl LockType {
    fn flock_arg(self, wait: bool) -> FlockArg {
        match (self, wait) {
            (LockType::None, _) => FlockArg::Unlock,
            (LockType::Read, true) => FlockArg::LockShared,
            (LockType::Read, false) => FlockArg::LockSharedNonblock,
            (LockType::Write, true) => FlockArg::LockExclusive,
            (LockType::Write, false) => FlockArg::LockExclusiveNonblock,
        }
    }
}

/// Opens the lock file at `path` without locking it. With `create == false`
/// a missing file is reported as `Ok(None)`.
pub fn open_lock_file(path: &Utf8Path, create: bool) -> Result<Option<File>, LockError> {
    let result = OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .mode(0o600)
        .open(path);

    match result {
        Ok(file) => Ok(Some(file)),
        Err(e) if !create && e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LockError::io(path, e)),
    }
}

/// Changes the lock held on `file`.
///
/// Returns `Ok(false)` only in non-blocking mode when somebody else holds a
/// conflicting lock. A blocking wait cut short by a signal is retried unless
/// the process-wide interrupt flag has been raised in the meantime.
#[allow(deprecated)]
pub fn lock_file(file: &File, lock_type: LockType, wait: bool) -> Result<bool, LockError> {
    let arg = lock_type.flock_arg(wait);

    loop {
        match nix::fcntl::flock(file.as_raw_fd(), arg) {
            Ok(()) => return Ok(true),
            Err(Errno::EINTR) => {
                Interrupt::global().check()?;
                continue;
            }
            Err(Errno::EWOULDBLOCK) if !wait => return Ok(false),
            Err(e) => return Err(LockError::Flock(e)),
        }
    }
}

/// Like [`lock_file`] in blocking mode, but gives up after `timeout` and
/// returns `Ok(false)`. A zero timeout waits indefinitely.
pub fn lock_file_with_timeout(
    file: &File,
    lock_type: LockType,
    timeout: Duration,
) -> Result<bool, LockError> {
    lock_file_interruptible(file, lock_type, timeout, &Interrupt::global())
}

/// [`lock_file_with_timeout`] observing a specific interrupt flag.
///
/// With a non-zero timeout the lock is polled with a short exponential
/// backoff, so an interrupt is noticed within a few tens of milliseconds.
pub fn lock_file_interruptible(
    file: &File,
    lock_type: LockType,
    timeout: Duration,
    interrupt: &Interrupt,
) -> Result<bool, LockError> {
    if timeout.is_zero() {
        interrupt.check()?;
        return lock_file(file, lock_type, true);
    }

    poll_lock(file, lock_type, Some(Instant::now() + timeout), interrupt)
}

/// Polls a non-blocking lock until it succeeds or `deadline` passes. Without
/// a deadline it waits until acquired or interrupted.
fn poll_lock(
    file: &File,
    lock_type: LockType,
    deadline: Option<Instant>,
    interrupt: &Interrupt,
) -> Result<bool, LockError> {
    let mut backoff = POLL_MIN;

    loop {
        interrupt.check()?;

        if lock_file(file, lock_type, false)? {
            return Ok(true);
        }

        let mut nap = backoff;
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            nap = nap.min(remaining);
        }

        thread::sleep(nap);
        backoff = (backoff * 2).min(POLL_MAX);
    }
}

/// Marks `file` stale and removes its directory entry.
///
/// Anybody who opened the path earlier and locks it later will see the marker
/// and reopen. Errors are ignored: the lock itself stays correct whether or
/// not the entry disappears.
pub fn delete_lock_file(path: &Utf8Path, file: &File) {
    let _ = (&*file).write_all(b"d");
    let _ = fs::remove_file(path);
}

/// How long [`acquire_lock`] may wait for contended locks.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Blocking {
    No,
    Forever,
    Until(Instant),
}

/// Opens, locks and validates the lock file at `path`, reopening as long as
/// the locked file turns out to be stale. `Ok(None)` means the lock could not
/// be taken within the allowed time.
pub(crate) fn acquire_lock(
    path: &Utf8Path,
    lock_type: LockType,
    blocking: Blocking,
    interrupt: &Interrupt,
) -> Result<Option<File>, LockError> {
    loop {
        interrupt.check()?;

        let file = open_lock_file(path, true)?.ok_or_else(|| {
            LockError::io(path, io::Error::from(io::ErrorKind::NotFound))
        })?;

        let acquired = match blocking {
            Blocking::No => lock_file(&file, lock_type, false)?,
            Blocking::Forever => poll_lock(&file, lock_type, None, interrupt)?,
            Blocking::Until(deadline) => poll_lock(&file, lock_type, Some(deadline), interrupt)?,
        };

        if !acquired {
            return Ok(None);
        }

        if is_stale(path, &file, lock_type)? {
            debug!("lock file '{path}' is stale, retrying");
            continue;
        }

        return Ok(Some(file));
    }
}

/// Decides whether the file we just locked is still the one `path` names.
fn is_stale(path: &Utf8Path, file: &File, lock_type: LockType) -> Result<bool, LockError> {
    let held = file.metadata().map_err(|e| LockError::io(path, e))?;

    if held.nlink() == 0 {
        return Ok(true);
    }

    match fs::metadata(path) {
        Ok(named) if named.ino() == held.ino() && named.dev() == held.dev() => {}
        Ok(_) => return Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(LockError::io(path, e)),
    }

    // Still linked but carrying a marker: its last holder died between marking
    // and unlinking. Only an exclusive holder may remove it; readers share the
    // file as it is.
    if held.len() > 0 && lock_type == LockType::Write {
        let _ = fs::remove_file(path);
        return Ok(true);
    }

    Ok(false)
}

/// Exclusive locks on a set of paths, through a `<path>.lock` file for each.
///
/// Paths are locked in sorted order so two processes locking overlapping sets
/// cannot deadlock. Everything is released on drop.
#[derive(Debug, Default)]
pub struct PathLocks {
    held: Vec<(Utf8PathBuf, File)>,
    deletion: bool,
    interrupt: Interrupt,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::with_interrupt(Interrupt::global())
    }

    pub fn with_interrupt(interrupt: Interrupt) -> Self {
        Self {
            held: Vec::new(),
            deletion: false,
            interrupt,
        }
    }

    /// Locks every path in `paths`.
    ///
    /// In non-blocking mode returns `Ok(false)` as soon as one of them is held
    /// elsewhere, releasing whatever was acquired so far. In blocking mode
    /// `wait_msg` is logged once per contended path before waiting.
    pub fn lock_paths(
        &mut self,
        paths: &BTreeSet<Utf8PathBuf>,
        wait_msg: &str,
        wait: bool,
    ) -> Result<bool, LockError> {
        debug_assert!(self.held.is_empty(), "PathLocks reused without unlock");

        for path in paths {
            let lock_path = Utf8PathBuf::from(format!("{path}.lock"));
            debug!("locking path '{path}'");

            let interrupt = &self.interrupt;
            let mut file = acquire_lock(&lock_path, LockType::Write, Blocking::No, interrupt)?;

            if file.is_none() && wait {
                if !wait_msg.is_empty() {
                    info!("{wait_msg}");
                }

                file = acquire_lock(&lock_path, LockType::Write, Blocking::Forever, interrupt)?;
            }

            match file {
                Some(file) => self.held.push((lock_path, file)),
                None => {
                    self.unlock();
                    return Ok(false);
                }
            }
        }

        Ok(true)
    }

    /// Whether releasing the locks should also delete the lock files.
    pub fn set_deletion(&mut self, deletion: bool) {
        self.deletion = deletion;
    }

    pub fn unlock(&mut self) {
        for (path, file) in self.held.drain(..) {
            if self.deletion {
                delete_lock_file(&path, &file);
            }

            if let Err(e) = lock_file(&file, LockType::None, false) {
                debug!("cannot release lock '{path}': {e}");
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

impl Drop for PathLocks {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("test.lock")).unwrap();
        (dir, path)
    }

    fn open(path: &Utf8Path) -> File {
        open_lock_file(path, true).unwrap().unwrap()
    }

    #[test]
    fn test_immediate_lock() {
        let (_dir, path) = setup();
        let fd = open(&path);

        assert!(lock_file_with_timeout(&fd, LockType::Write, Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_zero_timeout_blocks_until_acquired() {
        let (_dir, path) = setup();
        let fd = open(&path);

        assert!(lock_file_with_timeout(&fd, LockType::Write, Duration::ZERO).unwrap());
    }

    #[test]
    fn test_readers_share() {
        let (_dir, path) = setup();
        let fd1 = open(&path);
        let fd2 = open(&path);
        let fd3 = open(&path);

        let second = Duration::from_secs(1);
        assert!(lock_file_with_timeout(&fd1, LockType::Read, second).unwrap());
        assert!(lock_file_with_timeout(&fd2, LockType::Read, second).unwrap());
        assert!(lock_file(&fd3, LockType::Read, false).unwrap());
    }

    #[test]
    fn test_write_excludes_everything() {
        let (_dir, path) = setup();
        let fd1 = open(&path);
        let fd2 = open(&path);

        assert!(lock_file(&fd1, LockType::Write, false).unwrap());
        assert!(!lock_file(&fd2, LockType::Write, false).unwrap());
        assert!(!lock_file(&fd2, LockType::Read, false).unwrap());
    }

    #[test]
    fn test_read_blocks_write() {
        let (_dir, path) = setup();
        let fd1 = open(&path);
        let fd2 = open(&path);

        assert!(lock_file(&fd1, LockType::Read, false).unwrap());
        let timeout = Duration::from_millis(200);
        assert!(!lock_file_with_timeout(&fd2, LockType::Write, timeout).unwrap());
    }

    #[test]
    fn test_open_without_create() {
        let (_dir, path) = setup();

        assert!(open_lock_file(&path, false).unwrap().is_none());
        assert!(open_lock_file(&path, true).unwrap().is_some());
        assert!(open_lock_file(&path, false).unwrap().is_some());
    }

    #[test]
    fn test_lock_file_mode() {
        let (_dir, path) = setup();
        let _fd = open(&path);

        let mode = fs::metadata(&path).unwrap().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_unlock_allows_new_lock() {
        let (_dir, path) = setup();
        let fd1 = open(&path);
        let fd2 = open(&path);

        assert!(lock_file(&fd1, LockType::Write, false).unwrap());
        assert!(!lock_file(&fd2, LockType::Write, false).unwrap());

        assert!(lock_file(&fd1, LockType::None, false).unwrap());
        assert!(lock_file_with_timeout(&fd2, LockType::Write, Duration::from_secs(1)).unwrap());
    }

    #[test]
    fn test_waits_for_release() {
        let (_dir, path) = setup();
        let fd1 = open(&path);
        assert!(lock_file(&fd1, LockType::Write, false).unwrap());

        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(100));
                lock_file(&fd1, LockType::None, false).unwrap();
            });

            let fd2 = open(&path);
            let start = Instant::now();
            assert!(lock_file_with_timeout(&fd2, LockType::Write, Duration::from_secs(5)).unwrap());
            assert!(start.elapsed() >= Duration::from_millis(90));
        });
    }

    #[test]
    fn test_timeout_expires_on_time() {
        let (_dir, path) = setup();
        let fd1 = open(&path);
        assert!(lock_file(&fd1, LockType::Write, false).unwrap());

        let fd2 = open(&path);
        let start = Instant::now();
        assert!(!lock_file_with_timeout(&fd2, LockType::Write, Duration::from_secs(1)).unwrap());

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1500), "{elapsed:?}");
    }

    #[test]
    fn test_interrupt_aborts_wait() {
        let (_dir, path) = setup();
        let fd1 = open(&path);
        assert!(lock_file(&fd1, LockType::Write, false).unwrap());

        let interrupt = Interrupt::new();
        let fd2 = open(&path);

        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(50));
                interrupt.trigger();
            });

            let start = Instant::now();
            let result =
                lock_file_interruptible(&fd2, LockType::Write, Duration::from_secs(10), &interrupt);
            assert!(matches!(result, Err(LockError::Interrupted(_))));
            assert!(start.elapsed() < Duration::from_secs(2));
        });
    }

    #[test]
    fn test_delete_marks_and_unlinks() {
        let (_dir, path) = setup();
        let fd = open(&path);
        assert!(lock_file(&fd, LockType::Write, false).unwrap());

        delete_lock_file(&path, &fd);

        assert!(!path.exists());
        assert_eq!(fd.metadata().unwrap().len(), 1);
    }

    #[test]
    fn test_unlinked_file_is_stale() {
        let (_dir, path) = setup();
        let interrupt = Interrupt::new();

        // An early opener holds a description of the old file
        let early = open(&path);

        let holder = acquire_lock(&path, LockType::Write, Blocking::No, &interrupt)
            .unwrap()
            .unwrap();
        delete_lock_file(&path, &holder);
        drop(holder);

        // Locking the early description succeeds, but it no longer is the lock
        assert!(lock_file(&early, LockType::Write, false).unwrap());
        assert!(is_stale(&path, &early, LockType::Write).unwrap());

        // A fresh acquisition ends up on a new, valid file
        let fresh = acquire_lock(&path, LockType::Write, Blocking::No, &interrupt)
            .unwrap()
            .unwrap();
        assert!(!is_stale(&path, &fresh, LockType::Write).unwrap());
        assert_ne!(
            fresh.metadata().unwrap().ino(),
            early.metadata().unwrap().ino()
        );
    }

    #[test]
    fn test_leftover_marker_is_recovered() {
        let (_dir, path) = setup();
        let interrupt = Interrupt::new();

        // A holder that died after marking but before unlinking
        fs::write(&path, "d").unwrap();

        let file = acquire_lock(&path, LockType::Write, Blocking::No, &interrupt)
            .unwrap()
            .unwrap();

        assert_eq!(file.metadata().unwrap().len(), 0);
        assert!(!is_stale(&path, &file, LockType::Write).unwrap());
    }

    #[test]
    fn test_reader_leaves_marker_alone() {
        let (_dir, path) = setup();
        let interrupt = Interrupt::new();
        fs::write(&path, "d").unwrap();

        let file = acquire_lock(&path, LockType::Read, Blocking::No, &interrupt)
            .unwrap()
            .unwrap();

        // Same file, still marked and still linked
        assert_eq!(file.metadata().unwrap().len(), 1);
        assert_eq!(fs::metadata(&path).unwrap().ino(), file.metadata().unwrap().ino());
        assert!(!is_stale(&path, &file, LockType::Read).unwrap());
    }

    #[test]
    fn test_path_locks_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let paths: BTreeSet<_> = [root.join("a"), root.join("b")].into_iter().collect();
        let overlapping: BTreeSet<_> = [root.join("b"), root.join("c")].into_iter().collect();

        let mut first = PathLocks::with_interrupt(Interrupt::new());
        assert!(first.lock_paths(&paths, "", false).unwrap());
        assert!(root.join("a.lock").exists());

        let mut second = PathLocks::with_interrupt(Interrupt::new());
        assert!(!second.lock_paths(&overlapping, "", false).unwrap());
        assert!(second.is_empty());

        first.set_deletion(true);
        drop(first);
        assert!(!root.join("a.lock").exists());

        assert!(second.lock_paths(&overlapping, "", false).unwrap());
    }

    #[test]
    fn test_path_locks_wait() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        let paths: BTreeSet<_> = [root.join("out")].into_iter().collect();

        let mut first = PathLocks::with_interrupt(Interrupt::new());
        assert!(first.lock_paths(&paths, "", false).unwrap());
        first.set_deletion(true);

        thread::scope(|s| {
            s.spawn(move || {
                thread::sleep(Duration::from_millis(100));
                drop(first);
            });

            let mut second = PathLocks::with_interrupt(Interrupt::new());
            let start = Instant::now();
            assert!(second.lock_paths(&paths, "waiting for lock on 'out'", true).unwrap());
            assert!(start.elapsed() >= Duration::from_millis(90));
        });
    }
}
