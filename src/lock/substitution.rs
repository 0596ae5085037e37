use std::collections::HashSet;
use std::fs::{self, File};
use std::sync::{LazyLock, Mutex};
use std::time::{Duration, Instant, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use crate::core::Hash32;
use crate::error::LockError;
use crate::interrupt::Interrupt;
use crate::settings::Settings;

use super::{Blocking, LockType, acquire_lock, delete_lock_file, lock_file, open_lock_file};

/// Lock files untouched for this long belong to crashed holders.
const RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Lock directories already swept by this process.
static SWEPT: LazyLock<Mutex<HashSet<Utf8PathBuf>>> = LazyLock::new(Default::default);

/// Double-checked locks around expensive, idempotent copies.
///
/// Every key maps to `<cache>/substitution-locks/<key>.lock`. Two callers
/// with the same key never copy at the same time, and the one that waited
/// re-checks whether the work is already done before copying again.
#[derive(Debug, Clone)]
pub struct SubstitutionLocks {
    dir: Utf8PathBuf,
    interrupt: Interrupt,
}

impl SubstitutionLocks {
    pub fn new(cache_dir: &Utf8Path) -> Self {
        Self {
            dir: cache_dir.join("substitution-locks"),
            interrupt: Interrupt::global(),
        }
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    pub fn lock_path(&self, key: &str) -> Utf8PathBuf {
        self.dir.join(format!("{}.lock", file_key(key)))
    }

    /// Runs `do_copy` under the lock for `key` unless `check_exists` reports,
    /// once the lock is held, that the work has already been done.
    ///
    /// Returns whether `do_copy` ran. A zero `timeout` waits indefinitely;
    /// otherwise failing to get the lock in time is a [`LockError::Timeout`].
    /// The lock is released and its file removed on every path out, and
    /// errors from either callback reach the caller untouched.
    pub fn with_lock<E>(
        &self,
        key: &str,
        timeout: Duration,
        check_exists: impl FnOnce() -> Result<bool, E>,
        do_copy: impl FnOnce() -> Result<(), E>,
    ) -> Result<bool, E>
    where
        E: From<LockError>,
    {
        fs::create_dir_all(&self.dir).map_err(|e| LockError::io(&self.dir, e))?;
        self.sweep_once();

        let path = self.lock_path(key);

        let mut file = acquire_lock(&path, LockType::Write, Blocking::No, &self.interrupt)?;
        if file.is_none() {
            info!("waiting for another process to finish substituting '{key}'");

            let blocking = if timeout.is_zero() {
                Blocking::Forever
            } else {
                Blocking::Until(Instant::now() + timeout)
            };
            file = acquire_lock(&path, LockType::Write, blocking, &self.interrupt)?;
        }

        let file = file.ok_or_else(|| LockError::Timeout {
            path: path.clone(),
            timeout,
        })?;
        let _held = HeldLock { path: &path, file };

        if check_exists()? {
            debug!("'{key}' was substituted while waiting for the lock");
            return Ok(false);
        }

        do_copy()?;
        Ok(true)
    }

    fn sweep_once(&self) {
        let first = match SWEPT.lock() {
            Ok(mut swept) => swept.insert(self.dir.clone()),
            Err(_) => false,
        };

        if first {
            self.sweep(RETENTION);
        }
    }

    /// Removes lock files older than `max_age` that nobody holds.
    pub(crate) fn sweep(&self, max_age: Duration) {
        let pattern = format!("{}/*.lock", glob::Pattern::escape(self.dir.as_str()));
        let Ok(entries) = glob::glob(&pattern) else {
            return;
        };

        let now = SystemTime::now();

        for entry in entries.flatten() {
            let Ok(path) = Utf8PathBuf::try_from(entry) else {
                continue;
            };

            let expired = fs::metadata(&path)
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > max_age);

            if !expired {
                continue;
            }

            let Ok(Some(file)) = open_lock_file(&path, false) else {
                continue;
            };

            if let Ok(true) = lock_file(&file, LockType::Write, false) {
                debug!("removing old substitution lock '{path}'");
                delete_lock_file(&path, &file);
            }
        }
    }
}

/// Runs [`SubstitutionLocks::with_lock`] in the default cache directory.
pub fn with_substitution_lock<E>(
    key: &str,
    timeout: Duration,
    check_exists: impl FnOnce() -> Result<bool, E>,
    do_copy: impl FnOnce() -> Result<(), E>,
) -> Result<bool, E>
where
    E: From<LockError>,
{
    SubstitutionLocks::new(&Settings::default().cache_dir())
        .with_lock(key, timeout, check_exists, do_copy)
}

struct HeldLock<'a> {
    path: &'a Utf8Path,
    file: File,
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        delete_lock_file(self.path, &self.file);
        let _ = lock_file(&self.file, LockType::None, false);
    }
}

/// Keys that are already safe file names are used as they are, which keeps
/// the lock directory readable. Anything else is hashed.
fn file_key(key: &str) -> String {
    let plain = !key.is_empty()
        && key.len() <= 200
        && !key.starts_with('.')
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'.' | b'_' | b'-'));

    if plain {
        key.to_string()
    } else {
        Hash32::hash(key).to_hex()
    }
}
