use std::io;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::store::StorePath;

/// Raised when the user (or a test) triggers the cooperative interrupt flag.
/// Kept apart from ordinary failures so callers never retry on it.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("interrupted by the user")]
pub struct Interrupted;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Couldn't open lock file '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Couldn't change lock state.\n{0}")]
    Flock(#[from] nix::errno::Errno),

    #[error("timed out after {timeout:?} waiting for lock '{path}'")]
    Timeout { path: Utf8PathBuf, timeout: Duration },

    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

impl LockError {
    pub(crate) fn io(path: impl Into<Utf8PathBuf>, source: io::Error) -> Self {
        LockError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("node not found in graph: {0}")]
    NodeNotFound(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid store path '{0}'")]
    InvalidPath(String),

    #[error("path '{0}' is not valid")]
    NotValid(StorePath),

    #[error("derivation '{0}' is not in the store")]
    MissingDerivation(StorePath),

    #[error("I/O error on '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The on-disk state contradicts itself. Nothing a goal does can recover
    /// from this, so the scheduler lets it escape its run loop.
    #[error("store database entry for '{path}' is corrupt: {reason}")]
    Corrupt { path: String, reason: String },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<Utf8PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Reasons a goal ends in [`ExitCode::Failed`](crate::ExitCode::Failed).
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{count} dependencies of derivation '{drv}' failed to build")]
    DependenciesFailed { drv: StorePath, count: usize },

    #[error("builder for '{drv}' failed with {status}{log}")]
    BuilderFailed {
        drv: StorePath,
        status: String,
        log: String,
    },

    #[error("builder for '{drv}' failed to produce output path '{output}'")]
    MissingOutput { drv: StorePath, output: StorePath },

    #[error("{goal} timed out after {secs} seconds of silence")]
    SilenceTimeout { goal: String, secs: u64 },

    #[error("{goal} timed out after {secs} seconds")]
    BuildTimeout { goal: String, secs: u64 },

    #[error("some references of path '{0}' could not be realised")]
    IncompleteClosure(StorePath),

    #[error("could not substitute '{0}' from any substituter")]
    SubstitutionFailed(StorePath),

    #[error("cancelled because {0}")]
    Cancelled(String),
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("dependency cycle between goals: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    #[error("no goal can make progress; still waiting: {}", .0.join(", "))]
    Stalled(Vec<String>),

    /// A job category with a limit of zero has goals waiting for a slot. Holds
    /// the name of the setting to raise.
    #[error("unable to start any job; increase '{0}'")]
    NoBuildSlots(&'static str),

    #[error("fatal error in {goal}:\n{error:#}")]
    Fatal { goal: String, error: anyhow::Error },
}
