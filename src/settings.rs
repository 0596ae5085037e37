use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::engine::JobCategory;

/// Scheduler and locking configuration.
///
/// Every field has a default, so a settings file only needs to mention what
/// it overrides:
///
/// ```json
/// { "max-build-jobs": 4, "keep-going": true }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    /// Maximum number of builder processes running at once.
    pub max_build_jobs: usize,
    /// Maximum number of substitutions running at once.
    pub max_substitution_jobs: usize,
    /// Kill a job that produced no output for this many seconds. `0` disables.
    pub max_silent_time: u64,
    /// Kill a job that has been running for this many seconds. `0` disables.
    pub build_timeout: u64,
    /// Keep building unrelated goals after a requested goal failed.
    pub keep_going: bool,
    /// Try substituters before building.
    pub substitute: bool,
    /// How long to wait for a substitution lock, in seconds. `0` waits forever.
    pub lock_timeout: u64,
    /// Interval at which goals waiting on contended locks are retried.
    pub poll_interval_ms: u64,
    /// Number of trailing builder output lines kept for error messages.
    pub log_lines: usize,
    /// Where lock directories live. Defaults to the user cache directory.
    pub cache_dir: Option<Utf8PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_build_jobs: 1,
            max_substitution_jobs: 16,
            max_silent_time: 0,
            build_timeout: 0,
            keep_going: false,
            substitute: true,
            lock_timeout: 300,
            poll_interval_ms: 1000,
            log_lines: 25,
            cache_dir: None,
        }
    }
}

impl Settings {
    pub fn from_json_file(path: &Utf8Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Couldn't read settings from '{path}'.\n{e}"))?;

        Ok(serde_json::from_str(&data)?)
    }

    /// Concurrency limit for a job category. Administration goals never run
    /// jobs of their own, so they are not limited.
    pub fn max_jobs(&self, category: JobCategory) -> usize {
        match category {
            JobCategory::Build => self.max_build_jobs,
            JobCategory::Substitution => self.max_substitution_jobs,
            JobCategory::Administration => usize::MAX,
        }
    }

    /// Name of the setting behind [`Settings::max_jobs`], as spelled in a
    /// settings file.
    pub fn max_jobs_key(category: JobCategory) -> &'static str {
        match category {
            JobCategory::Build => "max-build-jobs",
            JobCategory::Substitution => "max-substitution-jobs",
            JobCategory::Administration => "max-administration-jobs",
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn max_silent_time(&self) -> Option<Duration> {
        (self.max_silent_time > 0).then(|| Duration::from_secs(self.max_silent_time))
    }

    pub fn build_timeout(&self) -> Option<Duration> {
        (self.build_timeout > 0).then(|| Duration::from_secs(self.build_timeout))
    }

    pub fn cache_dir(&self) -> Utf8PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }

        let base = std::env::var("XDG_CACHE_HOME")
            .ok()
            .filter(|dir| !dir.is_empty())
            .map(Utf8PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|home| Utf8PathBuf::from(home).join(".cache"))
            })
            .unwrap_or_else(|| Utf8PathBuf::from("/tmp"));

        base.join("kiln")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{ "max-build-jobs": 4, "keep-going": true }"#).unwrap();

        assert_eq!(settings.max_build_jobs, 4);
        assert!(settings.keep_going);
        assert_eq!(settings.max_substitution_jobs, 16);
        assert_eq!(settings.lock_timeout(), Duration::from_secs(300));
        assert!(settings.substitute);
    }

    #[test]
    fn test_zero_disables_timeouts() {
        let settings = Settings::default();
        assert_eq!(settings.max_silent_time(), None);
        assert_eq!(settings.build_timeout(), None);

        let settings = Settings {
            build_timeout: 7,
            ..Settings::default()
        };
        assert_eq!(settings.build_timeout(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_category_limits() {
        let settings = Settings {
            max_build_jobs: 3,
            max_substitution_jobs: 5,
            ..Settings::default()
        };

        assert_eq!(settings.max_jobs(JobCategory::Build), 3);
        assert_eq!(settings.max_jobs(JobCategory::Substitution), 5);
        assert_eq!(settings.max_jobs(JobCategory::Administration), usize::MAX);
    }

    #[test]
    fn test_explicit_cache_dir_wins() {
        let settings = Settings {
            cache_dir: Some("/var/cache/kiln-test".into()),
            ..Settings::default()
        };

        assert_eq!(settings.cache_dir(), Utf8PathBuf::from("/var/cache/kiln-test"));
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("settings.json")).unwrap();
        std::fs::write(&path, r#"{ "poll-interval-ms": 10, "log-lines": 3 }"#).unwrap();

        let settings = Settings::from_json_file(&path).unwrap();
        assert_eq!(settings.poll_interval(), Duration::from_millis(10));
        assert_eq!(settings.log_lines, 3);

        assert!(Settings::from_json_file(&path.with_file_name("missing.json")).is_err());
    }
}
