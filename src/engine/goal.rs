use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::time::Instant;

use crate::engine::task::Co;
use crate::engine::worker::JobOutcome;
use crate::store::StorePath;

/// Handle to a goal in the worker's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GoalId(pub(crate) usize);

impl Display for GoalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExitCode {
    #[default]
    Busy,
    Success,
    Failed,
    NoSubstituters,
}

impl ExitCode {
    pub fn is_terminal(self) -> bool {
        self != ExitCode::Busy
    }
}

/// Scheduling class used for concurrency limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobCategory {
    Build,
    Substitution,
    /// Goals that only wait on other goals and never run jobs themselves.
    Administration,
}

impl JobCategory {
    fn rank(self) -> u8 {
        match self {
            JobCategory::Substitution => 0,
            JobCategory::Administration => 1,
            JobCategory::Build => 2,
        }
    }
}

/// Total order in which runnable goals are resumed: substitutions first,
/// then administration, then builds, each by name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GoalKey {
    rank: u8,
    name: String,
}

impl GoalKey {
    pub fn new(category: JobCategory, name: &str) -> Self {
        Self {
            rank: category.rank(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GoalKind {
    Derivation(StorePath),
    Substitution(StorePath),
    Realise(StorePath),
    Custom,
}

/// Outcome of a goal as reported to whoever asked for it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildResult {
    pub exit_code: ExitCode,
    pub error: Option<String>,
    /// Output name to path, for goals that realise a derivation.
    pub built_outputs: BTreeMap<String, StorePath>,
    /// Waitees that ended in `Failed` or `NoSubstituters`.
    pub nr_failed: usize,
    /// Waitees that ended in `NoSubstituters`.
    pub nr_no_substituters: usize,
}

impl BuildResult {
    pub fn is_success(&self) -> bool {
        self.exit_code == ExitCode::Success
    }
}

pub(crate) struct Goal {
    pub name: String,
    pub kind: GoalKind,
    pub category: JobCategory,
    pub key: GoalKey,
    pub exit_code: ExitCode,
    pub nr_failed: usize,
    pub nr_no_substituters: usize,
    pub build_result: BuildResult,
    pub ex: Option<anyhow::Error>,
    pub preserve_exception: bool,
    /// Goals this one is blocked on.
    pub waitees: BTreeSet<GoalId>,
    /// Goals blocked on this one. Plain handles, the arena owns every goal.
    pub waiters: BTreeSet<GoalId>,
    /// Current task chain; taken out while the goal runs.
    pub co: Option<Co>,
    pub has_slot: bool,
    pub job: Option<u64>,
    pub job_outcome: Option<JobOutcome>,
    pub span: tracing::Span,
    pub created: Instant,
}

impl Goal {
    pub fn new(name: String, kind: GoalKind, category: JobCategory, co: Co) -> Self {
        let span = tracing::info_span!("goal", name = %name);

        Self {
            key: GoalKey::new(category, &name),
            name,
            kind,
            category,
            exit_code: ExitCode::Busy,
            nr_failed: 0,
            nr_no_substituters: 0,
            build_result: BuildResult::default(),
            ex: None,
            preserve_exception: false,
            waitees: BTreeSet::new(),
            waiters: BTreeSet::new(),
            co: Some(co),
            has_slot: false,
            job: None,
            job_outcome: None,
            span,
            created: Instant::now(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.exit_code == ExitCode::Busy
    }
}
