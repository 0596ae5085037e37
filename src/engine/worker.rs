//! The scheduler.
//!
//! All goal logic runs on the thread that calls [`Worker::run`]. Goals live in
//! an arena and refer to each other by [`GoalId`]; the worker resumes runnable
//! goals in [`GoalKey`] order, hands out job slots per [`JobCategory`], and
//! sleeps on the job channel when nothing is runnable.

mod diagnostics;
mod jobs;

use std::collections::{BTreeMap, BTreeSet};
use std::process::Command;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail};
use indicatif::ProgressStyle;
use tracing::{debug, error, info, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::engine::goal::{BuildResult, ExitCode, Goal, GoalId, GoalKey, GoalKind, JobCategory};
use crate::engine::task::{Co, Step};
use crate::error::{BuildError, Interrupted, SchedulerError, StoreError};
use crate::goals::{DerivationGoal, RealiseGoal, SubstitutionGoal};
use crate::graph::DependencyGraph;
use crate::interrupt::Interrupt;
use crate::lock::SubstitutionLocks;
use crate::settings::Settings;
use crate::store::{Store, StorePath, Substituter};

pub use diagnostics::{Diagnostics, GoalExecution};
use jobs::{Event, Expired, Jobs};
pub use jobs::{JobLimits, JobOutcome, describe_status};

/// Longest the worker sleeps on the job channel before looking around again.
const MAX_WAIT: Duration = Duration::from_millis(100);

static PROGRESS_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
});

/// Something the caller wants to exist in the store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum DerivedPath {
    /// A plain store path, obtained by substitution.
    Opaque(StorePath),
    /// All outputs of a derivation, substituted or built.
    Built(StorePath),
}

#[derive(Debug)]
pub struct GoalOutcome {
    pub id: GoalId,
    pub name: String,
    pub result: BuildResult,
    /// The error that ended the goal, unless it was already reported.
    pub error: Option<anyhow::Error>,
}

/// One outcome per requested goal, in the order they were requested.
#[derive(Debug)]
pub struct RunReport {
    pub results: Vec<GoalOutcome>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|outcome| outcome.result.is_success())
    }
}

pub struct Worker {
    settings: Settings,
    store: Arc<dyn Store>,
    substituters: Vec<Arc<dyn Substituter>>,
    substitution_locks: Arc<SubstitutionLocks>,
    interrupt: Interrupt,
    goals: Vec<Goal>,
    derivation_goals: BTreeMap<StorePath, GoalId>,
    substitution_goals: BTreeMap<StorePath, GoalId>,
    top_goals: BTreeSet<GoalId>,
    awake: BTreeSet<(GoalKey, GoalId)>,
    wanting_slot: BTreeSet<(GoalKey, GoalId)>,
    waiting_for_a_while: BTreeMap<GoalId, Instant>,
    jobs: Jobs,
    diagnostics: Diagnostics,
    progress: tracing::Span,
    progress_len: u64,
    cancelling: bool,
}

impl Worker {
    pub fn new(store: Arc<dyn Store>, settings: Settings) -> Self {
        let interrupt = Interrupt::global();
        let substitution_locks =
            SubstitutionLocks::new(&settings.cache_dir()).with_interrupt(interrupt.clone());

        Self {
            settings,
            store,
            substituters: Vec::new(),
            substitution_locks: Arc::new(substitution_locks),
            interrupt,
            goals: Vec::new(),
            derivation_goals: BTreeMap::new(),
            substitution_goals: BTreeMap::new(),
            top_goals: BTreeSet::new(),
            awake: BTreeSet::new(),
            wanting_slot: BTreeSet::new(),
            waiting_for_a_while: BTreeMap::new(),
            jobs: Jobs::new(),
            diagnostics: Diagnostics::default(),
            progress: tracing::Span::none(),
            progress_len: 0,
            cancelling: false,
        }
    }

    /// Substituters are tried in the given order.
    pub fn with_substituters(mut self, substituters: Vec<Arc<dyn Substituter>>) -> Self {
        self.substituters = substituters;
        self
    }

    /// Replaces the process-wide interrupt flag with `interrupt`.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        let locks =
            SubstitutionLocks::new(&self.settings.cache_dir()).with_interrupt(interrupt.clone());
        self.substitution_locks = Arc::new(locks);
        self.interrupt = interrupt;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn make_goal(&mut self, path: &DerivedPath) -> GoalId {
        match path {
            DerivedPath::Opaque(path) => self.make_substitution_goal(path),
            DerivedPath::Built(drv) => self.insert_goal(
                format!("realisation of '{drv}'"),
                GoalKind::Realise(drv.clone()),
                JobCategory::Administration,
                Co::new(RealiseGoal::new(drv.clone())),
            ),
        }
    }

    /// Finds the busy goal building `drv`, or creates one.
    pub fn make_derivation_goal(&mut self, drv: &StorePath) -> GoalId {
        if let Some(&id) = self.derivation_goals.get(drv) {
            return id;
        }

        let id = self.insert_goal(
            format!("building of '{drv}'"),
            GoalKind::Derivation(drv.clone()),
            JobCategory::Build,
            Co::new(DerivationGoal::new(drv.clone())),
        );
        self.derivation_goals.insert(drv.clone(), id);
        id
    }

    /// Finds the busy goal substituting `path`, or creates one.
    pub fn make_substitution_goal(&mut self, path: &StorePath) -> GoalId {
        if let Some(&id) = self.substitution_goals.get(path) {
            return id;
        }

        let id = self.insert_goal(
            format!("substitution of '{path}'"),
            GoalKind::Substitution(path.clone()),
            JobCategory::Substitution,
            Co::new(SubstitutionGoal::new(path.clone())),
        );
        self.substitution_goals.insert(path.clone(), id);
        id
    }

    /// Adds a goal driven by an arbitrary task.
    pub fn add_goal(&mut self, name: impl Into<String>, category: JobCategory, co: Co) -> GoalId {
        self.insert_goal(name.into(), GoalKind::Custom, category, co)
    }

    fn insert_goal(
        &mut self,
        name: String,
        kind: GoalKind,
        category: JobCategory,
        co: Co,
    ) -> GoalId {
        let id = GoalId(self.goals.len());
        let goal = Goal::new(name, kind, category, co);
        debug!("created goal {id}: {}", goal.name);

        self.awake.insert((goal.key.clone(), id));
        self.goals.push(goal);

        self.progress_len += 1;
        self.progress.pb_set_length(self.progress_len);
        id
    }

    pub fn exit_code(&self, id: GoalId) -> ExitCode {
        self.goals[id.0].exit_code
    }

    pub fn build_result(&self, id: GoalId) -> &BuildResult {
        &self.goals[id.0].build_result
    }

    pub fn take_error(&mut self, id: GoalId) -> Option<anyhow::Error> {
        self.goals[id.0].ex.take()
    }

    /// Creates goals for `paths`, runs them, and reports on each.
    pub fn realise(&mut self, paths: &[DerivedPath]) -> Result<RunReport, SchedulerError> {
        let ids: Vec<GoalId> = paths.iter().map(|path| self.make_goal(path)).collect();
        self.run(&ids)
    }

    /// Runs until every goal in `top` has finished.
    ///
    /// Goal failures are part of the report. Only a stuck goal graph or a
    /// corrupt store ends the run with an error.
    pub fn run(&mut self, top: &[GoalId]) -> Result<RunReport, SchedulerError> {
        self.top_goals.extend(top.iter().copied());
        self.cancelling = false;

        let span = tracing::info_span!("realising");
        self.progress_len = self.goals.iter().filter(|goal| goal.is_busy()).count() as u64;
        span.pb_set_style(&PROGRESS_STYLE);
        span.pb_set_length(self.progress_len);
        span.pb_set_message("Realising goals...");
        self.progress = span.clone();
        let _enter = span.enter();

        let result = self.run_loop();
        self.jobs.kill_all();
        self.progress = tracing::Span::none();
        result?;

        let results = top
            .iter()
            .map(|&id| {
                self.top_goals.remove(&id);
                let goal = &mut self.goals[id.0];
                GoalOutcome {
                    id,
                    name: goal.name.clone(),
                    result: goal.build_result.clone(),
                    error: goal.ex.take(),
                }
            })
            .collect();

        Ok(RunReport { results })
    }

    fn run_loop(&mut self) -> Result<(), SchedulerError> {
        loop {
            if self.interrupt.is_triggered() {
                self.interrupt_all();
            }

            self.grant_slots();
            self.wake_timers(Instant::now());

            let awake = std::mem::take(&mut self.awake);
            for (_, id) in awake {
                self.work(id)?;
            }

            if self.top_goals.iter().all(|id| !self.goals[id.0].is_busy()) {
                return Ok(());
            }

            let runnable = !self.awake.is_empty() || self.can_grant_slot();
            if !runnable && self.jobs.is_empty() && self.waiting_for_a_while.is_empty() {
                return Err(self.stall_error());
            }

            self.wait_for_events(runnable);
            self.check_timeouts();
        }
    }

    /// Resumes a goal's task chain until it blocks or the goal ends.
    fn work(&mut self, id: GoalId) -> Result<(), SchedulerError> {
        let goal = &mut self.goals[id.0];
        if !goal.is_busy() {
            return Ok(());
        }
        let Some(mut co) = goal.co.take() else {
            return Ok(());
        };

        let span = goal.span.clone();
        let _enter = span.enter();

        // Result of a `Done` whose continuation is still running
        let mut pending: Option<(ExitCode, Option<anyhow::Error>)> = None;

        loop {
            let step = co.resume(&mut Context { worker: self, id });

            let step = match step {
                Ok(step) => step,
                Err(e) if is_fatal(&e) => {
                    return Err(SchedulerError::Fatal {
                        goal: self.goals[id.0].name.clone(),
                        error: e,
                    });
                }
                Err(e) => {
                    self.finish(id, ExitCode::Failed, Some(e));
                    return Ok(());
                }
            };

            debug!(step = step.kind(), "resumed");

            if let Some((code, e)) = pending.take() {
                let unwinding = matches!(
                    step,
                    Step::Call(_) | Step::TailCall(_) | Step::Return | Step::Done(..)
                );
                if !unwinding {
                    self.finish(id, code, e);
                    return Ok(());
                }
                pending = Some((code, e));
            }

            match step {
                Step::Suspend => {
                    self.park(id, co);
                    self.wake(id);
                    return Ok(());
                }
                Step::Await(waitees) => {
                    if self.add_waitees(id, waitees) {
                        self.park(id, co);
                        return Ok(());
                    }
                }
                Step::WaitForSlot => {
                    if !self.goals[id.0].has_slot && !self.try_acquire_slot(id) {
                        let key = self.goals[id.0].key.clone();
                        self.wanting_slot.insert((key, id));
                        self.park(id, co);
                        return Ok(());
                    }
                }
                Step::WaitForJob => {
                    let goal = &self.goals[id.0];
                    if goal.job_outcome.is_none() {
                        if goal.job.is_none() {
                            let error = anyhow!("waiting for a job that was never started");
                            self.finish(id, ExitCode::Failed, Some(error));
                            return Ok(());
                        }
                        self.park(id, co);
                        return Ok(());
                    }
                }
                Step::WaitForAWhile => {
                    let until = Instant::now() + self.settings.poll_interval();
                    self.waiting_for_a_while.insert(id, until);
                    self.park(id, co);
                    return Ok(());
                }
                Step::Call(mut sub) => {
                    sub.set_continuation(Some(co));
                    co = sub;
                }
                Step::TailCall(mut next) => {
                    next.set_continuation(co.retire());
                    co = next;
                }
                Step::Return => match co.retire() {
                    Some(next) => co = next,
                    None => {
                        let (code, e) = pending.take().unwrap_or_else(|| {
                            let error = anyhow!("task returned without finishing its goal");
                            (ExitCode::Failed, Some(error))
                        });
                        self.finish(id, code, e);
                        return Ok(());
                    }
                },
                Step::Done(code, e) => {
                    if pending.is_none() {
                        pending = Some((code, e));
                    } else if let Some(e) = e {
                        debug!("goal already finished, dropping: {e:#}");
                    }

                    match co.retire() {
                        Some(next) => co = next,
                        None => {
                            let (code, e) = pending.take().unwrap_or((code, None));
                            self.finish(id, code, e);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn park(&mut self, id: GoalId, co: Co) {
        self.goals[id.0].co = Some(co);
    }

    fn wake(&mut self, id: GoalId) {
        let key = self.goals[id.0].key.clone();
        self.awake.insert((key, id));
    }

    /// Registers `waitees` of `id`. Returns whether any of them is still busy.
    fn add_waitees(&mut self, id: GoalId, waitees: Vec<GoalId>) -> bool {
        let mut blocked = false;

        for waitee in waitees {
            self.diagnostics.record_edge(id, waitee);

            let code = self.goals[waitee.0].exit_code;
            if code.is_terminal() {
                self.tally(id, code);
            } else {
                self.goals[waitee.0].waiters.insert(id);
                self.goals[id.0].waitees.insert(waitee);
                blocked = true;
            }
        }

        blocked
    }

    fn tally(&mut self, waiter: GoalId, code: ExitCode) {
        let goal = &mut self.goals[waiter.0];

        match code {
            ExitCode::Failed => goal.nr_failed += 1,
            ExitCode::NoSubstituters => {
                goal.nr_failed += 1;
                goal.nr_no_substituters += 1;
            }
            ExitCode::Busy | ExitCode::Success => {}
        }
    }

    fn try_acquire_slot(&mut self, id: GoalId) -> bool {
        let category = self.goals[id.0].category;

        // Goals already queued for this category go first
        let queued = self
            .wanting_slot
            .iter()
            .any(|(_, other)| self.goals[other.0].category == category);

        if queued || !self.jobs.try_acquire_slot(category, self.settings.max_jobs(category)) {
            return false;
        }

        self.goals[id.0].has_slot = true;
        true
    }

    fn can_grant_slot(&self) -> bool {
        self.wanting_slot.iter().any(|(_, id)| {
            let category = self.goals[id.0].category;
            self.jobs.has_free_slot(category, self.settings.max_jobs(category))
        })
    }

    fn grant_slots(&mut self) {
        let wanting: Vec<(GoalKey, GoalId)> = self.wanting_slot.iter().cloned().collect();

        for (key, id) in wanting {
            let category = self.goals[id.0].category;
            if self.jobs.try_acquire_slot(category, self.settings.max_jobs(category)) {
                self.wanting_slot.remove(&(key.clone(), id));
                self.goals[id.0].has_slot = true;
                self.awake.insert((key, id));
            }
        }
    }

    fn wake_timers(&mut self, now: Instant) {
        let due: Vec<GoalId> = self
            .waiting_for_a_while
            .iter()
            .filter(|&(_, &until)| until <= now)
            .map(|(&id, _)| id)
            .collect();

        for id in due {
            self.waiting_for_a_while.remove(&id);
            self.wake(id);
        }
    }

    fn wait_for_events(&mut self, runnable: bool) {
        let now = Instant::now();
        let deadlines = [
            self.jobs.next_deadline(),
            self.waiting_for_a_while.values().min().copied(),
        ];

        let timeout = if runnable {
            Duration::ZERO
        } else {
            deadlines
                .into_iter()
                .flatten()
                .map(|deadline| deadline.saturating_duration_since(now))
                .fold(MAX_WAIT, Duration::min)
        };

        let mut next = if timeout.is_zero() {
            self.jobs.try_recv()
        } else {
            self.jobs.recv_timeout(timeout)
        };

        while let Some(event) = next {
            self.handle_event(event);
            next = self.jobs.try_recv();
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Output { job, line } => {
                if let Some(id) = self.jobs.record_output(job, line.clone()) {
                    debug!(target: "kiln::build_log", goal = %self.goals[id.0].name, "{line}");
                }
            }
            Event::Finished { job, completion } => {
                // Killed jobs were already forgotten
                let Some((running, outcome)) = self.jobs.complete(job, completion) else {
                    return;
                };

                let id = running.goal;
                let goal = &mut self.goals[id.0];
                goal.job = None;
                goal.job_outcome = Some(outcome);

                if std::mem::take(&mut goal.has_slot) {
                    self.jobs.release_slot(running.category);
                }
                if self.goals[id.0].is_busy() {
                    self.wake(id);
                }
            }
        }
    }

    fn check_timeouts(&mut self) {
        for (_, id, expired) in self.jobs.expired(Instant::now()) {
            let goal = self.goals[id.0].name.clone();
            let error = match expired {
                Expired::Silence(limit) => BuildError::SilenceTimeout {
                    goal,
                    secs: limit.as_secs(),
                },
                Expired::Timeout(limit) => BuildError::BuildTimeout {
                    goal,
                    secs: limit.as_secs(),
                },
            };

            warn!("{error}");
            if let Some(job) = self.goals[id.0].job.take() {
                self.jobs.kill(job);
            }
            let error = match self.goals[id.0].co.as_mut() {
                Some(co) => co.timed_out(error),
                None => error.into(),
            };
            self.finish(id, ExitCode::Failed, Some(error));
        }
    }

    fn interrupt_all(&mut self) {
        warn!("interrupted, stopping all goals");
        self.jobs.kill_all();

        for index in 0..self.goals.len() {
            self.finish(GoalId(index), ExitCode::Failed, Some(Interrupted.into()));
        }
    }

    fn cancel_all(&mut self, reason: &str) {
        if std::mem::replace(&mut self.cancelling, true) {
            return;
        }

        for index in 0..self.goals.len() {
            let error = BuildError::Cancelled(reason.to_string());
            self.finish(GoalId(index), ExitCode::Failed, Some(error.into()));
        }
    }

    /// Ends a goal and notifies its waiters. Does nothing for goals that have
    /// already ended.
    fn finish(&mut self, id: GoalId, code: ExitCode, error: Option<anyhow::Error>) {
        debug_assert!(code.is_terminal());

        let goal = &mut self.goals[id.0];
        if !goal.is_busy() {
            return;
        }

        goal.co = None;
        goal.job_outcome = None;
        let job = goal.job.take();
        let had_slot = std::mem::take(&mut goal.has_slot);
        let waitees = std::mem::take(&mut goal.waitees);
        let key = goal.key.clone();
        let category = goal.category;

        if let Some(job) = job {
            self.jobs.kill(job);
        }
        if had_slot {
            self.jobs.release_slot(category);
        }
        for waitee in waitees {
            self.goals[waitee.0].waiters.remove(&id);
        }
        self.awake.remove(&(key.clone(), id));
        self.wanting_slot.remove(&(key, id));
        self.waiting_for_a_while.remove(&id);

        let goal = &mut self.goals[id.0];
        goal.exit_code = code;
        goal.build_result.exit_code = code;
        goal.build_result.nr_failed = goal.nr_failed;
        goal.build_result.nr_no_substituters = goal.nr_no_substituters;

        if let Some(e) = error {
            goal.build_result.error = Some(format!("{e:#}"));

            if !goal.preserve_exception && !goal.waiters.is_empty() {
                error!("{}: {e:#}", goal.name);
            } else {
                goal.ex = Some(e);
            }
        }

        info!("{} finished: {code:?}", goal.name);
        goal.span = tracing::Span::none();

        let name = goal.name.clone();
        self.diagnostics.record_goal(
            id,
            GoalExecution {
                name: name.clone(),
                exit_code: code,
                start: goal.created,
                duration: goal.created.elapsed(),
            },
        );

        let waiters = std::mem::take(&mut goal.waiters);
        for waiter in waiters {
            self.goals[waiter.0].waitees.remove(&id);
            self.tally(waiter, code);

            let waiter_goal = &self.goals[waiter.0];
            if waiter_goal.waitees.is_empty() && waiter_goal.is_busy() {
                self.wake(waiter);
            }
        }

        match &self.goals[id.0].kind {
            GoalKind::Derivation(drv) => {
                if self.derivation_goals.get(drv) == Some(&id) {
                    self.derivation_goals.remove(drv);
                }
            }
            GoalKind::Substitution(path) => {
                if self.substitution_goals.get(path) == Some(&id) {
                    self.substitution_goals.remove(path);
                }
            }
            GoalKind::Realise(_) | GoalKind::Custom => {}
        }

        self.progress.pb_inc(1);

        if code == ExitCode::Failed && self.top_goals.contains(&id) && !self.settings.keep_going {
            self.cancel_all(&format!("{name} failed"));
        }
    }

    fn stall_error(&self) -> SchedulerError {
        let mut graph = DependencyGraph::<GoalId>::new();
        for (index, goal) in self.goals.iter().enumerate() {
            if goal.is_busy() {
                for &waitee in &goal.waitees {
                    graph.add_edge(GoalId(index), waitee);
                }
            }
        }

        if let Some(cycle) = graph.find_cycles().into_iter().next() {
            let names = cycle.iter().map(|id| self.goals[id.0].name.clone()).collect();
            return SchedulerError::DependencyCycle(names);
        }

        let starved = self
            .wanting_slot
            .iter()
            .map(|(_, id)| self.goals[id.0].category)
            .find(|&category| self.settings.max_jobs(category) == 0);
        if let Some(category) = starved {
            return SchedulerError::NoBuildSlots(Settings::max_jobs_key(category));
        }

        let busy = self
            .goals
            .iter()
            .filter(|goal| goal.is_busy())
            .map(|goal| goal.name.clone())
            .collect();
        SchedulerError::Stalled(busy)
    }
}

/// Errors that mean the on-disk state can't be trusted any more.
fn is_fatal(e: &anyhow::Error) -> bool {
    e.chain()
        .any(|cause| matches!(cause.downcast_ref::<StoreError>(), Some(StoreError::Corrupt { .. })))
}

/// What a task sees of the worker while it is being resumed.
pub struct Context<'a> {
    worker: &'a mut Worker,
    id: GoalId,
}

impl Context<'_> {
    pub fn id(&self) -> GoalId {
        self.id
    }

    fn goal(&self) -> &Goal {
        &self.worker.goals[self.id.0]
    }

    fn goal_mut(&mut self) -> &mut Goal {
        &mut self.worker.goals[self.id.0]
    }

    pub fn name(&self) -> &str {
        &self.goal().name
    }

    pub fn span(&self) -> &tracing::Span {
        &self.goal().span
    }

    pub fn settings(&self) -> &Settings {
        &self.worker.settings
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.worker.store.clone()
    }

    pub fn substituters(&self) -> &[Arc<dyn Substituter>] {
        &self.worker.substituters
    }

    pub fn substitution_locks(&self) -> Arc<SubstitutionLocks> {
        self.worker.substitution_locks.clone()
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.worker.interrupt
    }

    /// Awaited goals that ended in failure since the last reset.
    pub fn nr_failed(&self) -> usize {
        self.goal().nr_failed
    }

    pub fn nr_no_substituters(&self) -> usize {
        self.goal().nr_no_substituters
    }

    pub fn reset_tallies(&mut self) {
        let goal = self.goal_mut();
        goal.nr_failed = 0;
        goal.nr_no_substituters = 0;
    }

    pub fn make_derivation_goal(&mut self, drv: &StorePath) -> GoalId {
        self.worker.make_derivation_goal(drv)
    }

    pub fn make_substitution_goal(&mut self, path: &StorePath) -> GoalId {
        self.worker.make_substitution_goal(path)
    }

    pub fn add_goal(&mut self, name: impl Into<String>, category: JobCategory, co: Co) -> GoalId {
        self.worker.add_goal(name, category, co)
    }

    pub fn exit_code(&self, id: GoalId) -> ExitCode {
        self.worker.exit_code(id)
    }

    pub fn build_result(&self, id: GoalId) -> &BuildResult {
        self.worker.build_result(id)
    }

    pub fn take_error(&mut self, id: GoalId) -> Option<anyhow::Error> {
        self.worker.take_error(id)
    }

    /// Makes `id` keep its error for whoever awaits it, instead of logging it.
    pub fn set_preserve_exception(&mut self, id: GoalId, preserve: bool) {
        self.worker.goals[id.0].preserve_exception = preserve;
    }

    /// The result this goal will report; exit code and tallies are filled in
    /// when it ends.
    pub fn build_result_mut(&mut self) -> &mut BuildResult {
        &mut self.goal_mut().build_result
    }

    fn claim_slot(&mut self) -> anyhow::Result<()> {
        if self.goal().job.is_some() {
            bail!("{} already runs a job", self.name());
        }
        if !self.goal().has_slot && !self.worker.try_acquire_slot(self.id) {
            bail!("no free job slot for {}", self.name());
        }
        Ok(())
    }

    fn started(&mut self, job: u64) {
        let category = self.goal().category;
        let goal = self.goal_mut();
        goal.job = Some(job);
        goal.job_outcome = None;

        let running = self.worker.jobs.running_in(category);
        self.worker.diagnostics.record_jobs(category, running);
    }

    /// Starts a child process for this goal, holding its job slot until the
    /// process exits. Follow with [`Step::WaitForJob`].
    pub fn spawn_process(
        &mut self,
        command: Command,
        stdin: Option<Vec<u8>>,
        limits: JobLimits,
    ) -> anyhow::Result<()> {
        self.claim_slot()?;

        let (id, category) = (self.id, self.goal().category);
        let log_lines = self.worker.settings.log_lines;
        let job = self
            .worker
            .jobs
            .spawn_process(id, category, command, stdin, limits, log_lines)
            .map_err(|e| anyhow!("Couldn't start builder for {}.\n{e}", self.name()))?;

        self.started(job);
        Ok(())
    }

    /// Runs `f` on a job thread for this goal. Follow with
    /// [`Step::WaitForJob`].
    pub fn spawn_thread<F>(&mut self, name: &str, f: F) -> anyhow::Result<()>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.claim_slot()?;

        let (id, category) = (self.id, self.goal().category);
        let job = self
            .worker
            .jobs
            .spawn_thread(id, category, name, f)
            .map_err(|e| anyhow!("Couldn't start thread for {}.\n{e}", self.name()))?;

        self.started(job);
        Ok(())
    }

    pub fn take_job_outcome(&mut self) -> Option<JobOutcome> {
        self.goal_mut().job_outcome.take()
    }
}
