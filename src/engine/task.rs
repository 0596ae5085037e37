//! Cooperative suspension runtime.
//!
//! A goal's logic is a chain of [`Co`]s. Each link wraps a [`Task`], a state
//! machine that is resumed by the worker and answers with the [`Step`] it
//! wants to take next. Suspending means returning a step; the task keeps
//! whatever it needs in its own fields and picks up from its saved state the
//! next time it is resumed.

use crate::engine::goal::{ExitCode, GoalId};
use crate::engine::worker::Context;
use crate::error::BuildError;

/// What a task asks the worker to do after being resumed.
pub enum Step {
    /// Yield; resume on the next scheduling pass.
    Suspend,
    /// Resume once every listed goal has reached a terminal exit code.
    Await(Vec<GoalId>),
    /// Resume once the goal's job category has a free slot, which is then
    /// reserved for the goal until its job finishes.
    WaitForSlot,
    /// Resume once the job started by this goal has finished.
    WaitForJob,
    /// Resume after the configured poll interval.
    WaitForAWhile,
    /// Run a sub-task, then come back to this one.
    Call(Co),
    /// Hand the rest of the work to another task. It inherits this task's
    /// continuation, and this task is discarded.
    TailCall(Co),
    /// End this task and resume its continuation.
    Return,
    /// End the goal with the given result once the chain has unwound.
    Done(ExitCode, Option<anyhow::Error>),
}

impl Step {
    pub fn success() -> Self {
        Step::Done(ExitCode::Success, None)
    }

    pub fn failed(error: impl Into<anyhow::Error>) -> Self {
        Step::Done(ExitCode::Failed, Some(error.into()))
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Step::Suspend => "suspend",
            Step::Await(_) => "await",
            Step::WaitForSlot => "wait-for-slot",
            Step::WaitForJob => "wait-for-job",
            Step::WaitForAWhile => "wait-for-a-while",
            Step::Call(_) => "call",
            Step::TailCall(_) => "tail-call",
            Step::Return => "return",
            Step::Done(..) => "done",
        }
    }
}

/// A resumable unit of goal logic.
///
/// Errors returned from `resume` fail the owning goal, with the error stored
/// as the goal's exception.
pub trait Task {
    fn resume(&mut self, cx: &mut Context<'_>) -> anyhow::Result<Step>;

    /// Called when the goal's process job overran its silence or wall-clock
    /// limit. The job has already been killed; the returned error fails the
    /// goal. Thread jobs carry no limits and never reach this.
    fn timed_out(&mut self, error: BuildError) -> anyhow::Error {
        error.into()
    }
}

impl<F> Task for F
where
    F: FnMut(&mut Context<'_>) -> anyhow::Result<Step>,
{
    fn resume(&mut self, cx: &mut Context<'_>) -> anyhow::Result<Step> {
        self(cx)
    }
}

/// One link of a goal's task chain.
pub struct Co {
    task: Box<dyn Task>,
    continuation: Option<Box<Co>>,
    alive: bool,
}

impl Co {
    pub fn new(task: impl Task + 'static) -> Self {
        Self {
            task: Box::new(task),
            continuation: None,
            alive: true,
        }
    }

    /// Same as [`Co::new`], but lets closures infer their argument type.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnMut(&mut Context<'_>) -> anyhow::Result<Step> + 'static,
    {
        Self::new(f)
    }

    pub(crate) fn resume(&mut self, cx: &mut Context<'_>) -> anyhow::Result<Step> {
        debug_assert!(self.alive, "resumed a task that already finished");
        self.task.resume(cx)
    }

    pub(crate) fn timed_out(&mut self, error: BuildError) -> anyhow::Error {
        self.task.timed_out(error)
    }

    pub(crate) fn take_continuation(&mut self) -> Option<Co> {
        self.continuation.take().map(|co| *co)
    }

    pub(crate) fn set_continuation(&mut self, continuation: Option<Co>) {
        debug_assert!(self.continuation.is_none(), "continuation overwritten");
        self.continuation = continuation.map(Box::new);
    }

    /// Marks the task finished and hands back what should run after it.
    pub(crate) fn retire(mut self) -> Option<Co> {
        self.alive = false;
        self.take_continuation()
    }

    /// Length of the chain starting at this link.
    pub(crate) fn depth(&self) -> usize {
        let mut depth = 1;
        let mut next = self.continuation.as_deref();

        while let Some(co) = next {
            depth += 1;
            next = co.continuation.as_deref();
        }

        depth
    }
}

impl std::fmt::Debug for Co {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Co")
            .field("depth", &self.depth())
            .field("alive", &self.alive)
            .finish()
    }
}
