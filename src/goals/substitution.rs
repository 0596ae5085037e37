use std::collections::VecDeque;
use std::fs;
use std::sync::Arc;

use anyhow::anyhow;
use tracing::{debug, info, warn};

use crate::engine::{Context, ExitCode, JobOutcome, Step, Task};
use crate::error::{BuildError, Interrupted, LockError};
use crate::store::{LocalStore, PathInfo, StorePath, Substituter, remove_tree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    TryNext,
    ReferencesRealised,
    HaveSlot,
    Copying,
}

/// Makes a single store path valid by copying it from the first substituter
/// that has it.
pub struct SubstitutionGoal {
    path: StorePath,
    state: State,
    substituters: VecDeque<Arc<dyn Substituter>>,
    current: Option<(Arc<dyn Substituter>, PathInfo)>,
    /// Whether some substituter had the path but failed to deliver it.
    had_candidate: bool,
}

impl SubstitutionGoal {
    pub fn new(path: StorePath) -> Self {
        Self {
            path,
            state: State::Init,
            substituters: VecDeque::new(),
            current: None,
            had_candidate: false,
        }
    }

    fn init(&mut self, cx: &mut Context<'_>) -> anyhow::Result<Option<Step>> {
        if cx.store().is_valid_path(&self.path)? {
            return Ok(Some(Step::success()));
        }

        if cx.settings().substitute {
            self.substituters = cx.substituters().iter().cloned().collect();
        }

        self.state = State::TryNext;
        Ok(None)
    }

    fn try_next(&mut self, cx: &mut Context<'_>) -> anyhow::Result<Option<Step>> {
        let Some(sub) = self.substituters.pop_front() else {
            if self.had_candidate {
                return Ok(Some(Step::failed(BuildError::SubstitutionFailed(self.path.clone()))));
            }

            let message = format!(
                "path '{}' is required, but there is no substituter that has it",
                self.path
            );
            debug!("{message}");
            cx.build_result_mut().error = Some(message);
            return Ok(Some(Step::Done(ExitCode::NoSubstituters, None)));
        };

        let info = match sub.query_path_info(&self.path) {
            Ok(Some(info)) => info,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("Couldn't query '{}' on {}.\n{e:#}", self.path, sub.uri());
                return Ok(None);
            }
        };

        self.had_candidate = true;

        let store = cx.store();
        let mut waitees = Vec::new();
        for reference in &info.references {
            if reference != &self.path && !store.is_valid_path(reference)? {
                waitees.push(cx.make_substitution_goal(reference));
            }
        }

        self.current = Some((sub, info));
        self.state = State::ReferencesRealised;
        Ok(Some(Step::Await(waitees)))
    }

    fn references_realised(&mut self, cx: &mut Context<'_>) -> Step {
        if cx.nr_failed() > 0 {
            return Step::failed(BuildError::IncompleteClosure(self.path.clone()));
        }

        self.state = State::HaveSlot;
        Step::WaitForSlot
    }

    fn start_copy(&mut self, cx: &mut Context<'_>) -> anyhow::Result<Step> {
        let Some((sub, info)) = self.current.clone() else {
            return Err(anyhow!("no substituter chosen for '{}'", self.path));
        };

        let store = cx.store();
        let locks = cx.substitution_locks();
        let timeout = cx.settings().lock_timeout();
        let path = self.path.clone();

        info!("copying '{}' from {}", self.path, sub.uri());

        cx.spawn_thread("substitute", move || {
            let dest = store.to_real_path(&path);

            locks.with_lock(
                path.hash_part(),
                timeout,
                || -> anyhow::Result<bool> { Ok(store.is_valid_path(&path)?) },
                || {
                    let temp = LocalStore::temp_path(&dest);
                    if let Err(e) = sub.copy_path(&path, &temp) {
                        let _ = remove_tree(&temp);
                        return Err(e);
                    }

                    remove_tree(&dest)?;
                    fs::rename(&temp, &dest)
                        .map_err(|e| anyhow!("Couldn't move '{temp}' to '{dest}'.\n{e}"))?;
                    store.register_valid_path(info)?;
                    Ok(())
                },
            )?;

            Ok(())
        })?;

        self.state = State::Copying;
        Ok(Step::WaitForJob)
    }

    fn copied(&mut self, cx: &mut Context<'_>) -> anyhow::Result<Option<Step>> {
        let error = match cx.take_job_outcome() {
            Some(JobOutcome::Thread(Ok(()))) => {
                debug!("substituted '{}'", self.path);
                return Ok(Some(Step::success()));
            }
            Some(JobOutcome::Thread(Err(e)) | JobOutcome::Lost(e)) => e,
            Some(JobOutcome::Process { .. }) | None => anyhow!("copy job vanished"),
        };

        let interrupted = error.chain().any(|cause| {
            cause.is::<Interrupted>()
                || matches!(cause.downcast_ref::<LockError>(), Some(LockError::Interrupted(_)))
        });
        if interrupted {
            return Err(error);
        }

        let uri = self.current.take().map(|(sub, _)| sub.uri()).unwrap_or_default();
        warn!("substitution of '{}' from {uri} failed: {error:#}", self.path);

        self.state = State::TryNext;
        Ok(None)
    }
}

impl Task for SubstitutionGoal {
    fn resume(&mut self, cx: &mut Context<'_>) -> anyhow::Result<Step> {
        loop {
            let step = match self.state {
                State::Init => self.init(cx)?,
                State::TryNext => self.try_next(cx)?,
                State::ReferencesRealised => Some(self.references_realised(cx)),
                State::HaveSlot => Some(self.start_copy(cx)?),
                State::Copying => self.copied(cx)?,
            };

            if let Some(step) = step {
                return Ok(step);
            }
        }
    }
}
