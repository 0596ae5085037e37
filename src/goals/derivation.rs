use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context as _, anyhow, bail};
use camino::{Utf8Path, Utf8PathBuf};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::core::Hash32;
use crate::engine::{Co, Context, JobLimits, JobOutcome, Step, Task, describe_status};
use crate::error::BuildError;
use crate::lock::PathLocks;
use crate::store::{
    Derivation, HASH_PART_LEN, PathInfo, Store, StorePath, compute_closure, remove_tree,
};

/// Makes every output of a derivation valid, by substitution if possible and
/// by running its builder otherwise.
pub struct DerivationGoal {
    drv_path: StorePath,
    drv: Option<Derivation>,
}

impl DerivationGoal {
    pub fn new(drv_path: StorePath) -> Self {
        Self { drv_path, drv: None }
    }

    fn all_outputs_valid(store: &dyn Store, drv: &Derivation) -> anyhow::Result<bool> {
        for path in drv.outputs.values() {
            if !store.is_valid_path(path)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn succeed(cx: &mut Context<'_>, drv: &Derivation) -> Step {
        cx.build_result_mut().built_outputs = drv.outputs.clone();
        Step::success()
    }

    /// Reads the derivation and tries substituting whatever outputs are
    /// missing.
    fn start(&mut self, cx: &mut Context<'_>) -> anyhow::Result<Step> {
        let store = cx.store();
        let drv = store.read_derivation(&self.drv_path)?;

        if Self::all_outputs_valid(store.as_ref(), &drv)? {
            debug!("all outputs of '{}' are valid", self.drv_path);
            return Ok(Self::succeed(cx, &drv));
        }

        let mut waitees = Vec::new();
        if cx.settings().substitute && !cx.substituters().is_empty() {
            for path in drv.outputs.values() {
                if !store.is_valid_path(path)? {
                    waitees.push(cx.make_substitution_goal(path));
                }
            }
        }

        self.drv = Some(drv);
        Ok(Step::Await(waitees))
    }
}

impl Task for DerivationGoal {
    fn resume(&mut self, cx: &mut Context<'_>) -> anyhow::Result<Step> {
        let Some(drv) = self.drv.take() else {
            return self.start(cx);
        };

        if Self::all_outputs_valid(cx.store().as_ref(), &drv)? {
            return Ok(Self::succeed(cx, &drv));
        }

        if cx.nr_failed() > 0 {
            debug!(
                "{} outputs of '{}' could not be substituted, building",
                cx.nr_failed(),
                self.drv_path
            );
        }
        cx.reset_tallies();

        let build = BuildTask::new(self.drv_path.clone(), drv);
        Ok(Step::TailCall(Co::new(build)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildState {
    Inputs,
    InputsRealised,
    HaveSlot,
    Building,
}

/// Realises the inputs of a derivation and runs its builder.
struct BuildTask {
    drv_path: StorePath,
    drv: Derivation,
    state: BuildState,
    locks: Option<PathLocks>,
    build_top: Option<Utf8PathBuf>,
}

impl BuildTask {
    fn new(drv_path: StorePath, drv: Derivation) -> Self {
        Self {
            drv_path,
            drv,
            state: BuildState::Inputs,
            locks: None,
            build_top: None,
        }
    }

    fn realise_inputs(&mut self, cx: &mut Context<'_>) -> anyhow::Result<Step> {
        let store = cx.store();
        let mut waitees = Vec::new();

        for drv in &self.drv.input_drvs {
            waitees.push(cx.make_derivation_goal(drv));
        }
        for src in &self.drv.input_srcs {
            if !store.is_valid_path(src)? {
                waitees.push(cx.make_substitution_goal(src));
            }
        }

        self.state = BuildState::InputsRealised;
        Ok(Step::Await(waitees))
    }

    fn inputs_realised(&mut self, cx: &mut Context<'_>) -> anyhow::Result<Step> {
        if cx.nr_failed() > 0 {
            return Ok(Step::failed(BuildError::DependenciesFailed {
                drv: self.drv_path.clone(),
                count: cx.nr_failed(),
            }));
        }

        self.state = BuildState::HaveSlot;
        Ok(Step::WaitForSlot)
    }

    /// With a slot in hand: lock the outputs, then start the builder.
    fn try_build(&mut self, cx: &mut Context<'_>) -> anyhow::Result<Step> {
        let store = cx.store();

        let paths: BTreeSet<Utf8PathBuf> = self
            .drv
            .outputs
            .values()
            .map(|path| store.to_real_path(path))
            .collect();

        let mut locks = PathLocks::with_interrupt(cx.interrupt().clone());
        if !locks.lock_paths(&paths, "", false)? {
            debug!("outputs of '{}' are locked, retrying later", self.drv_path);
            return Ok(Step::WaitForAWhile);
        }

        // Someone else may have built them while we waited for the locks
        if DerivationGoal::all_outputs_valid(store.as_ref(), &self.drv)? {
            debug!("outputs of '{}' became valid", self.drv_path);
            return Ok(DerivationGoal::succeed(cx, &self.drv));
        }

        for path in &paths {
            remove_tree(path).with_context(|| format!("Couldn't remove stale output '{path}'"))?;
        }

        let build_top = store
            .store_dir()
            .join(format!(".kiln-build-{}", self.drv_path.hash_part()));
        remove_tree(&build_top)?;
        fs::create_dir_all(&build_top).with_context(|| format!("Couldn't create '{build_top}'"))?;

        let command = self.command(store.as_ref(), &build_top);
        let stdin = self.drv.stdin.clone().map(String::into_bytes);
        let limits = self.limits(cx);

        self.locks = Some(locks);
        self.build_top = Some(build_top);

        info!("building '{}'", self.drv_path);
        cx.spawn_process(command, stdin, limits)?;

        self.state = BuildState::Building;
        Ok(Step::WaitForJob)
    }

    fn command(&self, store: &dyn Store, build_top: &Utf8Path) -> Command {
        let mut command = Command::new(&self.drv.builder);
        command
            .args(&self.drv.args)
            .current_dir(build_top)
            .env_clear()
            .env("PATH", "/usr/bin:/bin")
            .env("HOME", "/homeless-shelter")
            .env("TMPDIR", build_top)
            .envs(&self.drv.env)
            .env("KILN_STORE", store.store_dir())
            .env("KILN_BUILD_TOP", build_top);

        for (name, path) in &self.drv.outputs {
            command.env(name, store.to_real_path(path));
        }

        command
    }

    fn limits(&self, cx: &Context<'_>) -> JobLimits {
        let seconds = |secs: u64| (secs > 0).then(|| Duration::from_secs(secs));

        JobLimits {
            max_silent_time: match self.drv.max_silent_time {
                Some(secs) => seconds(secs),
                None => cx.settings().max_silent_time(),
            },
            timeout: match self.drv.timeout {
                Some(secs) => seconds(secs),
                None => cx.settings().build_timeout(),
            },
        }
    }

    fn builder_finished(&mut self, cx: &mut Context<'_>) -> anyhow::Result<Step> {
        match cx.take_job_outcome() {
            Some(JobOutcome::Process { status, log }) => {
                if !status.success() {
                    return Ok(Step::failed(BuildError::BuilderFailed {
                        drv: self.drv_path.clone(),
                        status: describe_status(&status),
                        log: format_log(&log),
                    }));
                }
            }
            Some(JobOutcome::Lost(e)) => return Err(e),
            Some(JobOutcome::Thread(_)) | None => bail!("builder of '{}' vanished", self.drv_path),
        }

        let store = cx.store();
        let infos = self.register_outputs(store.as_ref())?;
        for info in infos {
            store.register_valid_path(info)?;
        }

        if let Some(mut locks) = self.locks.take() {
            locks.set_deletion(true);
            locks.unlock();
        }

        info!("built '{}'", self.drv_path);
        Ok(DerivationGoal::succeed(cx, &self.drv))
    }

    /// Checks, hashes and scans every output.
    fn register_outputs(&self, store: &dyn Store) -> anyhow::Result<Vec<PathInfo>> {
        let outputs: Vec<(StorePath, Utf8PathBuf)> = self
            .drv
            .outputs
            .values()
            .map(|path| (path.clone(), store.to_real_path(path)))
            .collect();

        for (path, real) in &outputs {
            if fs::symlink_metadata(real).is_err() {
                return Err(BuildError::MissingOutput {
                    drv: self.drv_path.clone(),
                    output: path.clone(),
                }
                .into());
            }
        }

        let mut inputs: BTreeSet<StorePath> = self.drv.input_srcs.clone();
        for drv in &self.drv.input_drvs {
            inputs.extend(store.read_derivation(drv)?.outputs.into_values());
        }
        let mut candidates = compute_closure(store, inputs)?;
        candidates.extend(outputs.iter().map(|(path, _)| path.clone()));

        let deriver = &self.drv_path;
        outputs
            .par_iter()
            .map(|(path, real)| -> io::Result<PathInfo> {
                let nar_hash = Hash32::hash_path(real)?;
                let nar_size = tree_size(real)?;
                let references = scan_references(real, &candidates)?;

                Ok(PathInfo {
                    path: path.clone(),
                    nar_hash,
                    nar_size,
                    references,
                    deriver: Some(deriver.clone()),
                })
            })
            .collect::<io::Result<Vec<_>>>()
            .map_err(|e| anyhow!("Couldn't read outputs of '{}'.\n{e}", self.drv_path))
    }
}

impl Task for BuildTask {
    fn resume(&mut self, cx: &mut Context<'_>) -> anyhow::Result<Step> {
        match self.state {
            BuildState::Inputs => self.realise_inputs(cx),
            BuildState::InputsRealised => self.inputs_realised(cx),
            BuildState::HaveSlot => self.try_build(cx),
            BuildState::Building => self.builder_finished(cx),
        }
    }
}

impl Drop for BuildTask {
    fn drop(&mut self) {
        if let Some(build_top) = self.build_top.take() {
            if let Err(e) = remove_tree(&build_top) {
                debug!("Couldn't remove '{build_top}': {e}");
            }
        }
    }
}

fn format_log(log: &[String]) -> String {
    if log.is_empty() {
        return String::new();
    }

    let lines: Vec<String> = log.iter().map(|line| format!("> {line}")).collect();
    format!(";\nlast {} log lines:\n{}", log.len(), lines.join("\n"))
}

/// Total size of the regular files and symlink targets under `path`.
fn tree_size(path: &Utf8Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(path)?;

    if meta.is_dir() {
        let mut size = 0;
        for entry in path.read_dir_utf8()? {
            size += tree_size(entry?.path())?;
        }
        Ok(size)
    } else if meta.file_type().is_symlink() {
        Ok(fs::read_link(path)?.as_os_str().len() as u64)
    } else {
        Ok(meta.len())
    }
}

/// Which of `candidates` are mentioned, by hash part, anywhere under `path`.
fn scan_references(
    path: &Utf8Path,
    candidates: &BTreeSet<StorePath>,
) -> io::Result<BTreeSet<StorePath>> {
    let by_hash: HashMap<&[u8], &StorePath> = candidates
        .iter()
        .map(|path| (path.hash_part().as_bytes(), path))
        .collect();

    let mut found = BTreeSet::new();
    scan_tree(path, &by_hash, &mut found)?;
    Ok(found)
}

fn scan_tree(
    path: &Utf8Path,
    by_hash: &HashMap<&[u8], &StorePath>,
    found: &mut BTreeSet<StorePath>,
) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;

    let data = if meta.is_dir() {
        for entry in path.read_dir_utf8()? {
            scan_tree(entry?.path(), by_hash, found)?;
        }
        return Ok(());
    } else if meta.file_type().is_symlink() {
        fs::read_link(path)?.into_os_string().into_encoded_bytes()
    } else {
        fs::read(path)?
    };

    for window in data.windows(HASH_PART_LEN) {
        if let Some(&candidate) = by_hash.get(window) {
            found.insert(candidate.clone());
        }
    }

    Ok(())
}
