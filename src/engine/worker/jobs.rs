//! Work that runs outside the scheduler thread.
//!
//! A job is either a child process or a named thread. Both report back over a
//! single channel, so the scheduler can sleep on one receiver with a deadline
//! and still notice output, completion and timeouts.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::debug;

use crate::engine::goal::{GoalId, JobCategory};

/// Result of a finished job, handed to the goal that started it.
#[derive(Debug)]
pub enum JobOutcome {
    Process {
        status: ExitStatus,
        /// Last lines of combined stdout and stderr.
        log: Vec<String>,
    },
    Thread(anyhow::Result<()>),
    /// The job's completion could not be observed.
    Lost(anyhow::Error),
}

/// Describes how a process ended, for error messages.
pub fn describe_status(status: &ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        _ => "unknown status".into(),
    }
}

/// Wall-clock limits enforced on a running job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobLimits {
    pub max_silent_time: Option<Duration>,
    pub timeout: Option<Duration>,
}

pub(crate) enum Event {
    Output { job: u64, line: String },
    Finished { job: u64, completion: Completion },
}

pub(crate) enum Completion {
    Process(io::Result<ExitStatus>),
    Thread(anyhow::Result<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expired {
    Silence(Duration),
    Timeout(Duration),
}

pub(crate) struct Running {
    pub goal: GoalId,
    pub category: JobCategory,
    pgid: Option<Pid>,
    started: Instant,
    last_output: Instant,
    limits: JobLimits,
    log: VecDeque<String>,
    log_limit: usize,
}

impl Running {
    fn deadline(&self) -> Option<Instant> {
        let silence = self.limits.max_silent_time.map(|d| self.last_output + d);
        let timeout = self.limits.timeout.map(|d| self.started + d);

        match (silence, timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn expired(&self, now: Instant) -> Option<Expired> {
        if let Some(limit) = self.limits.timeout {
            if now.duration_since(self.started) >= limit {
                return Some(Expired::Timeout(limit));
            }
        }

        if let Some(limit) = self.limits.max_silent_time {
            if now.duration_since(self.last_output) >= limit {
                return Some(Expired::Silence(limit));
            }
        }

        None
    }
}

pub(crate) struct Jobs {
    tx: Sender<Event>,
    rx: Receiver<Event>,
    running: BTreeMap<u64, Running>,
    next_id: u64,
    slots: HashMap<JobCategory, usize>,
}

impl Jobs {
    pub fn new() -> Self {
        let (tx, rx) = channel();

        Self {
            tx,
            rx,
            running: BTreeMap::new(),
            next_id: 0,
            slots: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }

    pub fn running_in(&self, category: JobCategory) -> usize {
        self.running.values().filter(|job| job.category == category).count()
    }

    pub fn try_acquire_slot(&mut self, category: JobCategory, limit: usize) -> bool {
        let used = self.slots.entry(category).or_default();
        if *used >= limit {
            return false;
        }

        *used += 1;
        true
    }

    pub fn release_slot(&mut self, category: JobCategory) {
        if let Some(used) = self.slots.get_mut(&category) {
            *used = used.saturating_sub(1);
        }
    }

    pub fn has_free_slot(&self, category: JobCategory, limit: usize) -> bool {
        self.slots.get(&category).copied().unwrap_or(0) < limit
    }

    fn register(
        &mut self,
        goal: GoalId,
        category: JobCategory,
        pgid: Option<Pid>,
        limits: JobLimits,
        log_limit: usize,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;

        let now = Instant::now();
        self.running.insert(
            id,
            Running {
                goal,
                category,
                pgid,
                started: now,
                last_output: now,
                limits,
                log: VecDeque::new(),
                log_limit,
            },
        );

        id
    }

    /// Starts `command` in its own process group with piped output. `stdin`
    /// is fed from a separate writer thread while the output is drained.
    pub fn spawn_process(
        &mut self,
        goal: GoalId,
        category: JobCategory,
        mut command: Command,
        stdin: Option<Vec<u8>>,
        limits: JobLimits,
        log_limit: usize,
    ) -> io::Result<u64> {
        command
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let mut child = command.spawn()?;
        let pgid = Pid::from_raw(child.id() as i32);
        let id = self.register(goal, category, Some(pgid), limits, log_limit);

        let threads = match attach_pipes(id, &mut child, stdin, &self.tx) {
            Ok(threads) => threads,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                self.running.remove(&id);
                return Err(e);
            }
        };

        let tx = self.tx.clone();
        let waiter = thread::Builder::new()
            .name(format!("kiln-wait-{id}"))
            .spawn(move || {
                for reader in threads {
                    let _ = reader.join();
                }
                let status = child.wait();
                let _ = tx.send(Event::Finished {
                    job: id,
                    completion: Completion::Process(status),
                });
            });

        if let Err(e) = waiter {
            self.kill(id);
            return Err(e);
        }

        debug!("started process job {id} for goal {goal}");
        Ok(id)
    }

    /// Runs `f` on a named thread. A panic is reported as an error.
    pub fn spawn_thread<F>(
        &mut self,
        goal: GoalId,
        category: JobCategory,
        name: &str,
        f: F,
    ) -> io::Result<u64>
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let id = self.register(goal, category, None, JobLimits::default(), 0);
        let tx = self.tx.clone();

        let spawned = thread::Builder::new()
            .name(format!("kiln-{name}"))
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(f))
                    .unwrap_or_else(|_| Err(anyhow!("job thread panicked")));
                let _ = tx.send(Event::Finished {
                    job: id,
                    completion: Completion::Thread(result),
                });
            });

        if let Err(e) = spawned {
            self.running.remove(&id);
            return Err(e);
        }

        debug!("started thread job {id} for goal {goal}");
        Ok(id)
    }

    /// Earliest moment a running job may exceed one of its limits.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.running.values().filter_map(Running::deadline).min()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Records a line of output. Returns the owning goal, or `None` for
    /// stale events of jobs that were already killed.
    pub fn record_output(&mut self, job: u64, line: String) -> Option<GoalId> {
        let running = self.running.get_mut(&job)?;
        running.last_output = Instant::now();

        if running.log_limit > 0 {
            if running.log.len() == running.log_limit {
                running.log.pop_front();
            }
            running.log.push_back(line);
        }

        Some(running.goal)
    }

    /// Turns a completion into the outcome for its goal.
    pub fn complete(&mut self, job: u64, completion: Completion) -> Option<(Running, JobOutcome)> {
        let mut running = self.running.remove(&job)?;

        let outcome = match completion {
            Completion::Process(Ok(status)) => JobOutcome::Process {
                status,
                log: running.log.drain(..).collect(),
            },
            Completion::Process(Err(e)) => {
                JobOutcome::Lost(anyhow!("Couldn't wait for job {job}.\n{e}"))
            }
            Completion::Thread(result) => JobOutcome::Thread(result),
        };

        Some((running, outcome))
    }

    pub fn expired(&self, now: Instant) -> Vec<(u64, GoalId, Expired)> {
        self.running
            .iter()
            .filter_map(|(&id, job)| job.expired(now).map(|why| (id, job.goal, why)))
            .collect()
    }

    /// Forgets a job, killing its process group if it has one. Threads cannot
    /// be stopped; whatever they report later is ignored.
    pub fn kill(&mut self, job: u64) -> Option<Running> {
        let running = self.running.remove(&job)?;

        if let Some(pgid) = running.pgid {
            debug!("killing process group {pgid} of job {job}");
            if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                debug!("cannot kill process group {pgid}: {e}");
            }
        }

        Some(running)
    }

    pub fn kill_all(&mut self) {
        let ids: Vec<u64> = self.running.keys().copied().collect();
        for id in ids {
            self.kill(id);
        }
    }
}

/// Starts the stdin writer and the output readers of a child. Returns the
/// reader threads, which end once the child's output is closed.
fn attach_pipes(
    id: u64,
    child: &mut Child,
    stdin: Option<Vec<u8>>,
    tx: &Sender<Event>,
) -> io::Result<Vec<thread::JoinHandle<()>>> {
    if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
        thread::Builder::new()
            .name(format!("kiln-stdin-{id}"))
            .spawn(move || {
                // The builder may exit without reading everything
                let _ = pipe.write_all(&data);
            })?;
    }

    let mut threads = Vec::new();
    if let Some(out) = child.stdout.take() {
        threads.push(forward_lines(id, "stdout", out, tx.clone())?);
    }
    if let Some(err) = child.stderr.take() {
        threads.push(forward_lines(id, "stderr", err, tx.clone())?);
    }

    Ok(threads)
}

fn forward_lines(
    job: u64,
    stream: &str,
    pipe: impl Read + Send + 'static,
    tx: Sender<Event>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("kiln-{stream}-{job}"))
        .spawn(move || {
            let mut reader = BufReader::new(pipe);
            let mut buf = Vec::new();

            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf)
                            .trim_end_matches(['\n', '\r'])
                            .to_string();
                        if tx.send(Event::Output { job, line }).is_err() {
                            break;
                        }
                    }
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_finished(jobs: &mut Jobs) -> (Running, JobOutcome) {
        let deadline = Instant::now() + Duration::from_secs(10);

        while Instant::now() < deadline {
            match jobs.recv_timeout(Duration::from_millis(100)) {
                Some(Event::Output { job, line }) => {
                    jobs.record_output(job, line);
                }
                Some(Event::Finished { job, completion }) => {
                    return jobs.complete(job, completion).unwrap();
                }
                None => {}
            }
        }

        panic!("job did not finish");
    }

    #[test]
    fn test_process_output_and_status() {
        let mut jobs = Jobs::new();
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "echo one; echo two >&2; echo three; exit 3"]);

        jobs.spawn_process(GoalId(0), JobCategory::Build, cmd, None, JobLimits::default(), 2)
            .unwrap();

        let (running, outcome) = wait_finished(&mut jobs);
        assert_eq!(running.goal, GoalId(0));

        match outcome {
            JobOutcome::Process { status, log } => {
                assert_eq!(status.code(), Some(3));
                // Only the last two lines are kept
                assert_eq!(log.len(), 2);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(jobs.is_empty());
    }

    #[test]
    fn test_stdin_is_fed() {
        let mut jobs = Jobs::new();
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "read line; echo \"got $line\""]);

        jobs.spawn_process(
            GoalId(1),
            JobCategory::Build,
            cmd,
            Some(b"hello\n".to_vec()),
            JobLimits::default(),
            10,
        )
        .unwrap();

        match wait_finished(&mut jobs).1 {
            JobOutcome::Process { status, log } => {
                assert!(status.success());
                assert_eq!(log, vec!["got hello".to_string()]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_thread_panic_becomes_error() {
        let mut jobs = Jobs::new();
        jobs.spawn_thread(GoalId(2), JobCategory::Substitution, "panicky", || panic!("boom"))
            .unwrap();

        match wait_finished(&mut jobs).1 {
            JobOutcome::Thread(result) => assert!(result.is_err()),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_slots() {
        let mut jobs = Jobs::new();

        assert!(jobs.try_acquire_slot(JobCategory::Build, 2));
        assert!(jobs.try_acquire_slot(JobCategory::Build, 2));
        assert!(!jobs.try_acquire_slot(JobCategory::Build, 2));
        assert!(jobs.try_acquire_slot(JobCategory::Substitution, 2));

        jobs.release_slot(JobCategory::Build);
        assert!(jobs.has_free_slot(JobCategory::Build, 2));
        assert!(!jobs.has_free_slot(JobCategory::Build, 0));
    }

    #[test]
    fn test_silence_expires() {
        let mut jobs = Jobs::new();
        let mut cmd = Command::new("/bin/sh");
        cmd.args(["-c", "sleep 10"]);

        let limits = JobLimits {
            max_silent_time: Some(Duration::from_millis(50)),
            timeout: None,
        };
        let id = jobs
            .spawn_process(GoalId(3), JobCategory::Build, cmd, None, limits, 0)
            .unwrap();

        assert!(jobs.next_deadline().is_some());
        thread::sleep(Duration::from_millis(80));

        let expired = jobs.expired(Instant::now());
        assert_eq!(expired, vec![(id, GoalId(3), Expired::Silence(Duration::from_millis(50)))]);

        assert!(jobs.kill(id).is_some());
        assert!(jobs.is_empty());
    }
}
