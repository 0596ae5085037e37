use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write;
use std::time::{Duration, Instant};

use crate::engine::goal::{ExitCode, GoalId, JobCategory};

#[derive(Debug, Clone)]
pub struct GoalExecution {
    pub name: String,
    pub exit_code: ExitCode,
    pub start: Instant,
    pub duration: Duration,
}

/// What happened during a run of the worker.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Finished goals with their lifetime.
    pub execution_times: BTreeMap<GoalId, GoalExecution>,
    /// Highest number of jobs that ran at once, per category.
    pub peak_jobs: HashMap<JobCategory, usize>,
    /// Waiter to waitee edges, as registered.
    pub edges: BTreeSet<(GoalId, GoalId)>,
}

impl Diagnostics {
    pub(crate) fn record_jobs(&mut self, category: JobCategory, running: usize) {
        let peak = self.peak_jobs.entry(category).or_default();
        *peak = (*peak).max(running);
    }

    pub(crate) fn record_edge(&mut self, waiter: GoalId, waitee: GoalId) {
        self.edges.insert((waiter, waitee));
    }

    pub(crate) fn record_goal(&mut self, id: GoalId, execution: GoalExecution) {
        self.execution_times.insert(id, execution);
    }

    pub fn peak(&self, category: JobCategory) -> usize {
        self.peak_jobs.get(&category).copied().unwrap_or(0)
    }

    /// Renders the goal graph as a Mermaid diagram, coloured by how long each
    /// goal took.
    ///
    /// * **Green**: fast
    /// * **Yellow**: moderate
    /// * **Red**: slow
    /// * **Grey**: failed
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let times = &self.execution_times;
        let (min_time, max_time) = times
            .values()
            .map(|t| t.duration.as_secs_f64())
            .fold(None, |acc: Option<(f64, f64)>, secs| match acc {
                None => Some((secs, secs)),
                Some((lo, hi)) => Some((lo.min(secs), hi.max(secs))),
            })
            .unwrap_or((0.0, 0.0));

        // All goals took the same time
        let span = if (max_time - min_time).abs() < f64::EPSILON {
            1.0
        } else {
            max_time - min_time
        };

        for (id, exec) in times {
            let name = exec.name.replace('"', "#quot;");

            let colour = if exec.exit_code == ExitCode::Success {
                let t = (exec.duration.as_secs_f64() - min_time) / span;
                gradient(t)
            } else {
                "#B0B0B0".to_string()
            };

            let _ = writeln!(f, "    {}[\"{}\\n{:.2?}\"]", id.0, name, exec.duration);
            let _ = writeln!(f, "    style {} fill:{}", id.0, colour);
        }

        for (waiter, waitee) in &self.edges {
            let _ = writeln!(f, "    {} --> {}", waitee.0, waiter.0);
        }

        f
    }
}

/// 0.0 is green, 0.5 yellow, 1.0 red.
fn gradient(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);

    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };

    format!("#{r:02X}{g:02X}00")
}
