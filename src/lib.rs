#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod error;
mod goals;
pub mod graph;
mod interrupt;
pub mod lock;
mod settings;
pub mod store;

pub mod engine;

pub use crate::core::Hash32;
pub use crate::engine::{
    BuildResult, Co, Context, DerivedPath, Diagnostics, ExitCode, GoalId, JobCategory, JobLimits,
    JobOutcome, RunReport, Step, Task, Worker,
};
pub use crate::error::*;
pub use crate::goals::{DerivationGoal, RealiseGoal, SubstitutionGoal};
pub use crate::graph::{DependencyGraph, EdgeProperty, FileListEdge};
pub use crate::interrupt::Interrupt;
pub use crate::lock::{LockType, PathLocks, SubstitutionLocks, with_substitution_lock};
pub use crate::settings::Settings;
pub use crate::store::{Derivation, LocalCache, LocalStore, PathInfo, Store, StorePath, Substituter};

/// Installs a global `tracing` subscriber: `RUST_LOG` style filtering
/// (`info` by default), formatted output and progress bars for the worker's
/// spans.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, fmt};

    let indicatif_layer = IndicatifLayer::new();

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = fmt::layer()
        .with_writer(indicatif_layer.get_stderr_writer())
        .without_time();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(indicatif_layer)
        .try_init()?;

    Ok(())
}
