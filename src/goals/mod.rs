//! Concrete goal kinds.
//!
//! Each goal is a [`Task`](crate::Task) state machine. The worker creates them
//! through [`Worker::make_derivation_goal`](crate::Worker::make_derivation_goal),
//! [`Worker::make_substitution_goal`](crate::Worker::make_substitution_goal)
//! and [`Worker::make_goal`](crate::Worker::make_goal).

mod derivation;
mod realise;
mod substitution;

pub use derivation::DerivationGoal;
pub use realise::RealiseGoal;
pub use substitution::SubstitutionGoal;
