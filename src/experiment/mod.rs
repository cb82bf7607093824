//! Test plan execution.
//!
//! - [`plan`]: the YAML plan document
//! - [`run_engine`]: [`PlanRunner`], which executes a plan against a
//!   [`RunContext`] of instruments
//! - [`state`]: runner lifecycle and [`RunOutcome`]

pub mod plan;
pub mod run_engine;
pub mod state;

pub use plan::{DmmStep, Plan, PsuStep, ScopeStep, Step};
pub use run_engine::{PlanRunner, RunContext};
pub use state::{RunOutcome, RunState};
