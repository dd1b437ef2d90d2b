//! The outer loop: run the pipeline, evaluate gates, and on failure feed
//! corrections back into the requirements before the next run.
//!
//! - [`controller`] drives iterations and decides when to stop
//! - [`stagnation`] tracks whether coverage is still improving
//! - [`feedback`] gathers what went wrong in one iteration
//! - [`patch`] turns feedback into decisions and requirement edits
//! - [`snapshot`] records each iteration under `.crucible/iterations/`

pub mod controller;
pub mod feedback;
pub mod patch;
pub mod snapshot;
pub mod stagnation;

pub use controller::{
    IterationController, IterationOutcome, LoopSummary, PipelineDriver, SpecPatcher, StopReason,
};
pub use feedback::Feedback;
pub use patch::{PatchSummary, RequirementsPatcher};
pub use stagnation::StagnationGuard;
