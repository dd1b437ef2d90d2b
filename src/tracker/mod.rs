//! Git history of the generated project.

pub mod git;

pub use git::{CommitSummary, GitTracker};
