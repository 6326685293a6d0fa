//! Branch integration: merging finished task branches and producing review diffs.

pub mod git;

pub use git::{GitIntegration, GitTracker, MergeOutcome};
