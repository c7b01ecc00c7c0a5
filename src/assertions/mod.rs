mod branch;
mod manager;
mod poster;

pub use {
  branch::{BranchSnapshot, CanonicalBranch},
  manager::{AssertionManager, ScanOutcome},
  poster::{ChallengePoster, RivalPoster},
};
