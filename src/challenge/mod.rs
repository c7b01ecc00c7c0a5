mod coordinator;
mod edge;
mod tracker;

pub use {
  coordinator::ChallengeCoordinator,
  edge::{bisection_point, BisectionError, Edge, EdgeStatus},
  tracker::{decide, Action, ChallengeCtx, EdgeSnapshot, EdgeTracker, TrackCmd},
};
