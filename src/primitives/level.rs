use {
  serde::{Deserialize, Serialize},
  std::fmt,
};

/// Challenge granularity level.
///
/// A dispute starts at the block level, where each history step is
/// one layer-2 block. Every time a length-one edge is reached and
/// rivaled, the game descends one level, zooming in on the disputed
/// step: first through a configurable number of big-step levels, and
/// finally to the small-step level where a single history step is a
/// single machine instruction, provable on chain.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum Level {
  Block,
  BigStep(u8),
  SmallStep,
}

impl Level {
  /// Numeric encoding used on chain: 0 for block, 1..=N for the
  /// big-step levels, N+1 for small-step.
  pub fn index(&self, num_big_step_levels: u8) -> u8 {
    match self {
      Level::Block => 0,
      Level::BigStep(k) => *k,
      Level::SmallStep => num_big_step_levels + 1,
    }
  }

  /// Inverse of [`Self::index`]. Returns None for an index beyond
  /// the small-step level.
  pub fn from_index(index: u8, num_big_step_levels: u8) -> Option<Level> {
    match index {
      0 => Some(Level::Block),
      k if k <= num_big_step_levels => Some(Level::BigStep(k)),
      k if k == num_big_step_levels + 1 => Some(Level::SmallStep),
      _ => None,
    }
  }

  /// The level one step finer than this one, or None at the bottom.
  pub fn next(&self, num_big_step_levels: u8) -> Option<Level> {
    match self {
      Level::Block if num_big_step_levels == 0 => Some(Level::SmallStep),
      Level::Block => Some(Level::BigStep(1)),
      Level::BigStep(k) if *k < num_big_step_levels => {
        Some(Level::BigStep(k + 1))
      }
      Level::BigStep(_) => Some(Level::SmallStep),
      Level::SmallStep => None,
    }
  }

  /// Only small-step edges are settled by one-step proof, all other
  /// levels descend into a subchallenge instead.
  pub fn is_bottom(&self) -> bool {
    matches!(self, Level::SmallStep)
  }

  /// Two-byte tag mixed into edge id derivations. The tag encodes
  /// the level kind and the big-step depth without depending on the
  /// configured number of big-step levels.
  pub fn tag(&self) -> [u8; 2] {
    match self {
      Level::Block => [0, 0],
      Level::BigStep(k) => [1, *k],
      Level::SmallStep => [2, 0],
    }
  }
}

impl fmt::Display for Level {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Level::Block => write!(f, "block"),
      Level::BigStep(k) => write!(f, "big-step-{k}"),
      Level::SmallStep => write!(f, "small-step"),
    }
  }
}
