use {
  crate::primitives::{
    keccak, Address, ClaimId, Digest, EdgeId, Level, MutualId, OriginId,
  },
  serde::{Deserialize, Serialize},
  std::fmt,
  thiserror::Error,
};

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize,
)]
pub enum EdgeStatus {
  Pending,
  Confirmed,
}

/// One vertex in the challenge DAG: a commitment to a range of
/// machine history at some level.
///
/// Edges with the same [`Edge::mutual_id`] but different end roots
/// are rivals, they agree on where the history starts and disagree
/// on where it ends. The whole game is about shrinking that
/// disagreement, one bisection at a time, until it fits in a single
/// machine instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
  pub level: Level,

  /// Links this edge to the assertion pair (at the block level) or
  /// the upper-level claim its challenge descends from.
  pub origin: OriginId,

  pub start_height: u64,
  pub start_root: Digest,
  pub end_height: u64,
  pub end_root: Digest,

  /// The upper-level edge this edge claims to decide. Set only on
  /// level-zero edges.
  pub claim: Option<ClaimId>,

  /// Bisection children. Either both absent or both present.
  pub lower_child: Option<EdgeId>,
  pub upper_child: Option<EdgeId>,

  /// The account that staked on this edge. Set only on level-zero
  /// edges, which carry the deposit.
  pub staker: Option<Address>,

  pub created_at_block: u64,
  pub status: EdgeStatus,
}

impl Edge {
  /// Id of this edge, a keccak over everything that makes it
  /// unique. Two stakers submitting identical moves produce the
  /// same id, which is what makes rival races benign.
  pub fn id(&self) -> EdgeId {
    keccak(&[
      &self.level.tag(),
      self.origin.as_bytes(),
      &self.start_height.to_be_bytes(),
      self.start_root.as_bytes(),
      &self.end_height.to_be_bytes(),
      self.end_root.as_bytes(),
    ])
  }

  /// Id of this edge's rivalry class: everything but the end root.
  pub fn mutual_id(&self) -> MutualId {
    keccak(&[
      &self.level.tag(),
      self.origin.as_bytes(),
      &self.start_height.to_be_bytes(),
      self.start_root.as_bytes(),
      &self.end_height.to_be_bytes(),
    ])
  }

  pub fn length(&self) -> u64 {
    self.end_height - self.start_height
  }

  /// Length-one edges cannot be bisected; they are settled by
  /// one-step proof at the bottom level and by subchallenge
  /// everywhere else.
  pub fn is_length_one(&self) -> bool {
    self.length() == 1
  }

  pub fn children(&self) -> Option<(EdgeId, EdgeId)> {
    match (self.lower_child, self.upper_child) {
      (Some(lower), Some(upper)) => Some((lower, upper)),
      _ => None,
    }
  }

  pub fn is_confirmed(&self) -> bool {
    matches!(self.status, EdgeStatus::Confirmed)
  }
}

impl fmt::Display for Edge {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "[{} {:?} {}..{}]",
      self.level,
      self.id(),
      self.start_height,
      self.end_height
    )
  }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BisectionError {
  #[error("edge of length {0} cannot be bisected")]
  NotBisectable(u64),

  #[error("inverted range {start}..{end}")]
  InvertedRange { start: u64, end: u64 },
}

/// The height an edge spanning `start..end` bisects at.
///
/// The offset from `start` is the largest power of two strictly
/// below the edge length. This "most significant bit" rule keeps
/// subtree boundaries aligned across rivals, so a lower child is
/// frequently shared with the rival's lower child and the chain can
/// deduplicate it.
pub fn bisection_point(start: u64, end: u64) -> Result<u64, BisectionError> {
  if end <= start {
    return Err(BisectionError::InvertedRange { start, end });
  }
  let length = end - start;
  if length < 2 {
    return Err(BisectionError::NotBisectable(length));
  }
  // largest power of two <= length - 1, hence strictly < length
  let offset = 1u64 << (63 - (length - 1).leading_zeros());
  Ok(start + offset)
}

#[cfg(test)]
mod tests {
  use {
    super::{bisection_point, BisectionError, Edge, EdgeStatus},
    crate::primitives::{keccak, Level},
  };

  #[test]
  fn bisection_points() {
    assert_eq!(bisection_point(0, 64), Ok(32));
    assert_eq!(bisection_point(0, 33), Ok(32));
    assert_eq!(bisection_point(0, 2), Ok(1));
    assert_eq!(
      bisection_point(0, 1),
      Err(BisectionError::NotBisectable(1))
    );
    assert_eq!(
      bisection_point(4, 4),
      Err(BisectionError::InvertedRange { start: 4, end: 4 })
    );

    // offsets stay aligned when the range does not start at zero
    assert_eq!(bisection_point(32, 64), Ok(48));
    assert_eq!(bisection_point(32, 35), Ok(34));
  }

  #[test]
  fn children_cover_parent_exactly() {
    for length in 2..=64u64 {
      let mid = bisection_point(0, length).unwrap();
      assert!(mid > 0 && mid < length);
      // lower child spans 0..mid, upper child mid..length
      assert_eq!(mid + (length - mid), length);
      // the lower child is a power of two, so it bottoms out in
      // log2 more bisections
      assert!(mid.is_power_of_two());
    }
  }

  fn edge(end_root: &[u8]) -> Edge {
    Edge {
      level: Level::Block,
      origin: keccak(&[b"origin"]),
      start_height: 0,
      start_root: keccak(&[b"start"]),
      end_height: 32,
      end_root: keccak(&[end_root]),
      claim: None,
      lower_child: None,
      upper_child: None,
      staker: None,
      created_at_block: 1,
      status: EdgeStatus::Pending,
    }
  }

  #[test]
  fn rivals_share_mutual_id_not_id() {
    let ours = edge(b"honest");
    let theirs = edge(b"malicious");
    assert_eq!(ours.mutual_id(), theirs.mutual_id());
    assert_ne!(ours.id(), theirs.id());

    let mut other_class = edge(b"honest");
    other_class.start_height = 1;
    assert_ne!(ours.mutual_id(), other_class.mutual_id());
  }
}
