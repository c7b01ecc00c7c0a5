//! Merkle history commitments.
//!
//! A commitment to machine hashes `h_0..h_N` is a merkle expansion:
//! the ordered list of complete-subtree roots whose sizes are the
//! set bits of `N+1`, highest bit first. Appending one leaf is
//! O(log N), the same carry propagation as incrementing a binary
//! counter. The root folds the subtree roots together from the
//! lowest level up.
//!
//! A prefix proof shows that the commitment to `h_0..h_k` is a
//! prefix of the commitment to `h_0..h_N`: it carries the prefix
//! expansion plus the roots of the aligned complete subtrees
//! covering `h_{k+1}..h_N`, and the verifier replays the appends.
//! An inclusion proof is the usual sibling path of one leaf inside
//! its subtree, plus the rest of the expansion to rebuild the root.

use {
  crate::primitives::{keccak2, Digest},
  serde::{Deserialize, Serialize},
  thiserror::Error,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommitmentError {
  #[error("cannot commit to an empty range")]
  EmptyRange,

  #[error("subtree at level {level} is not aligned with the expansion")]
  MisalignedSubtree { level: u32 },

  #[error("leaf index {index} out of range for {count} leaves")]
  IndexOutOfRange { index: u64, count: u64 },

  #[error("proof shape does not match the claimed sizes")]
  MalformedProof,

  #[error("recomputed root does not match the commitment")]
  RootMismatch,
}

/// A merkle commitment to the history `h_0..h_height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryCommitment {
  /// Height of the last committed machine hash, so the commitment
  /// covers `height + 1` leaves.
  pub height: u64,
  pub root: Digest,
}

/// The ordered complete-subtree roots of an append-only merkle
/// tree. `levels[i]`, when set, is the root of a complete subtree
/// over `2^i` leaves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleExpansion {
  levels: Vec<Option<Digest>>,
}

impl MerkleExpansion {
  pub fn empty() -> Self {
    Self::default()
  }

  pub fn from_leaves(leaves: &[Digest]) -> Self {
    let mut expansion = Self::empty();
    for leaf in leaves {
      expansion.append_leaf(*leaf);
    }
    expansion
  }

  pub fn leaf_count(&self) -> u64 {
    self
      .levels
      .iter()
      .enumerate()
      .filter(|(_, slot)| slot.is_some())
      .map(|(level, _)| 1u64 << level)
      .sum()
  }

  /// Which level's subtree the leaf at `index` lives in, given the
  /// high-bit-first layout of the expansion. Also returns the index
  /// of the subtree's first leaf.
  fn owning_level(&self, index: u64) -> Option<(u32, u64)> {
    let mut start = 0u64;
    for level in (0..self.levels.len()).rev() {
      if self.levels[level].is_none() {
        continue;
      }
      let size = 1u64 << level;
      if index < start + size {
        return Some((level as u32, start));
      }
      start += size;
    }
    None
  }

  pub fn append_leaf(&mut self, leaf: Digest) {
    self.carry(0, leaf);
  }

  /// Appends a complete subtree of `2^level` leaves. The expansion
  /// must have no occupied slot below `level`, otherwise the result
  /// would not correspond to any leaf sequence.
  pub fn append_complete_subtree(
    &mut self,
    level: u32,
    root: Digest,
  ) -> Result<(), CommitmentError> {
    let level = level as usize;
    if self.levels.iter().take(level).any(|slot| slot.is_some()) {
      return Err(CommitmentError::MisalignedSubtree {
        level: level as u32,
      });
    }
    self.carry(level, root);
    Ok(())
  }

  fn carry(&mut self, mut level: usize, mut accum: Digest) {
    loop {
      if level == self.levels.len() {
        self.levels.push(Some(accum));
        return;
      }
      match self.levels[level].take() {
        None => {
          self.levels[level] = Some(accum);
          return;
        }
        Some(left) => {
          accum = keccak2(left, accum);
          level += 1;
        }
      }
    }
  }

  /// Folds the subtree roots into a single root, lowest level
  /// first. Empty slots above the lowest occupied one stand for
  /// right-padding of the virtual tree and fold in as zero digests.
  pub fn root(&self) -> Digest {
    let mut accum: Option<Digest> = None;
    for slot in &self.levels {
      accum = match (slot, accum) {
        (Some(peak), None) => Some(*peak),
        (Some(peak), Some(acc)) => Some(keccak2(*peak, acc)),
        (None, Some(acc)) => Some(keccak2(Digest::ZERO, acc)),
        (None, None) => None,
      };
    }
    accum.unwrap_or(Digest::ZERO)
  }

  fn blank(&self, level: u32) -> MerkleExpansion {
    let mut copy = self.clone();
    copy.levels[level as usize] = None;
    copy
  }

  fn with(&self, level: u32, root: Digest) -> MerkleExpansion {
    let mut copy = self.clone();
    copy.levels[level as usize] = Some(root);
    copy
  }
}

/// Root of a complete merkle tree over exactly `leaves.len()`
/// leaves, which must be a power of two.
fn complete_subtree_root(leaves: &[Digest]) -> Digest {
  debug_assert!(leaves.len().is_power_of_two());
  let mut layer = leaves.to_vec();
  while layer.len() > 1 {
    layer = layer
      .chunks(2)
      .map(|pair| keccak2(pair[0], pair[1]))
      .collect();
  }
  layer[0]
}

/// The level of the largest complete subtree that can be appended
/// next: bounded by the alignment of the current leaf count and by
/// how many leaves remain.
fn next_append_level(count: u64, remaining: u64) -> u32 {
  let align = if count == 0 { 63 } else { count.trailing_zeros() };
  let size = 63 - remaining.leading_zeros();
  align.min(size)
}

pub fn commit(leaves: &[Digest]) -> Result<HistoryCommitment, CommitmentError> {
  if leaves.is_empty() {
    return Err(CommitmentError::EmptyRange);
  }
  let expansion = MerkleExpansion::from_leaves(leaves);
  Ok(HistoryCommitment {
    height: leaves.len() as u64 - 1,
    root: expansion.root(),
  })
}

/// Proof that one history commitment extends another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixProof {
  /// Expansion of the prefix. Its root must match the prefix
  /// commitment.
  pub prefix_expansion: MerkleExpansion,

  /// Roots of the aligned complete subtrees covering the suffix
  /// leaves, in append order.
  pub suffix: Vec<Digest>,
}

pub fn prefix_proof(
  leaves: &[Digest],
  prefix_count: u64,
) -> Result<PrefixProof, CommitmentError> {
  if prefix_count == 0 || prefix_count as usize > leaves.len() {
    return Err(CommitmentError::MalformedProof);
  }
  let prefix_expansion =
    MerkleExpansion::from_leaves(&leaves[..prefix_count as usize]);

  let mut suffix = Vec::new();
  let mut count = prefix_count;
  let mut remaining = leaves.len() as u64 - prefix_count;
  while remaining > 0 {
    let level = next_append_level(count, remaining);
    let size = 1u64 << level;
    let chunk = &leaves[count as usize..(count + size) as usize];
    suffix.push(complete_subtree_root(chunk));
    count += size;
    remaining -= size;
  }

  Ok(PrefixProof {
    prefix_expansion,
    suffix,
  })
}

/// Checks that `full` commits to a history whose first
/// `prefix.height + 1` hashes are committed to by `prefix`.
pub fn verify_prefix_proof(
  prefix: &HistoryCommitment,
  full: &HistoryCommitment,
  proof: &PrefixProof,
) -> Result<(), CommitmentError> {
  if full.height <= prefix.height {
    return Err(CommitmentError::MalformedProof);
  }
  if proof.prefix_expansion.leaf_count() != prefix.height + 1 {
    return Err(CommitmentError::MalformedProof);
  }
  if proof.prefix_expansion.root() != prefix.root {
    return Err(CommitmentError::RootMismatch);
  }

  // replay the suffix appends on top of the prefix expansion; the
  // append levels are forced by the sizes, so the proof shape must
  // line up exactly
  let mut expansion = proof.prefix_expansion.clone();
  let mut count = prefix.height + 1;
  let mut remaining = full.height - prefix.height;
  let mut roots = proof.suffix.iter();
  while remaining > 0 {
    let level = next_append_level(count, remaining);
    let root = roots.next().ok_or(CommitmentError::MalformedProof)?;
    expansion.append_complete_subtree(level, *root)?;
    count += 1 << level;
    remaining -= 1 << level;
  }
  if roots.next().is_some() {
    return Err(CommitmentError::MalformedProof);
  }

  if expansion.root() != full.root {
    return Err(CommitmentError::RootMismatch);
  }
  Ok(())
}

/// Merkle inclusion proof of a single machine hash inside a history
/// commitment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
  pub index: u64,

  /// Sibling hashes inside the complete subtree owning the leaf,
  /// bottom-up.
  pub siblings: Vec<Digest>,

  /// The full expansion with the owning subtree's slot blanked out.
  pub rest: MerkleExpansion,
}

pub fn inclusion_proof(
  leaves: &[Digest],
  index: u64,
) -> Result<InclusionProof, CommitmentError> {
  let count = leaves.len() as u64;
  if index >= count {
    return Err(CommitmentError::IndexOutOfRange { index, count });
  }
  let expansion = MerkleExpansion::from_leaves(leaves);
  let (level, subtree_start) = expansion
    .owning_level(index)
    .expect("index checked against leaf count");

  let mut siblings = Vec::with_capacity(level as usize);
  let mut lo = subtree_start as usize;
  let mut hi = lo + (1usize << level);
  let mut position = (index - subtree_start) as usize;
  for _ in 0..level {
    let mid = lo + (hi - lo) / 2;
    // sibling is the complete subtree on the other side of the
    // split containing the leaf
    if lo + position < mid {
      siblings.push(complete_subtree_root(&leaves[mid..hi]));
      hi = mid;
    } else {
      siblings.push(complete_subtree_root(&leaves[lo..mid]));
      position -= mid - lo;
      lo = mid;
    }
  }
  siblings.reverse(); // bottom-up

  Ok(InclusionProof {
    index,
    siblings,
    rest: expansion.blank(level),
  })
}

/// Checks that `leaf` is the machine hash at `proof.index` of the
/// history committed to by `commitment`.
pub fn verify_inclusion(
  commitment: &HistoryCommitment,
  leaf: Digest,
  proof: &InclusionProof,
) -> Result<(), CommitmentError> {
  let count = commitment.height + 1;
  if proof.index >= count {
    return Err(CommitmentError::IndexOutOfRange {
      index: proof.index,
      count,
    });
  }
  let level = proof.siblings.len() as u32;
  if (proof.rest.leaf_count() + (1u64 << level)) != count {
    return Err(CommitmentError::MalformedProof);
  }
  if proof.rest.levels.len() <= level as usize
    || proof.rest.levels[level as usize].is_some()
  {
    return Err(CommitmentError::MalformedProof);
  }

  // the position of the leaf inside its subtree is fixed by the
  // layout: subtrees are laid out highest level first
  let subtree_start: u64 = proof
    .rest
    .levels
    .iter()
    .enumerate()
    .skip(level as usize + 1)
    .filter(|(_, slot)| slot.is_some())
    .map(|(l, _)| 1u64 << l)
    .sum();
  if proof.index < subtree_start
    || proof.index >= subtree_start + (1u64 << level)
  {
    return Err(CommitmentError::IndexOutOfRange {
      index: proof.index,
      count,
    });
  }
  let position = proof.index - subtree_start;

  let mut accum = leaf;
  for (bit, sibling) in proof.siblings.iter().enumerate() {
    accum = if (position >> bit) & 1 == 1 {
      keccak2(*sibling, accum)
    } else {
      keccak2(accum, *sibling)
    };
  }

  if proof.rest.with(level, accum).root() != commitment.root {
    return Err(CommitmentError::RootMismatch);
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use {
    super::{
      commit, inclusion_proof, prefix_proof, verify_inclusion,
      verify_prefix_proof, CommitmentError, MerkleExpansion,
    },
    crate::primitives::{keccak, Digest},
  };

  fn leaves(n: u64) -> Vec<Digest> {
    (0..n).map(|i| keccak(&[b"leaf", &i.to_be_bytes()])).collect()
  }

  #[test]
  fn expansion_counts_leaves() {
    for n in 1..=40u64 {
      let expansion = MerkleExpansion::from_leaves(&leaves(n));
      assert_eq!(expansion.leaf_count(), n);
    }
  }

  #[test]
  fn commitment_is_positional() {
    let a = commit(&leaves(9)).unwrap();
    let mut swapped = leaves(9);
    swapped.swap(3, 4);
    let b = commit(&swapped).unwrap();
    assert_eq!(a.height, 8);
    assert_ne!(a.root, b.root);
  }

  #[test]
  fn empty_range_rejected() {
    assert_eq!(commit(&[]), Err(CommitmentError::EmptyRange));
  }

  #[test]
  fn prefix_proofs_roundtrip() {
    // exercise ragged sizes on both sides of powers of two
    for total in [2u64, 3, 5, 8, 13, 16, 31, 33, 64] {
      let all = leaves(total);
      let full = commit(&all).unwrap();
      for prefix_count in 1..total {
        let prefix = commit(&all[..prefix_count as usize]).unwrap();
        let proof = prefix_proof(&all, prefix_count).unwrap();
        verify_prefix_proof(&prefix, &full, &proof).unwrap_or_else(|e| {
          panic!("{prefix_count}/{total} failed: {e}")
        });
      }
    }
  }

  #[test]
  fn prefix_proof_rejects_wrong_root() {
    let all = leaves(13);
    let full = commit(&all).unwrap();
    let mut prefix = commit(&all[..5]).unwrap();
    let proof = prefix_proof(&all, 5).unwrap();

    prefix.root = keccak(&[b"bogus"]);
    assert_eq!(
      verify_prefix_proof(&prefix, &full, &proof),
      Err(CommitmentError::RootMismatch)
    );
  }

  #[test]
  fn prefix_proof_rejects_tampered_suffix() {
    let all = leaves(13);
    let full = commit(&all).unwrap();
    let prefix = commit(&all[..5]).unwrap();
    let mut proof = prefix_proof(&all, 5).unwrap();
    proof.suffix[0] = keccak(&[b"tampered"]);
    assert!(verify_prefix_proof(&prefix, &full, &proof).is_err());
  }

  #[test]
  fn inclusion_roundtrip() {
    for total in [1u64, 2, 3, 7, 8, 12, 21, 32] {
      let all = leaves(total);
      let commitment = commit(&all).unwrap();
      for index in 0..total {
        let proof = inclusion_proof(&all, index).unwrap();
        verify_inclusion(&commitment, all[index as usize], &proof)
          .unwrap_or_else(|e| panic!("{index}/{total} failed: {e}"));
      }
    }
  }

  #[test]
  fn inclusion_rejects_wrong_leaf() {
    let all = leaves(12);
    let commitment = commit(&all).unwrap();
    let proof = inclusion_proof(&all, 5).unwrap();
    assert_eq!(
      verify_inclusion(&commitment, all[6], &proof),
      Err(CommitmentError::RootMismatch)
    );
  }

  #[test]
  fn inclusion_rejects_out_of_range() {
    let all = leaves(4);
    assert!(matches!(
      inclusion_proof(&all, 4),
      Err(CommitmentError::IndexOutOfRange { .. })
    ));
  }
}
