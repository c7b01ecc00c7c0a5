mod digest;
mod level;
mod state;

pub use {
  digest::{keccak, keccak2, Address, Digest},
  level::Level,
  state::{ExecutionState, MachineStatus},
};

/// Hash identifying an assertion on the rollup contract.
pub type AssertionHash = Digest;

/// Hash identifying a single edge in the challenge graph.
pub type EdgeId = Digest;

/// Hash identifying a rivalry class: edges that share everything
/// except their end history root.
pub type MutualId = Digest;

/// Links an edge to the assertion pair or upper-level claim its
/// challenge descends from.
pub type OriginId = Digest;

/// Id of the upper-level edge (or claimed assertion, at the block
/// level) an edge claims to decide.
pub type ClaimId = Digest;
