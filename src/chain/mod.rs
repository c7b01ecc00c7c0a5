//! Parent-chain interface.
//!
//! Read-only views of assertions, edges and block numbers, plus the
//! transactional writes the validator uses to make moves in the
//! game. The transport behind this trait (RPC, ABI encoding,
//! signing, gas) lives outside this crate; what matters here is the
//! error contract: transient failures are retryable, losing a race
//! to a rival is success, and event subscriptions are broadcast
//! channels that slow consumers may lag on.

mod inmem;
mod retry;

pub use {
  inmem::InMemChain,
  retry::{with_backoff, Backoff},
};

use {
  crate::{
    challenge::Edge,
    config::ChainConstants,
    error::ChainError,
    history::{HistoryCommitment, OneStepProof, PrefixProof},
    primitives::{
      Address, AssertionHash, ClaimId, EdgeId, ExecutionState, Level,
      MutualId,
    },
  },
  async_trait::async_trait,
  serde::{Deserialize, Serialize},
  tokio::sync::broadcast,
};

/// Creation metadata of an assertion, as reported by the rollup
/// contract. Assertions are immutable once created; confirmation
/// only flips a flag on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionCreationInfo {
  pub hash: AssertionHash,
  pub parent: AssertionHash,
  pub after_state: ExecutionState,
  pub created_at_block: u64,
  pub staker: Address,
}

/// Raised by the contract whenever any staker creates an assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssertionCreatedEvent {
  pub hash: AssertionHash,
}

/// Edge lifecycle events raised by the challenge manager contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeEvent {
  Added {
    id: EdgeId,
    mutual: MutualId,
  },
  Bisected {
    id: EdgeId,
    lower: EdgeId,
    upper: EdgeId,
  },
  Confirmed {
    id: EdgeId,
  },
}

/// Arguments for staking a new level-zero edge.
#[derive(Debug, Clone)]
pub struct LayerZeroEdgeArgs {
  pub level: Level,

  /// What this edge claims to decide: the assertion being defended
  /// at the block level, the length-one upper-level edge below it.
  pub claim: ClaimId,

  pub start: HistoryCommitment,
  pub end: HistoryCommitment,

  /// Shows the start commitment is a prefix of the end commitment.
  pub prefix_proof: PrefixProof,

  pub staker: Address,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
  // reads

  async fn latest_block_number(&self) -> Result<u64, ChainError>;

  async fn read_genesis_hash(&self) -> Result<AssertionHash, ChainError>;

  async fn read_assertion(
    &self,
    hash: AssertionHash,
  ) -> Result<AssertionCreationInfo, ChainError>;

  async fn read_edge(&self, id: EdgeId) -> Result<Edge, ChainError>;

  /// All edges of a rivalry class, in creation order.
  async fn rivals(&self, mutual: MutualId) -> Result<Vec<EdgeId>, ChainError>;

  /// Blocks during which this edge was the only member of its
  /// rivalry class, as accounted by the chain.
  async fn time_unrivaled(&self, id: EdgeId) -> Result<u64, ChainError>;

  async fn protocol_constants(&self) -> Result<ChainConstants, ChainError>;

  // writes

  /// Creates and stakes a sibling of the given parent assertion.
  async fn create_assertion(
    &self,
    prev: &AssertionCreationInfo,
    after: &ExecutionState,
    staker: Address,
  ) -> Result<AssertionCreationInfo, ChainError>;

  async fn create_layer_zero_edge(
    &self,
    args: LayerZeroEdgeArgs,
  ) -> Result<EdgeId, ChainError>;

  /// Splits an edge at its bisection point. Returns the ids of the
  /// lower and upper children; either may have already existed,
  /// shared with a rival.
  async fn bisect_edge(
    &self,
    id: EdgeId,
    mid: HistoryCommitment,
    prefix_proof: PrefixProof,
  ) -> Result<(EdgeId, EdgeId), ChainError>;

  async fn confirm_edge_by_children(
    &self,
    id: EdgeId,
  ) -> Result<(), ChainError>;

  /// Transfers the confirmation of a level-zero edge up to the
  /// length-one edge it claimed.
  async fn confirm_edge_by_claim(
    &self,
    id: EdgeId,
    claiming: EdgeId,
  ) -> Result<(), ChainError>;

  /// Confirms by cumulative unrivaled time along the ancestor
  /// chain; the chain recomputes and checks the total itself.
  async fn confirm_edge_by_time(
    &self,
    id: EdgeId,
    ancestors: &[EdgeId],
  ) -> Result<(), ChainError>;

  async fn confirm_edge_by_one_step_proof(
    &self,
    id: EdgeId,
    proof: &OneStepProof,
  ) -> Result<(), ChainError>;

  /// Returns the stake of a confirmed level-zero edge.
  async fn refund_stake(&self, id: EdgeId) -> Result<(), ChainError>;

  // events

  fn subscribe_assertions(&self) -> broadcast::Receiver<AssertionCreatedEvent>;

  fn subscribe_edges(&self) -> broadcast::Receiver<EdgeEvent>;
}
