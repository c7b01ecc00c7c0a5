//! In-memory rollup chain.
//!
//! A self-contained implementation of [`ChainClient`] that models
//! the assertion tree and the challenge manager contract: edge ids,
//! rivalry bookkeeping, bisection, the four confirmation paths and
//! stake refunds, with the same validation the real contracts
//! perform on the moves that matter (prefix proofs on bisections,
//! inclusion proofs and the one-step verifier on final settlement).
//!
//! It backs the binary's `--sim` mode and the scenario tests, where
//! an honest validator and a scripted adversary play a full game
//! against it.

use {
  super::{
    AssertionCreatedEvent, AssertionCreationInfo, ChainClient, EdgeEvent,
    LayerZeroEdgeArgs,
  },
  crate::{
    challenge::{bisection_point, Edge, EdgeStatus},
    config::ChainConstants,
    error::ChainError,
    history::{
      verify_inclusion, verify_prefix_proof, HistoryCommitment, OneStepProof,
    },
    oracle::{HistoryRequest, SimOracle, StateOracle},
    primitives::{
      keccak, Address, AssertionHash, Digest, EdgeId, ExecutionState, Level,
      MutualId, OriginId,
    },
  },
  async_trait::async_trait,
  dashmap::{DashMap, DashSet},
  std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
  },
  tokio::sync::broadcast,
  tracing::debug,
};

/// Everything needed to rebuild the history request of a challenge
/// origin, tracked so the chain's one-step verifier can check
/// submitted proofs against the true trace.
#[derive(Debug, Clone)]
struct OriginContext {
  parent_assertion: AssertionHash,
  origin_heights: Vec<u64>,
}

pub struct InMemChain {
  constants: ChainConstants,

  /// The true machine trace, the chain's stand-in for the on-chain
  /// one-step verifier.
  truth: Arc<SimOracle>,

  block_number: AtomicU64,
  genesis: AssertionHash,

  assertions: DashMap<AssertionHash, AssertionCreationInfo>,
  edges: DashMap<EdgeId, Edge>,

  /// Rivalry classes in creation order.
  rivals: DashMap<MutualId, Vec<EdgeId>>,

  origins: DashMap<OriginId, OriginContext>,
  refunded: DashSet<EdgeId>,

  assertion_events: broadcast::Sender<AssertionCreatedEvent>,
  edge_events: broadcast::Sender<EdgeEvent>,
}

impl InMemChain {
  pub fn new(constants: ChainConstants, truth: Arc<SimOracle>) -> Self {
    let genesis_info = AssertionCreationInfo {
      hash: keccak(&[b"assertion-genesis"]),
      parent: Digest::ZERO,
      after_state: truth.genesis_state(),
      created_at_block: 0,
      staker: Address::default(),
    };
    let (assertion_events, _) = broadcast::channel(1024);
    let (edge_events, _) = broadcast::channel(1024);
    let chain = Self {
      constants,
      truth,
      block_number: AtomicU64::new(1),
      genesis: genesis_info.hash,
      assertions: DashMap::new(),
      edges: DashMap::new(),
      rivals: DashMap::new(),
      origins: DashMap::new(),
      refunded: DashSet::new(),
      assertion_events,
      edge_events,
    };
    chain.assertions.insert(genesis_info.hash, genesis_info);
    chain
  }

  pub fn advance_blocks(&self, n: u64) {
    self.block_number.fetch_add(n, Ordering::SeqCst);
  }

  /// Snapshot of every edge ever created, for status reporting.
  pub fn edges(&self) -> Vec<Edge> {
    self.edges.iter().map(|entry| entry.value().clone()).collect()
  }

  fn now(&self) -> u64 {
    self.block_number.load(Ordering::SeqCst)
  }

  fn level_zero_height(&self, level: Level) -> u64 {
    match level {
      Level::Block => self.constants.level_zero_heights.block,
      Level::BigStep(_) => self.constants.level_zero_heights.big_step,
      Level::SmallStep => self.constants.level_zero_heights.small_step,
    }
  }

  fn edge(&self, id: EdgeId) -> Result<Edge, ChainError> {
    self
      .edges
      .get(&id)
      .map(|e| e.clone())
      .ok_or_else(|| ChainError::NotFound(format!("edge {id:?}")))
  }

  /// Inserts an edge unless an identical one already exists, and
  /// records its rivalry class membership.
  fn insert_edge(&self, edge: Edge) -> (EdgeId, bool) {
    let id = edge.id();
    if self.edges.contains_key(&id) {
      return (id, false);
    }
    let mutual = edge.mutual_id();
    self.edges.insert(id, edge);
    self.rivals.entry(mutual).or_default().push(id);
    let _ = self.edge_events.send(EdgeEvent::Added { id, mutual });
    (id, true)
  }

  fn confirm(&self, id: EdgeId) -> Result<(), ChainError> {
    let mut edge = self
      .edges
      .get_mut(&id)
      .ok_or_else(|| ChainError::NotFound(format!("edge {id:?}")))?;
    if edge.is_confirmed() {
      return Err(ChainError::AlreadyConfirmed);
    }
    edge.status = EdgeStatus::Confirmed;
    drop(edge);
    let _ = self.edge_events.send(EdgeEvent::Confirmed { id });
    Ok(())
  }

  /// The history request covering an edge's level-zero span, used
  /// by the one-step verifier.
  fn history_request(&self, edge: &Edge) -> Result<HistoryRequest, ChainError> {
    let ctx = self.origins.get(&edge.origin).ok_or_else(|| {
      ChainError::NotFound(format!("origin context {:?}", edge.origin))
    })?;
    Ok(HistoryRequest {
      parent_assertion: ctx.parent_assertion,
      level: edge.level,
      origin_heights: ctx.origin_heights.clone(),
      start: 0,
      end: self.level_zero_height(edge.level),
    })
  }

  fn unrivaled_blocks(&self, edge: &Edge) -> u64 {
    let class = match self.rivals.get(&edge.mutual_id()) {
      Some(class) => class,
      None => return 0,
    };
    let id = edge.id();
    match class.first() {
      Some(first) if *first == id => match class.get(1) {
        // unrivaled from creation until the first rival arrived
        Some(second) => {
          let rivaled_at = self
            .edges
            .get(second)
            .map(|e| e.created_at_block)
            .unwrap_or(edge.created_at_block);
          rivaled_at.saturating_sub(edge.created_at_block)
        }
        None => self.now().saturating_sub(edge.created_at_block),
      },
      // later arrivals were rivaled from birth
      _ => 0,
    }
  }
}

#[async_trait]
impl ChainClient for InMemChain {
  async fn latest_block_number(&self) -> Result<u64, ChainError> {
    Ok(self.now())
  }

  async fn read_genesis_hash(&self) -> Result<AssertionHash, ChainError> {
    Ok(self.genesis)
  }

  async fn read_assertion(
    &self,
    hash: AssertionHash,
  ) -> Result<AssertionCreationInfo, ChainError> {
    self
      .assertions
      .get(&hash)
      .map(|info| info.clone())
      .ok_or_else(|| ChainError::NotFound(format!("assertion {hash:?}")))
  }

  async fn read_edge(&self, id: EdgeId) -> Result<Edge, ChainError> {
    self.edge(id)
  }

  async fn rivals(&self, mutual: MutualId) -> Result<Vec<EdgeId>, ChainError> {
    Ok(
      self
        .rivals
        .get(&mutual)
        .map(|class| class.clone())
        .unwrap_or_default(),
    )
  }

  async fn time_unrivaled(&self, id: EdgeId) -> Result<u64, ChainError> {
    let edge = self.edge(id)?;
    Ok(self.unrivaled_blocks(&edge))
  }

  async fn protocol_constants(&self) -> Result<ChainConstants, ChainError> {
    Ok(self.constants)
  }

  async fn create_assertion(
    &self,
    prev: &AssertionCreationInfo,
    after: &ExecutionState,
    staker: Address,
  ) -> Result<AssertionCreationInfo, ChainError> {
    if !self.assertions.contains_key(&prev.hash) {
      return Err(ChainError::NotFound(format!(
        "parent assertion {:?}",
        prev.hash
      )));
    }
    let hash = keccak(&[
      b"assertion",
      prev.hash.as_bytes(),
      after.commitment_hash().as_bytes(),
    ]);
    if let Some(existing) = self.assertions.get(&hash) {
      // same parent, same post-state: idempotent
      debug!("assertion {hash:?} already exists");
      return Ok(existing.clone());
    }
    let info = AssertionCreationInfo {
      hash,
      parent: prev.hash,
      after_state: *after,
      created_at_block: self.now(),
      staker,
    };
    self.assertions.insert(hash, info.clone());
    let _ = self.assertion_events.send(AssertionCreatedEvent { hash });
    Ok(info)
  }

  async fn create_layer_zero_edge(
    &self,
    args: LayerZeroEdgeArgs,
  ) -> Result<EdgeId, ChainError> {
    let height = self.level_zero_height(args.level);
    if args.start.height != 0 || args.end.height != height {
      return Err(ChainError::InvalidArgument(format!(
        "level-zero {} edge must span 0..{height}",
        args.level
      )));
    }
    verify_prefix_proof(&args.start, &args.end, &args.prefix_proof).map_err(
      |e| ChainError::InvalidArgument(format!("bad prefix proof: {e}")),
    )?;

    // derive the origin and its trace context from the claim
    let (origin, context) = match args.level {
      Level::Block => {
        let claimed = self.read_assertion(args.claim).await?;
        let origin = keccak(&[b"origin", claimed.parent.as_bytes()]);
        (origin, OriginContext {
          parent_assertion: claimed.parent,
          origin_heights: vec![],
        })
      }
      _ => {
        let claimed = self.edge(args.claim)?;
        if !claimed.is_length_one() {
          return Err(ChainError::InvalidArgument(
            "claimed edge is not length one".into(),
          ));
        }
        let num_levels = self.constants.num_big_step_levels;
        if claimed.level.next(num_levels) != Some(args.level) {
          return Err(ChainError::InvalidArgument(format!(
            "cannot open a {} subchallenge under a {} edge",
            args.level, claimed.level
          )));
        }
        let upper = self.origins.get(&claimed.origin).ok_or_else(|| {
          ChainError::NotFound(format!("origin context {:?}", claimed.origin))
        })?;
        let mut origin_heights = upper.origin_heights.clone();
        origin_heights.push(claimed.start_height);
        (claimed.mutual_id(), OriginContext {
          parent_assertion: upper.parent_assertion,
          origin_heights,
        })
      }
    };
    self.origins.entry(origin).or_insert(context);

    let edge = Edge {
      level: args.level,
      origin,
      start_height: args.start.height,
      start_root: args.start.root,
      end_height: args.end.height,
      end_root: args.end.root,
      claim: Some(args.claim),
      lower_child: None,
      upper_child: None,
      staker: Some(args.staker),
      created_at_block: self.now(),
      status: EdgeStatus::Pending,
    };
    let (id, created) = self.insert_edge(edge);
    if !created {
      debug!("level-zero edge {id:?} already exists");
    }
    Ok(id)
  }

  async fn bisect_edge(
    &self,
    id: EdgeId,
    mid: HistoryCommitment,
    prefix_proof: crate::history::PrefixProof,
  ) -> Result<(EdgeId, EdgeId), ChainError> {
    let edge = self.edge(id)?;
    if let Some(children) = edge.children() {
      // someone already made this move, possibly a rival
      return Ok(children);
    }
    let expected = bisection_point(edge.start_height, edge.end_height)
      .map_err(|e| ChainError::InvalidArgument(e.to_string()))?;
    if mid.height != expected {
      return Err(ChainError::InvalidArgument(format!(
        "bisection at {} instead of {expected}",
        mid.height
      )));
    }
    let end = HistoryCommitment {
      height: edge.end_height,
      root: edge.end_root,
    };
    verify_prefix_proof(&mid, &end, &prefix_proof).map_err(|e| {
      ChainError::InvalidArgument(format!("bad prefix proof: {e}"))
    })?;

    let lower = Edge {
      level: edge.level,
      origin: edge.origin,
      start_height: edge.start_height,
      start_root: edge.start_root,
      end_height: mid.height,
      end_root: mid.root,
      claim: None,
      lower_child: None,
      upper_child: None,
      staker: None,
      created_at_block: self.now(),
      status: EdgeStatus::Pending,
    };
    let upper = Edge {
      start_height: mid.height,
      start_root: mid.root,
      end_height: edge.end_height,
      end_root: edge.end_root,
      ..lower.clone()
    };

    let (lower_id, _) = self.insert_edge(lower);
    let (upper_id, _) = self.insert_edge(upper);
    if let Some(mut edge) = self.edges.get_mut(&id) {
      edge.lower_child = Some(lower_id);
      edge.upper_child = Some(upper_id);
    }
    let _ = self.edge_events.send(EdgeEvent::Bisected {
      id,
      lower: lower_id,
      upper: upper_id,
    });
    Ok((lower_id, upper_id))
  }

  async fn confirm_edge_by_children(
    &self,
    id: EdgeId,
  ) -> Result<(), ChainError> {
    let edge = self.edge(id)?;
    let (lower, upper) = edge.children().ok_or_else(|| {
      ChainError::InvalidArgument("edge has no children".into())
    })?;
    if !self.edge(lower)?.is_confirmed() || !self.edge(upper)?.is_confirmed() {
      return Err(ChainError::InvalidArgument(
        "children are not both confirmed".into(),
      ));
    }
    self.confirm(id)
  }

  async fn confirm_edge_by_claim(
    &self,
    id: EdgeId,
    claiming: EdgeId,
  ) -> Result<(), ChainError> {
    let claiming = self.edge(claiming)?;
    if claiming.claim != Some(id) {
      return Err(ChainError::InvalidArgument(
        "claiming edge does not claim this edge".into(),
      ));
    }
    if !claiming.is_confirmed() {
      return Err(ChainError::InvalidArgument(
        "claiming edge is not confirmed".into(),
      ));
    }
    self.confirm(id)
  }

  async fn confirm_edge_by_time(
    &self,
    id: EdgeId,
    ancestors: &[EdgeId],
  ) -> Result<(), ChainError> {
    let edge = self.edge(id)?;
    let mut total = self.unrivaled_blocks(&edge);
    for ancestor in ancestors {
      let ancestor = self.edge(*ancestor)?;
      total += self.unrivaled_blocks(&ancestor);
    }
    if total < self.constants.challenge_period_blocks {
      return Err(ChainError::InvalidArgument(format!(
        "unrivaled for {total} blocks, challenge period is {}",
        self.constants.challenge_period_blocks
      )));
    }
    self.confirm(id)
  }

  async fn confirm_edge_by_one_step_proof(
    &self,
    id: EdgeId,
    proof: &OneStepProof,
  ) -> Result<(), ChainError> {
    let edge = self.edge(id)?;
    if edge.level != Level::SmallStep || !edge.is_length_one() {
      return Err(ChainError::InvalidArgument(
        "only length-one small-step edges take one-step proofs".into(),
      ));
    }
    if proof.step != edge.start_height {
      return Err(ChainError::InvalidArgument(format!(
        "proof for step {} on edge at {}",
        proof.step, edge.start_height
      )));
    }

    // the before and after hashes must really be the committed
    // leaves at the edge's endpoints
    let start = HistoryCommitment {
      height: edge.start_height,
      root: edge.start_root,
    };
    let end = HistoryCommitment {
      height: edge.end_height,
      root: edge.end_root,
    };
    verify_inclusion(&start, proof.before_hash, &proof.before_inclusion)
      .map_err(|e| {
        ChainError::InvalidArgument(format!("before inclusion: {e}"))
      })?;
    verify_inclusion(&end, proof.after_hash, &proof.after_inclusion)
      .map_err(|e| {
        ChainError::InvalidArgument(format!("after inclusion: {e}"))
      })?;

    // stand-in for the one-step verifier: the transition must match
    // the true machine trace
    let req = self.history_request(&edge)?;
    let expected = self
      .truth
      .one_step_data(&req, edge.start_height)
      .await
      .map_err(|e| ChainError::InvalidArgument(e.to_string()))?;
    if expected.before_hash != proof.before_hash
      || expected.after_hash != proof.after_hash
    {
      return Err(ChainError::InvalidArgument(
        "one-step proof does not verify".into(),
      ));
    }
    self.confirm(id)
  }

  async fn refund_stake(&self, id: EdgeId) -> Result<(), ChainError> {
    let edge = self.edge(id)?;
    if edge.claim.is_none() {
      return Err(ChainError::InvalidArgument(
        "only level-zero edges carry a stake".into(),
      ));
    }
    if !edge.is_confirmed() {
      return Err(ChainError::InvalidArgument(
        "edge is not confirmed".into(),
      ));
    }
    if !self.refunded.insert(id) {
      return Err(ChainError::AlreadyConfirmed);
    }
    debug!("refunded stake of {id:?}");
    Ok(())
  }

  fn subscribe_assertions(
    &self,
  ) -> broadcast::Receiver<AssertionCreatedEvent> {
    self.assertion_events.subscribe()
  }

  fn subscribe_edges(&self) -> broadcast::Receiver<EdgeEvent> {
    self.edge_events.subscribe()
  }
}
