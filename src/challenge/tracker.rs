//! Per-edge tracker.
//!
//! Every edge the validator owns runs one tracker task that drives
//! it to a terminal state: bisected down to length one, descended
//! into a subchallenge, settled by one-step proof, or confirmed by
//! time, children or claim. Decisions are a pure function of a
//! chain-truth snapshot, so every transition is idempotent: a
//! tracker restarted from nothing converges to the same moves.

use {
  super::edge::{bisection_point, Edge},
  crate::{
    cancel::CancelToken,
    chain::{
      with_backoff, Backoff, ChainClient, EdgeEvent, LayerZeroEdgeArgs,
    },
    config::ProtocolParams,
    error::{ChainError, ValidatorError},
    history::HistoryProvider,
    oracle::HistoryRequest,
    primitives::{Address, AssertionHash, EdgeId, Level, MutualId},
  },
  std::{collections::HashSet, sync::Arc},
  tokio::sync::mpsc,
  tracing::{debug, error, info, warn},
};

/// Where an edge sits inside the wider dispute: the assertion pair
/// it descends from, its position within upper levels, and the
/// ancestor edges whose unrivaled time it inherits.
#[derive(Debug, Clone, Default)]
pub struct ChallengeCtx {
  /// Parent of the rival assertions; the disputed trace starts at
  /// its post-state.
  pub parent_assertion: AssertionHash,

  /// Start heights of the claimed edges at every level above this
  /// edge's level, outermost first.
  pub origin_heights: Vec<u64>,

  /// Ancestor edge ids from the block-level zero edge down to this
  /// edge's parent, root first. Submitted with confirm-by-time.
  pub ancestors: Vec<EdgeId>,

  /// Rivalry classes of the ancestors; a new rival in any of them
  /// invalidates the local unrivaled-time bound.
  pub ancestor_mutuals: HashSet<MutualId>,
}

impl ChallengeCtx {
  /// Context of a bisection child of an edge with this context.
  pub fn child(&self, parent: EdgeId, parent_mutual: MutualId) -> Self {
    let mut ctx = self.clone();
    ctx.ancestors.push(parent);
    ctx.ancestor_mutuals.insert(parent_mutual);
    ctx
  }

  /// Context of a subchallenge opened under a length-one edge at
  /// `claimed_start` with this context.
  pub fn descend(
    &self,
    claimed: EdgeId,
    claimed_mutual: MutualId,
    claimed_start: u64,
  ) -> Self {
    let mut ctx = self.child(claimed, claimed_mutual);
    ctx.origin_heights.push(claimed_start);
    ctx
  }
}

/// Instruction to the coordinator to start tracking an edge.
#[derive(Debug)]
pub struct TrackCmd {
  pub id: EdgeId,
  pub ctx: ChallengeCtx,
  pub owned: bool,
}

/// Chain-truth view of an edge, the input of [`decide`].
#[derive(Debug, Clone)]
pub struct EdgeSnapshot {
  pub edge: Edge,

  /// We created this edge (or its level-zero ancestor) and are
  /// responsible for its stake.
  pub owned: bool,

  /// Stake already returned.
  pub refunded: bool,

  pub has_rival: bool,

  /// A rival of this edge was confirmed: we lost this rivalry.
  pub rival_confirmed: bool,

  /// A rivalry above us was decided against our branch.
  pub origin_refuted: bool,

  pub children_confirmed: bool,

  /// The subchallenge zero edge claiming this edge, if confirmed.
  pub claiming_confirmed: Option<EdgeId>,

  /// We already opened a subchallenge under this edge.
  pub sub_challenge_open: bool,

  /// Lower bound on cumulative unrivaled blocks along the ancestor
  /// chain.
  pub unrivaled_total: u64,
}

/// The next move for an edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
  /// Nothing to do: presumptive, or waiting on children or on a
  /// subchallenge outcome.
  Wait,
  Bisect {
    mid: u64,
  },
  OpenSubchallenge,
  SubmitOneStepProof,
  ConfirmByTime,
  ConfirmByChildren,
  ConfirmByClaim {
    claiming: EdgeId,
  },
  RefundStake,
  /// The rivalry (or one above us) was decided against us; stop
  /// without confirming.
  Abandon,
  /// Terminal, nothing left to do.
  Done,
}

/// The edge state machine. Pure: same snapshot, same move.
pub fn decide(snap: &EdgeSnapshot, challenge_period: u64) -> Action {
  if snap.edge.is_confirmed() {
    if snap.owned && snap.edge.claim.is_some() && !snap.refunded {
      return Action::RefundStake;
    }
    return Action::Done;
  }
  if snap.rival_confirmed || snap.origin_refuted {
    return Action::Abandon;
  }
  if snap.unrivaled_total >= challenge_period {
    return Action::ConfirmByTime;
  }
  if snap.children_confirmed {
    return Action::ConfirmByChildren;
  }
  if let Some(claiming) = snap.claiming_confirmed {
    return Action::ConfirmByClaim { claiming };
  }
  if !snap.has_rival {
    // presumptive: the clock runs in our favor, no move needed
    return Action::Wait;
  }
  if snap.edge.is_length_one() {
    if snap.edge.level.is_bottom() {
      return Action::SubmitOneStepProof;
    }
    if snap.sub_challenge_open {
      return Action::Wait;
    }
    return Action::OpenSubchallenge;
  }
  if snap.edge.children().is_some() {
    // already bisected, the children trackers carry on
    return Action::Wait;
  }
  match bisection_point(snap.edge.start_height, snap.edge.end_height) {
    Ok(mid) => Action::Bisect { mid },
    // unreachable for well-formed edges, but never panic on chain data
    Err(_) => Action::Wait,
  }
}

/// Locally cached unrivaled-time bound. While this edge is
/// unrivaled its share keeps growing with the chain, so the bound
/// can be extrapolated without re-reading; any rival event on the
/// ancestry throws the cache away.
#[derive(Debug, Clone, Copy)]
struct TimeCache {
  total: u64,
  at_block: u64,
  self_unrivaled: bool,
}

pub struct EdgeTracker {
  id: EdgeId,
  chain: Arc<dyn ChainClient>,
  history: Arc<HistoryProvider>,
  params: Arc<ProtocolParams>,
  ctx: ChallengeCtx,
  owned: bool,
  staker: Address,
  cancel: CancelToken,
  backoff: Backoff,

  /// Hands newly created edges (children, subchallenges) to the
  /// coordinator for tracking.
  commands: mpsc::UnboundedSender<TrackCmd>,

  /// Edge events routed to us by the coordinator.
  events: mpsc::UnboundedReceiver<EdgeEvent>,

  mutual: Option<MutualId>,
  opened_subchallenge: Option<EdgeId>,
  refunded: bool,
  unrivaled_cache: Option<TimeCache>,
}

impl EdgeTracker {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    id: EdgeId,
    chain: Arc<dyn ChainClient>,
    history: Arc<HistoryProvider>,
    params: Arc<ProtocolParams>,
    ctx: ChallengeCtx,
    owned: bool,
    staker: Address,
    cancel: CancelToken,
    commands: mpsc::UnboundedSender<TrackCmd>,
    events: mpsc::UnboundedReceiver<EdgeEvent>,
  ) -> Self {
    let backoff = Backoff::new(&params);
    Self {
      id,
      chain,
      history,
      params,
      ctx,
      owned,
      staker,
      cancel,
      backoff,
      commands,
      events,
      mutual: None,
      opened_subchallenge: None,
      refunded: false,
      unrivaled_cache: None,
    }
  }

  pub fn id(&self) -> EdgeId {
    self.id
  }

  /// Drives the edge until it reaches a terminal state.
  pub async fn run(mut self) -> Result<(), ValidatorError> {
    let mut tick = tokio::time::interval(self.params.poll_interval);
    loop {
      tokio::select! {
        _ = self.cancel.cancelled() => return Err(ValidatorError::Cancelled),
        Some(event) = self.events.recv() => self.observe(event),
        _ = tick.tick() => {}
      }
      match self.step().await {
        Ok(true) => return Ok(()),
        Ok(false) => {}
        Err(e) if e.is_cancelled() => return Err(e),
        Err(ValidatorError::Chain(e)) => {
          // transient trouble was already retried with backoff,
          // whatever remains is worth another tick
          warn!("edge {:?}: chain error, will retry: {e}", self.id);
        }
        Err(e) => {
          // proof generation failed or an invariant broke, this
          // tracker cannot make progress anymore
          error!("edge {:?}: giving up: {e}", self.id);
          return Err(e);
        }
      }
    }
  }

  fn observe(&mut self, event: EdgeEvent) {
    if let EdgeEvent::Added { mutual, .. } = event {
      let relevant = self.mutual == Some(mutual)
        || self.ctx.ancestor_mutuals.contains(&mutual);
      if relevant {
        debug!("edge {:?}: rival activity, dropping time cache", self.id);
        self.unrivaled_cache = None;
      }
    }
  }

  async fn read_edge(&self, id: EdgeId) -> Result<Edge, ValidatorError> {
    let chain = Arc::clone(&self.chain);
    Ok(
      with_backoff(&self.backoff, &self.cancel, || {
        let chain = Arc::clone(&chain);
        async move { chain.read_edge(id).await }
      })
      .await?,
    )
  }

  /// Cumulative unrivaled blocks of this edge plus its ancestors,
  /// served from the local bound when it is still valid.
  async fn unrivaled_total(&mut self, edge: &Edge) -> Result<u64, ValidatorError> {
    let now = self.chain.latest_block_number().await?;
    if let Some(cache) = self.unrivaled_cache {
      let grown = if cache.self_unrivaled {
        now.saturating_sub(cache.at_block)
      } else {
        0
      };
      return Ok(cache.total + grown);
    }

    let mut total = self.chain.time_unrivaled(self.id).await?;
    for ancestor in &self.ctx.ancestors {
      total += self.chain.time_unrivaled(*ancestor).await?;
    }
    let rivals = self.chain.rivals(edge.mutual_id()).await?;
    self.unrivaled_cache = Some(TimeCache {
      total,
      at_block: now,
      self_unrivaled: rivals.len() <= 1,
    });
    Ok(total)
  }

  async fn snapshot(&mut self) -> Result<EdgeSnapshot, ValidatorError> {
    let edge = self.read_edge(self.id).await?;
    self.mutual = Some(edge.mutual_id());

    let class = self.chain.rivals(edge.mutual_id()).await?;
    let has_rival = class.iter().any(|id| *id != self.id);
    let mut rival_confirmed = false;
    for rival in class.iter().filter(|id| **id != self.id) {
      if self.read_edge(*rival).await?.is_confirmed() {
        rival_confirmed = true;
        break;
      }
    }

    let mut origin_refuted = false;
    'ancestry: for ancestor in &self.ctx.ancestors {
      let ancestor = self.read_edge(*ancestor).await?;
      for rival in self.chain.rivals(ancestor.mutual_id()).await? {
        if rival != ancestor.id() && self.read_edge(rival).await?.is_confirmed()
        {
          origin_refuted = true;
          break 'ancestry;
        }
      }
    }

    let children_confirmed = match edge.children() {
      Some((lower, upper)) => {
        self.read_edge(lower).await?.is_confirmed()
          && self.read_edge(upper).await?.is_confirmed()
      }
      None => false,
    };

    let claiming_confirmed = match self.opened_subchallenge {
      Some(sub) => self
        .read_edge(sub)
        .await?
        .is_confirmed()
        .then_some(sub),
      None => None,
    };

    let unrivaled_total = self.unrivaled_total(&edge).await?;

    Ok(EdgeSnapshot {
      edge,
      owned: self.owned,
      refunded: self.refunded,
      has_rival,
      rival_confirmed,
      origin_refuted,
      children_confirmed,
      claiming_confirmed,
      sub_challenge_open: self.opened_subchallenge.is_some(),
      unrivaled_total,
    })
  }

  /// One observe-decide-act round. Returns true when the edge has
  /// reached a terminal state.
  async fn step(&mut self) -> Result<bool, ValidatorError> {
    let snap = self.snapshot().await?;

    // children may have appeared through our own bisection, a
    // rival's, or a restart; handing them to the coordinator is
    // idempotent
    if let Some((lower, upper)) = snap.edge.children() {
      let mutual = snap.edge.mutual_id();
      for child in [lower, upper] {
        let _ = self.commands.send(TrackCmd {
          id: child,
          ctx: self.ctx.child(self.id, mutual),
          owned: self.owned,
        });
      }
    }

    let action = decide(&snap, self.params.challenge_period_blocks);
    debug!("edge {:?}: {action:?}", self.id);
    match action {
      Action::Wait => Ok(false),
      Action::Done => Ok(true),
      Action::Abandon => {
        info!("edge {:?} was refuted, abandoning", self.id);
        Ok(true)
      }
      Action::Bisect { mid } => {
        self.bisect(&snap.edge, mid).await?;
        Ok(false)
      }
      Action::OpenSubchallenge => {
        self.open_subchallenge(&snap.edge).await?;
        Ok(false)
      }
      Action::SubmitOneStepProof => {
        self.submit_one_step_proof(&snap.edge).await?;
        Ok(false)
      }
      Action::ConfirmByTime => {
        let ancestors = self.ctx.ancestors.clone();
        self
          .write(|chain| {
            let ancestors = ancestors.clone();
            let id = self.id;
            async move { chain.confirm_edge_by_time(id, &ancestors).await }
          })
          .await?;
        info!("edge {:?} confirmed by time", self.id);
        Ok(false)
      }
      Action::ConfirmByChildren => {
        self
          .write(|chain| {
            let id = self.id;
            async move { chain.confirm_edge_by_children(id).await }
          })
          .await?;
        info!("edge {:?} confirmed by children", self.id);
        Ok(false)
      }
      Action::ConfirmByClaim { claiming } => {
        self
          .write(|chain| {
            let id = self.id;
            async move { chain.confirm_edge_by_claim(id, claiming).await }
          })
          .await?;
        info!("edge {:?} confirmed by claim", self.id);
        Ok(false)
      }
      Action::RefundStake => {
        self
          .write(|chain| {
            let id = self.id;
            async move { chain.refund_stake(id).await }
          })
          .await?;
        self.refunded = true;
        info!("edge {:?} stake refunded", self.id);
        Ok(false)
      }
    }
  }

  /// Runs a chain write with retry, mapping benign races (a rival
  /// made the same move, or it already took effect) to success.
  async fn write<F, Fut>(&self, mut op: F) -> Result<(), ValidatorError>
  where
    F: FnMut(Arc<dyn ChainClient>) -> Fut,
    Fut: std::future::Future<Output = Result<(), ChainError>>,
  {
    let result = with_backoff(&self.backoff, &self.cancel, || {
      op(Arc::clone(&self.chain))
    })
    .await;
    match result {
      Ok(()) => Ok(()),
      Err(e) if e.is_benign() => {
        debug!("edge {:?}: benign outcome: {e}", self.id);
        Ok(())
      }
      Err(e) => Err(e.into()),
    }
  }

  /// The history request covering this edge's level-zero span.
  fn request(&self, level: Level, end: u64) -> HistoryRequest {
    HistoryRequest {
      parent_assertion: self.ctx.parent_assertion,
      level,
      origin_heights: self.ctx.origin_heights.clone(),
      start: 0,
      end,
    }
  }

  async fn bisect(&mut self, edge: &Edge, mid: u64) -> Result<(), ValidatorError> {
    // commitments are prefixes of the level history, so the proof
    // target is this edge's own end commitment
    let full = self.request(edge.level, edge.end_height);

    let mid_commitment = self
      .history
      .commitment(HistoryRequest { end: mid, ..full.clone() })
      .await?;
    let proof = self.history.prefix_proof(full, mid).await?;

    let chain = Arc::clone(&self.chain);
    let id = self.id;
    let result = with_backoff(&self.backoff, &self.cancel, || {
      let chain = Arc::clone(&chain);
      let proof = proof.clone();
      async move { chain.bisect_edge(id, mid_commitment, proof).await }
    })
    .await;

    let (lower, upper) = match result {
      Ok(children) => children,
      Err(e) if e.is_benign() => {
        // the rival bisected first; the children are on chain
        // already and the next snapshot will pick them up
        debug!("edge {:?}: lost bisection race: {e}", self.id);
        return Ok(());
      }
      Err(e) => return Err(e.into()),
    };
    info!(
      "bisected edge {:?} at {mid} into {lower:?} and {upper:?}",
      self.id
    );
    Ok(())
  }

  async fn open_subchallenge(
    &mut self,
    edge: &Edge,
  ) -> Result<(), ValidatorError> {
    let next = edge
      .level
      .next(self.params.num_big_step_levels)
      .ok_or_else(|| {
        ValidatorError::fatal("tried to descend below the small-step level")
      })?;

    let ctx =
      self
        .ctx
        .descend(self.id, edge.mutual_id(), edge.start_height);
    let span = self.params.level_zero_height(next);
    let full = HistoryRequest {
      parent_assertion: ctx.parent_assertion,
      level: next,
      origin_heights: ctx.origin_heights.clone(),
      start: 0,
      end: span,
    };

    let end = self.history.commitment(full.clone()).await?;
    let start = self
      .history
      .commitment(HistoryRequest { end: 0, ..full.clone() })
      .await?;
    let prefix_proof = self.history.prefix_proof(full, 0).await?;

    let chain = Arc::clone(&self.chain);
    let staker = self.staker;
    let claim = self.id;
    let sub = with_backoff(&self.backoff, &self.cancel, || {
      let chain = Arc::clone(&chain);
      let prefix_proof = prefix_proof.clone();
      async move {
        chain
          .create_layer_zero_edge(LayerZeroEdgeArgs {
            level: next,
            claim,
            start,
            end,
            prefix_proof,
            staker,
          })
          .await
      }
    })
    .await?;

    info!(
      "opened {next} subchallenge {sub:?} under edge {:?}",
      self.id
    );
    self.opened_subchallenge = Some(sub);
    let _ = self.commands.send(TrackCmd {
      id: sub,
      ctx,
      owned: self.owned,
    });
    Ok(())
  }

  async fn submit_one_step_proof(
    &mut self,
    edge: &Edge,
  ) -> Result<(), ValidatorError> {
    let span = self.params.level_zero_height(edge.level);
    let req = self.request(edge.level, span);
    let proof = self
      .history
      .one_step_proof(req, edge.start_height)
      .await?;

    let chain = Arc::clone(&self.chain);
    let id = self.id;
    let result = with_backoff(&self.backoff, &self.cancel, || {
      let chain = Arc::clone(&chain);
      let proof = proof.clone();
      async move { chain.confirm_edge_by_one_step_proof(id, &proof).await }
    })
    .await;
    match result {
      Ok(()) => {
        info!("edge {:?} proved by one-step proof", self.id);
        Ok(())
      }
      Err(e) if e.is_benign() => Ok(()),
      // a rejected proof will never start verifying, this edge is
      // lost and its tracker must stop
      Err(ChainError::InvalidArgument(msg)) => {
        Err(ValidatorError::Proof(msg))
      }
      Err(e) => Err(e.into()),
    }
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{decide, Action, EdgeSnapshot},
    crate::{
      challenge::{Edge, EdgeStatus},
      primitives::{keccak, Level},
    },
  };

  const CHALLENGE_PERIOD: u64 = 100;

  fn snapshot(level: Level, start: u64, end: u64) -> EdgeSnapshot {
    EdgeSnapshot {
      edge: Edge {
        level,
        origin: keccak(&[b"origin"]),
        start_height: start,
        start_root: keccak(&[b"start"]),
        end_height: end,
        end_root: keccak(&[b"end"]),
        claim: None,
        lower_child: None,
        upper_child: None,
        staker: None,
        created_at_block: 1,
        status: EdgeStatus::Pending,
      },
      owned: true,
      refunded: false,
      has_rival: true,
      rival_confirmed: false,
      origin_refuted: false,
      children_confirmed: false,
      claiming_confirmed: None,
      sub_challenge_open: false,
      unrivaled_total: 0,
    }
  }

  #[test]
  fn presumptive_edges_wait() {
    let mut snap = snapshot(Level::Block, 0, 32);
    snap.has_rival = false;
    assert_eq!(decide(&snap, CHALLENGE_PERIOD), Action::Wait);
  }

  #[test]
  fn rivaled_long_edges_bisect() {
    let snap = snapshot(Level::Block, 0, 32);
    assert_eq!(
      decide(&snap, CHALLENGE_PERIOD),
      Action::Bisect { mid: 16 }
    );

    let snap = snapshot(Level::BigStep(1), 16, 19);
    assert_eq!(
      decide(&snap, CHALLENGE_PERIOD),
      Action::Bisect { mid: 18 }
    );
  }

  #[test]
  fn bisected_edges_defer_to_children() {
    let mut snap = snapshot(Level::Block, 0, 32);
    snap.edge.lower_child = Some(keccak(&[b"lower"]));
    snap.edge.upper_child = Some(keccak(&[b"upper"]));
    assert_eq!(decide(&snap, CHALLENGE_PERIOD), Action::Wait);
  }

  #[test]
  fn length_one_descends_or_proves() {
    let snap = snapshot(Level::Block, 4, 5);
    assert_eq!(decide(&snap, CHALLENGE_PERIOD), Action::OpenSubchallenge);

    let mut waiting = snapshot(Level::BigStep(1), 4, 5);
    waiting.sub_challenge_open = true;
    assert_eq!(decide(&waiting, CHALLENGE_PERIOD), Action::Wait);

    let bottom = snapshot(Level::SmallStep, 4, 5);
    assert_eq!(
      decide(&bottom, CHALLENGE_PERIOD),
      Action::SubmitOneStepProof
    );
  }

  #[test]
  fn confirmation_paths() {
    let mut by_time = snapshot(Level::Block, 0, 32);
    by_time.unrivaled_total = CHALLENGE_PERIOD;
    assert_eq!(decide(&by_time, CHALLENGE_PERIOD), Action::ConfirmByTime);

    let mut by_children = snapshot(Level::Block, 0, 32);
    by_children.children_confirmed = true;
    assert_eq!(
      decide(&by_children, CHALLENGE_PERIOD),
      Action::ConfirmByChildren
    );

    let sub = keccak(&[b"sub"]);
    let mut by_claim = snapshot(Level::Block, 4, 5);
    by_claim.sub_challenge_open = true;
    by_claim.claiming_confirmed = Some(sub);
    assert_eq!(
      decide(&by_claim, CHALLENGE_PERIOD),
      Action::ConfirmByClaim { claiming: sub }
    );
  }

  #[test]
  fn refuted_edges_abandon() {
    let mut snap = snapshot(Level::Block, 0, 32);
    snap.rival_confirmed = true;
    assert_eq!(decide(&snap, CHALLENGE_PERIOD), Action::Abandon);

    let mut snap = snapshot(Level::BigStep(1), 0, 32);
    snap.origin_refuted = true;
    assert_eq!(decide(&snap, CHALLENGE_PERIOD), Action::Abandon);
  }

  #[test]
  fn confirmed_edges_refund_once_then_finish() {
    let mut snap = snapshot(Level::Block, 0, 32);
    snap.edge.status = EdgeStatus::Confirmed;
    snap.edge.claim = Some(keccak(&[b"assertion"]));
    assert_eq!(decide(&snap, CHALLENGE_PERIOD), Action::RefundStake);

    snap.refunded = true;
    assert_eq!(decide(&snap, CHALLENGE_PERIOD), Action::Done);

    // interior edges carry no stake
    let mut interior = snapshot(Level::Block, 0, 16);
    interior.edge.status = EdgeStatus::Confirmed;
    assert_eq!(decide(&interior, CHALLENGE_PERIOD), Action::Done);
  }

  #[test]
  fn confirmation_is_monotone() {
    // a confirmed edge never acts again, even with a confirmed
    // rival in sight
    let mut snap = snapshot(Level::Block, 0, 16);
    snap.edge.status = EdgeStatus::Confirmed;
    snap.rival_confirmed = true;
    assert_eq!(decide(&snap, CHALLENGE_PERIOD), Action::Done);
  }
}
