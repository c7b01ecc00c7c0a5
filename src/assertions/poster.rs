use {
  crate::{
    cancel::CancelToken,
    chain::{
      with_backoff, AssertionCreationInfo, Backoff, ChainClient,
      LayerZeroEdgeArgs,
    },
    challenge::{ChallengeCtx, TrackCmd},
    config::ProtocolParams,
    error::ValidatorError,
    history::HistoryProvider,
    oracle::{HistoryRequest, StateOracle},
    primitives::{Address, Level},
  },
  async_trait::async_trait,
  std::sync::Arc,
  tokio::sync::mpsc,
  tracing::{info, warn},
};

/// Counter-move against an invalid assertion: stake the correct
/// sibling and open a challenge.
#[async_trait]
pub trait RivalPoster: Send + Sync {
  /// Computes the validator's own execution state at the invalid
  /// assertion's post-batch count, creates and stakes it as a
  /// sibling, then opens a level-zero edge challenging the invalid
  /// assertion against ours. Returns the created assertion's info.
  async fn post_rival_and_challenge(
    &self,
    invalid: &AssertionCreationInfo,
  ) -> Result<AssertionCreationInfo, ValidatorError>;
}

pub struct ChallengePoster {
  chain: Arc<dyn ChainClient>,
  oracle: Arc<dyn StateOracle>,
  history: Arc<HistoryProvider>,
  params: Arc<ProtocolParams>,
  staker: Address,
  backoff: Backoff,
  cancel: CancelToken,

  /// Newly opened challenge edges are handed to the coordinator
  /// through here.
  tracks: mpsc::UnboundedSender<TrackCmd>,
}

impl ChallengePoster {
  pub fn new(
    chain: Arc<dyn ChainClient>,
    oracle: Arc<dyn StateOracle>,
    history: Arc<HistoryProvider>,
    params: Arc<ProtocolParams>,
    staker: Address,
    cancel: CancelToken,
    tracks: mpsc::UnboundedSender<TrackCmd>,
  ) -> Self {
    let backoff = Backoff::new(&params);
    Self {
      chain,
      oracle,
      history,
      params,
      staker,
      backoff,
      cancel,
      tracks,
    }
  }
}

#[async_trait]
impl RivalPoster for ChallengePoster {
  async fn post_rival_and_challenge(
    &self,
    invalid: &AssertionCreationInfo,
  ) -> Result<AssertionCreationInfo, ValidatorError> {
    // our view of the rollup at the same post-batch count; an
    // unknown batch propagates and defers the rival to a later sync
    let correct = self
      .oracle
      .execution_state_after_batch(invalid.after_state.batch)
      .await?;
    if correct == invalid.after_state {
      // the caller classified this assertion as invalid, agreeing
      // with it here means the two of us have diverged
      return Err(ValidatorError::fatal(format!(
        "asked to rival assertion {:?} the oracle agrees with",
        invalid.hash
      )));
    }

    let parent = {
      let chain = Arc::clone(&self.chain);
      let hash = invalid.parent;
      with_backoff(&self.backoff, &self.cancel, || {
        let chain = Arc::clone(&chain);
        async move { chain.read_assertion(hash).await }
      })
      .await?
    };

    // stake the correct sibling; recreating an assertion that
    // already exists is idempotent on chain
    let ours = {
      let chain = Arc::clone(&self.chain);
      let staker = self.staker;
      with_backoff(&self.backoff, &self.cancel, || {
        let chain = Arc::clone(&chain);
        let parent = parent.clone();
        async move { chain.create_assertion(&parent, &correct, staker).await }
      })
      .await?
    };
    info!(
      "staked rival assertion {:?} against invalid {:?}",
      ours.hash, invalid.hash
    );

    // open the level-zero block challenge defending our assertion
    let span = self.params.level_zero_height(Level::Block);
    let full = HistoryRequest {
      parent_assertion: invalid.parent,
      level: Level::Block,
      origin_heights: vec![],
      start: 0,
      end: span,
    };
    let end = self.history.commitment(full.clone()).await?;
    let start = self
      .history
      .commitment(HistoryRequest { end: 0, ..full.clone() })
      .await?;
    let prefix_proof = self.history.prefix_proof(full, 0).await?;

    let edge = {
      let chain = Arc::clone(&self.chain);
      let staker = self.staker;
      let claim = ours.hash;
      let result = with_backoff(&self.backoff, &self.cancel, || {
        let chain = Arc::clone(&chain);
        let prefix_proof = prefix_proof.clone();
        async move {
          chain
            .create_layer_zero_edge(LayerZeroEdgeArgs {
              level: Level::Block,
              claim,
              start,
              end,
              prefix_proof,
              staker,
            })
            .await
        }
      })
      .await;
      match result {
        Ok(edge) => edge,
        Err(e) if e.is_benign() => {
          // the edge is already on chain from an earlier run; its
          // tracker was spawned back then
          warn!("challenge edge for {:?} already open: {e}", ours.hash);
          return Ok(ours);
        }
        Err(e) => return Err(e.into()),
      }
    };
    info!("opened challenge edge {edge:?} defending {:?}", ours.hash);

    let ctx = ChallengeCtx {
      parent_assertion: invalid.parent,
      ..ChallengeCtx::default()
    };
    let _ = self.tracks.send(TrackCmd {
      id: edge,
      ctx,
      owned: true,
    });
    Ok(ours)
  }
}
