//! Validator assembly.
//!
//! Wires the pipeline together: chain events feed the assertion
//! manager, the manager's poster opens challenges, the coordinator
//! spawns an edge tracker per edge, and every tracker consults the
//! shared history provider before posting moves back to the chain.

use {
  crate::{
    assertions::{AssertionManager, BranchSnapshot, ChallengePoster},
    cancel::CancelToken,
    challenge::ChallengeCoordinator,
    chain::ChainClient,
    config::ProtocolParams,
    error::ValidatorError,
    history::HistoryProvider,
    oracle::StateOracle,
    primitives::{Address, AssertionHash},
  },
  std::{path::PathBuf, sync::Arc},
  tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
  },
  tracing::info,
};

pub struct Validator {
  pub manager: JoinHandle<Result<(), ValidatorError>>,
  pub coordinator: JoinHandle<Result<(), ValidatorError>>,

  /// Hashes of newly canonical assertions.
  pub observations: broadcast::Receiver<AssertionHash>,

  /// Live view of the canonical branch tip.
  pub snapshots: watch::Receiver<BranchSnapshot>,
}

impl Validator {
  /// Validates the configuration against the chain and spawns the
  /// long-running tasks. They stop when `cancel` fires; errors in
  /// the assertion manager halt new-challenge creation but leave
  /// running trackers alone.
  pub async fn spawn(
    chain: Arc<dyn ChainClient>,
    oracle: Arc<dyn StateOracle>,
    params: Arc<ProtocolParams>,
    staker: Address,
    checkpoint_path: Option<PathBuf>,
    cancel: CancelToken,
  ) -> Result<Validator, ValidatorError> {
    let constants = chain.protocol_constants().await?;
    params.validate_against(&constants)?;

    let history = Arc::new(HistoryProvider::new(Arc::clone(&oracle)));
    let coordinator = ChallengeCoordinator::new(
      Arc::clone(&chain),
      Arc::clone(&history),
      Arc::clone(&params),
      staker,
      cancel.clone(),
    );
    let poster = Arc::new(ChallengePoster::new(
      Arc::clone(&chain),
      Arc::clone(&oracle),
      history,
      Arc::clone(&params),
      staker,
      cancel.clone(),
      coordinator.commands(),
    ));

    let branch =
      AssertionManager::bootstrap_branch(&chain, checkpoint_path.as_deref())
        .await?;
    info!(
      "starting validator as staker {staker}, canonical tip {:?}",
      branch.latest_agreed()
    );
    let manager = AssertionManager::new(
      chain,
      oracle,
      poster,
      params,
      branch,
      checkpoint_path,
      cancel,
    );
    let observations = manager.observations();
    let snapshots = manager.snapshots();

    Ok(Validator {
      manager: tokio::spawn(manager.run()),
      coordinator: tokio::spawn(coordinator.run()),
      observations,
      snapshots,
    })
  }
}
