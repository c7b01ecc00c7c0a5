//! Assertion manager.
//!
//! Consumes the stream of assertion-created events and turns it
//! into decisions: extend the canonical branch when the oracle
//! agrees with a new assertion, or stake a rival and open a
//! challenge when it does not. Assertions the oracle cannot judge
//! yet stay queued and are re-examined on the next sync.

use {
  super::{
    branch::{BranchSnapshot, CanonicalBranch},
    poster::RivalPoster,
  },
  crate::{
    cancel::CancelToken,
    chain::{
      with_backoff, AssertionCreatedEvent, AssertionCreationInfo, Backoff,
      ChainClient,
    },
    config::{AmbiguityPolicy, ProtocolParams},
    error::{OracleError, ValidatorError},
    oracle::StateOracle,
    primitives::AssertionHash,
  },
  itertools::Itertools,
  lru::LruCache,
  std::{
    collections::{HashSet, VecDeque},
    num::NonZeroUsize,
    path::PathBuf,
    sync::{Arc, Mutex},
  },
  tokio::sync::{broadcast, watch},
  tracing::{debug, error, info, warn},
};

/// Bound on the remembered rival submissions. Eviction is
/// best-effort: a falsely forgotten submission is idempotent on
/// chain.
const SUBMITTED_LRU_SIZE: usize = 4096;

/// What one canonical scan over a batch of creation infos did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanOutcome {
  /// Assertions appended to the canonical branch.
  pub extended: usize,

  /// Assertions the oracle could not judge yet; they are neither
  /// agreed nor disagreed and must not be rivaled.
  pub deferred: HashSet<AssertionHash>,
}

pub struct AssertionManager {
  chain: Arc<dyn ChainClient>,
  oracle: Arc<dyn StateOracle>,
  poster: Arc<dyn RivalPoster>,
  params: Arc<ProtocolParams>,
  cancel: CancelToken,
  backoff: Backoff,

  branch: CanonicalBranch,
  pending: VecDeque<AssertionCreationInfo>,

  /// Rival submissions already made, shared and lock-guarded so
  /// concurrent readers stay safe.
  submitted: Arc<Mutex<LruCache<AssertionHash, ()>>>,
  submitted_rivals: u64,

  /// Hashes of newly canonical assertions, delivered best-effort.
  observations: broadcast::Sender<AssertionHash>,
  snapshot_tx: watch::Sender<BranchSnapshot>,

  checkpoint_path: Option<PathBuf>,
}

impl AssertionManager {
  pub fn new(
    chain: Arc<dyn ChainClient>,
    oracle: Arc<dyn StateOracle>,
    poster: Arc<dyn RivalPoster>,
    params: Arc<ProtocolParams>,
    branch: CanonicalBranch,
    checkpoint_path: Option<PathBuf>,
    cancel: CancelToken,
  ) -> Self {
    let backoff = Backoff::new(&params);
    let (observations, _) = broadcast::channel(256);
    let (snapshot_tx, _) = watch::channel(branch.snapshot());
    Self {
      chain,
      oracle,
      poster,
      params,
      cancel,
      backoff,
      branch,
      pending: VecDeque::new(),
      submitted: Arc::new(Mutex::new(LruCache::new(
        NonZeroUsize::new(SUBMITTED_LRU_SIZE).expect("nonzero"),
      ))),
      submitted_rivals: 0,
      observations,
      snapshot_tx,
      checkpoint_path,
    }
  }

  /// Bootstraps the canonical branch at the chain's genesis
  /// assertion, or from a checkpoint when one is present.
  pub async fn bootstrap_branch(
    chain: &Arc<dyn ChainClient>,
    checkpoint_path: Option<&std::path::Path>,
  ) -> Result<CanonicalBranch, ValidatorError> {
    if let Some(path) = checkpoint_path {
      match CanonicalBranch::restore(path) {
        Ok(branch) => return Ok(branch),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("ignoring unusable checkpoint: {e}"),
      }
    }
    let genesis = chain.read_genesis_hash().await?;
    let info = chain.read_assertion(genesis).await?;
    Ok(CanonicalBranch::new(info))
  }

  pub fn branch(&self) -> &CanonicalBranch {
    &self.branch
  }

  pub fn submitted_rivals(&self) -> u64 {
    self.submitted_rivals
  }

  /// Stream of newly canonical assertion hashes. Bounded and
  /// non-blocking on the sending side; slow observers lose the
  /// oldest entries and must tolerate it.
  pub fn observations(&self) -> broadcast::Receiver<AssertionHash> {
    self.observations.subscribe()
  }

  /// Consistent view of the branch tip for readers outside the
  /// manager task.
  pub fn snapshots(&self) -> watch::Receiver<BranchSnapshot> {
    self.snapshot_tx.subscribe()
  }

  /// Filters an assertion-created event down to a hash worth
  /// classifying: drops the zero hash, the genesis assertion and
  /// anything already classified.
  pub fn extract_assertion(
    &self,
    event: &AssertionCreatedEvent,
  ) -> Option<AssertionHash> {
    if event.hash.is_zero() {
      return None;
    }
    if event.hash == self.branch.genesis() {
      return None;
    }
    if self.branch.contains(&event.hash) {
      return None;
    }
    Some(event.hash)
  }

  /// Fetches the creation info of a freshly announced assertion and
  /// queues it for the next sync.
  pub async fn on_assertion_created(
    &mut self,
    event: AssertionCreatedEvent,
  ) -> Result<(), ValidatorError> {
    let Some(hash) = self.extract_assertion(&event) else {
      return Ok(());
    };
    if self.pending.iter().any(|info| info.hash == hash) {
      return Ok(());
    }
    let info = {
      let chain = Arc::clone(&self.chain);
      with_backoff(&self.backoff, &self.cancel, || {
        let chain = Arc::clone(&chain);
        async move { chain.read_assertion(hash).await }
      })
      .await?
    };
    debug!("queued assertion {hash:?} for classification");
    self.pending.push_back(info);
    Ok(())
  }

  /// One classification round over everything queued: extend the
  /// canonical branch as far as the oracle allows, then counter
  /// whatever is provably invalid. Unjudgeable assertions stay
  /// queued.
  pub async fn sync(&mut self) -> Result<(), ValidatorError> {
    if self.pending.is_empty() {
      return Ok(());
    }
    let infos: Vec<_> = self.pending.drain(..).collect();
    let outcome = self.find_canonical_branch(&infos).await?;
    self.respond_to_invalid(&infos, &outcome.deferred).await?;

    // keep what could not be classified: oracle gaps, and orphans
    // whose parent may yet join the branch
    for info in infos {
      let unclassified = !self.branch.contains(&info.hash)
        && !self.branch.contains(&info.parent);
      if unclassified || outcome.deferred.contains(&info.hash) {
        self.pending.push_back(info);
      }
    }

    if outcome.extended > 0 {
      if let Some(path) = &self.checkpoint_path {
        if let Err(e) = self.branch.checkpoint(path) {
          warn!("failed to checkpoint canonical branch: {e}");
        }
      }
    }
    Ok(())
  }

  /// Scans creation infos in parent-to-child order starting at the
  /// current tip, asking the oracle about each frontier candidate.
  /// Agreement advances the tip; disagreement leaves the candidate
  /// for [`Self::respond_to_invalid`]; an oracle gap stops the scan
  /// until a later sync.
  pub async fn find_canonical_branch(
    &mut self,
    infos: &[AssertionCreationInfo],
  ) -> Result<ScanOutcome, ValidatorError> {
    let mut by_parent = infos
      .iter()
      .filter(|info| !self.branch.contains(&info.hash))
      .into_group_map_by(|info| info.parent);
    // deterministic sibling order, oldest first
    for siblings in by_parent.values_mut() {
      siblings.sort_by_key(|info| (info.created_at_block, info.hash));
    }

    let mut outcome = ScanOutcome::default();
    'scan: loop {
      let tip = self.branch.latest_agreed();
      let Some(candidates) = by_parent.get(&tip) else {
        break;
      };

      let mut agreed = Vec::new();
      for info in candidates {
        match self
          .oracle
          .agrees_with_execution_state(&info.after_state)
          .await
        {
          Ok(true) => agreed.push(*info),
          Ok(false) => {}
          Err(OracleError::NoExecutionState(batch)) => {
            // the honest child of this frontier may be the one we
            // cannot see yet, stop here and resume later
            debug!(
              "oracle has no state for batch {batch}, pausing the scan at \
               {:?}",
              info.hash
            );
            outcome.deferred.insert(info.hash);
            break 'scan;
          }
          Err(e) => return Err(e.into()),
        }
      }

      let choice = match agreed.len() {
        0 => break,
        1 => agreed[0],
        n => {
          // must not happen for a correct oracle
          error!(
            "oracle agrees with {n} sibling assertions of {tip:?}, this is \
             a bug in the oracle or the chain"
          );
          match self.params.ambiguity_policy {
            AmbiguityPolicy::Halt => break,
            AmbiguityPolicy::ExtendFirst => {
              warn!("extending with the earliest-created agreed sibling");
              agreed[0]
            }
          }
        }
      };

      self.branch.extend(choice.clone())?;
      outcome.extended += 1;
      info!("canonical branch extended to {:?}", choice.hash);
      // observers may be absent or lagging, both are fine
      let _ = self.observations.send(choice.hash);
      let _ = self.snapshot_tx.send(self.branch.snapshot());
    }
    Ok(outcome)
  }

  /// Posts a rival for every info whose parent is canonical but
  /// which itself is not, skipping deferred assertions and
  /// everything already submitted.
  pub async fn respond_to_invalid(
    &mut self,
    infos: &[AssertionCreationInfo],
    deferred: &HashSet<AssertionHash>,
  ) -> Result<u64, ValidatorError> {
    let mut posted = 0;
    for info in infos {
      if deferred.contains(&info.hash) {
        continue;
      }
      if !self.branch.contains(&info.parent)
        || self.branch.contains(&info.hash)
      {
        continue;
      }
      {
        let mut submitted = self.submitted.lock().expect("lru lock poisoned");
        if submitted.contains(&info.hash) {
          continue;
        }
        drop(submitted);
      }

      match self.poster.post_rival_and_challenge(info).await {
        Ok(ours) => {
          self
            .submitted
            .lock()
            .expect("lru lock poisoned")
            .put(info.hash, ());
          self.submitted_rivals += 1;
          posted += 1;
          info!(
            "countered invalid assertion {:?} with {:?}",
            info.hash, ours.hash
          );
        }
        Err(ValidatorError::Oracle(OracleError::NoExecutionState(batch))) => {
          debug!(
            "cannot compute rival state for batch {batch} yet, deferring"
          );
        }
        Err(e) if e.is_fatal() || e.is_cancelled() => return Err(e),
        Err(e) => {
          // this item is dropped, chain-level retries already
          // happened inside the poster
          warn!("failed to counter assertion {:?}: {e}", info.hash);
        }
      }
    }
    Ok(posted)
  }

  /// Event loop: ingest assertion events and classify them in
  /// batches on a fixed cadence.
  pub async fn run(mut self) -> Result<(), ValidatorError> {
    let mut events = self.chain.subscribe_assertions();
    let mut sync_tick = tokio::time::interval(self.params.poll_interval);
    loop {
      tokio::select! {
        _ = self.cancel.cancelled() => return Err(ValidatorError::Cancelled),
        event = events.recv() => match event {
          Ok(event) => {
            if let Err(e) = self.on_assertion_created(event).await {
              if e.is_fatal() || e.is_cancelled() {
                return Err(e);
              }
              warn!("failed to ingest assertion event: {e}");
            }
          }
          Err(broadcast::error::RecvError::Lagged(missed)) => {
            warn!("assertion event stream lagged by {missed} events");
          }
          Err(broadcast::error::RecvError::Closed) => {
            return Err(ValidatorError::fatal("assertion event stream closed"));
          }
        },
        _ = sync_tick.tick() => {
          if let Err(e) = self.sync().await {
            if e.is_fatal() || e.is_cancelled() {
              return Err(e);
            }
            warn!("assertion sync failed: {e}");
          }
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use {
    super::AssertionManager,
    crate::{
      assertions::{CanonicalBranch, RivalPoster},
      cancel::CancelToken,
      chain::{AssertionCreatedEvent, AssertionCreationInfo, ChainClient},
      config::AmbiguityPolicy,
      error::ValidatorError,
      primitives::Digest,
      test::{
        genesis_info, info, sim_chain, sim_params, ScriptedOracle,
      },
    },
    async_trait::async_trait,
    std::sync::{Arc, Mutex},
  };

  /// Records rivaled assertions instead of talking to a chain.
  #[derive(Default)]
  struct RecordingPoster {
    rivaled: Mutex<Vec<Digest>>,
  }

  #[async_trait]
  impl RivalPoster for RecordingPoster {
    async fn post_rival_and_challenge(
      &self,
      invalid: &AssertionCreationInfo,
    ) -> Result<AssertionCreationInfo, ValidatorError> {
      self.rivaled.lock().unwrap().push(invalid.hash);
      Ok(info(&genesis_info(), 99))
    }
  }

  fn manager(
    oracle: ScriptedOracle,
    poster: Arc<RecordingPoster>,
  ) -> AssertionManager {
    AssertionManager::new(
      sim_chain(),
      Arc::new(oracle),
      poster,
      Arc::new(sim_params()),
      CanonicalBranch::new(genesis_info()),
      None,
      CancelToken::never(),
    )
  }

  /// The six-assertion tree of the canonical-scan scenario:
  /// 1 -> {2, 3}, 2 -> {4, 5}, 4 -> {6, 7}, oracle agrees with
  /// {2, 4, 6} only.
  fn six_assertion_tree() -> Vec<AssertionCreationInfo> {
    let root = genesis_info();
    let a2 = info(&root, 2);
    let a3 = info(&root, 3);
    let a4 = info(&a2, 4);
    let a5 = info(&a2, 5);
    let a6 = info(&a4, 6);
    let a7 = info(&a4, 7);
    vec![a2, a3, a4, a5, a6, a7]
  }

  #[tokio::test]
  async fn canonical_scan_six_assertions() {
    let infos = six_assertion_tree();
    let oracle = ScriptedOracle::agreeing(&[&infos[0], &infos[2], &infos[4]]);
    let poster = Arc::new(RecordingPoster::default());
    let mut manager = manager(oracle, Arc::clone(&poster));
    let mut observations = manager.observations();

    let outcome = manager.find_canonical_branch(&infos).await.unwrap();
    assert_eq!(outcome.extended, 3);
    assert!(outcome.deferred.is_empty());

    // canonical map is {1, 2, 4, 6} with the tip at 6
    assert_eq!(manager.branch().len(), 4);
    assert_eq!(manager.branch().latest_agreed(), infos[4].hash);
    assert!(manager.branch().verify_links());

    // three canonical observations, in branch order
    for expected in [&infos[0], &infos[2], &infos[4]] {
      assert_eq!(observations.try_recv().unwrap(), expected.hash);
    }
    assert!(observations.try_recv().is_err());
  }

  #[tokio::test]
  async fn rivals_posted_for_invalid_children_of_canonical() {
    let infos = six_assertion_tree();
    let oracle = ScriptedOracle::agreeing(&[&infos[0], &infos[2], &infos[4]]);
    let poster = Arc::new(RecordingPoster::default());
    let mut manager = manager(oracle, Arc::clone(&poster));

    let outcome = manager.find_canonical_branch(&infos).await.unwrap();
    let posted = manager
      .respond_to_invalid(&infos, &outcome.deferred)
      .await
      .unwrap();

    // 3 (child of 1) and 5 (child of 2) and 7 (child of 4) are all
    // invalid with canonical parents
    assert_eq!(posted, 3);
    assert_eq!(manager.submitted_rivals(), 3);
    let rivaled = poster.rivaled.lock().unwrap().clone();
    assert!(rivaled.contains(&infos[1].hash));
    assert!(rivaled.contains(&infos[3].hash));
    assert!(rivaled.contains(&infos[5].hash));
  }

  #[tokio::test]
  async fn no_rivals_without_agreed_parent() {
    let root = genesis_info();
    let a2 = info(&root, 2);
    let a4 = info(&a2, 4);
    let oracle = ScriptedOracle::agreeing(&[&a2, &a4]);
    let poster = Arc::new(RecordingPoster::default());
    let mut manager = manager(oracle, Arc::clone(&poster));
    manager
      .find_canonical_branch(&[a2.clone(), a4.clone()])
      .await
      .unwrap();

    // whole stray subtree, no parent on the canonical branch
    let stray_root = info(&info(&root, 200), 400);
    let stray_child = info(&stray_root, 600);
    let posted = manager
      .respond_to_invalid(
        &[stray_root, stray_child],
        &Default::default(),
      )
      .await
      .unwrap();
    assert_eq!(posted, 0);
    assert_eq!(manager.submitted_rivals(), 0);
    assert!(poster.rivaled.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn duplicate_submissions_are_suppressed() {
    let root = genesis_info();
    let bad = info(&root, 3);
    let oracle = ScriptedOracle::agreeing(&[]);
    let poster = Arc::new(RecordingPoster::default());
    let mut manager = manager(oracle, Arc::clone(&poster));

    for _ in 0..3 {
      manager
        .respond_to_invalid(
          std::slice::from_ref(&bad),
          &Default::default(),
        )
        .await
        .unwrap();
    }
    assert_eq!(manager.submitted_rivals(), 1);
    assert_eq!(poster.rivaled.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn oracle_gap_pauses_scan_and_defers_rivaling() {
    let root = genesis_info();
    let a2 = info(&root, 2);
    let a4 = info(&a2, 4);
    let mut oracle = ScriptedOracle::agreeing(&[&a2, &a4]);
    // batch 4 is beyond what the oracle has executed
    oracle.unknown_batch(4);
    let poster = Arc::new(RecordingPoster::default());
    let mut manager = manager(oracle, Arc::clone(&poster));

    let infos = vec![a2.clone(), a4.clone()];
    let outcome = manager.find_canonical_branch(&infos).await.unwrap();
    assert_eq!(outcome.extended, 1);
    assert!(outcome.deferred.contains(&a4.hash));

    // the deferred assertion must not be countered
    let posted = manager
      .respond_to_invalid(&infos, &outcome.deferred)
      .await
      .unwrap();
    assert_eq!(posted, 0);
  }

  #[tokio::test]
  async fn ambiguous_siblings_halt_the_scan() {
    let root = genesis_info();
    let a2 = info(&root, 2);
    let a3 = info(&root, 3);
    let a4 = info(&a2, 4);
    // a broken oracle that agrees with both siblings
    let oracle = ScriptedOracle::agreeing(&[&a2, &a3, &a4]);
    let poster = Arc::new(RecordingPoster::default());
    let mut manager = manager(oracle, Arc::clone(&poster));
    assert_eq!(manager.params.ambiguity_policy, AmbiguityPolicy::Halt);

    let outcome = manager
      .find_canonical_branch(&[a2, a3, a4])
      .await
      .unwrap();
    // refused to extend past the ambiguous point
    assert_eq!(outcome.extended, 0);
    assert_eq!(manager.branch().len(), 1);
  }

  #[tokio::test]
  async fn event_extraction() {
    let oracle = ScriptedOracle::agreeing(&[]);
    let poster = Arc::new(RecordingPoster::default());
    let manager = manager(oracle, poster);

    // zero hash and genesis are ignored
    assert_eq!(
      manager.extract_assertion(&AssertionCreatedEvent {
        hash: Digest::ZERO
      }),
      None
    );
    assert_eq!(
      manager.extract_assertion(&AssertionCreatedEvent {
        hash: manager.branch().genesis()
      }),
      None
    );

    // a real unclassified assertion comes through
    let fresh = info(&genesis_info(), 2);
    assert_eq!(
      manager.extract_assertion(&AssertionCreatedEvent { hash: fresh.hash }),
      Some(fresh.hash)
    );
  }
}
