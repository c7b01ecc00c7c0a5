//! History commitment provider.
//!
//! Wraps the state oracle with the hashing of machine-hash
//! sequences into merkle commitments and proofs. Driving the VM is
//! expensive, and many edge trackers routinely want the same
//! commitment at the same time (rivals share prefixes, children
//! share their parent's endpoints), so every computation goes
//! through an in-flight deduplication table: at most one concurrent
//! computation per fingerprint, all concurrent callers receive the
//! owner's result.
//!
//! The table deduplicates, it does not memoize: results are not
//! retained once delivered, which keeps memory bounded no matter
//! what an adversary makes us compute. Recomputation policy belongs
//! to the callers.

use {
  super::commitment::{
    self, HistoryCommitment, InclusionProof, PrefixProof,
  },
  crate::{
    error::ValidatorError,
    oracle::{HistoryRequest, StateOracle},
    primitives::Digest,
  },
  dashmap::{mapref::entry::Entry, DashMap},
  std::{future::Future, hash::Hash, sync::Arc},
  tokio::sync::oneshot,
  tracing::trace,
};

type Waiters<V> = Vec<oneshot::Sender<Result<V, ValidatorError>>>;

/// In-flight deduplication table.
///
/// The first caller for a key becomes the owner and runs the
/// computation; callers arriving while it runs register a one-shot
/// waiter channel and suspend. The owner delivers its result
/// (errors included, they are `Clone` for exactly this reason) to
/// every waiter exactly once and clears the entry. The critical
/// section only covers the table insert/lookup/remove, never the
/// computation itself.
pub struct InFlight<K, V> {
  table: DashMap<K, Waiters<V>>,
}

impl<K, V> Default for InFlight<K, V>
where
  K: Eq + Hash,
{
  fn default() -> Self {
    Self {
      table: DashMap::new(),
    }
  }
}

/// Clears the table entry if the owner never completed, releasing
/// waiters with a closed channel instead of leaving them parked
/// forever. Normal completion disarms it by taking the key first.
struct Reservation<'t, K: Eq + Hash, V> {
  table: &'t DashMap<K, Waiters<V>>,
  key: Option<K>,
}

impl<K: Eq + Hash, V> Drop for Reservation<'_, K, V> {
  fn drop(&mut self) {
    if let Some(key) = self.key.take() {
      // dropping the waiter senders closes their channels
      self.table.remove(&key);
    }
  }
}

impl<K, V> InFlight<K, V>
where
  K: Eq + Hash + Clone,
  V: Clone,
{
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of computations currently in flight.
  pub fn len(&self) -> usize {
    self.table.len()
  }

  pub async fn compute<F, Fut>(
    &self,
    key: K,
    f: F,
  ) -> Result<V, ValidatorError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V, ValidatorError>>,
  {
    let waiter = match self.table.entry(key.clone()) {
      Entry::Occupied(mut entry) => {
        let (tx, rx) = oneshot::channel();
        entry.get_mut().push(tx);
        Some(rx)
      }
      Entry::Vacant(entry) => {
        entry.insert(Vec::new());
        None
      }
    };

    if let Some(rx) = waiter {
      trace!("joining in-flight computation");
      // a closed channel means the owner was cancelled or panicked
      // before delivering; the waiter is released to retry
      return rx.await.unwrap_or(Err(ValidatorError::Cancelled));
    }

    let mut reservation = Reservation {
      table: &self.table,
      key: Some(key),
    };

    // the expensive part runs outside any table lock
    let result = f().await;

    if let Some(key) = reservation.key.take() {
      if let Some((_, waiters)) = self.table.remove(&key) {
        for waiter in waiters {
          // a waiter that stopped listening is its own problem
          let _ = waiter.send(result.clone());
        }
      }
    }
    result
  }
}

/// Computes history commitments and prefix/inclusion proofs over
/// machine-hash sequences obtained from the oracle.
pub struct HistoryProvider {
  oracle: Arc<dyn StateOracle>,
  commitments: InFlight<HistoryRequest, HistoryCommitment>,
  prefix_proofs: InFlight<(HistoryRequest, u64), PrefixProof>,
  inclusions: InFlight<(HistoryRequest, u64), InclusionProof>,
}

impl HistoryProvider {
  pub fn new(oracle: Arc<dyn StateOracle>) -> Self {
    Self {
      oracle,
      commitments: InFlight::new(),
      prefix_proofs: InFlight::new(),
      inclusions: InFlight::new(),
    }
  }

  pub fn oracle(&self) -> &Arc<dyn StateOracle> {
    &self.oracle
  }

  async fn leaves(
    &self,
    req: &HistoryRequest,
  ) -> Result<Vec<Digest>, ValidatorError> {
    Ok(self.oracle.machine_hashes(req).await?)
  }

  /// Merkle commitment to the machine hashes of `req`.
  pub async fn commitment(
    &self,
    req: HistoryRequest,
  ) -> Result<HistoryCommitment, ValidatorError> {
    self
      .commitments
      .compute(req.clone(), || async move {
        let leaves = self.leaves(&req).await?;
        commitment::commit(&leaves)
          .map_err(|e| ValidatorError::Proof(e.to_string()))
      })
      .await
  }

  /// Proof that the commitment over `req.start..=mid` is a prefix
  /// of the commitment over the full request range.
  pub async fn prefix_proof(
    &self,
    req: HistoryRequest,
    mid: u64,
  ) -> Result<PrefixProof, ValidatorError> {
    self
      .prefix_proofs
      .compute((req.clone(), mid), || async move {
        if mid < req.start || mid >= req.end {
          return Err(ValidatorError::Proof(format!(
            "prefix point {mid} outside range {}..{}",
            req.start, req.end
          )));
        }
        let leaves = self.leaves(&req).await?;
        commitment::prefix_proof(&leaves, mid - req.start + 1)
          .map_err(|e| ValidatorError::Proof(e.to_string()))
      })
      .await
  }

  /// Inclusion proof of the machine hash at absolute height
  /// `height` within the commitment over the request range.
  pub async fn inclusion_proof(
    &self,
    req: HistoryRequest,
    height: u64,
  ) -> Result<InclusionProof, ValidatorError> {
    self
      .inclusions
      .compute((req.clone(), height), || async move {
        if height < req.start || height > req.end {
          return Err(ValidatorError::Proof(format!(
            "height {height} outside range {}..{}",
            req.start, req.end
          )));
        }
        let leaves = self.leaves(&req).await?;
        commitment::inclusion_proof(&leaves, height - req.start)
          .map_err(|e| ValidatorError::Proof(e.to_string()))
      })
      .await
  }

  /// Everything needed to settle a length-one small-step edge on
  /// chain: the prover artifact for the single instruction plus
  /// inclusion proofs of the before and after hashes in the edge's
  /// history commitment.
  pub async fn one_step_proof(
    &self,
    req: HistoryRequest,
    step: u64,
  ) -> Result<OneStepProof, ValidatorError> {
    let data = self.oracle.one_step_data(&req, step).await?;
    // the endpoints of a length-one edge are prefix commitments up
    // to the step itself, so each hash is the last leaf of its own
    // commitment
    let before = self
      .inclusion_proof(HistoryRequest { end: step, ..req.clone() }, step)
      .await?;
    let after = self
      .inclusion_proof(HistoryRequest { end: step + 1, ..req }, step + 1)
      .await?;
    Ok(OneStepProof {
      step,
      before_hash: data.before_hash,
      after_hash: data.after_hash,
      machine_proof: data.proof,
      before_inclusion: before,
      after_inclusion: after,
    })
  }
}

/// A one-step proof ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneStepProof {
  pub step: u64,
  pub before_hash: Digest,
  pub after_hash: Digest,

  /// Opaque artifact from the external prover.
  pub machine_proof: Vec<u8>,

  pub before_inclusion: InclusionProof,
  pub after_inclusion: InclusionProof,
}

#[cfg(test)]
mod tests {
  use {
    super::{HistoryProvider, InFlight},
    crate::{
      config::LevelZeroHeights,
      error::ValidatorError,
      history::commitment::{verify_inclusion, verify_prefix_proof},
      oracle::{HistoryRequest, SimOracle, StateOracle},
      primitives::{keccak, Level},
    },
    std::sync::{
      atomic::{AtomicUsize, Ordering},
      Arc,
    },
  };

  #[tokio::test]
  async fn dedup_runs_once_for_concurrent_callers() {
    let inflight = Arc::new(InFlight::<u64, u64>::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(tokio::sync::Notify::new());

    let mut tasks = Vec::new();
    for _ in 0..100 {
      let inflight = Arc::clone(&inflight);
      let runs = Arc::clone(&runs);
      let gate = Arc::clone(&gate);
      tasks.push(tokio::spawn(async move {
        inflight
          .compute(7, || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            gate.notified().await;
            Ok(42)
          })
          .await
      }));
    }

    // let every caller reach the table before the owner finishes
    tokio::task::yield_now().await;
    gate.notify_waiters();

    for task in tasks {
      assert_eq!(task.await.unwrap().unwrap(), 42);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(inflight.len(), 0);
  }

  #[tokio::test]
  async fn errors_reach_every_waiter() {
    let inflight = Arc::new(InFlight::<u64, u64>::new());
    let gate = Arc::new(tokio::sync::Notify::new());

    let mut tasks = Vec::new();
    for _ in 0..10 {
      let inflight = Arc::clone(&inflight);
      let gate = Arc::clone(&gate);
      tasks.push(tokio::spawn(async move {
        inflight
          .compute(1, || {
            let gate = Arc::clone(&gate);
            async move {
              gate.notified().await;
              Err::<u64, _>(ValidatorError::fatal("oracle exploded"))
            }
          })
          .await
      }));
    }

    tokio::task::yield_now().await;
    gate.notify_waiters();

    for task in tasks {
      assert!(task.await.unwrap().unwrap_err().is_fatal());
    }
  }

  #[tokio::test]
  async fn cancelled_owner_releases_waiters() {
    let inflight = Arc::new(InFlight::<u64, u64>::new());

    let owner = tokio::spawn({
      let inflight = Arc::clone(&inflight);
      async move {
        inflight
          .compute(3, || async {
            futures::future::pending::<()>().await;
            Ok(0)
          })
          .await
      }
    });
    tokio::task::yield_now().await;

    let waiter = tokio::spawn({
      let inflight = Arc::clone(&inflight);
      async move { inflight.compute(3, || async { Ok(1) }).await }
    });
    tokio::task::yield_now().await;

    owner.abort();
    let result = waiter.await.unwrap();
    assert_eq!(result, Err(ValidatorError::Cancelled));
    assert_eq!(inflight.len(), 0);
  }

  #[tokio::test]
  async fn no_memoization_across_calls() {
    let inflight = InFlight::<u64, u64>::new();
    let runs = AtomicUsize::new(0);
    for _ in 0..3 {
      inflight
        .compute(9, || async {
          runs.fetch_add(1, Ordering::SeqCst);
          Ok(0)
        })
        .await
        .unwrap();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 3);
  }

  fn provider() -> HistoryProvider {
    let heights = LevelZeroHeights {
      block: 8,
      big_step: 8,
      small_step: 8,
    };
    HistoryProvider::new(Arc::new(SimOracle::honest(heights, 1, 4)))
  }

  fn request() -> HistoryRequest {
    HistoryRequest {
      parent_assertion: keccak(&[b"parent"]),
      level: Level::Block,
      origin_heights: vec![],
      start: 0,
      end: 7,
    }
  }

  #[tokio::test]
  async fn proofs_verify_against_commitments() {
    let provider = provider();
    let full = provider.commitment(request()).await.unwrap();

    let mid = 3;
    let prefix = provider
      .commitment(HistoryRequest { end: mid, ..request() })
      .await
      .unwrap();
    let proof = provider.prefix_proof(request(), mid).await.unwrap();
    verify_prefix_proof(&prefix, &full, &proof).unwrap();

    let leaf = provider
      .oracle()
      .machine_hashes(&request())
      .await
      .unwrap()[5];
    let inclusion = provider.inclusion_proof(request(), 5).await.unwrap();
    verify_inclusion(&full, leaf, &inclusion).unwrap();
  }

  #[tokio::test]
  async fn one_step_proof_verifies_against_edge_endpoints() {
    let provider = provider();
    let req = HistoryRequest {
      parent_assertion: keccak(&[b"parent"]),
      level: Level::SmallStep,
      origin_heights: vec![1, 2],
      start: 0,
      end: 7,
    };
    let step = 3;
    let proof = provider.one_step_proof(req.clone(), step).await.unwrap();

    // the chain checks the hashes against the commitments a
    // length-one edge at [step, step + 1] carries
    let start = provider
      .commitment(HistoryRequest { end: step, ..req.clone() })
      .await
      .unwrap();
    let end = provider
      .commitment(HistoryRequest { end: step + 1, ..req })
      .await
      .unwrap();
    verify_inclusion(&start, proof.before_hash, &proof.before_inclusion)
      .unwrap();
    verify_inclusion(&end, proof.after_hash, &proof.after_inclusion).unwrap();
  }
}
