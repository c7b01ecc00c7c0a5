//! Trusted layer-2 state oracle.
//!
//! The oracle is the validator's source of truth about layer-2
//! execution: it replays batches on the underlying virtual machine
//! and answers what the correct execution state after a batch is,
//! and what the machine hashes along any stretch of the replay are.
//! The validator never executes the VM itself, it only compares the
//! oracle's answers with what stakers assert on chain.

use {
  crate::{
    config::LevelZeroHeights,
    error::OracleError,
    primitives::{
      keccak, AssertionHash, Digest, ExecutionState, Level, MachineStatus,
    },
  },
  async_trait::async_trait,
};

/// Identifies a stretch of machine history, content-addressed.
///
/// `origin_heights` pins the position of the requested level inside
/// the levels above it: entry `j` is the start height of the claimed
/// edge at level index `j`. Together with the parent assertion the
/// dispute descends from, this uniquely fingerprints the
/// computation, which is what the in-flight deduplication in the
/// history provider keys on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HistoryRequest {
  /// The assertion whose post-state the disputed trace starts from.
  /// Rival edges share it, which is exactly why their histories
  /// share a prefix.
  pub parent_assertion: AssertionHash,

  pub level: Level,

  /// Start heights of the claimed edges at every level above
  /// `level`, outermost first. Empty at the block level.
  pub origin_heights: Vec<u64>,

  /// First height covered, inclusive.
  pub start: u64,

  /// Last height covered, inclusive.
  pub end: u64,
}

/// Raw material for a one-step proof, produced by the external
/// prover entry for a single machine instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneStepData {
  pub before_hash: Digest,
  pub after_hash: Digest,
  pub proof: Vec<u8>,
}

#[async_trait]
pub trait StateOracle: Send + Sync {
  /// The correct execution state after consuming `batch` inbox
  /// batches, or [`OracleError::NoExecutionState`] if the oracle
  /// has not executed that far yet.
  async fn execution_state_after_batch(
    &self,
    batch: u64,
  ) -> Result<ExecutionState, OracleError>;

  /// Whether the proposed state matches the oracle's own replay at
  /// the same batch count.
  async fn agrees_with_execution_state(
    &self,
    state: &ExecutionState,
  ) -> Result<bool, OracleError>;

  /// Machine hashes `h_start..=h_end` of the requested stretch of
  /// history. This drives the VM and is the expensive call the
  /// history provider deduplicates.
  async fn machine_hashes(
    &self,
    req: &HistoryRequest,
  ) -> Result<Vec<Digest>, OracleError>;

  /// One-step proof artifact for the machine instruction at
  /// `step` (relative to the request's origin), produced by the
  /// external prover.
  async fn one_step_data(
    &self,
    req: &HistoryRequest,
    step: u64,
  ) -> Result<OneStepData, OracleError>;
}

/// A deliberately wrong view of layer-2 execution, used to script
/// adversaries: identical to the honest replay up to the fault
/// point, divergent after it.
#[derive(Debug, Clone, Copy)]
pub struct Fault {
  /// First batch whose execution state is wrong.
  pub batch: u64,

  /// First machine step (in small-step granularity) whose hash is
  /// wrong.
  pub step: u64,
}

/// Deterministic oracle over a synthetic machine trace.
///
/// Machine hashes are derived by hashing the step counter, so two
/// oracles over the same trace agree everywhere, and an oracle
/// carrying a [`Fault`] agrees exactly up to the fault point. This
/// powers the `--sim` mode of the binary and the scenario tests: the
/// honest validator and the scripted adversary are the same code
/// with different faults.
#[derive(Debug, Clone)]
pub struct SimOracle {
  heights: LevelZeroHeights,
  num_big_step_levels: u8,

  /// Batches executed so far. Queries beyond this return
  /// [`OracleError::NoExecutionState`].
  available_batches: u64,

  /// Step at which the machine halts; later hashes repeat the
  /// final one, mirroring how real traces are padded.
  halt_step: u64,

  fault: Option<Fault>,
}

impl SimOracle {
  pub fn honest(
    heights: LevelZeroHeights,
    num_big_step_levels: u8,
    available_batches: u64,
  ) -> Self {
    let steps_per_block = heights
      .big_step
      .pow(num_big_step_levels as u32)
      .saturating_mul(heights.small_step);
    Self {
      heights,
      num_big_step_levels,
      available_batches,
      halt_step: available_batches
        .saturating_mul(heights.block)
        .saturating_mul(steps_per_block),
      fault: None,
    }
  }

  pub fn faulty(
    heights: LevelZeroHeights,
    num_big_step_levels: u8,
    available_batches: u64,
    fault: Fault,
  ) -> Self {
    Self {
      fault: Some(fault),
      ..Self::honest(heights, num_big_step_levels, available_batches)
    }
  }

  /// Restricts how far this oracle has executed, simulating an
  /// oracle that lags behind the chain.
  pub fn limit_batches(&mut self, available: u64) {
    self.available_batches = available;
  }

  /// The execution state the rollup starts from. Faults never
  /// reach batch zero, both sides of a dispute agree on genesis.
  pub fn genesis_state(&self) -> ExecutionState {
    ExecutionState {
      block_hash: keccak(&[b"l2-block", &0u64.to_be_bytes()]),
      send_root: keccak(&[b"send-root", &0u64.to_be_bytes()]),
      batch: 0,
      pos_in_batch: 0,
      machine_status: MachineStatus::Finished,
    }
  }

  /// Small steps covered by one history step at `level`.
  fn stride(&self, level: Level) -> u64 {
    let n = self.num_big_step_levels as u32;
    match level {
      Level::SmallStep => 1,
      Level::BigStep(k) => self
        .heights
        .big_step
        .pow(n - k as u32)
        .saturating_mul(self.heights.small_step),
      Level::Block => self
        .heights
        .big_step
        .pow(n)
        .saturating_mul(self.heights.small_step),
    }
  }

  /// Absolute small-step position of height 0 of the request.
  fn origin_offset(&self, req: &HistoryRequest) -> u64 {
    req
      .origin_heights
      .iter()
      .enumerate()
      .map(|(j, height)| {
        let level = Level::from_index(j as u8, self.num_big_step_levels)
          .expect("origin height beyond the small-step level");
        height * self.stride(level)
      })
      .sum()
  }

  fn machine_hash(&self, seed: AssertionHash, step: u64) -> Digest {
    if let Some(fault) = self.fault {
      if step >= fault.step {
        return keccak(&[b"machine-faulty", seed.as_bytes(), &step.to_be_bytes()]);
      }
    }
    let step = step.min(self.halt_step);
    keccak(&[b"machine", seed.as_bytes(), &step.to_be_bytes()])
  }

  fn state_at(&self, batch: u64) -> ExecutionState {
    let wrong = matches!(self.fault, Some(f) if batch >= f.batch);
    let tag: &[u8] = if wrong { b"l2-block-faulty" } else { b"l2-block" };
    ExecutionState {
      block_hash: keccak(&[tag, &batch.to_be_bytes()]),
      send_root: keccak(&[b"send-root", &batch.to_be_bytes()]),
      batch,
      pos_in_batch: 0,
      machine_status: MachineStatus::Finished,
    }
  }
}

#[async_trait]
impl StateOracle for SimOracle {
  async fn execution_state_after_batch(
    &self,
    batch: u64,
  ) -> Result<ExecutionState, OracleError> {
    if batch > self.available_batches {
      return Err(OracleError::NoExecutionState(batch));
    }
    Ok(self.state_at(batch))
  }

  async fn agrees_with_execution_state(
    &self,
    state: &ExecutionState,
  ) -> Result<bool, OracleError> {
    let ours = self.execution_state_after_batch(state.batch).await?;
    Ok(ours == *state)
  }

  async fn machine_hashes(
    &self,
    req: &HistoryRequest,
  ) -> Result<Vec<Digest>, OracleError> {
    if req.end < req.start {
      return Err(OracleError::Permanent(format!(
        "inverted history range {}..{}",
        req.start, req.end
      )));
    }
    let offset = self.origin_offset(req);
    let stride = self.stride(req.level);
    Ok(
      (req.start..=req.end)
        .map(|i| self.machine_hash(req.parent_assertion, offset + i * stride))
        .collect(),
    )
  }

  async fn one_step_data(
    &self,
    req: &HistoryRequest,
    step: u64,
  ) -> Result<OneStepData, OracleError> {
    if req.level != Level::SmallStep {
      return Err(OracleError::Permanent(format!(
        "one-step proof requested at the {} level",
        req.level
      )));
    }
    let position = self.origin_offset(req) + step;
    let before_hash = self.machine_hash(req.parent_assertion, position);
    let after_hash = self.machine_hash(req.parent_assertion, position + 1);
    let proof = keccak(&[
      b"one-step",
      req.parent_assertion.as_bytes(),
      &position.to_be_bytes(),
    ]);
    Ok(OneStepData {
      before_hash,
      after_hash,
      proof: proof.as_bytes().to_vec(),
    })
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{Fault, HistoryRequest, SimOracle, StateOracle},
    crate::{config::LevelZeroHeights, primitives::keccak, primitives::Level},
  };

  const HEIGHTS: LevelZeroHeights = LevelZeroHeights {
    block: 8,
    big_step: 8,
    small_step: 8,
  };

  fn request(level: Level, origin_heights: Vec<u64>, end: u64) -> HistoryRequest {
    HistoryRequest {
      parent_assertion: keccak(&[b"parent"]),
      level,
      origin_heights,
      start: 0,
      end,
    }
  }

  #[tokio::test]
  async fn faulty_oracle_diverges_after_fault() {
    let honest = SimOracle::honest(HEIGHTS, 1, 4);
    // fault at small-step 100 = block 1 (64 steps/block), big-step 4
    let faulty =
      SimOracle::faulty(HEIGHTS, 1, 4, Fault { batch: 1, step: 100 });

    let req = request(Level::Block, vec![], 7);
    let good = honest.machine_hashes(&req).await.unwrap();
    let bad = faulty.machine_hashes(&req).await.unwrap();
    assert_eq!(good[0], bad[0]);
    assert_eq!(good[1], bad[1]); // block 1 starts at step 64 < 100
    assert_ne!(good[2], bad[2]); // block 2 starts at step 128

    // descend into block 1: big steps are 8 small steps each
    let req = request(Level::BigStep(1), vec![1], 7);
    let good = honest.machine_hashes(&req).await.unwrap();
    let bad = faulty.machine_hashes(&req).await.unwrap();
    // big step 4 of block 1 starts at 64 + 32 = 96 < 100
    assert_eq!(good[4], bad[4]);
    // big step 5 starts at 104 >= 100
    assert_ne!(good[5], bad[5]);

    // descend into big step 4 of block 1
    let req = request(Level::SmallStep, vec![1, 4], 7);
    let good = honest.machine_hashes(&req).await.unwrap();
    let bad = faulty.machine_hashes(&req).await.unwrap();
    assert_eq!(good[..4], bad[..4]); // steps 96..=99
    assert_ne!(good[4], bad[4]); // step 100, the faulty instruction
  }

  #[tokio::test]
  async fn state_agreement_follows_fault() {
    let honest = SimOracle::honest(HEIGHTS, 1, 4);
    let faulty =
      SimOracle::faulty(HEIGHTS, 1, 4, Fault { batch: 2, step: 128 });

    for batch in 0..2 {
      let claim = faulty.execution_state_after_batch(batch).await.unwrap();
      assert!(honest.agrees_with_execution_state(&claim).await.unwrap());
    }
    let claim = faulty.execution_state_after_batch(2).await.unwrap();
    assert!(!honest.agrees_with_execution_state(&claim).await.unwrap());
  }

  #[tokio::test]
  async fn unknown_batch_is_a_gap() {
    let honest = SimOracle::honest(HEIGHTS, 1, 4);
    assert!(matches!(
      honest.execution_state_after_batch(5).await,
      Err(crate::error::OracleError::NoExecutionState(5))
    ));
  }
}
