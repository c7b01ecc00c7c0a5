//! Shared test support: deterministic assertion trees, a scriptable
//! oracle, and default sim parameters matching the in-memory chain.


use {
  crate::{
    chain::{AssertionCreationInfo, ChainClient, InMemChain},
    config::{ChainConstants, LevelZeroHeights, ProtocolParams},
    error::OracleError,
    oracle::{HistoryRequest, OneStepData, SimOracle, StateOracle},
    primitives::{
      keccak, Address, Digest, ExecutionState, MachineStatus,
    },
  },
  async_trait::async_trait,
  once_cell::sync::Lazy,
  std::{collections::HashSet, sync::Arc},
};

pub fn sim_constants() -> ChainConstants {
  ChainConstants {
    level_zero_heights: LevelZeroHeights {
      block: 4,
      big_step: 4,
      small_step: 4,
    },
    num_big_step_levels: 1,
    challenge_period_blocks: 10,
    confirm_period_blocks: 5,
  }
}

/// Parameters matching [`sim_constants`], tuned for fast tests.
pub fn sim_params() -> ProtocolParams {
  let constants = sim_constants();
  serde_json::from_str::<ProtocolParams>(&format!(
    r#"{{
      "level_zero_heights":
        {{ "block": {}, "big_step": {}, "small_step": {} }},
      "num_big_step_levels": {},
      "challenge_period_blocks": {},
      "confirm_period_blocks": {},
      "poll_interval": "5ms",
      "backoff": {{ "base": "1ms", "max": "10ms", "retries": 3 }}
    }}"#,
    constants.level_zero_heights.block,
    constants.level_zero_heights.big_step,
    constants.level_zero_heights.small_step,
    constants.num_big_step_levels,
    constants.challenge_period_blocks,
    constants.confirm_period_blocks,
  ))
  .expect("valid sim params")
}

/// An in-memory chain whose one-step verifier follows the honest
/// sim trace.
pub fn sim_chain() -> Arc<dyn ChainClient> {
  let constants = sim_constants();
  let truth = Arc::new(SimOracle::honest(
    constants.level_zero_heights,
    constants.num_big_step_levels,
    4,
  ));
  Arc::new(InMemChain::new(constants, truth))
}

static GENESIS: Lazy<AssertionCreationInfo> =
  Lazy::new(|| AssertionCreationInfo {
    hash: keccak(&[b"test-assertion", &1u64.to_be_bytes()]),
    parent: Digest::ZERO,
    after_state: test_state(1),
    created_at_block: 0,
    staker: Address([7; 20]),
  });

/// Synthetic root assertion for branch and manager tests.
pub fn genesis_info() -> AssertionCreationInfo {
  GENESIS.clone()
}

fn test_state(id: u64) -> ExecutionState {
  ExecutionState {
    block_hash: keccak(&[b"test-block", &id.to_be_bytes()]),
    send_root: keccak(&[b"test-send", &id.to_be_bytes()]),
    batch: id,
    pos_in_batch: 0,
    machine_status: MachineStatus::Finished,
  }
}

/// A child assertion of `parent` with an execution state unique to
/// `id`.
pub fn info(
  parent: &AssertionCreationInfo,
  id: u64,
) -> AssertionCreationInfo {
  AssertionCreationInfo {
    hash: keccak(&[
      b"test-assertion",
      parent.hash.as_bytes(),
      &id.to_be_bytes(),
    ]),
    parent: parent.hash,
    after_state: test_state(id),
    created_at_block: id,
    staker: Address([7; 20]),
  }
}

/// A straight chain of assertions under `root`, one per id.
pub fn info_chain(
  root: &AssertionCreationInfo,
  ids: &[u64],
) -> Vec<AssertionCreationInfo> {
  let mut infos = Vec::with_capacity(ids.len());
  let mut parent = root.clone();
  for id in ids {
    let child = info(&parent, *id);
    parent = child.clone();
    infos.push(child);
  }
  infos
}

/// Oracle scripted with an explicit agreement set, for driving the
/// assertion manager through arbitrary tree shapes.
pub struct ScriptedOracle {
  agrees: HashSet<Digest>,
  unknown_batches: HashSet<u64>,
}

impl ScriptedOracle {
  /// Agrees exactly with the after-states of the given infos.
  pub fn agreeing(infos: &[&AssertionCreationInfo]) -> Self {
    Self {
      agrees: infos
        .iter()
        .map(|info| info.after_state.commitment_hash())
        .collect(),
      unknown_batches: HashSet::new(),
    }
  }

  /// Marks a batch as not yet executed by the oracle.
  pub fn unknown_batch(&mut self, batch: u64) {
    self.unknown_batches.insert(batch);
  }
}

#[async_trait]
impl StateOracle for ScriptedOracle {
  async fn execution_state_after_batch(
    &self,
    batch: u64,
  ) -> Result<ExecutionState, OracleError> {
    if self.unknown_batches.contains(&batch) {
      return Err(OracleError::NoExecutionState(batch));
    }
    Ok(test_state(batch))
  }

  async fn agrees_with_execution_state(
    &self,
    state: &ExecutionState,
  ) -> Result<bool, OracleError> {
    if self.unknown_batches.contains(&state.batch) {
      return Err(OracleError::NoExecutionState(state.batch));
    }
    Ok(self.agrees.contains(&state.commitment_hash()))
  }

  async fn machine_hashes(
    &self,
    _req: &HistoryRequest,
  ) -> Result<Vec<Digest>, OracleError> {
    Err(OracleError::Permanent("machine hashes not scripted".into()))
  }

  async fn one_step_data(
    &self,
    _req: &HistoryRequest,
    _step: u64,
  ) -> Result<OneStepData, OracleError> {
    Err(OracleError::Permanent("one-step data not scripted".into()))
  }
}
