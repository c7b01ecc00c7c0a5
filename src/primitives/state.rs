use {
  super::digest::{keccak, Digest},
  serde::{Deserialize, Serialize},
};

/// Status of the layer-2 machine at a given execution state.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum MachineStatus {
  Running,
  Finished,
  Errored,
}

impl MachineStatus {
  fn tag(&self) -> u8 {
    match self {
      MachineStatus::Running => 0,
      MachineStatus::Finished => 1,
      MachineStatus::Errored => 2,
    }
  }
}

/// A commitment to a single point in layer-2 execution.
///
/// Assertions claim the execution state of the rollup after
/// consuming some number of inbox batches. Two siblings with
/// different after-states represent competing futures of the chain,
/// and at most one of them can be honest.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub struct ExecutionState {
  /// Hash of the layer-2 block this state is at.
  pub block_hash: Digest,

  /// Merkle root of all outgoing (L2 to L1) messages produced
  /// up to this state.
  pub send_root: Digest,

  /// Index of the inbox batch being consumed.
  pub batch: u64,

  /// Position within that batch.
  pub pos_in_batch: u64,

  /// Whether the machine is still running, halted cleanly or
  /// stopped with an error at this point.
  pub machine_status: MachineStatus,
}

impl ExecutionState {
  /// The hash committing to this tuple. This is the leaf of
  /// block-level history commitments.
  pub fn commitment_hash(&self) -> Digest {
    keccak(&[
      self.block_hash.as_bytes(),
      self.send_root.as_bytes(),
      &self.batch.to_be_bytes(),
      &self.pos_in_batch.to_be_bytes(),
      &[self.machine_status.tag()],
    ])
  }
}

#[cfg(test)]
mod tests {
  use {
    super::{ExecutionState, MachineStatus},
    crate::primitives::keccak,
  };

  fn state(batch: u64) -> ExecutionState {
    ExecutionState {
      block_hash: keccak(&[b"block", &batch.to_be_bytes()]),
      send_root: keccak(&[b"send", &batch.to_be_bytes()]),
      batch,
      pos_in_batch: 0,
      machine_status: MachineStatus::Finished,
    }
  }

  #[test]
  fn commitment_binds_every_field() {
    let base = state(3);
    let mut errored = base;
    errored.machine_status = MachineStatus::Errored;
    let mut moved = base;
    moved.pos_in_batch = 7;

    assert_eq!(base.commitment_hash(), state(3).commitment_hash());
    assert_ne!(base.commitment_hash(), state(4).commitment_hash());
    assert_ne!(base.commitment_hash(), errored.commitment_hash());
    assert_ne!(base.commitment_hash(), moved.commitment_hash());
  }
}
