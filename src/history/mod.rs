mod commitment;
mod provider;

pub use {
  commitment::{
    commit, inclusion_proof, prefix_proof, verify_inclusion,
    verify_prefix_proof, CommitmentError, HistoryCommitment, InclusionProof,
    MerkleExpansion, PrefixProof,
  },
  provider::{HistoryProvider, InFlight, OneStepProof},
};
