//! Error taxonomy of the validator.
//!
//! Errors carry their handling policy in their kind: transient chain
//! failures are retried with backoff, benign races are treated as
//! success, oracle gaps pause classification until the oracle
//! catches up, and invariant violations are fatal because an honest
//! validator cannot keep playing a game whose state it no longer
//! understands.
//!
//! The variants are `Clone` on purpose: the history commitment
//! provider delivers one computation result to many concurrent
//! waiters, errors included.

use {std::time::Duration, thiserror::Error};

/// Errors surfaced by the chain interface.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChainError {
  #[error("chain read timed out after {0:?}")]
  Timeout(Duration),

  #[error("transient chain error: {0}")]
  Transient(String),

  #[error("not found: {0}")]
  NotFound(String),

  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  /// A rival raced us to create the same edge or child. The move we
  /// wanted is already on chain, which is what we wanted anyway.
  #[error("edge already created by a rival")]
  RivalRace,

  #[error("already confirmed")]
  AlreadyConfirmed,

  #[error("cancelled")]
  Cancelled,
}

impl ChainError {
  /// Retried with bounded exponential backoff.
  pub fn is_retryable(&self) -> bool {
    matches!(self, ChainError::Timeout(_) | ChainError::Transient(_))
  }

  /// Duplicate submissions are idempotent on chain, losing a race
  /// to a rival leaves the chain in the state we wanted.
  pub fn is_benign(&self) -> bool {
    matches!(self, ChainError::RivalRace | ChainError::AlreadyConfirmed)
  }
}

/// Errors surfaced by the layer-2 state oracle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OracleError {
  /// The oracle has not executed this batch yet. The assertion in
  /// question is neither agreed nor disagreed with; classification
  /// resumes on a later event sync.
  #[error("no execution state known for batch {0}")]
  NoExecutionState(u64),

  #[error("oracle failure: {0}")]
  Permanent(String),

  #[error("cancelled")]
  Cancelled,
}

/// Top-level error of validator tasks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidatorError {
  #[error(transparent)]
  Chain(#[from] ChainError),

  #[error(transparent)]
  Oracle(#[from] OracleError),

  #[error("malformed history proof: {0}")]
  Proof(String),

  #[error("cancelled")]
  Cancelled,

  /// An invariant of the protocol was violated. The process must
  /// terminate, an honest validator cannot proceed.
  #[error("invariant violated: {0}")]
  Fatal(String),
}

impl ValidatorError {
  pub fn fatal(msg: impl Into<String>) -> Self {
    ValidatorError::Fatal(msg.into())
  }

  pub fn is_fatal(&self) -> bool {
    matches!(self, ValidatorError::Fatal(_))
  }

  pub fn is_cancelled(&self) -> bool {
    matches!(
      self,
      ValidatorError::Cancelled
        | ValidatorError::Chain(ChainError::Cancelled)
        | ValidatorError::Oracle(OracleError::Cancelled)
    )
  }
}
