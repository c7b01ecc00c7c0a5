use {
  crate::{cancel::CancelToken, config::ProtocolParams, error::ChainError},
  rand::Rng,
  std::{future::Future, time::Duration},
  tracing::debug,
};

/// Retry policy for chain calls: a per-attempt timeout plus bounded
/// exponential backoff with jitter.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
  base: Duration,
  max: Duration,
  retries: u32,
  timeout: Duration,
}

impl Backoff {
  pub fn new(params: &ProtocolParams) -> Self {
    Self {
      base: params.backoff.base,
      max: params.backoff.max,
      retries: params.backoff.retries,
      timeout: params.chain_read_timeout,
    }
  }

  /// Delay before retry number `attempt`, doubling from the base
  /// and capped at the maximum, with up to 25% random jitter so a
  /// fleet of trackers does not hammer the RPC endpoint in
  /// lockstep.
  pub fn delay(&self, attempt: u32) -> Duration {
    let exp = self
      .base
      .saturating_mul(1u32 << attempt.min(16))
      .min(self.max);
    let jitter = rand::thread_rng().gen_range(0.0..0.25);
    exp.mul_f64(1.0 + jitter)
  }

  pub fn retries(&self) -> u32 {
    self.retries
  }

  pub fn timeout(&self) -> Duration {
    self.timeout
  }
}

/// Runs a chain operation with the per-attempt timeout, retrying
/// timeouts and transient errors with backoff until the retry
/// budget runs out or cancellation fires.
pub async fn with_backoff<T, F, Fut>(
  backoff: &Backoff,
  cancel: &CancelToken,
  mut op: F,
) -> Result<T, ChainError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T, ChainError>>,
{
  let mut attempt = 0;
  loop {
    if cancel.is_cancelled() {
      return Err(ChainError::Cancelled);
    }
    let outcome = tokio::select! {
      _ = cancel.cancelled() => return Err(ChainError::Cancelled),
      outcome = tokio::time::timeout(backoff.timeout(), op()) => outcome,
    };
    let error = match outcome {
      Ok(Ok(value)) => return Ok(value),
      Ok(Err(e)) => e,
      Err(_elapsed) => ChainError::Timeout(backoff.timeout()),
    };
    if !error.is_retryable() || attempt >= backoff.retries() {
      return Err(error);
    }
    let delay = backoff.delay(attempt);
    attempt += 1;
    debug!("retrying chain call in {delay:?} after: {error}");
    tokio::select! {
      _ = cancel.cancelled() => return Err(ChainError::Cancelled),
      _ = tokio::time::sleep(delay) => {}
    }
  }
}
