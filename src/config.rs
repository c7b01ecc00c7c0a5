use {
  crate::{error::ValidatorError, primitives::Level},
  serde::{Deserialize, Serialize},
  std::{path::Path, time::Duration},
};

/// Length of a level-zero edge at each challenge level. A level-zero
/// block edge commits to `block` layer-2 blocks, each of which
/// expands into `big_step` steps at the next level down, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelZeroHeights {
  pub block: u64,
  pub big_step: u64,
  pub small_step: u64,
}

/// Constants the rollup contract reports about itself. The local
/// [`ProtocolParams`] must match them exactly, a validator playing
/// by different rules than the chain would lose every challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConstants {
  pub level_zero_heights: LevelZeroHeights,
  pub num_big_step_levels: u8,
  pub challenge_period_blocks: u64,
  pub confirm_period_blocks: u64,
}

/// What to do when the oracle agrees with two sibling assertions.
///
/// This must not happen for a correct oracle, so it is treated as a
/// bug symptom: the default refuses to extend the canonical branch
/// past the ambiguous point and raises a loud alarm. `ExtendFirst`
/// keeps the validator going by picking the earlier-created sibling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AmbiguityPolicy {
  Halt,
  ExtendFirst,
}

impl Default for AmbiguityPolicy {
  fn default() -> Self {
    AmbiguityPolicy::Halt
  }
}

/// Retry policy for transient chain errors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffParams {
  /// Delay before the first retry, doubled on each attempt.
  #[serde(with = "humantime_serde", default = "default_backoff_base")]
  pub base: Duration,

  /// Upper bound on a single delay.
  #[serde(with = "humantime_serde", default = "default_backoff_max")]
  pub max: Duration,

  /// Retries before the error is handed to the caller.
  #[serde(default = "default_backoff_retries")]
  pub retries: u32,
}

impl Default for BackoffParams {
  fn default() -> Self {
    Self {
      base: default_backoff_base(),
      max: default_backoff_max(),
      retries: default_backoff_retries(),
    }
  }
}

fn default_backoff_base() -> Duration {
  Duration::from_millis(250)
}

fn default_backoff_max() -> Duration {
  Duration::from_secs(30)
}

fn default_backoff_retries() -> u32 {
  8
}

fn default_chain_read_timeout() -> Duration {
  Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
  Duration::from_secs(2)
}

/// Validator configuration, read from a JSON file at startup and
/// validated against the constants the chain reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolParams {
  pub level_zero_heights: LevelZeroHeights,

  /// Number of big-step levels between the block and small-step
  /// levels.
  pub num_big_step_levels: u8,

  /// Cumulative unrivaled blocks an edge needs before it can be
  /// confirmed by time.
  pub challenge_period_blocks: u64,

  /// Blocks before a pending assertion can be confirmed.
  pub confirm_period_blocks: u64,

  /// Timeout applied to individual chain reads.
  #[serde(with = "humantime_serde", default = "default_chain_read_timeout")]
  pub chain_read_timeout: Duration,

  /// How often idle trackers re-examine chain state.
  #[serde(with = "humantime_serde", default = "default_poll_interval")]
  pub poll_interval: Duration,

  #[serde(default)]
  pub backoff: BackoffParams,

  #[serde(default)]
  pub ambiguity_policy: AmbiguityPolicy,
}

impl ProtocolParams {
  /// Reads the configuration from its JSON serialized form at the
  /// path provided by the user.
  pub fn load(path: &Path) -> Result<Self, std::io::Error> {
    let json = std::fs::read_to_string(path)?;
    let params: ProtocolParams =
      serde_json::from_str(&json).map_err(std::io::Error::from)?;
    Ok(params)
  }

  pub fn level_zero_height(&self, level: Level) -> u64 {
    match level {
      Level::Block => self.level_zero_heights.block,
      Level::BigStep(_) => self.level_zero_heights.big_step,
      Level::SmallStep => self.level_zero_heights.small_step,
    }
  }

  /// Compares the local configuration with the chain's reported
  /// constants. A mismatch is fatal.
  pub fn validate_against(
    &self,
    chain: &ChainConstants,
  ) -> Result<(), ValidatorError> {
    let local = ChainConstants {
      level_zero_heights: self.level_zero_heights,
      num_big_step_levels: self.num_big_step_levels,
      challenge_period_blocks: self.challenge_period_blocks,
      confirm_period_blocks: self.confirm_period_blocks,
    };
    if &local != chain {
      return Err(ValidatorError::fatal(format!(
        "protocol constants mismatch: configured {local:?}, chain reports \
         {chain:?}"
      )));
    }
    Ok(())
  }
}
