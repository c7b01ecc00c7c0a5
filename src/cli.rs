use {
  crate::{config::ProtocolParams, primitives::Address},
  clap::Parser,
  std::path::PathBuf,
};

#[derive(Debug, Parser)]
#[clap(version, about)]
pub struct CliOpts {
  #[clap(
    long,
    parse(from_os_str),
    help = "path to the protocol constants JSON file"
  )]
  pub config: PathBuf,

  #[clap(long, help = "hex-encoded address this validator stakes from")]
  pub staker: Address,

  #[clap(
    long,
    parse(from_os_str),
    help = "directory for canonical-branch checkpoints"
  )]
  pub data_dir: Option<PathBuf>,

  #[clap(
    short,
    long,
    parse(from_occurrences),
    help = "Use verbose output (-vv very verbose output)"
  )]
  pub verbose: u64,

  #[clap(
    long,
    help = "play a scripted dispute against the built-in chain simulation"
  )]
  pub sim: bool,

  #[clap(
    long,
    default_value = "16",
    help = "blocks per second of the simulated chain"
  )]
  pub sim_block_rate: u64,
}

impl CliOpts {
  /// Retrieves the protocol constants from their JSON serialized
  /// form at the path provided by the user.
  pub fn params(&self) -> Result<ProtocolParams, std::io::Error> {
    ProtocolParams::load(&self.config)
  }

  /// Where the canonical branch is checkpointed between runs, if a
  /// data directory was given.
  pub fn checkpoint_path(&self) -> Option<PathBuf> {
    self
      .data_dir
      .as_ref()
      .map(|dir| dir.join("canonical-branch.bin"))
  }
}
