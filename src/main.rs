mod assertions;
mod cancel;
mod challenge;
mod chain;
mod cli;
mod config;
mod error;
mod history;
mod oracle;
mod primitives;
mod validator;

#[cfg(test)]
mod test;

use {
  crate::{
    chain::{ChainClient, InMemChain},
    cli::CliOpts,
    config::{ChainConstants, ProtocolParams},
    oracle::{Fault, SimOracle, StateOracle},
    primitives::{Address, Level},
    validator::Validator,
  },
  clap::Parser,
  std::{sync::Arc, time::Duration},
  tracing::{info, warn, Level as LogLevel},
  tracing_subscriber::{
    filter::filter_fn,
    prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
    Layer,
  },
};

fn print_essentials(opts: &CliOpts, params: &ProtocolParams) {
  info!("Starting Vigil validator");
  info!("Version: {}", env!("CARGO_PKG_VERSION"));
  info!("Staker address: {}", opts.staker);
  info!(
    "Level-zero heights: block {}, big-step {}, small-step {}",
    params.level_zero_heights.block,
    params.level_zero_heights.big_step,
    params.level_zero_heights.small_step
  );
  info!("Big-step levels: {}", params.num_big_step_levels);
  info!("Challenge period: {} blocks", params.challenge_period_blocks);
  if let Some(path) = opts.checkpoint_path() {
    info!("Checkpoint file: {}", path.display());
  }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
  let opts = CliOpts::parse();

  let loglevel = match opts.verbose {
    1 => LogLevel::DEBUG,
    2 => LogLevel::TRACE,
    _ => LogLevel::INFO,
  };
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::fmt::layer()
        .with_filter(filter_fn(move |metadata| metadata.level() <= &loglevel)),
    )
    .init();

  let params = Arc::new(opts.params()?);
  print_essentials(&opts, &params);

  if !opts.sim {
    // the chain transport (RPC, ABI, signing) is provided by the
    // embedding process through the library API
    anyhow::bail!(
      "no chain transport configured in this build; run with --sim to play \
       a scripted dispute against the built-in chain"
    );
  }

  // the simulation pits this validator against a scripted adversary
  // whose oracle corrupts one machine instruction inside batch 1
  let constants = ChainConstants {
    level_zero_heights: params.level_zero_heights,
    num_big_step_levels: params.num_big_step_levels,
    challenge_period_blocks: params.challenge_period_blocks,
    confirm_period_blocks: params.confirm_period_blocks,
  };
  let available_batches = 8;
  let truth = Arc::new(SimOracle::honest(
    params.level_zero_heights,
    params.num_big_step_levels,
    available_batches,
  ));
  let steps_per_block = params
    .level_zero_heights
    .big_step
    .pow(params.num_big_step_levels as u32)
    * params.level_zero_heights.small_step;
  let adversary_oracle = Arc::new(SimOracle::faulty(
    params.level_zero_heights,
    params.num_big_step_levels,
    available_batches,
    Fault {
      batch: 1,
      step: steps_per_block + steps_per_block / 3,
    },
  ));
  let adversary_staker = Address([0xEE; 20]);

  let chain = Arc::new(InMemChain::new(constants, Arc::clone(&truth)));
  let (cancel_handle, cancel_token) = cancel::channel();

  let mut honest = Validator::spawn(
    Arc::clone(&chain) as Arc<dyn ChainClient>,
    Arc::clone(&truth) as Arc<dyn StateOracle>,
    Arc::clone(&params),
    opts.staker,
    opts.checkpoint_path(),
    cancel_token.clone(),
  )
  .await?;
  let adversary = Validator::spawn(
    Arc::clone(&chain) as Arc<dyn ChainClient>,
    Arc::clone(&adversary_oracle) as Arc<dyn StateOracle>,
    Arc::clone(&params),
    adversary_staker,
    None,
    cancel_token,
  )
  .await?;

  // the adversary proposes its invalid assertion on top of genesis
  let genesis = chain.read_genesis_hash().await?;
  let genesis_info = chain.read_assertion(genesis).await?;
  let bad_state = adversary_oracle.execution_state_after_batch(1).await?;
  chain
    .create_assertion(&genesis_info, &bad_state, adversary_staker)
    .await?;
  info!("adversary staked an invalid assertion, the game is on");

  // simulated block clock
  let clock = tokio::spawn({
    let chain = Arc::clone(&chain);
    let block_time =
      Duration::from_millis(1000 / opts.sim_block_rate.max(1));
    async move {
      let mut tick = tokio::time::interval(block_time);
      loop {
        tick.tick().await;
        chain.advance_blocks(1);
      }
    }
  });

  let mut status = tokio::time::interval(Duration::from_secs(2));
  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => {
        info!("shutdown requested");
        break;
      }

      Ok(hash) = honest.observations.recv() => {
        info!("assertion {hash:?} is now canonical");
      }

      _ = status.tick() => {
        let edges = chain.edges();
        let confirmed = edges.iter().filter(|e| e.is_confirmed()).count();
        info!(
          "chain block {}, {} edges ({confirmed} confirmed)",
          chain.latest_block_number().await?,
          edges.len(),
        );

        let won = edges.iter().any(|edge| {
          edge.level == Level::Block
            && edge.staker == Some(opts.staker)
            && edge.is_confirmed()
        });
        if won {
          info!("dispute resolved: the honest branch won");
          break;
        }
      }

      result = &mut honest.manager => {
        warn!("assertion manager exited: {result:?}");
        break;
      }
    }
  }

  clock.abort();
  cancel_handle.cancel();
  let _ = honest.coordinator.await;
  let _ = adversary.manager.await;
  let _ = adversary.coordinator.await;
  Ok(())
}
