//! Challenge coordinator.
//!
//! Owns the set of live edge trackers. Edges reference each other
//! by id only, so the registry is a flat id-to-tracker map and
//! parent/child navigation is by lookup, never by ownership.
//!
//! The coordinator routes chain edge events to trackers, spawns a
//! tracker whenever one asks for a new edge to be tracked (its
//! bisection children, or the level-zero edge of a subchallenge it
//! opened), and reaps trackers whose edge reached a terminal state.

use {
  super::tracker::{EdgeTracker, TrackCmd},
  crate::{
    cancel::CancelToken,
    chain::{ChainClient, EdgeEvent},
    config::ProtocolParams,
    error::ValidatorError,
    history::HistoryProvider,
    primitives::{Address, EdgeId},
  },
  std::{collections::HashMap, sync::Arc},
  tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
  },
  tracing::{debug, info, warn},
};

struct TrackerHandle {
  events: mpsc::UnboundedSender<EdgeEvent>,
  task: JoinHandle<Result<(), ValidatorError>>,
}

pub struct ChallengeCoordinator {
  chain: Arc<dyn ChainClient>,
  history: Arc<HistoryProvider>,
  params: Arc<ProtocolParams>,
  staker: Address,
  cancel: CancelToken,

  commands_tx: mpsc::UnboundedSender<TrackCmd>,
  commands_rx: mpsc::UnboundedReceiver<TrackCmd>,

  trackers: HashMap<EdgeId, TrackerHandle>,
}

impl ChallengeCoordinator {
  pub fn new(
    chain: Arc<dyn ChainClient>,
    history: Arc<HistoryProvider>,
    params: Arc<ProtocolParams>,
    staker: Address,
    cancel: CancelToken,
  ) -> Self {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    Self {
      chain,
      history,
      params,
      staker,
      cancel,
      commands_tx,
      commands_rx,
      trackers: HashMap::new(),
    }
  }

  /// Handle through which new level-zero edges are handed over for
  /// tracking, used by the rival poster when it opens a challenge.
  pub fn commands(&self) -> mpsc::UnboundedSender<TrackCmd> {
    self.commands_tx.clone()
  }

  pub async fn run(mut self) -> Result<(), ValidatorError> {
    let mut edge_events = self.chain.subscribe_edges();
    let mut reap = tokio::time::interval(self.params.poll_interval);
    loop {
      tokio::select! {
        _ = self.cancel.cancelled() => {
          info!("coordinator winding down {} trackers", self.trackers.len());
          let tasks: Vec<_> =
            self.trackers.drain().map(|(_, handle)| handle.task).collect();
          let _ = futures::future::join_all(tasks).await;
          return Err(ValidatorError::Cancelled);
        }
        Some(cmd) = self.commands_rx.recv() => self.track(cmd),
        event = edge_events.recv() => match event {
          Ok(event) => self.route(event),
          Err(broadcast::error::RecvError::Lagged(missed)) => {
            // trackers re-read chain truth every tick, missed
            // events only delay them
            warn!("edge event stream lagged by {missed} events");
          }
          Err(broadcast::error::RecvError::Closed) => {
            return Err(ValidatorError::fatal("edge event stream closed"));
          }
        },
        _ = reap.tick() => self.reap(),
      }
    }
  }

  fn track(&mut self, cmd: TrackCmd) {
    if self.trackers.contains_key(&cmd.id) {
      // rivals race to create shared children, tracking twice is
      // not an error
      return;
    }
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let tracker = EdgeTracker::new(
      cmd.id,
      Arc::clone(&self.chain),
      Arc::clone(&self.history),
      Arc::clone(&self.params),
      cmd.ctx,
      cmd.owned,
      self.staker,
      self.cancel.clone(),
      self.commands_tx.clone(),
      events_rx,
    );
    info!("tracking edge {:?}", cmd.id);
    let task = tokio::spawn(tracker.run());
    self.trackers.insert(cmd.id, TrackerHandle {
      events: events_tx,
      task,
    });
  }

  /// Fans an edge event out to every tracker; each tracker decides
  /// for itself whether the event touches its rivalry class.
  fn route(&mut self, event: EdgeEvent) {
    for handle in self.trackers.values() {
      let _ = handle.events.send(event);
    }
  }

  fn reap(&mut self) {
    self.trackers.retain(|id, handle| {
      if handle.task.is_finished() {
        debug!("tracker for edge {id:?} finished");
        false
      } else {
        true
      }
    });
  }
}
