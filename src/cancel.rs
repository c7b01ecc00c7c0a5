//! Cooperative cancellation.
//!
//! Every long-running task (the assertion manager, each edge
//! tracker, backoff sleeps, commitment-cache waits) holds a
//! [`CancelToken`] and polls it at its suspension points. Dropping
//! or triggering the [`CancelHandle`] releases them all.

use tokio::sync::watch;

/// Sender half. Owned by the binary runloop; firing it asks every
/// task holding a token to wind down.
pub struct CancelHandle {
  tx: watch::Sender<bool>,
}

impl CancelHandle {
  pub fn cancel(&self) {
    // receivers observe the change, send only fails when every
    // token is already gone
    let _ = self.tx.send(true);
  }
}

/// Receiver half, cheap to clone into every spawned task.
#[derive(Clone)]
pub struct CancelToken {
  rx: watch::Receiver<bool>,
}

impl CancelToken {
  pub fn is_cancelled(&self) -> bool {
    *self.rx.borrow()
  }

  /// Resolves once cancellation is requested. Also resolves if the
  /// handle was dropped without firing, a dead handle means nobody
  /// is left to keep this task alive.
  pub async fn cancelled(&self) {
    let mut rx = self.rx.clone();
    loop {
      if *rx.borrow() {
        return;
      }
      if rx.changed().await.is_err() {
        return;
      }
    }
  }

  /// A token that never fires, for tests and standalone usage.
  pub fn never() -> CancelToken {
    let (tx, rx) = watch::channel(false);
    // leak the sender so the channel stays open forever
    std::mem::forget(tx);
    CancelToken { rx }
  }
}

pub fn channel() -> (CancelHandle, CancelToken) {
  let (tx, rx) = watch::channel(false);
  (CancelHandle { tx }, CancelToken { rx })
}

#[cfg(test)]
mod tests {
  use super::channel;

  #[tokio::test]
  async fn cancel_releases_waiters() {
    let (handle, token) = channel();
    assert!(!token.is_cancelled());

    let waiter = tokio::spawn({
      let token = token.clone();
      async move { token.cancelled().await }
    });

    handle.cancel();
    waiter.await.unwrap();
    assert!(token.is_cancelled());
  }

  #[tokio::test]
  async fn dropped_handle_releases_waiters() {
    let (handle, token) = channel();
    drop(handle);
    token.cancelled().await;
  }
}
