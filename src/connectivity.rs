//! Online/offline signal fed by the host environment.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Shared connectivity flag plus a transition feed.
///
/// The host calls `set_online` when the platform reports a change; the queue
/// processor watches transitions to start a drain.
#[derive(Debug, Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  /// Create the flag in the given initial state.
  pub fn new(online: bool) -> Self {
    let (tx, _) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Record the platform's current state; repeated states are ignored.
  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      info!(online, "connectivity changed");
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_transitions_notify_subscribers() {
    let connectivity = Connectivity::new(false);
    let mut rx = connectivity.subscribe();

    connectivity.set_online(true);
    rx.changed().await.unwrap();
    assert!(*rx.borrow_and_update());
    assert!(connectivity.is_online());
  }

  #[test]
  fn test_repeated_state_is_not_a_transition() {
    let connectivity = Connectivity::new(true);
    let rx = connectivity.subscribe();
    connectivity.set_online(true);
    assert!(!rx.has_changed().unwrap());
  }
}
