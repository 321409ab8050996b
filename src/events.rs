//! In-process notifications about queue state.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::queue::QueuedOperation;

/// Why an operation left the queue without succeeding, or was flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
  /// Transient failures exhausted the retry ceiling.
  Exhausted,
  /// The server rejected the payload (4xx).
  Validation,
  /// The server refused the captured credentials.
  Unauthorized,
  /// Dropped before sending because a whitelist rule failed.
  Rejected,
  /// Kept in the queue, but an embedded payload could not be rewritten.
  Integrity,
  /// Local failure unrelated to the server.
  Fatal,
}

/// One entry of a drain report's `errors`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationFailure {
  pub kind: FailureKind,
  pub message: String,
  pub status: Option<u16>,
  pub operation: QueuedOperation,
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DrainReport {
  pub processed: usize,
  pub remaining: usize,
  pub errors: Vec<OperationFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "detail", rename_all = "kebab-case")]
pub enum SyncEvent {
  QueueUpdated { queue: Vec<QueuedOperation> },
  QueueProcessed(DrainReport),
}

/// Fire-and-forget event fan-out.
///
/// Publishing never blocks and never fails: with no subscribers the event is
/// discarded, and slow subscribers observe `Lagged` on their own receiver.
#[derive(Debug, Clone)]
pub struct EventBus {
  tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
  pub fn new(capacity: usize) -> Self {
    let (tx, _) = broadcast::channel(capacity);
    Self { tx }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.tx.subscribe()
  }

  pub fn publish(&self, event: SyncEvent) {
    // Err only means nobody is listening.
    let _ = self.tx.send(event);
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new(64)
  }
}
