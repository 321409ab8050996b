//! Durable queue of writes waiting for the server.
//!
//! The whole queue is one ordered list, persisted as a single JSON array and
//! rewritten after every mutation. A crash between a mutation and its flush
//! loses at most that mutation.

mod operation;
mod patch;

pub use operation::{Method, QueuedOperation};
pub use patch::{patch_body, patch_path, references, BodyPatch};

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::events::{EventBus, SyncEvent};
use crate::store::KeyValueStore;

/// Ordered, persisted list of `QueuedOperation`s.
///
/// Every method is infallible from the caller's point of view: storage
/// failures are logged and the in-memory list stays authoritative.
pub struct OperationQueue<S: KeyValueStore> {
  storage: Arc<S>,
  storage_key: String,
  ops: Arc<Mutex<Vec<QueuedOperation>>>,
  /// Operation whose network call has been dispatched. Not persisted.
  in_flight: Arc<Mutex<Option<String>>>,
  events: EventBus,
}

/// Marks an operation as dispatched until dropped.
///
/// While it is alive the operation can no longer be amended or purged: the
/// server may already hold its body.
pub struct ReplayGuard {
  in_flight: Arc<Mutex<Option<String>>>,
}

impl Drop for ReplayGuard {
  fn drop(&mut self) {
    *self.in_flight.lock().unwrap_or_else(|e| e.into_inner()) = None;
  }
}

impl<S: KeyValueStore> OperationQueue<S> {
  /// Load the queue persisted under `storage_key`, or start empty.
  pub fn open(storage: Arc<S>, storage_key: impl Into<String>, events: EventBus) -> Self {
    let storage_key = storage_key.into();

    let ops = match storage.read(&storage_key) {
      Ok(Some(value)) => match serde_json::from_value::<Vec<QueuedOperation>>(value) {
        Ok(ops) => ops,
        Err(e) => {
          warn!(key = %storage_key, error = %e, "persisted queue is unreadable, starting empty");
          Vec::new()
        }
      },
      Ok(None) => Vec::new(),
      Err(e) => {
        warn!(key = %storage_key, error = %e, "failed to load queue, starting empty");
        Vec::new()
      }
    };

    debug!(pending = ops.len(), "operation queue loaded");

    Self {
      storage,
      storage_key,
      ops: Arc::new(Mutex::new(ops)),
      in_flight: Arc::new(Mutex::new(None)),
      events,
    }
  }

  fn lock(&self) -> MutexGuard<'_, Vec<QueuedOperation>> {
    self.ops.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn in_flight_id(&self) -> Option<String> {
    self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  /// Mark `op_id` as dispatched for as long as the returned guard lives.
  pub fn replaying(&self, op_id: &str) -> ReplayGuard {
    *self.in_flight.lock().unwrap_or_else(|e| e.into_inner()) = Some(op_id.to_string());
    ReplayGuard {
      in_flight: Arc::clone(&self.in_flight),
    }
  }

  /// Whether the CREATE producing `temp_id` is on the wire right now.
  pub fn create_in_flight(&self, temp_id: &str) -> bool {
    let Some(in_flight) = self.in_flight_id() else {
      return false;
    };
    self
      .lock()
      .iter()
      .any(|op| op.op_id == in_flight && op.is_create() && op.temp_id.as_deref() == Some(temp_id))
  }

  /// Run `f` against the list, then flush and notify if it reports a change.
  fn mutate<R, F>(&self, f: F) -> R
  where
    F: FnOnce(&mut Vec<QueuedOperation>) -> (R, bool),
  {
    let (result, snapshot) = {
      let mut ops = self.lock();
      let (result, changed) = f(&mut ops);
      (result, changed.then(|| ops.clone()))
    };

    if let Some(queue) = snapshot {
      self.flush(&queue);
      self.events.publish(SyncEvent::QueueUpdated { queue });
    }

    result
  }

  fn flush(&self, queue: &[QueuedOperation]) {
    let value = match serde_json::to_value(queue) {
      Ok(value) => value,
      Err(e) => {
        warn!(error = %e, "failed to serialize queue");
        return;
      }
    };
    if let Err(e) = self.storage.write(&self.storage_key, &value) {
      warn!(key = %self.storage_key, error = %e, "failed to persist queue");
    }
  }

  /// Append `op` to the tail.
  pub fn enqueue(&self, op: QueuedOperation) {
    debug!(op = %op.op_id, method = ?op.method, path = %op.path, "enqueue");
    self.mutate(|ops| {
      ops.push(op);
      ((), true)
    })
  }

  /// Operations whose backoff window has elapsed, in queue order.
  pub fn drainable(&self, now: DateTime<Utc>) -> Vec<QueuedOperation> {
    self
      .lock()
      .iter()
      .filter(|op| op.is_eligible(now))
      .cloned()
      .collect()
  }

  /// Swap the whole queue for `queue`.
  pub fn replace(&self, queue: Vec<QueuedOperation>) {
    self.mutate(|ops| {
      *ops = queue;
      ((), true)
    })
  }

  pub fn snapshot(&self) -> Vec<QueuedOperation> {
    self.lock().clone()
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  pub fn get(&self, op_id: &str) -> Option<QueuedOperation> {
    self.lock().iter().find(|op| op.op_id == op_id).cloned()
  }

  pub fn remove(&self, op_id: &str) -> Option<QueuedOperation> {
    self.mutate(|ops| match ops.iter().position(|op| op.op_id == op_id) {
      Some(index) => (Some(ops.remove(index)), true),
      None => (None, false),
    })
  }

  /// Put an updated copy of `op` at the tail, dropping its old position.
  ///
  /// Does nothing if the operation has left the queue in the meantime.
  pub fn move_to_tail(&self, op: QueuedOperation) -> bool {
    self.mutate(|ops| match ops.iter().position(|o| o.op_id == op.op_id) {
      Some(index) => {
        ops.remove(index);
        ops.push(op);
        (true, true)
      }
      None => (false, false),
    })
  }

  /// Drop every operation for which `reject` holds. Returns what was dropped.
  pub fn remove_where<F>(&self, mut reject: F) -> Vec<QueuedOperation>
  where
    F: FnMut(&QueuedOperation) -> bool,
  {
    self.mutate(|ops| {
      let (dropped, kept): (Vec<_>, Vec<_>) = ops.drain(..).partition(|op| reject(op));
      *ops = kept;
      let changed = !dropped.is_empty();
      (dropped, changed)
    })
  }

  /// The queued CREATE that will produce `temp_id`, if still pending.
  pub fn pending_create(&self, temp_id: &str) -> Option<QueuedOperation> {
    self
      .lock()
      .iter()
      .find(|op| op.is_create() && op.temp_id.as_deref() == Some(temp_id))
      .cloned()
  }

  /// Merge `changes` into the body of the pending CREATE for `temp_id`.
  ///
  /// Object fields in `changes` overwrite the queued body's fields; a
  /// non-object `changes` replaces the body outright. A CREATE that is
  /// already in flight is left alone and `false` is returned.
  pub fn amend_pending_create(&self, temp_id: &str, changes: &Value) -> bool {
    let in_flight = self.in_flight_id();
    self.mutate(|ops| {
      let target = ops.iter_mut().find(|op| {
        op.is_create()
          && op.temp_id.as_deref() == Some(temp_id)
          && in_flight.as_deref() != Some(op.op_id.as_str())
      });

      match target {
        Some(op) => {
          merge_fields(&mut op.body, changes);
          (true, true)
        }
        None => (false, false),
      }
    })
  }

  /// Remove the pending CREATE for `temp_id` and every operation referring to it.
  ///
  /// The in-flight operation, if any, is never purged.
  pub fn purge_temp(&self, temp_id: &str) -> Vec<QueuedOperation> {
    let in_flight = self.in_flight_id();
    let purged = self.remove_where(|op| {
      in_flight.as_deref() != Some(op.op_id.as_str())
        && (op.temp_id.as_deref() == Some(temp_id)
        || op.real_id.as_deref() == Some(temp_id)
        || patch_path(&op.path, temp_id, "").is_some()
          || references(&op.body, temp_id))
    });
    debug!(temp_id, purged = purged.len(), "purged temporary resource from queue");
    purged
  }

  /// Rewrite references to `temp_id` across the queue after it resolved to `real_id`.
  ///
  /// `resolved_op` (the CREATE that produced the id) is skipped. Returns the
  /// operations that were flagged because an embedded payload could not be
  /// parsed; those keep their original body.
  pub fn resolve_temp_id(
    &self,
    resolved_op: &str,
    temp_id: &str,
    real_id: &str,
  ) -> Vec<QueuedOperation> {
    self.mutate(|ops| {
      let mut changed = false;
      let mut flagged = Vec::new();

      for op in ops.iter_mut().filter(|op| op.op_id != resolved_op) {
        if let Some(path) = patch_path(&op.path, temp_id, real_id) {
          op.path = path;
          changed = true;
        }

        if op.real_id.as_deref() == Some(temp_id) {
          op.real_id = Some(real_id.to_string());
          changed = true;
        }

        let mut body = op.body.clone();
        let patch = patch_body(&mut body, temp_id, real_id);
        if let Some(reason) = patch.integrity_error {
          warn!(op = %op.op_id, %reason, "could not rewrite queued body, keeping it unpatched");
          op.integrity_error = Some(reason);
          flagged.push(op.clone());
          changed = true;
        } else if patch.changed {
          op.body = body;
          changed = true;
        }
      }

      debug!(temp_id, real_id, "resolved temporary id across queue");
      (flagged, changed)
    })
  }

  /// Local records of queued CREATEs targeting `cache_key` or `path`.
  pub fn pending_records(&self, cache_key: Option<&str>, path: &str) -> Vec<Value> {
    self
      .lock()
      .iter()
      .filter(|op| op.is_create())
      .filter(|op| match (cache_key, op.cache_key.as_deref()) {
        (Some(wanted), Some(key)) if wanted == key => true,
        _ => op.path == path,
      })
      .filter_map(QueuedOperation::local_record)
      .collect()
  }
}

impl<S: KeyValueStore> Clone for OperationQueue<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      storage_key: self.storage_key.clone(),
      ops: Arc::clone(&self.ops),
      in_flight: Arc::clone(&self.in_flight),
      events: self.events.clone(),
    }
  }
}

/// Shallow-merge object `changes` into `target`.
pub(crate) fn merge_fields(target: &mut Value, changes: &Value) {
  match (target, changes) {
    (Value::Object(target), Value::Object(changes)) => {
      for (k, v) in changes {
        target.insert(k.clone(), v.clone());
      }
    }
    (target, changes) => *target = changes.clone(),
  }
}
