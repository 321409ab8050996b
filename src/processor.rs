//! Queue processor: replays queued writes once the server is reachable.
//!
//! One pass walks the operations that were eligible when it started, one
//! network call at a time. Each attempt ends in success (removed, ids
//! reconciled), a scheduled retry (moved to the tail with exponential
//! backoff) or abandonment (removed and reported).

use chrono::Duration;
use reqwest::Method as HttpMethod;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::SyncContext;
use crate::error::{ErrorClass, SyncError};
use crate::events::{DrainReport, FailureKind, OperationFailure, SyncEvent};
use crate::mutation::item_id;
use crate::queue::{Method, QueuedOperation};
use crate::store::KeyValueStore;
use crate::transport::{ApiRequest, Transport};

/// Keeps `now + backoff` representable however many attempts were made.
const MAX_BACKOFF_SECS: u64 = 365 * 24 * 60 * 60;

pub struct QueueProcessor<S: KeyValueStore, T: Transport> {
  ctx: SyncContext<S, T>,
  /// Held for the duration of a pass; concurrent triggers see it taken.
  draining: Mutex<()>,
}

fn failure(kind: FailureKind, message: impl Into<String>, status: Option<u16>, op: QueuedOperation) -> OperationFailure {
  OperationFailure {
    kind,
    message: message.into(),
    status,
    operation: op,
  }
}

impl<S: KeyValueStore, T: Transport> QueueProcessor<S, T> {
  /// Create an idle processor over the shared engine context.
  pub fn new(ctx: SyncContext<S, T>) -> Self {
    Self {
      ctx,
      draining: Mutex::new(()),
    }
  }

  /// Delay before the next attempt after `attempts` failures.
  pub fn backoff(&self, attempts: u32) -> Duration {
    let secs = self
      .ctx
      .settings
      .backoff_base_secs
      .saturating_mul(2u64.saturating_pow(attempts))
      .min(MAX_BACKOFF_SECS);
    Duration::seconds(secs as i64)
  }

  /// Run one pass over the queue.
  ///
  /// Returns `None` without doing anything when offline or when another pass
  /// is in flight.
  pub async fn drain(&self) -> Option<DrainReport> {
    let Ok(_pass) = self.draining.try_lock() else {
      debug!("drain already in progress");
      return None;
    };
    if !self.ctx.connectivity.is_online() {
      debug!("offline, not draining");
      return None;
    }

    let mut report = DrainReport::default();
    self.reject_invalid(&mut report);

    let batch = self.ctx.queue.drainable(self.ctx.clock.now());
    debug!(eligible = batch.len(), pending = self.ctx.queue.len(), "drain started");

    for queued in batch {
      if !self.ctx.connectivity.is_online() {
        info!("went offline during drain, stopping");
        break;
      }
      // Earlier steps of this pass may have patched or purged it.
      let Some(op) = self.ctx.queue.get(&queued.op_id) else {
        continue;
      };

      let result = {
        let _replay = self.ctx.queue.replaying(&op.op_id);
        self.attempt(&op).await
      };

      match result {
        Ok(response) => {
          self.on_success(op, response, &mut report);
          report.processed += 1;
        }
        Err(e) => self.on_failure(op, e, &mut report),
      }
    }

    report.remaining = self.ctx.queue.len();
    info!(
      processed = report.processed,
      remaining = report.remaining,
      errors = report.errors.len(),
      "drain finished"
    );
    self.ctx.events.publish(SyncEvent::QueueProcessed(report.clone()));
    Some(report)
  }

  /// Drain once now if online, then again on every offline -> online transition.
  pub fn spawn_auto_drain(self: Arc<Self>) -> JoinHandle<()>
  where
    S: 'static,
    T: 'static,
  {
    let mut online = self.ctx.connectivity.subscribe();
    tokio::spawn(async move {
      if *online.borrow_and_update() {
        self.drain().await;
      }
      while online.changed().await.is_ok() {
        if *online.borrow_and_update() {
          self.drain().await;
        }
      }
    })
  }

  /// Drop operations the server is known to refuse, before any round-trip.
  fn reject_invalid(&self, report: &mut DrainReport) {
    let rejected: Vec<(QueuedOperation, String)> = self
      .ctx
      .queue
      .snapshot()
      .into_iter()
      .filter_map(|op| self.ctx.validator.check(&op).err().map(|reason| (op, reason)))
      .collect();

    for (op, reason) in rejected {
      // Purged along with an earlier rejected CREATE.
      if self.ctx.queue.get(&op.op_id).is_none() {
        continue;
      }
      warn!(op = %op.op_id, path = %op.path, %reason, "dropping operation the server would reject");
      self.abandon(op, FailureKind::Rejected, reason, None, report);
    }
  }

  async fn attempt(&self, op: &QueuedOperation) -> Result<Value, SyncError> {
    let method = match op.method {
      Method::Create => HttpMethod::POST,
      Method::Update => HttpMethod::PUT,
      Method::Delete => HttpMethod::DELETE,
    };
    let mut request = ApiRequest::new(method, op.path.clone())
      .with_headers(self.ctx.session.merged_with(&op.captured_headers));
    if op.method != Method::Delete {
      request = request.with_body(op.body.clone());
    }

    debug!(op = %op.op_id, verb = op.method.http_verb(), path = %op.path, attempt = op.attempts + 1, "replaying");
    self.ctx.transport.send(request).await
  }

  fn on_success(&self, op: QueuedOperation, response: Value, report: &mut DrainReport) {
    self.ctx.queue.remove(&op.op_id);
    let applier = &self.ctx.applier;

    match op.method {
      Method::Create => {
        let (Some(temp_id), Some(real_id)) = (op.temp_id.as_deref(), item_id(&response)) else {
          debug!(op = %op.op_id, "create confirmed without a server id");
          return;
        };

        for flagged in self.ctx.queue.resolve_temp_id(&op.op_id, temp_id, &real_id) {
          let reason = flagged.integrity_error.clone().unwrap_or_default();
          report
            .errors
            .push(failure(FailureKind::Integrity, reason, None, flagged));
        }
        if let Some(key) = op.cache_key.as_deref() {
          applier.apply_confirm(key, temp_id, &response);
          // Edits queued while the POST was on the wire are still pending.
          for pending in self.ctx.queue.snapshot() {
            if pending.method == Method::Update
              && pending.real_id.as_deref() == Some(real_id.as_str())
              && pending.cache_key.as_deref() == Some(key)
            {
              applier.apply_replace(key, &real_id, &pending.body);
            }
          }
        }
        debug!(%temp_id, %real_id, "temporary id resolved");
      }
      Method::Update => {
        if let (Some(key), Some(id)) = (op.cache_key.as_deref(), op.real_id.as_deref()) {
          if response.is_object() {
            applier.apply_replace(key, id, &response);
          }
        }
      }
      Method::Delete => {
        if let (Some(key), Some(id)) = (op.cache_key.as_deref(), op.real_id.as_deref()) {
          applier.apply_remove(key, id);
        }
      }
    }
  }

  fn on_failure(&self, mut op: QueuedOperation, error: SyncError, report: &mut DrainReport) {
    let status = error.status();
    let kind = match error.classify() {
      ErrorClass::Transient => {
        op.attempts += 1;
        if op.attempts < self.ctx.settings.max_attempts {
          op.next_eligible_at = self.ctx.clock.now() + self.backoff(op.attempts);
          debug!(
            op = %op.op_id,
            attempts = op.attempts,
            next = %op.next_eligible_at,
            error = %error,
            "replay failed, retry scheduled"
          );
          self.ctx.queue.move_to_tail(op);
          return;
        }
        FailureKind::Exhausted
      }
      ErrorClass::Validation => FailureKind::Validation,
      ErrorClass::Unauthorized => FailureKind::Unauthorized,
      ErrorClass::Fatal => FailureKind::Fatal,
    };

    warn!(op = %op.op_id, path = %op.path, ?kind, error = %error, "abandoning operation");
    self.abandon(op, kind, error.to_string(), status, report);
  }

  /// Remove `op` for good, rolling back what it showed locally.
  ///
  /// An abandoned CREATE takes every operation that depends on its temporary
  /// id with it, transitively; those could only fail against the server.
  fn abandon(
    &self,
    op: QueuedOperation,
    kind: FailureKind,
    message: String,
    status: Option<u16>,
    report: &mut DrainReport,
  ) {
    let mut dependents = Vec::new();

    match (op.method, op.temp_id.clone()) {
      (Method::Create, Some(temp_id)) => {
        let mut pending = vec![(temp_id, op.cache_key.clone())];
        while let Some((temp_id, cache_key)) = pending.pop() {
          if let Some(key) = cache_key.as_deref() {
            self.ctx.applier.apply_remove(key, &temp_id);
          }
          for dependent in self.ctx.queue.purge_temp(&temp_id) {
            if dependent.op_id == op.op_id {
              continue;
            }
            if let (Method::Create, Some(dependent_temp)) = (dependent.method, dependent.temp_id.clone()) {
              pending.push((dependent_temp, dependent.cache_key.clone()));
            }
            let note = format!("depends on abandoned {}", temp_id);
            dependents.push(failure(kind, note, None, dependent));
          }
        }
      }
      _ => {
        self.ctx.queue.remove(&op.op_id);
      }
    }

    report.errors.push(failure(kind, message, status, op));
    report.errors.extend(dependents);
  }
}
