//! Time source used for backoff scheduling and temporary id generation.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Clock that only moves when told to. Used to step through backoff windows.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  /// Create a clock frozen at `start`.
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  /// Move the clock forward by `by`.
  pub fn advance(&self, by: chrono::Duration) {
    if let Ok(mut now) = self.now.lock() {
      *now += by;
    }
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    self.now.lock().map(|n| *n).unwrap_or_else(|e| *e.into_inner())
  }
}

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Build a session-unique identifier: `prefix` + nanosecond timestamp + sequence.
///
/// The sequence makes two ids minted within the same clock tick distinct.
pub fn unique_id(prefix: &str) -> String {
  let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
  let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
  format!("{}{}-{}", prefix, nanos, seq)
}
