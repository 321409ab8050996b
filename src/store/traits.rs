//! Storage backend contract for the persistent cache and the operation queue.

use serde_json::Value;

use crate::error::Result;

/// Durable key -> JSON storage.
///
/// Values are whole snapshots; there is no partial update and no expiry.
/// Anything written stays authoritative until overwritten or deleted.
pub trait KeyValueStore: Send + Sync {
  /// Read the value stored under `key`, if any.
  fn read(&self, key: &str) -> Result<Option<Value>>;

  /// Store `value` under `key`, replacing what was there.
  fn write(&self, key: &str, value: &Value) -> Result<()>;

  /// Remove `key`. Removing a missing key is not an error.
  fn delete(&self, key: &str) -> Result<()>;

  /// All stored keys, sorted.
  fn keys(&self) -> Result<Vec<String>>;
}
