//! Snapshot cache: logical keys mapped onto the durable store.

use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use super::keys::KeySpace;
use super::traits::KeyValueStore;
use crate::session::Session;

/// Last-known JSON snapshot per resource collection.
///
/// Reads prefer the per-user variant of a key; writes go to every variant so
/// readers using either convention see the same data. Storage failures are
/// logged and swallowed: the cache is a best-effort mirror.
pub struct SnapshotCache<S: KeyValueStore> {
  storage: Arc<S>,
  keys: KeySpace,
  session: Session,
}

impl<S: KeyValueStore> SnapshotCache<S> {
  pub fn new(storage: Arc<S>, keys: KeySpace, session: Session) -> Self {
    Self {
      storage,
      keys,
      session,
    }
  }

  fn variants(&self, key: &str) -> Vec<String> {
    let identity = self.session.identity();
    self.keys.variants(key, identity.as_deref())
  }

  fn read_raw(&self, storage_key: &str) -> Option<Value> {
    match self.storage.read(storage_key) {
      Ok(value) => value,
      Err(e) => {
        warn!(key = storage_key, error = %e, "cache read failed");
        None
      }
    }
  }

  fn write_raw(&self, storage_key: &str, value: &Value) {
    if let Err(e) = self.storage.write(storage_key, value) {
      warn!(key = storage_key, error = %e, "cache write failed");
    }
  }

  /// Last snapshot stored for `key`, or `None`.
  pub fn read(&self, key: &str) -> Option<Value> {
    self
      .variants(key)
      .iter()
      .find_map(|storage_key| self.read_raw(storage_key))
  }

  /// Overwrite the snapshot for `key`.
  pub fn write(&self, key: &str, value: &Value) {
    for storage_key in self.variants(key) {
      self.write_raw(&storage_key, value);
    }
  }

  pub fn delete(&self, key: &str) {
    for storage_key in self.variants(key) {
      if let Err(e) = self.storage.delete(&storage_key) {
        warn!(key = %storage_key, error = %e, "cache delete failed");
      }
    }
  }

  /// Read-modify-write every variant of `key`.
  ///
  /// `apply` returns whether it changed the value; unchanged variants are not
  /// rewritten.
  pub fn update<F>(&self, key: &str, mut apply: F)
  where
    F: FnMut(&mut Option<Value>) -> bool,
  {
    for storage_key in self.variants(key) {
      let mut current = self.read_raw(&storage_key);
      if apply(&mut current) {
        match current {
          Some(value) => self.write_raw(&storage_key, &value),
          None => {
            if let Err(e) = self.storage.delete(&storage_key) {
              warn!(key = %storage_key, error = %e, "cache delete failed");
            }
          }
        }
      }
    }
  }

  /// Logical keys currently stored under this cache's prefix.
  pub fn keys(&self) -> Vec<String> {
    let prefix = format!("{}:", self.keys.prefix());
    match self.storage.keys() {
      Ok(keys) => keys
        .into_iter()
        .filter_map(|k| k.strip_prefix(&prefix).map(String::from))
        .collect(),
      Err(e) => {
        warn!(error = %e, "listing cache keys failed");
        Vec::new()
      }
    }
  }
}

impl<S: KeyValueStore> Clone for SnapshotCache<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      keys: self.keys.clone(),
      session: self.session.clone(),
    }
  }
}
