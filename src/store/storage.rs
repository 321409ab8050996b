//! Storage backends: SQLite for real use, in-memory for tests and dry runs.

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::traits::KeyValueStore;
use crate::error::{Result, SyncError};

/// Storage kept entirely in memory. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
  entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

fn poisoned<E: std::fmt::Display>(e: E) -> SyncError {
  SyncError::Other(format!("Lock poisoned: {}", e))
}

impl KeyValueStore for MemoryStore {
  fn read(&self, key: &str) -> Result<Option<Value>> {
    let entries = self.entries.lock().map_err(poisoned)?;
    Ok(entries.get(key).cloned())
  }

  fn write(&self, key: &str, value: &Value) -> Result<()> {
    let mut entries = self.entries.lock().map_err(poisoned)?;
    entries.insert(key.to_string(), value.clone());
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    let mut entries = self.entries.lock().map_err(poisoned)?;
    entries.remove(key);
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let entries = self.entries.lock().map_err(poisoned)?;
    Ok(entries.keys().cloned().collect())
  }
}

/// SQLite-based storage. One row per key, value stored as JSON text.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open (or create) the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        SyncError::Config(format!(
          "Failed to create storage directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path)?;
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    tracing::debug!(path = %path.display(), "opened sync store");
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::Config("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("optisync").join("sync.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn.lock().map_err(poisoned)?;
    conn.execute_batch(STORE_SCHEMA)?;
    Ok(())
  }
}

const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl KeyValueStore for SqliteStore {
  fn read(&self, key: &str) -> Result<Option<Value>> {
    let conn = self.conn.lock().map_err(poisoned)?;

    let raw: Option<String> = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;

    match raw {
      Some(text) => Ok(Some(serde_json::from_str(&text)?)),
      None => Ok(None),
    }
  }

  fn write(&self, key: &str, value: &Value) -> Result<()> {
    let text = serde_json::to_string(value)?;
    let conn = self.conn.lock().map_err(poisoned)?;

    conn.execute(
      "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
       VALUES (?, ?, datetime('now'))",
      params![key, text],
    )?;

    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    let conn = self.conn.lock().map_err(poisoned)?;
    conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.conn.lock().map_err(poisoned)?;
    let mut stmt = conn.prepare("SELECT key FROM kv_store ORDER BY key")?;

    let keys = stmt
      .query_map([], |row| row.get::<_, String>(0))?
      .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(keys)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tempfile::TempDir;

  #[test]
  fn test_memory_read_write_delete() {
    let store = MemoryStore::new();
    assert_eq!(store.read("a").unwrap(), None);

    store.write("a", &json!([1, 2])).unwrap();
    assert_eq!(store.read("a").unwrap(), Some(json!([1, 2])));

    store.delete("a").unwrap();
    store.delete("a").unwrap();
    assert_eq!(store.read("a").unwrap(), None);
  }

  #[test]
  fn test_sqlite_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("nested").join("sync.db");

    {
      let store = SqliteStore::open_at(&path).unwrap();
      store
        .write("optisync:orders", &json!({"items": [{"_id": "o1"}]}))
        .unwrap();
      store.write("optisync:profile", &json!({"currency": "EUR"})).unwrap();
    }

    let store = SqliteStore::open_at(&path).unwrap();
    assert_eq!(
      store.read("optisync:orders").unwrap(),
      Some(json!({"items": [{"_id": "o1"}]}))
    );
    assert_eq!(
      store.keys().unwrap(),
      vec!["optisync:orders".to_string(), "optisync:profile".to_string()]
    );
  }

  #[test]
  fn test_sqlite_overwrite_and_delete() {
    let temp_dir = TempDir::new().unwrap();
    let store = SqliteStore::open_at(&temp_dir.path().join("sync.db")).unwrap();

    store.write("k", &json!(1)).unwrap();
    store.write("k", &json!(2)).unwrap();
    assert_eq!(store.read("k").unwrap(), Some(json!(2)));

    store.delete("k").unwrap();
    assert_eq!(store.read("k").unwrap(), None);
    assert!(store.keys().unwrap().is_empty());
  }
}
