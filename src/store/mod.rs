//! Persistent cache store.
//!
//! This module provides the durable half of the engine:
//! - A `KeyValueStore` contract with SQLite and in-memory backends
//! - Key namespacing, including per-user variants keyed by an identity hash
//! - `SnapshotCache`, the best-effort mirror of the last known server data

mod keys;
mod snapshot;
mod storage;
mod traits;

pub use keys::{user_hash, KeySpace};
pub use snapshot::SnapshotCache;
pub use storage::{MemoryStore, SqliteStore};
pub use traits::KeyValueStore;
