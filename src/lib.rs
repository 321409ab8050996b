//! Offline-first data sync for the optical shop order manager.
//!
//! Reads are served from the server when reachable and from a persisted
//! snapshot cache otherwise. Writes made while offline are applied to the
//! cache right away and replayed, in order, once connectivity returns.

pub mod clock;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod mutation;
pub mod processor;
pub mod queue;
pub mod session;
pub mod store;
pub mod transport;
pub mod validate;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use connectivity::Connectivity;
pub use engine::{EngineBuilder, SyncEngine};
pub use error::{ErrorClass, Result, SyncError};
pub use events::{DrainReport, FailureKind, OperationFailure, SyncEvent};
pub use queue::{Method, QueuedOperation};
pub use session::Session;
pub use store::{KeyValueStore, MemoryStore, SqliteStore};
pub use transport::{ApiRequest, HttpTransport, Transport};
