//! Wiring: builds the shared context and exposes the public CRUD surface.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, SyncConfig};
use crate::connectivity::Connectivity;
use crate::error::Result;
use crate::events::{DrainReport, EventBus, SyncEvent};
use crate::gateway::Gateway;
use crate::mutation::MutationApplier;
use crate::processor::QueueProcessor;
use crate::queue::OperationQueue;
use crate::session::Session;
use crate::store::{KeySpace, KeyValueStore, SnapshotCache, SqliteStore};
use crate::transport::{HttpTransport, Transport};
use crate::validate::{PayloadValidator, WhitelistRule};

/// Everything the gateway and the processor share.
pub struct SyncContext<S: KeyValueStore, T: Transport> {
  pub transport: Arc<T>,
  pub cache: SnapshotCache<S>,
  pub queue: OperationQueue<S>,
  pub applier: MutationApplier<S>,
  pub events: EventBus,
  pub connectivity: Connectivity,
  pub session: Session,
  pub clock: Arc<dyn Clock>,
  pub settings: Arc<SyncConfig>,
  pub validator: Arc<PayloadValidator>,
}

impl<S: KeyValueStore, T: Transport> Clone for SyncContext<S, T> {
  fn clone(&self) -> Self {
    Self {
      transport: Arc::clone(&self.transport),
      cache: self.cache.clone(),
      queue: self.queue.clone(),
      applier: self.applier.clone(),
      events: self.events.clone(),
      connectivity: self.connectivity.clone(),
      session: self.session.clone(),
      clock: Arc::clone(&self.clock),
      settings: Arc::clone(&self.settings),
      validator: Arc::clone(&self.validator),
    }
  }
}

pub struct EngineBuilder<S: KeyValueStore, T: Transport> {
  storage: Arc<S>,
  transport: Arc<T>,
  prefix: String,
  settings: SyncConfig,
  rules: Vec<WhitelistRule>,
  online: bool,
  clock: Arc<dyn Clock>,
  session: Session,
}

impl<S: KeyValueStore, T: Transport> EngineBuilder<S, T> {
  /// Start a builder with default settings, online, on the system clock.
  pub fn new(storage: Arc<S>, transport: Arc<T>) -> Self {
    Self {
      storage,
      transport,
      prefix: "optisync".to_string(),
      settings: SyncConfig::default(),
      rules: Vec::new(),
      online: true,
      clock: Arc::new(SystemClock),
      session: Session::new(),
    }
  }

  /// Namespace for every storage key the engine writes.
  pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
    self.prefix = prefix.into();
    self
  }

  /// Retry, temporary id and list-field settings.
  pub fn settings(mut self, settings: SyncConfig) -> Self {
    self.settings = settings;
    self
  }

  /// Whitelist rules checked before each drain.
  pub fn rules(mut self, rules: Vec<WhitelistRule>) -> Self {
    self.rules = rules;
    self
  }

  /// Initial connectivity state.
  pub fn online(mut self, online: bool) -> Self {
    self.online = online;
    self
  }

  /// Time source for backoff and timestamps.
  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Share an existing session instead of starting an empty one.
  pub fn session(mut self, session: Session) -> Self {
    self.session = session;
    self
  }

  /// Wire the cache, queue, gateway and processor together.
  pub fn build(self) -> SyncEngine<S, T> {
    let keys = KeySpace::new(self.prefix);
    let events = EventBus::default();
    let cache = SnapshotCache::new(Arc::clone(&self.storage), keys.clone(), self.session.clone());
    let queue = OperationQueue::open(Arc::clone(&self.storage), keys.queue(), events.clone());
    let applier = MutationApplier::new(cache.clone(), self.settings.list_fields.clone());

    let ctx = SyncContext {
      transport: self.transport,
      cache,
      queue,
      applier,
      events,
      connectivity: Connectivity::new(self.online),
      session: self.session,
      clock: self.clock,
      settings: Arc::new(self.settings),
      validator: Arc::new(PayloadValidator::new(self.rules)),
    };

    SyncEngine {
      gateway: Gateway::new(ctx.clone()),
      processor: Arc::new(QueueProcessor::new(ctx.clone())),
      ctx,
    }
  }
}

/// The offline-first sync engine.
///
/// CRUD calls go through the gateway, which either talks to the server or
/// records the write locally; queued writes are replayed by the processor.
pub struct SyncEngine<S: KeyValueStore, T: Transport> {
  ctx: SyncContext<S, T>,
  gateway: Gateway<S, T>,
  processor: Arc<QueueProcessor<S, T>>,
}

impl<S: KeyValueStore, T: Transport> SyncEngine<S, T> {
  /// See `EngineBuilder`.
  pub fn builder(storage: Arc<S>, transport: Arc<T>) -> EngineBuilder<S, T> {
    EngineBuilder::new(storage, transport)
  }

  /// Read `path`, falling back to the snapshot under `cache_key` when offline.
  pub async fn fetch_resource(&self, path: &str, cache_key: Option<&str>) -> Result<Option<Value>> {
    self.gateway.fetch_resource(path, cache_key).await
  }

  /// Create a resource, queueing it when the server is unreachable.
  pub async fn create_resource(&self, path: &str, body: Value, cache_key: Option<&str>) -> Result<Value> {
    self.gateway.create_resource(path, body, cache_key).await
  }

  /// Update the resource `id`, queueing the change when the server is unreachable.
  pub async fn update_resource(
    &self,
    path: &str,
    id: &str,
    body: Value,
    cache_key: Option<&str>,
  ) -> Result<Value> {
    self.gateway.update_resource(path, id, body, cache_key).await
  }

  /// Delete the resource `id`, queueing the deletion when the server is unreachable.
  pub async fn delete_resource(&self, path: &str, id: &str, cache_key: Option<&str>) -> Result<Value> {
    self.gateway.delete_resource(path, id, cache_key).await
  }

  /// Run one drain pass now. `None` if offline or a pass is already running.
  pub async fn drain(&self) -> Option<DrainReport> {
    self.processor.drain().await
  }

  /// Receive queue updates and drain reports.
  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.ctx.events.subscribe()
  }

  /// Handle the host uses to report network changes.
  pub fn connectivity(&self) -> &Connectivity {
    &self.ctx.connectivity
  }

  /// Headers and identity applied to outgoing requests.
  pub fn session(&self) -> &Session {
    &self.ctx.session
  }

  /// Pending writes, for inspection.
  pub fn queue(&self) -> &OperationQueue<S> {
    &self.ctx.queue
  }

  /// Cached snapshots, for inspection and seeding.
  pub fn cache(&self) -> &SnapshotCache<S> {
    &self.ctx.cache
  }
}

impl<S, T> SyncEngine<S, T>
where
  S: KeyValueStore + 'static,
  T: Transport + 'static,
{
  /// Drain once now if online, then on every offline -> online transition.
  pub fn start(&self) -> JoinHandle<()> {
    Arc::clone(&self.processor).spawn_auto_drain()
  }
}

impl SyncEngine<SqliteStore, HttpTransport> {
  /// Engine backed by the configured SQLite file and the HTTP API.
  pub fn from_config(config: &Config, online: bool) -> Result<Self> {
    let storage = match &config.storage.path {
      Some(path) => SqliteStore::open_at(path)?,
      None => SqliteStore::open()?,
    };
    let transport = HttpTransport::new(
      &config.api.base_url,
      Duration::from_secs(config.api.timeout_secs),
    )?;

    let session = Session::new();
    if let Some(token) = Config::get_api_token() {
      session.set_bearer_token(&token);
    }
    session.set_identity(Config::get_identity());

    Ok(
      EngineBuilder::new(Arc::new(storage), Arc::new(transport))
        .prefix(config.storage.prefix.clone())
        .settings(config.sync.clone())
        .rules(config.validation.clone())
        .online(online)
        .session(session)
        .build(),
    )
  }
}
