//! Test doubles shared by the engine, gateway and processor tests.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::clock::ManualClock;
use crate::engine::SyncEngine;
use crate::error::{Result, SyncError};
use crate::store::MemoryStore;
use crate::transport::{ApiRequest, Transport};
use crate::validate::WhitelistRule;

type Responder = dyn Fn(&ApiRequest) -> Result<Value> + Send + Sync;

/// Transport answering from a closure and recording every request.
pub struct ScriptedTransport {
  respond: Box<Responder>,
  calls: Mutex<Vec<ApiRequest>>,
  gate: Option<Arc<Notify>>,
}

impl ScriptedTransport {
  pub fn new<F>(respond: F) -> Self
  where
    F: Fn(&ApiRequest) -> Result<Value> + Send + Sync + 'static,
  {
    Self {
      respond: Box::new(respond),
      calls: Mutex::new(Vec::new()),
      gate: None,
    }
  }

  /// Answer every request with `value`.
  pub fn ok(value: Value) -> Self {
    Self::new(move |_| Ok(value.clone()))
  }

  /// Hold each request until `gate` is notified.
  pub fn gated(mut self, gate: Arc<Notify>) -> Self {
    self.gate = Some(gate);
    self
  }

  pub fn calls(&self) -> Vec<ApiRequest> {
    self.calls.lock().unwrap().clone()
  }
}

#[async_trait]
impl Transport for ScriptedTransport {
  async fn send(&self, request: ApiRequest) -> Result<Value> {
    self.calls.lock().unwrap().push(request.clone());
    if let Some(gate) = &self.gate {
      gate.notified().await;
    }
    (self.respond)(&request)
  }
}

pub fn network_down() -> SyncError {
  SyncError::Network("connection refused".to_string())
}

pub type TestEngine = SyncEngine<MemoryStore, ScriptedTransport>;

pub fn engine(transport: ScriptedTransport, online: bool) -> (TestEngine, Arc<ScriptedTransport>) {
  let (engine, transport, _) = engine_with_clock(transport, online);
  (engine, transport)
}

/// Engine on a manual clock, for stepping through backoff windows.
pub fn engine_with_clock(
  transport: ScriptedTransport,
  online: bool,
) -> (TestEngine, Arc<ScriptedTransport>, Arc<ManualClock>) {
  let transport = Arc::new(transport);
  let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()));
  let engine = SyncEngine::builder(Arc::new(MemoryStore::new()), Arc::clone(&transport))
    .online(online)
    .clock(clock.clone())
    .build();
  (engine, transport, clock)
}

/// Offline engine enforcing `rules` before replay.
pub fn engine_with_rules(
  transport: ScriptedTransport,
  rules: Vec<WhitelistRule>,
) -> (TestEngine, Arc<ScriptedTransport>) {
  let transport = Arc::new(transport);
  let engine = SyncEngine::builder(Arc::new(MemoryStore::new()), Arc::clone(&transport))
    .online(false)
    .rules(rules)
    .build();
  (engine, transport)
}
