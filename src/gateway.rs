//! Network gateway: decides per call whether to hit the server or work locally.
//!
//! Online calls go straight to the transport. When the host reports offline,
//! or the request fails before any response arrives, writes are applied to
//! the cache optimistically and queued for the processor.

use reqwest::Method;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::clock::unique_id;
use crate::engine::SyncContext;
use crate::error::{Result, SyncError};
use crate::mutation::insert_item;
use crate::queue::{merge_fields, QueuedOperation};
use crate::store::KeyValueStore;
use crate::transport::{ApiRequest, Transport};

pub struct Gateway<S: KeyValueStore, T: Transport> {
  ctx: SyncContext<S, T>,
}

impl<S: KeyValueStore, T: Transport> Gateway<S, T> {
  /// Create a gateway over the shared engine context.
  pub fn new(ctx: SyncContext<S, T>) -> Self {
    Self { ctx }
  }

  /// Whether `id` is a placeholder minted by this client.
  pub fn is_temp_id(&self, id: &str) -> bool {
    id.starts_with(&self.ctx.settings.temp_id_prefix)
  }

  async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
    let mut request = ApiRequest::new(method, path).with_headers(self.ctx.session.headers());
    if let Some(body) = body {
      request = request.with_body(body.clone());
    }
    self.ctx.transport.send(request).await
  }

  /// Send when online. `Ok(None)` means "handle it locally instead".
  async fn try_online(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Option<Value>> {
    if !self.ctx.connectivity.is_online() {
      return Ok(None);
    }
    match self.send(method, path, body).await {
      Ok(value) => Ok(Some(value)),
      Err(e) if e.is_network() => {
        info!(path, error = %e, "request failed before reaching the server, working offline");
        Ok(None)
      }
      Err(e) => Err(e),
    }
  }

  fn cached(&self, cache_key: Option<&str>) -> Option<Value> {
    cache_key.and_then(|key| self.ctx.cache.read(key))
  }

  /// Copy configured profile fields (e.g. currency) into a locally created record.
  fn annotate(&self, record: &mut Value) {
    let settings = &self.ctx.settings;
    let Some(profile_key) = settings.profile_cache_key.as_deref() else {
      return;
    };
    let Some(profile) = self.ctx.cache.read(profile_key) else {
      return;
    };
    let Value::Object(map) = record else {
      return;
    };
    for field in &settings.profile_fields {
      if let Some(value) = profile.get(field) {
        map.entry(field.clone()).or_insert_with(|| value.clone());
      }
    }
  }

  /// Read a resource, falling back to the last cached snapshot when offline.
  ///
  /// Online results include records whose CREATE is still queued, so they do
  /// not vanish from lists until the queue drains.
  pub async fn fetch_resource(&self, path: &str, cache_key: Option<&str>) -> Result<Option<Value>> {
    let Some(mut value) = self.try_online(Method::GET, path, None).await? else {
      debug!(path, "serving cached snapshot");
      return Ok(self.cached(cache_key));
    };

    for mut record in self.ctx.queue.pending_records(cache_key, path) {
      self.annotate(&mut record);
      insert_item(&mut value, &record, self.ctx.applier.list_fields());
    }

    if let Some(key) = cache_key {
      self.ctx.cache.write(key, &value);
    }
    Ok(Some(value))
  }

  /// Create a resource. Offline, returns a local record with a temporary id.
  pub async fn create_resource(&self, path: &str, body: Value, cache_key: Option<&str>) -> Result<Value> {
    if let Some(created) = self.try_online(Method::POST, path, Some(&body)).await? {
      if let Some(key) = cache_key {
        if created.is_object() {
          self.ctx.applier.apply_insert(key, &created);
        }
      }
      return Ok(created);
    }

    let temp_id = unique_id(&self.ctx.settings.temp_id_prefix);
    let op = QueuedOperation::create(path, body, temp_id.clone(), self.ctx.clock.now())
      .with_cache_key(cache_key)
      .with_headers(self.ctx.session.headers());

    let mut record = op
      .local_record()
      .ok_or_else(|| SyncError::Other("queued create has no temporary id".to_string()))?;
    self.annotate(&mut record);

    if let Some(key) = cache_key {
      self.ctx.applier.apply_insert(key, &record);
    }
    self.ctx.queue.enqueue(op);

    debug!(path, %temp_id, "created resource locally");
    Ok(record)
  }

  /// Queue `op` for replay without attempting the network.
  fn defer(&self, op: QueuedOperation) {
    self.ctx.queue.enqueue(op.with_headers(self.ctx.session.headers()));
  }

  /// Update a resource.
  ///
  /// A record that only exists locally has its queued CREATE amended instead
  /// of getting a separate UPDATE. Once that CREATE is on the wire the edit
  /// is queued as an UPDATE of the temporary id, rewritten when the server
  /// id arrives.
  pub async fn update_resource(
    &self,
    path: &str,
    id: &str,
    body: Value,
    cache_key: Option<&str>,
  ) -> Result<Value> {
    if self.is_temp_id(id) && self.ctx.queue.amend_pending_create(id, &body) {
      if let Some(key) = cache_key {
        self.ctx.applier.apply_replace(key, id, &body);
      }
      let mut record = self
        .ctx
        .queue
        .pending_create(id)
        .and_then(|op| op.local_record())
        .unwrap_or_else(|| body.clone());
      self.annotate(&mut record);
      debug!(%id, "amended pending create");
      return Ok(record);
    }

    // The server does not know this id until the in-flight POST returns.
    let behind_create = self.is_temp_id(id) && self.ctx.queue.create_in_flight(id);
    if behind_create {
      debug!(%id, "create in flight, update queued behind it");
    } else if let Some(updated) = self.try_online(Method::PUT, path, Some(&body)).await? {
      if let Some(key) = cache_key {
        let changes = if updated.is_object() { &updated } else { &body };
        self.ctx.applier.apply_replace(key, id, changes);
      }
      return Ok(updated);
    }

    if let Some(key) = cache_key {
      self.ctx.applier.apply_replace(key, id, &body);
    }
    self.defer(QueuedOperation::update(path, id, body.clone(), self.ctx.clock.now()).with_cache_key(cache_key));

    let mut record = json!({ "_id": id });
    merge_fields(&mut record, &body);
    Ok(record)
  }

  /// Delete a resource.
  ///
  /// Deleting a record that only exists locally never touches the network:
  /// the snapshot entry and every queued operation naming it are dropped. If
  /// its CREATE is already on the wire, a DELETE is queued behind it instead.
  pub async fn delete_resource(&self, path: &str, id: &str, cache_key: Option<&str>) -> Result<Value> {
    if self.is_temp_id(id) {
      if let Some(key) = cache_key {
        self.ctx.applier.apply_remove(key, id);
      }
      self.ctx.queue.purge_temp(id);

      if self.ctx.queue.create_in_flight(id) {
        self.defer(QueuedOperation::delete(path, id, self.ctx.clock.now()).with_cache_key(cache_key));
        debug!(%id, "create in flight, delete queued behind it");
        return Ok(json!({ "_id": id, "deleted": true, "queued": true }));
      }
      return Ok(json!({ "_id": id, "deleted": true }));
    }

    if let Some(response) = self.try_online(Method::DELETE, path, None).await? {
      if let Some(key) = cache_key {
        self.ctx.applier.apply_remove(key, id);
      }
      return Ok(response);
    }

    if let Some(key) = cache_key {
      self.ctx.applier.apply_remove(key, id);
    }
    self.defer(QueuedOperation::delete(path, id, self.ctx.clock.now()).with_cache_key(cache_key));
    Ok(json!({ "_id": id, "deleted": true, "queued": true }))
  }
}

#[cfg(test)]
mod tests {
  use crate::error::SyncError;
  use crate::queue::Method as OpMethod;
  use crate::testing::{engine, network_down, ScriptedTransport};
  use reqwest::Method;
  use serde_json::json;

  #[tokio::test]
  async fn test_offline_fetch_serves_cache_or_none() {
    let (engine, _) = engine(ScriptedTransport::ok(json!([])), false);
    assert_eq!(engine.fetch_resource("/orders", Some("orders")).await.unwrap(), None);

    engine.cache().write("orders", &json!([{"_id": "1"}]));
    assert_eq!(
      engine.fetch_resource("/orders", Some("orders")).await.unwrap(),
      Some(json!([{"_id": "1"}]))
    );
    assert_eq!(engine.fetch_resource("/orders", None).await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_online_fetch_persists_response() {
    let transport = ScriptedTransport::ok(json!({"items": [{"_id": "1"}]}));
    let (engine, transport) = engine(transport, true);

    let value = engine.fetch_resource("/orders", Some("orders")).await.unwrap();
    assert_eq!(value, Some(json!({"items": [{"_id": "1"}]})));
    assert_eq!(engine.cache().read("orders"), value);
    assert_eq!(transport.calls()[0].method, Method::GET);
  }

  #[tokio::test]
  async fn test_fetch_network_failure_falls_back_to_cache() {
    let (engine, _) = engine(ScriptedTransport::new(|_| Err(network_down())), true);
    engine.cache().write("orders", &json!(["cached"]));
    assert_eq!(
      engine.fetch_resource("/orders", Some("orders")).await.unwrap(),
      Some(json!(["cached"]))
    );
  }

  #[tokio::test]
  async fn test_merge_on_read_includes_queued_create_once() {
    let (engine, _) = engine(ScriptedTransport::ok(json!({"items": [{"_id": "srv-1"}]})), false);
    let local = engine
      .create_resource("/orders", json!({"total": 40}), Some("orders"))
      .await
      .unwrap();
    let temp_id = local["_id"].as_str().unwrap().to_string();

    engine.connectivity().set_online(true);
    let first = engine.fetch_resource("/orders", Some("orders")).await.unwrap().unwrap();
    let second = engine.fetch_resource("/orders", Some("orders")).await.unwrap().unwrap();

    for value in [first, second] {
      let items = value["items"].as_array().unwrap();
      assert_eq!(items.len(), 2);
      assert_eq!(items.iter().filter(|i| i["_id"] == temp_id.as_str()).count(), 1);
    }
  }

  #[tokio::test]
  async fn test_offline_create_queues_and_annotates() {
    let (engine, transport) = engine(ScriptedTransport::ok(json!({})), false);
    engine.cache().write("profile", &json!({"currency": "CHF", "name": "Optik Muster"}));

    let record = engine
      .create_resource("/patients", json!({"name": "Jane"}), Some("patients"))
      .await
      .unwrap();

    let temp_id = record["_id"].as_str().unwrap();
    assert!(temp_id.starts_with("local-"));
    assert_eq!(record["currency"], "CHF");
    assert!(record.get("name").is_some());
    assert!(transport.calls().is_empty());

    let queued = engine.queue().snapshot();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].method, OpMethod::Create);
    assert_eq!(queued[0].temp_id.as_deref(), Some(temp_id));
    assert_eq!(engine.cache().read("patients").unwrap()[0]["_id"], temp_id);
  }

  #[tokio::test]
  async fn test_create_network_failure_queues_with_captured_headers() {
    let (engine, _) = engine(ScriptedTransport::new(|_| Err(network_down())), true);
    engine.session().set_bearer_token("abc");

    let record = engine.create_resource("/orders", json!({}), None).await.unwrap();
    assert!(record["_id"].as_str().unwrap().starts_with("local-"));

    let queued = engine.queue().snapshot();
    assert_eq!(queued[0].captured_headers["Authorization"], "Bearer abc");
  }

  #[tokio::test]
  async fn test_online_validation_error_is_surfaced() {
    let transport = ScriptedTransport::new(|_| {
      Err(SyncError::Api {
        status: 422,
        body: Some(json!({"error": "missing sphere"})),
      })
    });
    let (engine, _) = engine(transport, true);

    let err = engine
      .create_resource("/prescriptions", json!({}), Some("prescriptions"))
      .await
      .unwrap_err();
    assert!(err.is_validation());
    assert!(engine.queue().is_empty());
    assert_eq!(engine.cache().read("prescriptions"), None);
  }

  #[tokio::test]
  async fn test_update_of_pending_create_amends_it() {
    let (engine, _) = engine(ScriptedTransport::ok(json!({})), false);
    let local = engine
      .create_resource("/orders", json!({"total": 40, "status": "draft"}), Some("orders"))
      .await
      .unwrap();
    let temp_id = local["_id"].as_str().unwrap();

    let updated = engine
      .update_resource(&format!("/orders/{}", temp_id), temp_id, json!({"total": 55}), Some("orders"))
      .await
      .unwrap();

    assert_eq!(updated["total"], 55);
    let queued = engine.queue().snapshot();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].body, json!({"total": 55, "status": "draft"}));
    assert_eq!(engine.cache().read("orders").unwrap()[0]["total"], 55);
  }

  #[tokio::test]
  async fn test_offline_update_of_server_record_queues_update() {
    let (engine, _) = engine(ScriptedTransport::ok(json!({})), false);
    engine.cache().write("orders", &json!([{"_id": "o-5", "total": 1}]));

    engine
      .update_resource("/orders/o-5", "o-5", json!({"total": 2}), Some("orders"))
      .await
      .unwrap();

    let queued = engine.queue().snapshot();
    assert_eq!(queued[0].method, OpMethod::Update);
    assert_eq!(queued[0].real_id.as_deref(), Some("o-5"));
    assert_eq!(engine.cache().read("orders").unwrap()[0]["total"], 2);
  }

  #[tokio::test]
  async fn test_online_update_and_delete() {
    let transport = ScriptedTransport::new(|req| match req.method {
      Method::PUT => Ok(json!({"_id": "o-5", "total": 9, "updatedAt": "now"})),
      _ => Ok(serde_json::Value::Null),
    });
    let (engine, transport) = engine(transport, true);
    engine.cache().write("orders", &json!([{"_id": "o-5", "total": 1}, {"_id": "o-6"}]));

    engine
      .update_resource("/orders/o-5", "o-5", json!({"total": 9}), Some("orders"))
      .await
      .unwrap();
    assert_eq!(engine.cache().read("orders").unwrap()[0]["updatedAt"], "now");

    engine.delete_resource("/orders/o-6", "o-6", Some("orders")).await.unwrap();
    assert_eq!(engine.cache().read("orders").unwrap().as_array().unwrap().len(), 1);
    assert_eq!(transport.calls().len(), 2);
    assert!(engine.queue().is_empty());
  }

  #[tokio::test]
  async fn test_offline_delete_queues_delete() {
    let (engine, _) = engine(ScriptedTransport::ok(json!({})), false);
    engine.cache().write("orders", &json!([{"_id": "o-5"}]));

    let result = engine.delete_resource("/orders/o-5", "o-5", Some("orders")).await.unwrap();
    assert_eq!(result["queued"], true);
    assert_eq!(engine.cache().read("orders"), Some(json!([])));
    assert_eq!(engine.queue().snapshot()[0].method, OpMethod::Delete);
  }

  #[tokio::test]
  async fn test_delete_before_sync_is_local_only() {
    let (engine, transport) = engine(ScriptedTransport::ok(json!({"_id": "srv-1"})), false);
    let local = engine
      .create_resource("/orders", json!({"total": 1}), Some("orders"))
      .await
      .unwrap();
    let temp_id = local["_id"].as_str().unwrap().to_string();
    engine
      .update_resource(&format!("/orders/{}", temp_id), &temp_id, json!({"total": 2}), Some("orders"))
      .await
      .unwrap();

    engine.connectivity().set_online(true);
    engine
      .delete_resource(&format!("/orders/{}", temp_id), &temp_id, Some("orders"))
      .await
      .unwrap();

    assert!(transport.calls().is_empty());
    assert!(engine.queue().is_empty());
    assert_eq!(engine.cache().read("orders"), Some(json!([])));

    let report = engine.drain().await.unwrap();
    assert_eq!(report.processed, 0);
    assert!(transport.calls().is_empty());
  }
}
