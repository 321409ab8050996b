//! Deferred write operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::unique_id;
use crate::session::Headers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Create,
  Update,
  Delete,
}

impl Method {
  /// Verb used when replaying.
  pub fn http_verb(&self) -> &'static str {
    match self {
      Method::Create => "POST",
      Method::Update => "PUT",
      Method::Delete => "DELETE",
    }
  }
}

/// One write waiting for the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
  /// Identity of the queue entry itself.
  pub op_id: String,
  pub method: Method,
  /// Resource path, without host.
  pub path: String,
  #[serde(default)]
  pub body: Value,
  /// Placeholder id of the record a CREATE will produce.
  #[serde(default)]
  pub temp_id: Option<String>,
  /// Server id targeted by an UPDATE or DELETE.
  #[serde(default)]
  pub real_id: Option<String>,
  #[serde(default)]
  pub cache_key: Option<String>,
  #[serde(default)]
  pub attempts: u32,
  pub next_eligible_at: DateTime<Utc>,
  #[serde(default)]
  pub captured_headers: Headers,
  pub created_at: DateTime<Utc>,
  /// Set when id patching met an embedded payload it could not parse.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub integrity_error: Option<String>,
}

impl QueuedOperation {
  fn new(method: Method, path: impl Into<String>, body: Value, now: DateTime<Utc>) -> Self {
    Self {
      op_id: unique_id("op-"),
      method,
      path: path.into(),
      body,
      temp_id: None,
      real_id: None,
      cache_key: None,
      attempts: 0,
      next_eligible_at: now,
      captured_headers: Headers::new(),
      created_at: now,
      integrity_error: None,
    }
  }

  /// A POST of `body` that will produce the record now known as `temp_id`.
  pub fn create(path: impl Into<String>, body: Value, temp_id: String, now: DateTime<Utc>) -> Self {
    Self {
      temp_id: Some(temp_id),
      ..Self::new(Method::Create, path, body, now)
    }
  }

  /// A PUT of `body` to the record `id`, eligible immediately.
  pub fn update(path: impl Into<String>, id: impl Into<String>, body: Value, now: DateTime<Utc>) -> Self {
    Self {
      real_id: Some(id.into()),
      ..Self::new(Method::Update, path, body, now)
    }
  }

  /// A DELETE of the record `id`, eligible immediately.
  pub fn delete(path: impl Into<String>, id: impl Into<String>, now: DateTime<Utc>) -> Self {
    Self {
      real_id: Some(id.into()),
      ..Self::new(Method::Delete, path, Value::Null, now)
    }
  }

  /// Snapshot the operation's record lives in, if any.
  pub fn with_cache_key(mut self, cache_key: Option<&str>) -> Self {
    self.cache_key = cache_key.map(String::from);
    self
  }

  /// Headers to replay with, captured when the write was made.
  pub fn with_headers(mut self, headers: Headers) -> Self {
    self.captured_headers = headers;
    self
  }

  /// Whether the backoff window has elapsed at `now`.
  pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
    self.next_eligible_at <= now
  }

  pub fn is_create(&self) -> bool {
    self.method == Method::Create
  }

  /// The record a queued CREATE stands for, as readers should see it.
  ///
  /// Mirrors what the gateway returned when the write was accepted offline.
  pub fn local_record(&self) -> Option<Value> {
    let temp_id = self.temp_id.as_ref()?;
    let mut record = match &self.body {
      Value::Object(map) => map.clone(),
      _ => serde_json::Map::new(),
    };
    record.insert("_id".to_string(), Value::String(temp_id.clone()));
    record
      .entry("createdAt")
      .or_insert_with(|| Value::String(self.created_at.to_rfc3339()));
    Some(Value::Object(record))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_wire_format_is_camel_case() {
    let now = Utc::now();
    let op = QueuedOperation::create("/orders", json!({"total": 10}), "local-1".into(), now)
      .with_cache_key(Some("orders"));

    let json = serde_json::to_value(&op).unwrap();
    assert_eq!(json["method"], "CREATE");
    assert_eq!(json["tempId"], "local-1");
    assert_eq!(json["cacheKey"], "orders");
    assert!(json.get("nextEligibleAt").is_some());
    assert!(json.get("integrityError").is_none());

    let back: QueuedOperation = serde_json::from_value(json).unwrap();
    assert_eq!(back, op);
  }

  #[test]
  fn test_local_record_carries_temp_id() {
    let op = QueuedOperation::create("/orders", json!({"total": 10}), "local-7".into(), Utc::now());
    let record = op.local_record().unwrap();
    assert_eq!(record["_id"], "local-7");
    assert_eq!(record["total"], 10);
    assert!(record["createdAt"].is_string());

    let update = QueuedOperation::update("/orders/1", "1", json!({}), Utc::now());
    assert!(update.local_record().is_none());
  }

  #[test]
  fn test_eligibility() {
    let now = Utc::now();
    let mut op = QueuedOperation::delete("/orders/1", "1", now);
    assert!(op.is_eligible(now));
    op.next_eligible_at = now + chrono::Duration::seconds(2);
    assert!(!op.is_eligible(now));
    assert_eq!(op.method.http_verb(), "DELETE");
  }
}
