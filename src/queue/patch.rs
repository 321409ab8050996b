//! Rewriting references to a temporary id once the server assigns a real one.
//!
//! Only whole values are replaced: a path segment, a query value or a JSON
//! string leaf equal to the old id. Strings that merely contain the old id
//! are left alone, so `local-1` never clobbers `local-10`.

use serde_json::Value;

/// Outcome of patching one JSON payload.
#[derive(Debug, Default, PartialEq)]
pub struct BodyPatch {
  pub changed: bool,
  /// First embedded payload that looked like JSON but failed to parse.
  pub integrity_error: Option<String>,
}

/// Replace path segments and query values equal to `old`.
///
/// Returns `None` when nothing matched.
pub fn patch_path(path: &str, old: &str, new: &str) -> Option<String> {
  let (route, query) = match path.split_once('?') {
    Some((route, query)) => (route, Some(query)),
    None => (path, None),
  };

  let mut changed = false;
  let route: Vec<&str> = route
    .split('/')
    .map(|segment| {
      if segment == old {
        changed = true;
        new
      } else {
        segment
      }
    })
    .collect();
  let mut patched = route.join("/");

  if let Some(query) = query {
    let pairs: Vec<String> = query
      .split('&')
      .map(|pair| match pair.split_once('=') {
        Some((name, value)) if value == old => {
          changed = true;
          format!("{}={}", name, new)
        }
        _ => pair.to_string(),
      })
      .collect();
    patched.push('?');
    patched.push_str(&pairs.join("&"));
  }

  changed.then_some(patched)
}

/// Walk `value` and replace every string leaf equal to `old` with `new`.
pub fn patch_body(value: &mut Value, old: &str, new: &str) -> BodyPatch {
  let mut patch = BodyPatch::default();
  walk(value, old, new, &mut patch);
  patch
}

fn walk(value: &mut Value, old: &str, new: &str, patch: &mut BodyPatch) {
  match value {
    Value::String(s) if s.as_str() == old => {
      *s = new.to_string();
      patch.changed = true;
    }
    Value::String(s) if looks_like_json(s) && s.contains(old) => {
      match serde_json::from_str::<Value>(s) {
        Ok(mut embedded) => {
          let mut inner = BodyPatch::default();
          walk(&mut embedded, old, new, &mut inner);
          if inner.changed {
            *s = embedded.to_string();
            patch.changed = true;
          }
          if patch.integrity_error.is_none() {
            patch.integrity_error = inner.integrity_error;
          }
        }
        Err(e) => {
          if patch.integrity_error.is_none() {
            patch.integrity_error = Some(format!("embedded payload is not valid JSON: {}", e));
          }
        }
      }
    }
    Value::Array(items) => {
      for item in items {
        walk(item, old, new, patch);
      }
    }
    Value::Object(map) => {
      for item in map.values_mut() {
        walk(item, old, new, patch);
      }
    }
    _ => {}
  }
}

/// Whether any string leaf of `value` equals `id`.
pub fn references(value: &Value, id: &str) -> bool {
  match value {
    Value::String(s) => s == id,
    Value::Array(items) => items.iter().any(|item| references(item, id)),
    Value::Object(map) => map.values().any(|item| references(item, id)),
    _ => false,
  }
}

fn looks_like_json(s: &str) -> bool {
  let trimmed = s.trim_start();
  trimmed.starts_with('{') || trimmed.starts_with('[')
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_patch_path_segments() {
    assert_eq!(
      patch_path("/orders/local-1/items", "local-1", "srv-9").as_deref(),
      Some("/orders/srv-9/items")
    );
    assert_eq!(patch_path("/orders/local-10", "local-1", "srv-9"), None);
  }

  #[test]
  fn test_patch_path_query_values() {
    assert_eq!(
      patch_path("/invoices?order=local-1&page=2", "local-1", "srv-9").as_deref(),
      Some("/invoices?order=srv-9&page=2")
    );
  }

  #[test]
  fn test_patch_nested_body() {
    let mut body = json!({
      "patient": {"orderRef": "local-1"},
      "lines": [{"order": "local-1"}, {"order": "local-2"}],
      "note": "follow-up for local-1"
    });

    let patch = patch_body(&mut body, "local-1", "srv-9");

    assert!(patch.changed);
    assert_eq!(patch.integrity_error, None);
    assert_eq!(body["patient"]["orderRef"], "srv-9");
    assert_eq!(body["lines"][0]["order"], "srv-9");
    assert_eq!(body["lines"][1]["order"], "local-2");
    assert_eq!(body["note"], "follow-up for local-1");
  }

  #[test]
  fn test_no_substring_false_positive() {
    let mut body = json!({"a": "local-10", "b": "xlocal-1"});
    let patch = patch_body(&mut body, "local-1", "srv-9");
    assert!(!patch.changed);
    assert_eq!(body, json!({"a": "local-10", "b": "xlocal-1"}));
  }

  #[test]
  fn test_embedded_json_string() {
    let mut body = json!({"meta": "{\"order\":\"local-1\"}"});
    let patch = patch_body(&mut body, "local-1", "srv-9");
    assert!(patch.changed);
    let meta: Value = serde_json::from_str(body["meta"].as_str().unwrap()).unwrap();
    assert_eq!(meta["order"], "srv-9");
  }

  #[test]
  fn test_malformed_embedded_json_is_flagged_and_untouched() {
    let mut body = json!({"meta": "{\"order\":\"local-1\"", "id": "local-1"});
    let patch = patch_body(&mut body, "local-1", "srv-9");

    assert!(patch.changed);
    assert!(patch.integrity_error.is_some());
    assert_eq!(body["meta"], "{\"order\":\"local-1\"");
    assert_eq!(body["id"], "srv-9");
  }

  #[test]
  fn test_references() {
    let body = json!({"lines": [{"order": "local-1"}]});
    assert!(references(&body, "local-1"));
    assert!(!references(&body, "local"));
  }
}
