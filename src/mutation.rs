//! Optimistic edits applied to cached snapshots before the server confirms.
//!
//! A snapshot is either a bare list of records or an object holding one or
//! more list-valued fields (`items`, `pending`, `all`, ...). Records are
//! matched by `_id`, falling back to `id`.

use serde_json::Value;
use std::sync::Arc;

use crate::queue::merge_fields;
use crate::store::{KeyValueStore, SnapshotCache};

/// Identifier of a record: `_id` or `id`, string or number.
pub fn item_id(item: &Value) -> Option<String> {
  let raw = item.get("_id").or_else(|| item.get("id"))?;
  match raw {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

fn has_id(item: &Value, id: &str) -> bool {
  item_id(item).as_deref() == Some(id)
}

/// The lists inside `snapshot` that hold records.
fn lists_mut<'a>(snapshot: &'a mut Value, fields: &[String]) -> Vec<&'a mut Vec<Value>> {
  match snapshot {
    Value::Array(items) => vec![items],
    Value::Object(map) => map
      .iter_mut()
      .filter(|(name, _)| fields.iter().any(|f| f == *name))
      .filter_map(|(_, value)| value.as_array_mut())
      .collect(),
    _ => Vec::new(),
  }
}

/// Prepend `item` to the first record list unless its id is already present.
pub fn insert_item(snapshot: &mut Value, item: &Value, fields: &[String]) -> bool {
  if let Some(id) = item_id(item) {
    let present = lists_mut(snapshot, fields)
      .iter()
      .any(|list| list.iter().any(|existing| has_id(existing, &id)));
    if present {
      return false;
    }
  }

  // Insert into the first configured field that holds a list.
  let target = match snapshot {
    Value::Array(items) => Some(items),
    Value::Object(map) => {
      let name = fields
        .iter()
        .find(|f| map.get(f.as_str()).is_some_and(Value::is_array));
      match name {
        Some(name) => map.get_mut(name.as_str()).and_then(Value::as_array_mut),
        None => None,
      }
    }
    _ => None,
  };

  match target {
    Some(list) => {
      list.insert(0, item.clone());
      true
    }
    None => false,
  }
}

/// Drop every record whose id equals `id`, across all record lists.
pub fn remove_item(snapshot: &mut Value, id: &str, fields: &[String]) -> bool {
  let mut removed = false;
  for list in lists_mut(snapshot, fields) {
    let before = list.len();
    list.retain(|item| !has_id(item, id));
    removed |= list.len() != before;
  }
  removed
}

/// Merge `changes` into every record whose id equals `id`.
pub fn merge_item(snapshot: &mut Value, id: &str, changes: &Value, fields: &[String]) -> bool {
  let mut merged = false;
  for list in lists_mut(snapshot, fields) {
    for item in list.iter_mut().filter(|item| has_id(item, id)) {
      merge_fields(item, changes);
      merged = true;
    }
  }
  merged
}

/// Swap the record `old_id` for `record`, leaving exactly one copy of `record`.
///
/// Nothing is inserted when `old_id` is absent: the record was removed
/// locally in the meantime.
pub fn swap_item(snapshot: &mut Value, old_id: &str, record: &Value, fields: &[String]) -> bool {
  let new_id = item_id(record);
  let mut changed = false;
  let mut placed = new_id.as_ref().is_some_and(|new_id| {
    lists_mut(snapshot, fields)
      .iter()
      .any(|list| list.iter().any(|item| has_id(item, new_id)))
  });

  for list in lists_mut(snapshot, fields) {
    let mut kept = Vec::with_capacity(list.len());
    for item in list.drain(..) {
      if has_id(&item, old_id) {
        changed = true;
        if !placed {
          kept.push(record.clone());
          placed = true;
        }
      } else {
        kept.push(item);
      }
    }
    *list = kept;
  }
  changed
}

/// Applies optimistic mutations to every variant of a cache key.
///
/// Never fails: a missing snapshot, an unknown id or a duplicate insert are
/// all treated as no-ops (an insert into a missing snapshot starts a list).
pub struct MutationApplier<S: KeyValueStore> {
  cache: SnapshotCache<S>,
  fields: Arc<Vec<String>>,
}

impl<S: KeyValueStore> MutationApplier<S> {
  pub fn new(cache: SnapshotCache<S>, list_fields: Vec<String>) -> Self {
    Self {
      cache,
      fields: Arc::new(list_fields),
    }
  }

  pub fn list_fields(&self) -> &[String] {
    &self.fields
  }

  pub fn apply_insert(&self, cache_key: &str, item: &Value) {
    self.cache.update(cache_key, |snapshot| match snapshot {
      Some(value) => insert_item(value, item, &self.fields),
      None => {
        *snapshot = Some(Value::Array(vec![item.clone()]));
        true
      }
    });
  }

  pub fn apply_remove(&self, cache_key: &str, id: &str) {
    self.cache.update(cache_key, |snapshot| match snapshot {
      Some(value) => remove_item(value, id, &self.fields),
      None => false,
    });
  }

  pub fn apply_replace(&self, cache_key: &str, id: &str, changes: &Value) {
    self.cache.update(cache_key, |snapshot| match snapshot {
      Some(value) => merge_item(value, id, changes, &self.fields),
      None => false,
    });
  }

  /// Replace the temporary record `old_id` with the server-confirmed `record`.
  pub fn apply_confirm(&self, cache_key: &str, old_id: &str, record: &Value) {
    self.cache.update(cache_key, |snapshot| match snapshot {
      Some(value) => swap_item(value, old_id, record, &self.fields),
      None => false,
    });
  }
}

impl<S: KeyValueStore> Clone for MutationApplier<S> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      fields: Arc::clone(&self.fields),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::session::Session;
  use crate::store::{KeySpace, MemoryStore};
  use serde_json::json;

  fn fields() -> Vec<String> {
    vec!["items".into(), "pending".into(), "all".into()]
  }

  #[test]
  fn test_item_id_variants() {
    assert_eq!(item_id(&json!({"_id": "a"})).as_deref(), Some("a"));
    assert_eq!(item_id(&json!({"id": 12})).as_deref(), Some("12"));
    assert_eq!(item_id(&json!({"name": "x"})), None);
  }

  #[test]
  fn test_insert_prepends_and_is_idempotent() {
    let mut snapshot = json!([{"_id": "1"}]);
    assert!(insert_item(&mut snapshot, &json!({"_id": "2"}), &fields()));
    assert!(!insert_item(&mut snapshot, &json!({"_id": "2"}), &fields()));
    assert_eq!(snapshot, json!([{"_id": "2"}, {"_id": "1"}]));
  }

  #[test]
  fn test_insert_into_named_list() {
    let mut snapshot = json!({"total": 1, "pending": [{"_id": "1"}]});
    assert!(insert_item(&mut snapshot, &json!({"_id": "2"}), &fields()));
    assert_eq!(snapshot["pending"][0]["_id"], "2");
    assert_eq!(snapshot["total"], 1);
  }

  #[test]
  fn test_remove_across_lists() {
    let mut snapshot = json!({"pending": [{"_id": "1"}], "all": [{"id": "1"}, {"id": "2"}]});
    assert!(remove_item(&mut snapshot, "1", &fields()));
    assert!(!remove_item(&mut snapshot, "1", &fields()));
    assert_eq!(snapshot, json!({"pending": [], "all": [{"id": "2"}]}));
  }

  #[test]
  fn test_swap_leaves_single_copy() {
    let mut snapshot = json!([{"_id": "local-1", "n": 1}, {"_id": "3"}]);
    swap_item(&mut snapshot, "local-1", &json!({"_id": "srv-9", "n": 1}), &fields());
    assert_eq!(snapshot, json!([{"_id": "srv-9", "n": 1}, {"_id": "3"}]));

    // The confirmed record already arrived through a fetch.
    let mut snapshot = json!([{"_id": "srv-9"}, {"_id": "local-1"}]);
    swap_item(&mut snapshot, "local-1", &json!({"_id": "srv-9"}), &fields());
    assert_eq!(snapshot, json!([{"_id": "srv-9"}]));
  }

  #[test]
  fn test_swap_without_temporary_record_inserts_nothing() {
    let mut snapshot = json!([{"_id": "3"}]);
    assert!(!swap_item(&mut snapshot, "local-1", &json!({"_id": "srv-9"}), &fields()));
    assert_eq!(snapshot, json!([{"_id": "3"}]));
  }

  #[test]
  fn test_applier_updates_base_and_user_keys() {
    let storage = Arc::new(MemoryStore::new());
    let session = Session::new();
    session.set_identity(Some("optician".into()));
    let keys = KeySpace::new("t");
    let cache = SnapshotCache::new(Arc::clone(&storage), keys.clone(), session);
    let applier = MutationApplier::new(cache, fields());

    applier.apply_insert("orders", &json!({"_id": "local-1", "total": 5}));
    applier.apply_replace("orders", "local-1", &json!({"total": 6}));

    for key in [keys.base("orders"), keys.for_user("orders", "optician")] {
      let stored = storage.read(&key).unwrap().unwrap();
      assert_eq!(stored, json!([{"_id": "local-1", "total": 6}]));
    }

    applier.apply_remove("orders", "local-1");
    applier.apply_remove("orders", "missing");
    assert_eq!(storage.read("t:orders").unwrap(), Some(json!([])));
  }
}
