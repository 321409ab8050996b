//! Storage key namespacing.

use sha2::{Digest, Sha256};

/// Maps logical cache keys ("orders", "profile") to storage keys.
///
/// Layout: `prefix:key` for the shared variant and `prefix:key:userHash` for
/// the per-user variant. The queue lives at `prefix#queue`, outside the
/// `prefix:` namespace, so no cache key can land on it.
#[derive(Debug, Clone)]
pub struct KeySpace {
  prefix: String,
}

impl KeySpace {
  pub fn new(prefix: impl Into<String>) -> Self {
    Self {
      prefix: prefix.into(),
    }
  }

  pub fn prefix(&self) -> &str {
    &self.prefix
  }

  pub fn base(&self, key: &str) -> String {
    format!("{}:{}", self.prefix, key)
  }

  pub fn for_user(&self, key: &str, identity: &str) -> String {
    format!("{}:{}:{}", self.prefix, key, user_hash(identity))
  }

  pub fn queue(&self) -> String {
    format!("{}#queue", self.prefix)
  }

  /// Every storage key a logical key is mirrored to, namespaced variant first.
  pub fn variants(&self, key: &str, identity: Option<&str>) -> Vec<String> {
    match identity {
      Some(id) => vec![self.for_user(key, id), self.base(key)],
      None => vec![self.base(key)],
    }
  }
}

/// Stable short hash of an authenticated identity.
pub fn user_hash(identity: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(identity.as_bytes());
  let digest = hex::encode(hasher.finalize());
  digest[..16].to_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_key_layout() {
    let keys = KeySpace::new("optisync");
    assert_eq!(keys.base("orders"), "optisync:orders");
    assert_eq!(keys.queue(), "optisync#queue");

    let user = keys.for_user("orders", "optician@example.com");
    assert!(user.starts_with("optisync:orders:"));
    assert_eq!(user.len(), "optisync:orders:".len() + 16);
  }

  #[test]
  fn test_user_hash_is_stable() {
    assert_eq!(user_hash("a"), user_hash("a"));
    assert_ne!(user_hash("a"), user_hash("b"));
  }

  #[test]
  fn test_variants() {
    let keys = KeySpace::new("p");
    assert_eq!(keys.variants("orders", None), vec!["p:orders"]);
    let both = keys.variants("orders", Some("u"));
    assert_eq!(both.len(), 2);
    assert_eq!(both[1], "p:orders");
  }

  #[test]
  fn test_queue_key_is_unreachable_from_cache_keys() {
    let keys = KeySpace::new("p");
    for key in ["queue", ":queue", "#queue", ""] {
      assert!(keys.variants(key, Some("u")).iter().all(|k| *k != keys.queue()));
    }
  }
}
