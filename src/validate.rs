//! Client-side mirror of server whitelist checks, applied before replay.

use serde::Deserialize;
use serde_json::Value;

use crate::queue::{Method, QueuedOperation};

/// `field` of bodies sent to paths under `path_prefix` must be one of `allowed`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WhitelistRule {
  pub path_prefix: String,
  /// Dotted path into the body, e.g. `category` or `expense.category`.
  pub field: String,
  pub allowed: Vec<String>,
}

impl WhitelistRule {
  fn applies_to(&self, op: &QueuedOperation) -> bool {
    matches!(op.method, Method::Create | Method::Update) && op.path.starts_with(&self.path_prefix)
  }

  fn lookup<'a>(&self, body: &'a Value) -> Option<&'a Value> {
    self
      .field
      .split('.')
      .try_fold(body, |value, segment| value.get(segment))
  }
}

#[derive(Debug, Clone, Default)]
pub struct PayloadValidator {
  rules: Vec<WhitelistRule>,
}

impl PayloadValidator {
  pub fn new(rules: Vec<WhitelistRule>) -> Self {
    Self { rules }
  }

  /// `Err(reason)` when `op` carries a value the server is known to refuse.
  ///
  /// An absent field passes; the server decides whether it is required.
  pub fn check(&self, op: &QueuedOperation) -> Result<(), String> {
    for rule in self.rules.iter().filter(|r| r.applies_to(op)) {
      let Some(value) = rule.lookup(&op.body) else {
        continue;
      };
      let allowed = value
        .as_str()
        .is_some_and(|v| rule.allowed.iter().any(|a| a == v));
      if !allowed {
        return Err(format!(
          "{} = {} is not one of [{}]",
          rule.field,
          value,
          rule.allowed.join(", ")
        ));
      }
    }
    Ok(())
  }
}
