//! Active session context: request headers and the acting identity.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

pub type Headers = BTreeMap<String, String>;

#[derive(Debug, Default)]
struct SessionState {
  headers: Headers,
  identity: Option<String>,
}

/// Shared, cloneable handle to the current session.
///
/// The host updates it on login/logout; the engine snapshots the headers
/// whenever it queues an operation.
#[derive(Debug, Clone, Default)]
pub struct Session {
  state: Arc<RwLock<SessionState>>,
}

impl Session {
  pub fn new() -> Self {
    Self::default()
  }

  /// Set a header sent with every request from now on.
  pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
    if let Ok(mut state) = self.state.write() {
      state.headers.insert(name.into(), value.into());
    }
  }

  /// Set `Authorization: Bearer <token>`.
  pub fn set_bearer_token(&self, token: &str) {
    self.set_header("Authorization", format!("Bearer {}", token));
  }

  /// Set the acting user; `None` on logout.
  pub fn set_identity(&self, identity: Option<String>) {
    if let Ok(mut state) = self.state.write() {
      state.identity = identity;
    }
  }

  pub fn identity(&self) -> Option<String> {
    self.state.read().ok().and_then(|s| s.identity.clone())
  }

  /// Copy of the current headers.
  pub fn headers(&self) -> Headers {
    self
      .state
      .read()
      .map(|s| s.headers.clone())
      .unwrap_or_default()
  }

  /// Current headers with `captured` laid over them.
  ///
  /// Captured values win on conflict; session-only headers are kept.
  pub fn merged_with(&self, captured: &Headers) -> Headers {
    let mut headers = self.headers();
    headers.extend(captured.iter().map(|(k, v)| (k.clone(), v.clone())));
    headers
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_captured_headers_win() {
    let session = Session::new();
    session.set_bearer_token("new-token");
    session.set_header("X-Shop", "12");

    let mut captured = Headers::new();
    captured.insert("Authorization".into(), "Bearer old-token".into());

    let merged = session.merged_with(&captured);
    assert_eq!(merged["Authorization"], "Bearer old-token");
    assert_eq!(merged["X-Shop"], "12");
  }

  #[test]
  fn test_identity_roundtrip() {
    let session = Session::new();
    assert_eq!(session.identity(), None);
    session.set_identity(Some("dr.lens".into()));
    assert_eq!(session.identity().as_deref(), Some("dr.lens"));
  }
}
