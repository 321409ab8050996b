//! Error types for the sync engine.

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
  /// The server answered with a non-2xx status.
  #[error("API error {status}{}", body.as_ref().map(|b| format!(": {}", b)).unwrap_or_default())]
  Api { status: u16, body: Option<Value> },

  /// The request never got a response (unreachable host, refused, timed out).
  #[error("network unavailable: {0}")]
  Network(String),

  #[error("storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  #[error("JSON error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("invalid header {name}: {reason}")]
  InvalidHeader { name: String, reason: String },

  #[error("configuration error: {0}")]
  Config(String),

  #[error("{0}")]
  Other(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// How the queue processor should treat a failed replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
  /// Retrying later may succeed (connectivity, 408, 429, 5xx).
  Transient,
  /// The server rejected the payload; retrying cannot change the outcome.
  Validation,
  /// Credentials were refused (401, 403).
  Unauthorized,
  /// Anything local that replaying will not fix.
  Fatal,
}

impl SyncError {
  pub fn classify(&self) -> ErrorClass {
    match self {
      SyncError::Network(_) => ErrorClass::Transient,
      SyncError::Api { status, .. } => match *status {
        401 | 403 => ErrorClass::Unauthorized,
        408 | 429 => ErrorClass::Transient,
        400..=499 => ErrorClass::Validation,
        _ => ErrorClass::Transient,
      },
      _ => ErrorClass::Fatal,
    }
  }

  /// True when the request could not reach the server at all.
  pub fn is_network(&self) -> bool {
    matches!(self, SyncError::Network(_))
  }

  pub fn is_unauthorized(&self) -> bool {
    self.classify() == ErrorClass::Unauthorized
  }

  /// The server refused the payload itself (4xx other than auth, 408 and 429).
  pub fn is_validation(&self) -> bool {
    self.classify() == ErrorClass::Validation
  }

  pub fn is_server(&self) -> bool {
    matches!(self, SyncError::Api { status, .. } if *status >= 500)
  }

  pub fn status(&self) -> Option<u16> {
    match self {
      SyncError::Api { status, .. } => Some(*status),
      _ => None,
    }
  }
}

impl From<reqwest::Error> for SyncError {
  fn from(e: reqwest::Error) -> Self {
    // A body cut off mid-read means the outcome is unknown, same as no response.
    if e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode() {
      SyncError::Network(e.to_string())
    } else if let Some(status) = e.status() {
      SyncError::Api {
        status: status.as_u16(),
        body: None,
      }
    } else {
      SyncError::Other(e.to_string())
    }
  }
}
