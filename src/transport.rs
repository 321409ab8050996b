//! HTTP transport to the remote API.
//! Handles request building, header injection and status mapping.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, Response};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::error::{Result, SyncError};
use crate::session::Headers;

/// One call against the remote API.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
  pub method: Method,
  /// Resource path, without host.
  pub path: String,
  pub body: Option<Value>,
  pub headers: Headers,
}

impl ApiRequest {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      body: None,
      headers: Headers::new(),
    }
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn with_headers(mut self, headers: Headers) -> Self {
    self.headers = headers;
    self
  }
}

/// Anything that can carry an `ApiRequest` to the server.
///
/// Implementations return the parsed JSON body on 2xx (`Null` when empty),
/// `SyncError::Api` on any other status and `SyncError::Network` when no
/// response arrived.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: ApiRequest) -> Result<Value>;
}

/// `Transport` over reqwest.
pub struct HttpTransport {
  client: Client,
  base_url: Url,
}

impl HttpTransport {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
    let base_url = Url::parse(base_url)
      .map_err(|e| SyncError::Config(format!("invalid base URL {}: {}", base_url, e)))?;

    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    let client = Client::builder()
      .default_headers(headers)
      .timeout(timeout)
      .build()
      .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;

    Ok(Self { client, base_url })
  }

  fn url_for(&self, path: &str) -> Result<Url> {
    let joined = format!(
      "{}/{}",
      self.base_url.as_str().trim_end_matches('/'),
      path.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|e| SyncError::Other(format!("invalid request path {}: {}", path, e)))
  }

  fn header_map(headers: &Headers) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
      let header_name =
        HeaderName::from_bytes(name.as_bytes()).map_err(|e| SyncError::InvalidHeader {
          name: name.clone(),
          reason: e.to_string(),
        })?;
      let header_value = HeaderValue::from_str(value).map_err(|e| SyncError::InvalidHeader {
        name: name.clone(),
        reason: e.to_string(),
      })?;
      map.insert(header_name, header_value);
    }
    Ok(map)
  }

  /// Check response status and convert errors.
  async fn check_response(response: Response) -> Result<Value> {
    let status = response.status();
    let text = response.text().await?;

    if status.is_success() {
      if text.trim().is_empty() {
        return Ok(Value::Null);
      }
      // The server accepted the request; an odd body must not turn that into a failure.
      return Ok(serde_json::from_str(&text).unwrap_or_else(|e| {
        tracing::warn!(status = status.as_u16(), error = %e, "2xx response body is not JSON");
        Value::Null
      }));
    }

    Err(SyncError::Api {
      status: status.as_u16(),
      body: serde_json::from_str(&text).ok(),
    })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: ApiRequest) -> Result<Value> {
    let url = self.url_for(&request.path)?;
    let headers = Self::header_map(&request.headers)?;

    tracing::debug!(method = %request.method, %url, "sending request");

    let mut builder = self.client.request(request.method, url).headers(headers);
    if let Some(body) = &request.body {
      builder = builder
        .header(CONTENT_TYPE, "application/json")
        .body(serde_json::to_vec(body)?);
    }

    let response = builder.send().await?;
    Self::check_response(response).await
  }
}
