//! Replays queued mutations against their endpoints.
//!
//! The engine only sees the `Transport` trait, so tests can script outcomes
//! without a server.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::config::Config;
use crate::error::DeliveryError;
use crate::intent::{IntentId, Method, QueuedIntent};

/// Everything needed to replay one intent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryRequest {
  pub id: IntentId,
  pub endpoint: String,
  pub method: Method,
  pub payload: Option<Value>,
}

impl From<&QueuedIntent> for DeliveryRequest {
  fn from(intent: &QueuedIntent) -> Self {
    Self {
      id: intent.id,
      endpoint: intent.endpoint.clone(),
      method: intent.method,
      payload: intent.payload.clone(),
    }
  }
}

#[async_trait]
pub trait Transport: Send + Sync {
  /// Deliver one mutation. `Ok` only for a 2xx response.
  async fn deliver(&self, request: &DeliveryRequest) -> Result<(), DeliveryError>;
}

impl From<Method> for reqwest::Method {
  fn from(method: Method) -> Self {
    match method {
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    }
  }
}

/// HTTP transport backed by reqwest.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Option<Url>,
  timeout: Duration,
}

impl HttpTransport {
  pub fn new(config: &Config) -> Result<Self> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| eyre!("Invalid header name {}: {}", name, e))?;
      let value =
        HeaderValue::from_str(value).map_err(|e| eyre!("Invalid value for header {}: {}", name, e))?;
      headers.insert(name, value);
    }

    if let Some(token) = Config::auth_token() {
      let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|e| eyre!("Invalid auth token: {}", e))?;
      value.set_sensitive(true);
      headers.insert(AUTHORIZATION, value);
    }

    let timeout = config.sync.request_timeout();
    let client = reqwest::Client::builder()
      .default_headers(headers)
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url: config.base_url()?,
      timeout,
    })
  }

  /// Absolute endpoints are used as-is; relative ones are joined onto `base_url`.
  fn resolve(&self, endpoint: &str) -> Result<Url, DeliveryError> {
    if let Ok(url) = Url::parse(endpoint) {
      return Ok(url);
    }

    let base = self.base_url.as_ref().ok_or_else(|| {
      DeliveryError::Network(format!(
        "relative endpoint {} but no base_url is configured",
        endpoint
      ))
    })?;

    base
      .join(endpoint)
      .map_err(|e| DeliveryError::Network(format!("cannot resolve endpoint {}: {}", endpoint, e)))
  }

  fn classify(&self, error: reqwest::Error) -> DeliveryError {
    if error.is_timeout() {
      DeliveryError::timeout(self.timeout)
    } else {
      DeliveryError::Network(error.to_string())
    }
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn deliver(&self, request: &DeliveryRequest) -> Result<(), DeliveryError> {
    let url = self.resolve(&request.endpoint)?;

    let mut builder = self.client.request(request.method.into(), url);
    if let Some(payload) = &request.payload {
      builder = builder.json(payload);
    }

    let response = builder.send().await.map_err(|e| self.classify(e))?;
    let status = response.status();
    if status.is_success() {
      return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    let body = if body.trim().is_empty() {
      status.canonical_reason().unwrap_or_default().to_string()
    } else {
      body
    };

    Err(DeliveryError::Server {
      status: status.as_u16(),
      body,
    })
  }
}


#[cfg(test)]
mod tests {
  use super::*;
  use httpmock::{Method as HttpMethod, MockServer};
  use serde_json::json;

  fn transport_for(server: &MockServer, timeout_secs: u64) -> HttpTransport {
    let config = Config::from_yaml(&format!(
      "base_url: {}\nheaders:\n  X-Client: storefront\nsync:\n  request_timeout_secs: {}\n",
      server.base_url(),
      timeout_secs
    ))
    .unwrap();
    HttpTransport::new(&config).unwrap()
  }

  fn request(endpoint: &str, method: Method, payload: Option<Value>) -> DeliveryRequest {
    DeliveryRequest {
      id: IntentId(1),
      endpoint: endpoint.to_string(),
      method,
      payload,
    }
  }

  #[tokio::test]
  async fn test_delivers_json_to_relative_endpoint() {
    let server = MockServer::start_async().await;
    let mock = server
      .mock_async(|when, then| {
        when
          .method(HttpMethod::POST)
          .path("/api/orders")
          .header("X-Client", "storefront")
          .json_body(json!({"product_id": "p1", "quantity": 2}));
        then.status(201);
      })
      .await;

    let transport = transport_for(&server, 5);
    let result = transport
      .deliver(&request(
        "/api/orders",
        Method::Post,
        Some(json!({"product_id": "p1", "quantity": 2})),
      ))
      .await;

    assert_eq!(result, Ok(()));
    mock.assert_async().await;
  }

  #[tokio::test]
  async fn test_non_2xx_is_server_error_with_body() {
    let server = MockServer::start_async().await;
    server
      .mock_async(|when, then| {
        when.method(HttpMethod::DELETE).path("/api/favorites/p1");
        then.status(409).body("already removed");
      })
      .await;

    let transport = transport_for(&server, 5);
    let result = transport
      .deliver(&request(&server.url("/api/favorites/p1"), Method::Delete, None))
      .await;

    assert_eq!(
      result,
      Err(DeliveryError::Server {
        status: 409,
        body: "already removed".into()
      })
    );
  }

  #[tokio::test]
  async fn test_empty_error_body_uses_reason_phrase() {
    let server = MockServer::start_async().await;
    server
      .mock_async(|when, then| {
        when.method(HttpMethod::PUT).path("/api/cart/p1");
        then.status(503);
      })
      .await;

    let transport = transport_for(&server, 5);
    let result = transport
      .deliver(&request("/api/cart/p1", Method::Put, None))
      .await;

    assert_eq!(
      result,
      Err(DeliveryError::Server {
        status: 503,
        body: "Service Unavailable".into()
      })
    );
  }

  #[tokio::test]
  async fn test_timeout_is_network_error() {
    let server = MockServer::start_async().await;
    server
      .mock_async(|when, then| {
        when.method(HttpMethod::PATCH).path("/api/cart/p1");
        then.status(200).delay(Duration::from_secs(3));
      })
      .await;

    let transport = transport_for(&server, 1);
    let result = transport
      .deliver(&request("/api/cart/p1", Method::Patch, None))
      .await;

    assert_eq!(result, Err(DeliveryError::timeout(Duration::from_secs(1))));
  }

  #[tokio::test]
  async fn test_unreachable_host_is_network_error() {
    let config = Config::from_yaml("sync:\n  request_timeout_secs: 2\n").unwrap();
    let transport = HttpTransport::new(&config).unwrap();

    // Port 9 (discard) is closed on test machines
    let result = transport
      .deliver(&request("http://127.0.0.1:9/api/orders", Method::Post, None))
      .await;

    assert!(matches!(result, Err(DeliveryError::Network(_))));
  }

  #[tokio::test]
  async fn test_relative_endpoint_without_base_url() {
    let config = Config::default();
    let transport = HttpTransport::new(&config).unwrap();

    let result = transport
      .deliver(&request("/api/orders", Method::Post, None))
      .await;

    assert!(matches!(result, Err(DeliveryError::Network(msg)) if msg.contains("base_url")));
  }
}
