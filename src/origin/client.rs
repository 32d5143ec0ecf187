//! HTTP client for the served origin.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use url::Url;

use super::types::{Method, Request, Response};

/// Network fetch against the origin.
///
/// The interceptor and the populator are generic over this so tests can
/// script outcomes without a live server.
pub trait Fetch: Send + Sync {
  fn fetch(&self, request: &Request) -> impl Future<Output = Result<Response>> + Send;
}

/// Delivery of a deferred write to the origin's write endpoint.
pub trait DeliverWrite: Send + Sync {
  fn deliver_write(
    &self,
    payload: &[u8],
    idempotency_key: &str,
  ) -> impl Future<Output = Result<()>> + Send;
}

/// reqwest-backed client for the single served origin.
#[derive(Clone)]
pub struct OriginClient {
  http: reqwest::Client,
  write_url: Url,
}

impl OriginClient {
  pub fn new(origin: &Url, write_endpoint: &str) -> Result<Self> {
    let http = reqwest::Client::builder()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let write_url = origin
      .join(write_endpoint)
      .map_err(|e| eyre!("Invalid write endpoint {}: {}", write_endpoint, e))?;

    Ok(Self { http, write_url })
  }

  fn method_for(method: Method) -> reqwest::Method {
    match method {
      Method::Get => reqwest::Method::GET,
      Method::Head => reqwest::Method::HEAD,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Delete => reqwest::Method::DELETE,
      Method::Patch => reqwest::Method::PATCH,
      Method::Options => reqwest::Method::OPTIONS,
    }
  }
}

impl Fetch for OriginClient {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let mut builder = self
      .http
      .request(Self::method_for(request.method), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Fetch failed for {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .map(|(name, value)| {
        (
          name.as_str().to_string(),
          String::from_utf8_lossy(value.as_bytes()).into_owned(),
        )
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read response body for {}: {}", request.url, e))?
      .to_vec();

    Ok(Response {
      status,
      headers,
      body,
    })
  }
}

impl DeliverWrite for OriginClient {
  async fn deliver_write(&self, payload: &[u8], idempotency_key: &str) -> Result<()> {
    let response = self
      .http
      .post(self.write_url.clone())
      .header("Content-Type", "application/json")
      .header("Idempotency-Key", idempotency_key)
      .body(payload.to_vec())
      .send()
      .await
      .map_err(|e| eyre!("Write delivery failed: {}", e))?;

    if !response.status().is_success() {
      return Err(eyre!("Origin rejected write: {}", response.status()));
    }

    Ok(())
  }
}
