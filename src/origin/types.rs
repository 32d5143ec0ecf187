//! Core request/response types shared by the interceptor and the cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Delete,
  Patch,
  Options,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Head => "HEAD",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Delete => "DELETE",
      Self::Patch => "PATCH",
      Self::Options => "OPTIONS",
    }
  }

  /// Only GET requests are idempotent reads eligible for caching.
  pub fn is_idempotent_read(&self) -> bool {
    matches!(self, Self::Get)
  }
}

/// What kind of resource a request is for.
///
/// Only `Document` matters to the interception policy (navigation fallback);
/// the remaining variants are carried through for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Destination {
  /// Top-level navigation / document request
  Document,
  Script,
  Style,
  Image,
  Font,
  #[default]
  Other,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  /// A plain GET request for a resource.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::Get,
      url,
      destination: Destination::Other,
      headers: Vec::new(),
      body: None,
    }
  }

  /// A top-level navigation request for a document.
  pub fn navigation(url: Url) -> Self {
    Self {
      destination: Destination::Document,
      ..Self::get(url)
    }
  }

  /// Whether this is a top-level navigation/document request.
  pub fn is_navigation(&self) -> bool {
    self.destination == Destination::Document
  }

  /// Cache key for this request: (method, absolute URL), matched verbatim.
  pub fn cache_key(&self) -> CacheKey {
    CacheKey {
      method: self.method,
      url: self.url.to_string(),
    }
  }
}

/// Cache lookup key: the request method plus the absolute URL.
///
/// The URL is matched exactly as issued. Query parameters are not stripped
/// or reordered, so `/a?v=1` and `/a?v=2` are distinct entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
  pub method: Method,
  pub url: String,
}

impl CacheKey {
  /// Key for a GET of the given URL.
  pub fn get(url: &Url) -> Self {
    Self {
      method: Method::Get,
      url: url.to_string(),
    }
  }

  /// Stable fixed-length storage key.
  pub fn storage_key(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response from the origin (or from cache).
#[derive(Debug, Clone)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

/// A stored response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub inserted_at: DateTime<Utc>,
}

impl CacheEntry {
  /// Snapshot a response for storage.
  pub fn from_response(response: &Response) -> Self {
    Self {
      status: response.status,
      headers: response.headers.clone(),
      body: response.body.clone(),
      inserted_at: Utc::now(),
    }
  }

  /// Rehydrate the stored response.
  pub fn into_response(self) -> Response {
    Response {
      status: self.status,
      headers: self.headers,
      body: self.body,
    }
  }
}
