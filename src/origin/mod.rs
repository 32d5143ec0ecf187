//! Requests, responses, and the HTTP client for the single served origin.

mod client;
mod types;

pub use client::{DeliverWrite, Fetch, OriginClient};
pub use types::{CacheEntry, CacheKey, Destination, Method, Request, Response};
