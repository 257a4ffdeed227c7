// src/cache/mod.rs
// =============================================================================
// Response cache in front of the fetch executor.
//
// CacheTransport wraps any Fetch and answers from a CacheStore when the HTTP
// caching rules allow it:
// 1. fresh entry            -> stored response, no network call
// 2. stale entry + validator -> conditional fetch (If-None-Match /
//                              If-Modified-Since); a 304 refreshes the entry
// 3. otherwise              -> plain fetch, stored if storable
//
// Entries are keyed by "{METHOD} {url}". When the origin answers with Vary,
// that key holds a small index naming the Vary headers instead, and each
// variant lives under the key refined by the request's values for them:
//   "GET https://example.com/ accept-language=en"
// The selected values are also kept inside the entry and re-checked on load.
//
// A broken store never fails a fetch: errors are logged and the request
// simply goes to the network.
//
// Submodules:
// - policy: freshness and storability rules
// - memory / disk / sled_store: the CacheStore backends
// =============================================================================

mod disk;
mod memory;
pub mod policy;
mod sled_store;

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, DATE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    LAST_MODIFIED, RANGE, VARY,
};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub use disk::DiskStore;
pub use memory::MemoryStore;
pub use sled_store::SledStore;

use crate::client::Fetch;
use crate::config::CachePolicy;
use crate::error::FetchError;
use crate::metrics::Metrics;
use crate::request::{Request, Response};
use policy::Freshness;

/// Source of "now" for freshness checks. Replaceable in tests.
pub type Clock = Arc<dyn Fn() -> SystemTime + Send + Sync>;

// Headers that describe one connection and must not be copied from a 304
// onto the stored response
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache entry could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cache database error: {0}")]
    Database(#[from] sled::Error),
}

/// Byte-oriented key-value backend for cached responses
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

// What a store key holds
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record {
    Entry(CacheEntry),
    /// Base key of a response that varies: names of the selecting headers
    Variants { vary: Vec<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    status: u16,
    headers: Vec<(String, String)>,
    url: Url,
    body: Vec<u8>,
    stored_at: SystemTime,
    /// Request header values selected by the response's Vary header
    vary: Vec<(String, Option<String>)>,
}

impl CacheEntry {
    fn new(res: &Response, req: &Request, stored_at: SystemTime) -> Self {
        let headers = res
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        let vary = vary_names(&res.headers)
            .into_iter()
            .map(|name| {
                let value = request_header(req, &name);
                (name, value)
            })
            .collect();

        Self {
            status: res.status.as_u16(),
            headers,
            url: res.url.clone(),
            body: res.body.to_vec(),
            stored_at,
            vary,
        }
    }

    fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
        map
    }

    fn matches(&self, req: &Request) -> bool {
        self.vary
            .iter()
            .all(|(name, value)| request_header(req, name) == *value)
    }

    // If-None-Match / If-Modified-Since for revalidating this entry
    fn validators(&self) -> HeaderMap {
        let stored = self.header_map();
        let mut validators = HeaderMap::new();
        if let Some(etag) = stored.get(ETAG) {
            validators.insert(IF_NONE_MATCH, etag.clone());
        }
        if let Some(modified) = stored.get(LAST_MODIFIED) {
            validators.insert(IF_MODIFIED_SINCE, modified.clone());
        }
        validators
    }

    // Applies a 304: its end-to-end headers replace the stored ones and the
    // entry's age restarts at `now`. A 304 without Date gets one, otherwise
    // the old Date would keep the entry stale.
    fn refresh(&mut self, not_modified: &HeaderMap, now: SystemTime) {
        self.merge_headers(not_modified);
        if !not_modified.contains_key(DATE) {
            self.headers.retain(|(name, _)| name != DATE.as_str());
            self.headers
                .push((DATE.as_str().to_string(), httpdate::fmt_http_date(now)));
        }
        self.stored_at = now;
    }

    // Copies the end-to-end headers of a 304 over the stored ones
    fn merge_headers(&mut self, fresh: &HeaderMap) {
        for name in fresh.keys() {
            let name = name.as_str();
            if HOP_BY_HOP.contains(&name) {
                continue;
            }
            self.headers.retain(|(stored, _)| stored != name);
            for value in fresh.get_all(name) {
                self.headers.push((
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                ));
            }
        }
    }

    fn to_response(&self, req: Arc<Request>) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let mut res = Response::new(req, status, self.header_map(), Bytes::from(self.body.clone()));
        res.url = self.url.clone();
        res.from_cache = true;
        res
    }
}

fn vary_names(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}

fn request_header(req: &Request, name: &str) -> Option<String> {
    req.headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub fn cache_key(req: &Request) -> String {
    format!("{} {}", req.method, req.url)
}

// Base key refined by the selected header values; absent headers show as the
// bare name
fn variant_key(base: &str, selected: &[(String, Option<String>)]) -> String {
    let mut key = base.to_string();
    for (name, value) in selected {
        key.push(' ');
        key.push_str(name);
        if let Some(value) = value {
            key.push('=');
            key.push_str(value);
        }
    }
    key
}

pub struct CacheTransport {
    inner: Arc<dyn Fetch>,
    store: Arc<dyn CacheStore>,
    policy: CachePolicy,
    metrics: Arc<Metrics>,
    clock: Clock,
}

impl CacheTransport {
    pub fn new(
        inner: Arc<dyn Fetch>,
        store: Arc<dyn CacheStore>,
        policy: CachePolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner,
            store,
            policy,
            metrics,
            clock: Arc::new(SystemTime::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    async fn read(&self, key: &str) -> Option<Record> {
        let bytes = match self.store.get(key).await {
            Ok(bytes) => bytes?,
            Err(e) => {
                warn!(key, error = %e, "cache read failed, fetching from network");
                return None;
            }
        };

        match serde_json::from_slice::<Record>(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key, error = %e, "discarding unreadable cache entry");
                None
            }
        }
    }

    async fn write(&self, key: &str, record: &Record) {
        let result = match serde_json::to_vec(record) {
            Ok(bytes) => self.store.set(key, bytes).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(key, error = %e, "cache write failed");
        }
    }

    // Finds the key the request's entry lives under (following a Vary index)
    // and the entry, if one is stored there and matches the request.
    async fn load(&self, req: &Request) -> (String, Option<CacheEntry>) {
        let base = cache_key(req);
        let (key, record) = match self.read(&base).await {
            Some(Record::Variants { vary }) => {
                let selected: Vec<_> = vary
                    .into_iter()
                    .map(|name| {
                        let value = request_header(req, &name);
                        (name, value)
                    })
                    .collect();
                let key = variant_key(&base, &selected);
                let record = self.read(&key).await;
                (key, record)
            }
            record => (base, record),
        };

        match record {
            Some(Record::Entry(entry)) if entry.matches(req) => (key, Some(entry)),
            Some(Record::Entry(_)) => {
                debug!(key, "cached entry does not match request headers");
                (key, None)
            }
            _ => (key, None),
        }
    }

    // Stores under the base key, or under the variant key with an index at
    // the base key when the response varies.
    async fn save(&self, req: &Request, entry: CacheEntry) {
        let base = cache_key(req);
        if entry.vary.is_empty() {
            self.write(&base, &Record::Entry(entry)).await;
            return;
        }

        let key = variant_key(&base, &entry.vary);
        let vary = entry.vary.iter().map(|(name, _)| name.clone()).collect();
        self.write(&base, &Record::Variants { vary }).await;
        self.write(&key, &Record::Entry(entry)).await;
    }

    async fn delete(&self, key: &str) {
        if let Err(e) = self.store.delete(key).await {
            warn!(key, error = %e, "cache delete failed");
        }
    }

    fn serve(&self, entry: &CacheEntry, req: Arc<Request>) -> Response {
        self.metrics.cache_hit();
        debug!(url = %req.url, "served from cache");
        entry.to_response(req)
    }

    fn stale_allowed(&self, entry: &CacheEntry, req: &Request, now: SystemTime) -> bool {
        policy::can_serve_stale_on_error(&req.headers, &entry.header_map(), entry.stored_at, now)
    }
}

#[async_trait]
impl Fetch for CacheTransport {
    async fn fetch(&self, req: Arc<Request>) -> Result<Response, FetchError> {
        let safe = req.method == Method::GET || req.method == Method::HEAD;

        if !safe {
            self.delete(&cache_key(&req)).await;
            return self.inner.fetch(req).await;
        }
        if req.headers.contains_key(RANGE) {
            return self.inner.fetch(req).await;
        }

        let (key, cached) = self.load(&req).await;
        let now = (self.clock)();

        let mut outgoing = Arc::clone(&req);
        if let Some(entry) = &cached {
            let freshness = policy::freshness(
                self.policy,
                &req.headers,
                &entry.header_map(),
                entry.stored_at,
                now,
            );
            match freshness {
                Freshness::Fresh => return Ok(self.serve(entry, req)),
                Freshness::Stale => {
                    let validators = entry.validators();
                    if !validators.is_empty() {
                        let mut conditional = (*req).clone();
                        conditional.headers.extend(validators);
                        outgoing = Arc::new(conditional);
                    }
                }
                Freshness::Transparent => {}
            }
        }

        let result = self.inner.fetch(outgoing).await;

        match (result, cached) {
            (Ok(res), Some(mut entry)) if res.status == StatusCode::NOT_MODIFIED => {
                entry.refresh(&res.headers, now);
                self.save(&req, entry.clone()).await;
                Ok(self.serve(&entry, req))
            }
            (Ok(res), Some(entry))
                if res.status.is_server_error() && self.stale_allowed(&entry, &req, now) =>
            {
                warn!(url = %req.url, status = res.status.as_u16(), "origin failed, serving stale copy");
                Ok(self.serve(&entry, req))
            }
            (Ok(mut res), cached) => {
                res.request = Arc::clone(&req);
                if policy::is_storable(self.policy, &req.headers, res.status, &res.headers) {
                    self.save(&req, CacheEntry::new(&res, &req, now)).await;
                } else if cached.is_some() {
                    self.delete(&key).await;
                }
                Ok(res)
            }
            (Err(e), Some(entry)) if self.stale_allowed(&entry, &req, now) => {
                warn!(url = %req.url, error = %e, "fetch failed, serving stale copy");
                Ok(self.serve(&entry, req))
            }
            (Err(e), Some(_)) => {
                self.delete(&key).await;
                Err(e)
            }
            (Err(e), None) => Err(e),
        }
    }
}
