// src/request/unit.rs
// =============================================================================
// Request: one HTTP exchange waiting to be (or being) dispatched.
//
// A request is built by the caller, or by an interceptor (the robots.txt
// stage builds its own), goes through the pipeline exactly once and is then
// frozen behind an Arc for the executor and the callback.
//
// Two fields are special:
// - cancelled: set by request interceptors. Once set it stays set
// - retry_count: bumped only by the executor, atomically, so it can be read
//   through the shared Arc while the retries happen
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use reqwest::header::{HeaderMap, USER_AGENT};
use reqwest::Method;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::client::RenderAction;
use crate::error::FetchError;

#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Caller data carried untouched to the response
    pub meta: HashMap<String, Value>,
    /// Fetch through the rendering collaborator instead of plain HTTP
    pub rendered: bool,
    /// Run inline on the issuing task instead of a spawned one
    pub synchronized: bool,
    /// Explicit body encoding label. None means detect
    pub encoding: Option<String>,
    /// Extra browser actions for rendered requests
    pub actions: Vec<RenderAction>,
    /// One attempt only: the executor never retries this request
    pub retry_disabled: bool,

    cancelled: bool,
    retry_count: AtomicU32,
    context: CancellationToken,
    custom_context: bool,
}

impl Request {
    pub fn new(method: Method, url: &str, body: impl Into<Bytes>) -> Result<Self, FetchError> {
        let url = Self::parse_destination(url)?;

        Ok(Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: body.into(),
            meta: HashMap::new(),
            rendered: false,
            synchronized: false,
            encoding: None,
            actions: Vec::new(),
            retry_disabled: false,
            cancelled: false,
            retry_count: AtomicU32::new(0),
            context: CancellationToken::new(),
            custom_context: false,
        })
    }

    pub fn get(url: &str) -> Result<Self, FetchError> {
        Self::new(Method::GET, url, Bytes::new())
    }

    pub fn head(url: &str) -> Result<Self, FetchError> {
        Self::new(Method::HEAD, url, Bytes::new())
    }

    pub fn post(url: &str, body: impl Into<Bytes>) -> Result<Self, FetchError> {
        Self::new(Method::POST, url, body)
    }

    // Parses and checks a destination. Only http(s) URLs with a host can be
    // crawled; anything else is an InvalidDestination.
    pub fn parse_destination(url: &str) -> Result<Url, FetchError> {
        let invalid = |reason: String| FetchError::InvalidDestination {
            url: url.to_string(),
            reason,
        };

        let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;

        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(invalid(format!("unsupported scheme '{}'", parsed.scheme())));
        }
        if parsed.host_str().is_none() {
            return Err(invalid("missing host".to_string()));
        }

        Ok(parsed)
    }

    /// Ties the request to a cancellation context. Gate waits and rendering
    /// give up as soon as the token fires.
    pub fn with_context(mut self, context: CancellationToken) -> Self {
        self.context = context;
        self.custom_context = true;
        self
    }

    // Puts the request under `parent` unless the caller already chose a
    // context with with_context().
    pub(crate) fn adopt_context(&mut self, parent: &CancellationToken) {
        if !self.custom_context {
            self.context = parent.child_token();
        }
    }

    pub fn context(&self) -> &CancellationToken {
        &self.context
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn increment_retry(&self) -> u32 {
        self.retry_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::SeqCst)
    }

    // Host plus port when the port is not the scheme default.
    // This is the key for per-destination gates and robots rules.
    pub fn host(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.headers.get(USER_AGENT).and_then(|v| v.to_str().ok())
    }

    /// SHA-256 over method, URL and body. Two requests with the same
    /// fingerprint are the same visit.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.method.as_str().as_bytes());
        hasher.update(b" ");
        hasher.update(self.url.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(&self.body);
        hasher.finalize().into()
    }
}

// Cloning starts a fresh life for the copy: same destination and payload,
// same context, but not cancelled and with the retry counter reset.
impl Clone for Request {
    fn clone(&self) -> Self {
        Self {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            meta: self.meta.clone(),
            rendered: self.rendered,
            synchronized: self.synchronized,
            encoding: self.encoding.clone(),
            actions: self.actions.clone(),
            retry_disabled: self.retry_disabled,
            cancelled: false,
            retry_count: AtomicU32::new(0),
            context: self.context.clone(),
            custom_context: self.custom_context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta() {
        let mut req = Request::get("https://example.com/catalogue").unwrap();
        req.meta.insert("key".to_string(), Value::from("value"));
        assert_eq!(req.meta["key"], Value::from("value"));
    }

    #[test]
    fn test_invalid_destinations() {
        assert!(matches!(
            Request::get("not a url"),
            Err(FetchError::InvalidDestination { .. })
        ));
        assert!(matches!(
            Request::get("mailto:someone@example.com"),
            Err(FetchError::InvalidDestination { .. })
        ));
        assert!(matches!(
            Request::get("ftp://example.com/file"),
            Err(FetchError::InvalidDestination { .. })
        ));
    }

    #[test]
    fn test_cancel_is_sticky() {
        let mut req = Request::get("https://example.com").unwrap();
        assert!(!req.is_cancelled());
        req.cancel();
        req.cancel();
        assert!(req.is_cancelled());
    }

    #[test]
    fn test_increment_retry_returns_new_count() {
        let req = Request::get("https://example.com").unwrap();
        assert_eq!(req.retry_count(), 0);
        assert_eq!(req.increment_retry(), 1);
        assert_eq!(req.increment_retry(), 2);
        assert_eq!(req.retry_count(), 2);
    }

    #[test]
    fn test_host_includes_non_default_port() {
        let req = Request::get("http://localhost:8080/a").unwrap();
        assert_eq!(req.host(), "localhost:8080");
        let req = Request::get("https://example.com/a").unwrap();
        assert_eq!(req.host(), "example.com");
    }

    #[test]
    fn test_fingerprint() {
        let long_url = format!("https://example.com{}", "/path".repeat(50));
        let a = Request::get(&long_url).unwrap();
        let b = Request::get(&long_url).unwrap();
        let c = Request::head(&long_url).unwrap();
        let d = Request::post(&long_url, "x=1").unwrap();
        let e = Request::post(&long_url, "x=2").unwrap();

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_ne!(d.fingerprint(), e.fingerprint());
    }

    #[test]
    fn test_adopt_context_keeps_explicit_one() {
        let parent = CancellationToken::new();

        let mut plain = Request::get("https://example.com").unwrap();
        plain.adopt_context(&parent);
        let own = CancellationToken::new();
        let mut explicit = Request::get("https://example.com").unwrap().with_context(own.clone());
        explicit.adopt_context(&parent);

        parent.cancel();
        assert!(plain.context().is_cancelled());
        assert!(!explicit.context().is_cancelled());
    }

    #[test]
    fn test_clone_resets_state() {
        let mut req = Request::get("https://example.com").unwrap();
        req.increment_retry();
        req.cancel();
        let copy = req.clone();
        assert_eq!(copy.retry_count(), 0);
        assert!(!copy.is_cancelled());
        assert_eq!(copy.url, req.url);
    }
}
