// src/request/response.rs
// =============================================================================
// Response: the terminal, successful outcome of one request.
//
// Built by the executor (or the cache) and handed, read-mostly, to the
// response interceptors and then to the callback. The originating request
// rides along so callbacks can read its metadata.
// =============================================================================

use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::StatusCode;
use url::Url;

use super::Request;

#[derive(Debug, Clone)]
pub struct Response {
    pub request: Arc<Request>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Final URL after redirects (or the rendered page's URL)
    pub url: Url,
    /// Body bytes, already decoded to UTF-8 when the body was text
    pub body: Bytes,
    /// True when the body came out of the response cache
    pub from_cache: bool,
    /// Links found by the HTML parsing stage. Empty when parsing is off
    pub links: Vec<Url>,
}

impl Response {
    pub fn new(request: Arc<Request>, status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        let url = request.url.clone();
        Self {
            request,
            status,
            headers,
            url,
            body,
            from_cache: false,
            links: Vec::new(),
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    pub fn is_html(&self) -> bool {
        match self.content_type() {
            Some(ct) => ct.contains("text/html") || ct.contains("application/xhtml"),
            // Rendered pages and header-less test servers still carry HTML
            None => !self.body.is_empty(),
        }
    }

    // Resolves a (possibly relative) link against the response URL.
    // Returns None for anchors and special protocols.
    pub fn join_url(&self, href: &str) -> Option<Url> {
        if href.starts_with('#')
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
            || href.starts_with("javascript:")
        {
            return None;
        }

        self.url.join(href).ok()
    }
}
