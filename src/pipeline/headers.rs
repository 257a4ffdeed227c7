// src/pipeline/headers.rs
// Fills in the usual browser-ish headers. Headers the request already
// carries are left alone.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, ACCEPT, ACCEPT_CHARSET, ACCEPT_LANGUAGE, USER_AGENT};

use super::RequestInterceptor;
use crate::request::Request;

const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const DEFAULT_ACCEPT_CHARSET: &str = "utf-8";
const DEFAULT_ACCEPT_LANGUAGE: &str = "en";

pub struct DefaultHeaders {
    user_agent: Option<HeaderValue>,
}

impl DefaultHeaders {
    // An agent string that is not a valid header value is skipped
    pub fn new(user_agent: impl AsRef<str>) -> Self {
        Self {
            user_agent: HeaderValue::from_str(user_agent.as_ref()).ok(),
        }
    }
}

#[async_trait]
impl RequestInterceptor for DefaultHeaders {
    async fn process(&self, req: &mut Request) {
        let headers = &mut req.headers;
        headers
            .entry(ACCEPT)
            .or_insert(HeaderValue::from_static(DEFAULT_ACCEPT));
        headers
            .entry(ACCEPT_CHARSET)
            .or_insert(HeaderValue::from_static(DEFAULT_ACCEPT_CHARSET));
        headers
            .entry(ACCEPT_LANGUAGE)
            .or_insert(HeaderValue::from_static(DEFAULT_ACCEPT_LANGUAGE));
        if let Some(agent) = &self.user_agent {
            headers.entry(USER_AGENT).or_insert_with(|| agent.clone());
        }
    }
}
