// src/pipeline/allowed_domains.rs
// Cancels requests whose host is not in the allowed list. An empty list
// allows everything.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;

use super::RequestInterceptor;
use crate::request::Request;

pub struct AllowedDomains {
    domains: HashSet<String>,
}

impl AllowedDomains {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| d.into().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn allows(&self, req: &Request) -> bool {
        if self.domains.is_empty() {
            return true;
        }
        match req.url.host_str() {
            Some(host) => self.domains.contains(&host.to_ascii_lowercase()),
            None => false,
        }
    }
}

#[async_trait]
impl RequestInterceptor for AllowedDomains {
    async fn process(&self, req: &mut Request) {
        if !self.allows(req) {
            debug!(url = %req.url, "domain not allowed");
            req.cancel();
        }
    }
}
