// src/pipeline/duplicates.rs
// =============================================================================
// Drops requests that were already seen.
//
// Requests are identified by their fingerprint (SHA-256 of method, URL and
// body). The check and the insert happen under one lock, so of two identical
// requests racing through here exactly one survives.
// =============================================================================

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use super::RequestInterceptor;
use crate::request::Request;

pub struct DuplicateRequests {
    revisit_enabled: bool,
    seen: Mutex<HashSet<[u8; 32]>>,
}

impl DuplicateRequests {
    pub fn new(revisit_enabled: bool) -> Self {
        Self {
            revisit_enabled,
            seen: Mutex::new(HashSet::new()),
        }
    }

    // Records the request; returns false if it had been recorded before
    fn first_visit(&self, req: &Request) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.insert(req.fingerprint())
    }
}

#[async_trait]
impl RequestInterceptor for DuplicateRequests {
    async fn process(&self, req: &mut Request) {
        if self.revisit_enabled {
            return;
        }
        if !self.first_visit(req) {
            debug!(method = %req.method, url = %req.url, "duplicate request dropped");
            req.cancel();
        }
    }
}
