// src/metrics.rs
// =============================================================================
// In-process crawl counters.
//
// Every counter is a relaxed atomic: bumping one never blocks, never fails
// and never orders anything else. Read them with snapshot().
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    requests: AtomicU64,
    responses: AtomicU64,
    retries: AtomicU64,
    cache_hits: AtomicU64,
    robots_requests: AtomicU64,
    robots_forbidden: AtomicU64,
    panics: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub responses: u64,
    pub retries: u64,
    pub cache_hits: u64,
    pub robots_requests: u64,
    pub robots_forbidden: u64,
    pub panics: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_dispatched(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_received(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retried(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn robots_requested(&self) {
        self.robots_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn robots_forbidden(&self) {
        self.robots_forbidden.fetch_add(1, Ordering::Relaxed);
    }

    pub fn panic_recovered(&self) {
        self.panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            robots_requests: self.robots_requests.load(Ordering::Relaxed),
            robots_forbidden: self.robots_forbidden.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = Metrics::new();
        metrics.request_dispatched();
        metrics.request_dispatched();
        metrics.cache_hit();
        metrics.panic_recovered();

        let snap = metrics.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.panics, 1);
        assert_eq!(snap.responses, 0);
    }
}
