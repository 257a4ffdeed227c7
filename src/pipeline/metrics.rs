// src/pipeline/metrics.rs
// Counts dispatched requests and received responses. The same instance sits
// in both chains.

use std::sync::Arc;

use async_trait::async_trait;

use super::{RequestInterceptor, ResponseInterceptor};
use crate::metrics::Metrics;
use crate::request::{Request, Response};

pub struct MetricsInterceptor {
    metrics: Arc<Metrics>,
}

impl MetricsInterceptor {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl RequestInterceptor for MetricsInterceptor {
    async fn process(&self, _req: &mut Request) {
        self.metrics.request_dispatched();
    }
}

impl ResponseInterceptor for MetricsInterceptor {
    fn process(&self, _res: &mut Response) {
        self.metrics.response_received();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use reqwest::header::HeaderMap;
    use reqwest::StatusCode;

    #[tokio::test]
    async fn test_counts_both_directions() {
        let metrics = Arc::new(Metrics::new());
        let stage = MetricsInterceptor::new(Arc::clone(&metrics));

        let mut req = Request::get("https://example.com/").unwrap();
        RequestInterceptor::process(&stage, &mut req).await;

        let mut res = Response::new(Arc::new(req), StatusCode::OK, HeaderMap::new(), Bytes::new());
        ResponseInterceptor::process(&stage, &mut res);

        let snap = metrics.snapshot();
        assert_eq!(snap.requests, 1);
        assert_eq!(snap.responses, 1);
    }
}
