// src/pipeline/log_stats.rs
// One log line per crawled response.

use tracing::info;

use super::ResponseInterceptor;
use crate::request::Response;

pub struct LogStats;

impl ResponseInterceptor for LogStats {
    fn process(&self, res: &mut Response) {
        info!(
            status = res.status.as_u16(),
            method = %res.request.method,
            url = %res.url,
            bytes = res.body.len(),
            cached = res.from_cache,
            "crawled"
        );
    }
}
