// src/pipeline/mod.rs
// =============================================================================
// Interceptor pipeline.
//
// Two ordered chains of stages around every fetch:
// - request stages run before dispatch and may mutate or cancel the request
// - response stages run after a successful fetch and may mutate the response
//
// The built-in stages come first, in this order:
//   request:  AllowedDomains, DuplicateRequests, DefaultHeaders, Delay,
//             MetricsInterceptor, RobotsTxt
//   response: ParseHtml, LogStats, MetricsInterceptor
// Stages added by the caller run after them.
//
// A stage that blocks only stalls the request it is working on: every
// request runs its pipeline on its own task.
// =============================================================================

mod allowed_domains;
mod delay;
mod duplicates;
mod headers;
mod log_stats;
mod metrics;
mod parse_html;
mod robots;

use std::sync::Arc;

use async_trait::async_trait;

pub use allowed_domains::AllowedDomains;
pub use delay::Delay;
pub use duplicates::DuplicateRequests;
pub use headers::DefaultHeaders;
pub use log_stats::LogStats;
pub use metrics::MetricsInterceptor;
pub use parse_html::{extract_links, ParseHtml};
pub use robots::RobotsTxt;

use crate::client::Fetch;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::request::{Request, Response};

/// A pre-dispatch stage. Cancel the request to stop it from being fetched.
#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    async fn process(&self, req: &mut Request);
}

/// A post-fetch stage
pub trait ResponseInterceptor: Send + Sync {
    fn process(&self, res: &mut Response);
}

#[derive(Default, Clone)]
pub struct Pipeline {
    request_stages: Vec<Arc<dyn RequestInterceptor>>,
    response_stages: Vec<Arc<dyn ResponseInterceptor>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    // The built-in stages for a configuration. `fetcher` is what the
    // robots.txt stage uses to download rules files.
    pub fn standard(config: &Config, fetcher: Arc<dyn Fetch>, metrics: Arc<Metrics>) -> Self {
        let shared_metrics = Arc::new(MetricsInterceptor::new(Arc::clone(&metrics)));

        let mut pipeline = Self::new()
            .with_request_stage(Arc::new(AllowedDomains::new(config.allowed_domains.clone())))
            .with_request_stage(Arc::new(DuplicateRequests::new(config.url_revisit_enabled)))
            .with_request_stage(Arc::new(DefaultHeaders::new(config.user_agent.clone())))
            .with_request_stage(Arc::new(Delay::new(
                config.request_delay,
                config.request_delay_randomize,
            )))
            .with_request_stage(Arc::clone(&shared_metrics) as Arc<dyn RequestInterceptor>);

        if !config.robots_txt_disabled {
            pipeline = pipeline.with_request_stage(Arc::new(RobotsTxt::new(fetcher, metrics)));
        }

        if !config.parse_html_disabled {
            pipeline = pipeline.with_response_stage(Arc::new(ParseHtml));
        }
        if !config.log_disabled {
            pipeline = pipeline.with_response_stage(Arc::new(LogStats));
        }
        pipeline.with_response_stage(shared_metrics)
    }

    pub fn with_request_stage(mut self, stage: Arc<dyn RequestInterceptor>) -> Self {
        self.request_stages.push(stage);
        self
    }

    pub fn with_response_stage(mut self, stage: Arc<dyn ResponseInterceptor>) -> Self {
        self.response_stages.push(stage);
        self
    }

    // Runs the request stages in order. Stops at the first stage that
    // cancels; returns whether the request may be dispatched.
    pub async fn process_request(&self, req: &mut Request) -> bool {
        for stage in &self.request_stages {
            stage.process(req).await;
            if req.is_cancelled() {
                return false;
            }
        }
        true
    }

    pub fn process_response(&self, res: &mut Response) {
        for stage in &self.response_stages {
            stage.process(res);
        }
    }

    pub fn request_stage_count(&self) -> usize {
        self.request_stages.len()
    }

    pub fn response_stage_count(&self) -> usize {
        self.response_stages.len()
    }
}
