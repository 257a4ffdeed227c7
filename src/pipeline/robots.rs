// src/pipeline/robots.rs
// =============================================================================
// robots.txt exclusion.
//
// The first request to a host downloads that host's /robots.txt through the
// engine's own fetcher (so the cache applies to it), in a single attempt.
// The outcome decides the host's rules:
// - 2xx: parse the file
// - 4xx: no rules, everything allowed
// - 5xx: the whole host is off limits, including statuses the executor
//   reports as RetryableStatus
// - transport error: nothing is recorded and the request goes ahead
//
// Lookups take a shared lock. Two requests to a new host may both download
// the file; the later insert wins.
// =============================================================================

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::USER_AGENT;
use reqwest::StatusCode;
use texting_robots::Robot;
use tracing::{debug, info};

use super::RequestInterceptor;
use crate::client::Fetch;
use crate::config::DEFAULT_USER_AGENT;
use crate::error::FetchError;
use crate::metrics::Metrics;
use crate::request::Request;

#[derive(Debug, Clone)]
pub enum RobotsRules {
    AllowAll,
    DisallowAll,
    Parsed(Bytes),
}

impl RobotsRules {
    pub fn from_status_and_body(status: StatusCode, body: Bytes) -> Self {
        if status.is_success() {
            RobotsRules::Parsed(body)
        } else if status.is_server_error() {
            RobotsRules::DisallowAll
        } else {
            RobotsRules::AllowAll
        }
    }

    // A file that does not parse restricts nothing
    pub fn allows(&self, url: &str, agent: &str) -> bool {
        match self {
            RobotsRules::AllowAll => true,
            RobotsRules::DisallowAll => false,
            RobotsRules::Parsed(body) => match Robot::new(agent, body) {
                Ok(robot) => robot.allowed(url),
                Err(_) => true,
            },
        }
    }
}

pub struct RobotsTxt {
    fetcher: Arc<dyn Fetch>,
    metrics: Arc<Metrics>,
    rules: RwLock<HashMap<String, Arc<RobotsRules>>>,
}

impl RobotsTxt {
    pub fn new(fetcher: Arc<dyn Fetch>, metrics: Arc<Metrics>) -> Self {
        Self {
            fetcher,
            metrics,
            rules: RwLock::new(HashMap::new()),
        }
    }

    fn cached(&self, host: &str) -> Option<Arc<RobotsRules>> {
        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        rules.get(host).cloned()
    }

    async fn download(&self, req: &Request) -> Option<Arc<RobotsRules>> {
        let host = req.host();
        let robots_url = format!("{}://{}/robots.txt", req.url.scheme(), host);

        let mut robots_req = Request::get(&robots_url).ok()?;
        robots_req.retry_disabled = true;
        if let Some(agent) = req.headers.get(USER_AGENT) {
            robots_req.headers.insert(USER_AGENT, agent.clone());
        }

        self.metrics.robots_requested();
        let rules = match self.fetcher.fetch(Arc::new(robots_req)).await {
            Ok(res) => RobotsRules::from_status_and_body(res.status, res.body),
            // The executor reports retry-listed statuses as errors
            Err(FetchError::RetryableStatus { status, .. }) => {
                let status =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                RobotsRules::from_status_and_body(status, Bytes::new())
            }
            Err(e) => {
                debug!(url = %robots_url, error = %e, "robots.txt unavailable");
                return None;
            }
        };

        let rules = Arc::new(rules);
        let mut map = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(host, Arc::clone(&rules));
        Some(rules)
    }
}

#[async_trait]
impl RequestInterceptor for RobotsTxt {
    async fn process(&self, req: &mut Request) {
        let rules = match self.cached(&req.host()) {
            Some(rules) => rules,
            None => match self.download(req).await {
                Some(rules) => rules,
                None => return,
            },
        };

        let agent = req.user_agent().unwrap_or(DEFAULT_USER_AGENT);
        if !rules.allows(req.url.as_str(), agent) {
            self.metrics.robots_forbidden();
            info!(url = %req.url, "forbidden by robots.txt");
            req.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Response;
    use reqwest::header::HeaderMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ROBOTS: &str = "User-agent: *\nDisallow: /private\n";

    struct RobotsServer {
        status: StatusCode,
        calls: AtomicUsize,
    }

    impl RobotsServer {
        fn new(status: StatusCode) -> Arc<Self> {
            Arc::new(Self {
                status,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Fetch for RobotsServer {
        async fn fetch(&self, req: Arc<Request>) -> Result<Response, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(req.url.path(), "/robots.txt");
            Ok(Response::new(
                req,
                self.status,
                HeaderMap::new(),
                Bytes::from_static(ROBOTS.as_bytes()),
            ))
        }
    }

    struct Offline;

    #[async_trait]
    impl Fetch for Offline {
        async fn fetch(&self, req: Arc<Request>) -> Result<Response, FetchError> {
            Err(FetchError::transport(req.url.as_str(), "connection refused"))
        }
    }

    async fn run(stage: &RobotsTxt, url: &str) -> bool {
        let mut req = Request::get(url).unwrap();
        stage.process(&mut req).await;
        !req.is_cancelled()
    }

    #[tokio::test]
    async fn test_parsed_rules_and_single_download() {
        let server = RobotsServer::new(StatusCode::OK);
        let metrics = Arc::new(Metrics::new());
        let stage = RobotsTxt::new(Arc::clone(&server) as Arc<dyn Fetch>, Arc::clone(&metrics));

        assert!(run(&stage, "https://example.com/public").await);
        assert!(!run(&stage, "https://example.com/private/page").await);
        assert!(run(&stage, "https://example.com/other").await);

        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
        let snap = metrics.snapshot();
        assert_eq!(snap.robots_requests, 1);
        assert_eq!(snap.robots_forbidden, 1);
    }

    #[tokio::test]
    async fn test_client_error_allows_everything() {
        let stage = RobotsTxt::new(RobotsServer::new(StatusCode::NOT_FOUND), Arc::new(Metrics::new()));
        assert!(run(&stage, "https://example.com/private").await);
    }

    #[tokio::test]
    async fn test_server_error_disallows_everything() {
        let stage = RobotsTxt::new(
            RobotsServer::new(StatusCode::SERVICE_UNAVAILABLE),
            Arc::new(Metrics::new()),
        );
        assert!(!run(&stage, "https://example.com/").await);
    }

    // What the executor returns once a 503 robots.txt used up its attempts
    struct Unavailable {
        calls: AtomicUsize,
        single_attempt: AtomicUsize,
    }

    #[async_trait]
    impl Fetch for Unavailable {
        async fn fetch(&self, req: Arc<Request>) -> Result<Response, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if req.retry_disabled {
                self.single_attempt.fetch_add(1, Ordering::SeqCst);
            }
            Err(FetchError::RetryableStatus {
                status: 503,
                attempts: 1,
            })
        }
    }

    #[tokio::test]
    async fn test_retryable_status_disallows_and_is_remembered() {
        let server = Arc::new(Unavailable {
            calls: AtomicUsize::new(0),
            single_attempt: AtomicUsize::new(0),
        });
        let stage = RobotsTxt::new(Arc::clone(&server) as Arc<dyn Fetch>, Arc::new(Metrics::new()));

        assert!(!run(&stage, "https://example.com/a").await);
        assert!(!run(&stage, "https://example.com/b").await);

        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
        assert_eq!(server.single_attempt.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_lets_request_through() {
        let stage = RobotsTxt::new(Arc::new(Offline), Arc::new(Metrics::new()));
        assert!(run(&stage, "https://example.com/private").await);
    }

    #[test]
    fn test_rules_per_agent() {
        let rules = RobotsRules::Parsed(Bytes::from_static(
            b"User-agent: badbot\nDisallow: /\n\nUser-agent: *\nDisallow:\n",
        ));
        assert!(!rules.allows("https://example.com/", "badbot"));
        assert!(rules.allows("https://example.com/", "trawler"));
    }
}
