// src/config.rs
// =============================================================================
// Engine configuration.
//
// Every recognized option lives in one plain struct with a default. Options
// are checked once by EngineBuilder::build (see engine/builder.rs); nothing
// re-reads or mutates them afterwards.
//
// Behaviour that is code rather than data (callbacks, interceptors, exporters,
// cache stores) is handed to the EngineBuilder instead.
// =============================================================================

use std::time::Duration;

use url::Url;

use crate::error::ConfigError;
use crate::request::Request;

pub const DEFAULT_USER_AGENT: &str = "trawler/0.1";
pub const DEFAULT_MAX_BODY: u64 = 1024 * 1024 * 1024; // 1GB
pub const DEFAULT_RETRY_TIMES: u32 = 2;
pub const DEFAULT_RETRY_HTTP_CODES: [u16; 7] = [500, 502, 503, 504, 522, 524, 408];
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Which freshness rules the response cache applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Store everything, always serve from the store once stored
    Dummy,
    /// HTTP/1.1 freshness and validation rules
    #[default]
    Rfc2616,
}

/// Where rendered requests get their browser from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocator {
    /// Spawn a local headless browser binary per rendered request
    Local { program: String },
    /// Ask a remote rendering service (browserless-compatible `/content` API)
    Remote { endpoint: Url },
}

impl Default for Allocator {
    fn default() -> Self {
        Allocator::Local {
            program: "chromium".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Seed URLs issued with GET when no start function is set
    pub start_urls: Vec<String>,
    /// Domains that may be fetched. Empty means everything is allowed
    pub allowed_domains: Vec<String>,

    /// Global concurrency limit, 0 = unlimited
    pub concurrent_requests: usize,
    /// Per-host concurrency limit, 0 = unlimited
    pub concurrent_requests_per_domain: usize,
    /// Smoothed request rate, 0 = unlimited
    pub requests_per_second: u32,
    /// Politeness delay applied before every request
    pub request_delay: Duration,
    /// Randomize the delay to [0.5 * delay, 1.5 * delay)
    pub request_delay_randomize: bool,

    pub retry_times: u32,
    pub retry_http_codes: Vec<u16>,
    pub max_body_size: u64,
    pub charset_detect_disabled: bool,

    pub user_agent: String,
    pub timeout: Duration,
    /// Redirects followed before giving up, 0 = never follow
    pub max_redirects: usize,
    pub cookies_disabled: bool,
    pub proxy: Option<String>,

    pub robots_txt_disabled: bool,
    pub url_revisit_enabled: bool,
    pub parse_html_disabled: bool,
    pub log_disabled: bool,

    pub cache_policy: CachePolicy,
    pub allocator: Allocator,
    pub render_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            start_urls: Vec::new(),
            allowed_domains: Vec::new(),
            concurrent_requests: 0,
            concurrent_requests_per_domain: 0,
            requests_per_second: 0,
            request_delay: Duration::ZERO,
            request_delay_randomize: false,
            retry_times: DEFAULT_RETRY_TIMES,
            retry_http_codes: DEFAULT_RETRY_HTTP_CODES.to_vec(),
            max_body_size: DEFAULT_MAX_BODY,
            charset_detect_disabled: false,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: DEFAULT_TIMEOUT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            cookies_disabled: false,
            proxy: None,
            robots_txt_disabled: false,
            url_revisit_enabled: false,
            parse_html_disabled: false,
            log_disabled: false,
            cache_policy: CachePolicy::default(),
            allocator: Allocator::default(),
            render_timeout: DEFAULT_RENDER_TIMEOUT,
        }
    }
}

impl Config {
    // Checks everything that can be checked before the first request.
    // A bad seed is the one failure that must stop the crawl up front.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for start_url in &self.start_urls {
            Request::parse_destination(start_url).map_err(ConfigError::InvalidStartUrl)?;
        }

        for code in &self.retry_http_codes {
            if !(100..=999).contains(code) {
                return Err(ConfigError::InvalidStatusCode(*code));
            }
        }

        if let Some(proxy) = &self.proxy {
            Url::parse(proxy).map_err(|_| ConfigError::InvalidProxy(proxy.clone()))?;
        }

        Ok(())
    }

    pub fn is_retry_status(&self, status: u16) -> bool {
        self.retry_http_codes.contains(&status)
    }
}
