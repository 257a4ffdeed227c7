// src/cli.rs
// =============================================================================
// This file defines our command-line interface using the `clap` crate.
//
// We use the "derive" API: the CLI structure is plain Rust structs and enums
// with #[...] attributes, and clap generates the parsing, --help and
// --version for us.
//
// The flags map almost one to one onto trawler::Config (see into_config).
// =============================================================================

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use url::Url;

use trawler::{Config, Request};

#[derive(Parser, Debug)]
#[command(
    name = "trawler",
    version,
    about = "A polite, concurrent web crawler",
    long_about = "trawler crawls websites starting from one or more seed URLs, follows \
                  same-domain links up to a depth and writes one JSON record per page."
)]
pub struct Cli {
    /// Only log warnings and errors (RUST_LOG still wins when set)
    #[arg(long, short, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Crawl one or more websites
    ///
    /// Example: trawler crawl https://quotes.toscrape.com --max-depth 2
    Crawl(CrawlArgs),
}

#[derive(Args, Debug)]
pub struct CrawlArgs {
    /// Seed URLs
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Maximum crawl depth. 1 = just the seed pages
    #[arg(long, default_value_t = 1)]
    pub max_depth: usize,

    /// Domains that may be crawled (repeatable). Defaults to the seeds' hosts
    #[arg(long = "allowed-domain")]
    pub allowed_domains: Vec<String>,

    /// Requests in flight at once, 0 = unlimited
    #[arg(long, default_value_t = 16)]
    pub concurrency: usize,

    /// Requests in flight per host, 0 = unlimited
    #[arg(long, default_value_t = 4)]
    pub per_domain: usize,

    /// Requests per second across the crawl, 0 = unlimited
    #[arg(long, default_value_t = 0)]
    pub rps: u32,

    /// Politeness delay before each request, in milliseconds
    #[arg(long, default_value_t = 0)]
    pub delay_ms: u64,

    /// Randomize the delay between 0.5x and 1.5x
    #[arg(long)]
    pub random_delay: bool,

    /// Retries for failed requests
    #[arg(long, default_value_t = trawler::config::DEFAULT_RETRY_TIMES)]
    pub retries: u32,

    /// Request timeout, in seconds
    #[arg(long, default_value_t = 10)]
    pub timeout: u64,

    #[arg(long, default_value = trawler::config::DEFAULT_USER_AGENT)]
    pub user_agent: String,

    /// Ignore robots.txt
    #[arg(long)]
    pub no_robots: bool,

    /// Fetch the same URL again when it is linked again
    #[arg(long)]
    pub revisit: bool,

    /// Keep responses in an on-disk HTTP cache in this directory
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Write results to this file instead of stdout
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Write a single JSON array instead of JSON lines (needs --output)
    #[arg(long, requires = "output")]
    pub json_array: bool,
}

impl CrawlArgs {
    pub fn into_config(self) -> Config {
        let allowed_domains = if self.allowed_domains.is_empty() {
            seed_hosts(&self.urls)
        } else {
            self.allowed_domains
        };

        Config {
            start_urls: self.urls,
            allowed_domains,
            concurrent_requests: self.concurrency,
            concurrent_requests_per_domain: self.per_domain,
            requests_per_second: self.rps,
            request_delay: Duration::from_millis(self.delay_ms),
            request_delay_randomize: self.random_delay,
            retry_times: self.retries,
            timeout: Duration::from_secs(self.timeout),
            user_agent: self.user_agent,
            robots_txt_disabled: self.no_robots,
            url_revisit_enabled: self.revisit,
            ..Config::default()
        }
    }
}

// Hosts of the seeds that parse; bad seeds are reported by config validation
fn seed_hosts(urls: &[String]) -> Vec<String> {
    let mut hosts: Vec<String> = urls
        .iter()
        .filter_map(|u| Request::parse_destination(u).ok())
        .filter_map(|u: Url| u.host_str().map(str::to_string))
        .collect();
    hosts.sort();
    hosts.dedup();
    hosts
}
