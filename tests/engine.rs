// tests/engine.rs
// =============================================================================
// End-to-end engine behaviour against an in-process site.
//
// FakeSite implements Transport: it serves a fixed map of pages, records
// every URL that reached the network and tracks how many exchanges were in
// flight at once (overall and per host).
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use trawler::client::{RawResponse, Transport};
use trawler::export::ExportError;
use trawler::{
    Config, Engine, EngineBuilder, Exporter, FetchError, JsonLines, MemoryStore, Request, Response,
};

#[derive(Clone)]
struct Page {
    status: u16,
    body: String,
    cache_control: Option<&'static str>,
}

#[derive(Default)]
struct FakeSite {
    pages: HashMap<String, Page>,
    delay: Duration,
    hits: Mutex<Vec<String>>,
    in_flight: Mutex<HashMap<String, usize>>,
    peak_per_host: AtomicUsize,
    global_in_flight: AtomicUsize,
    peak_global: AtomicUsize,
}

impl FakeSite {
    fn new() -> Self {
        Self::default()
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn html(mut self, url: &str, links: &[&str]) -> Self {
        let anchors: String = links
            .iter()
            .map(|l| format!(r#"<a href="{}">link</a>"#, l))
            .collect();
        self.pages.insert(
            url.to_string(),
            Page {
                status: 200,
                body: format!("<html><body>{}</body></html>", anchors),
                cache_control: None,
            },
        );
        self
    }

    fn page(mut self, url: &str, status: u16, body: &str, cache_control: Option<&'static str>) -> Self {
        self.pages.insert(
            url.to_string(),
            Page {
                status,
                body: body.to_string(),
                cache_control,
            },
        );
        self
    }

    fn hits(&self) -> Vec<String> {
        self.hits.lock().unwrap().clone()
    }

    fn hit_count(&self, url: &str) -> usize {
        self.hits().iter().filter(|h| h.as_str() == url).count()
    }
}

#[async_trait]
impl Transport for FakeSite {
    async fn round_trip(&self, req: &Request) -> Result<RawResponse, FetchError> {
        let url = req.url.to_string();
        let host = req.host();
        self.hits.lock().unwrap().push(url.clone());

        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let count = in_flight.entry(host.clone()).or_insert(0);
            *count += 1;
            self.peak_per_host.fetch_max(*count, Ordering::SeqCst);
        }
        let global = self.global_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_global.fetch_max(global, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.global_in_flight.fetch_sub(1, Ordering::SeqCst);
        *self.in_flight.lock().unwrap().get_mut(&host).unwrap() -= 1;

        let page = self.pages.get(&url).cloned().unwrap_or(Page {
            status: 404,
            body: "not found".to_string(),
            cache_control: None,
        });

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
        if let Some(cc) = page.cache_control {
            headers.insert(CACHE_CONTROL, HeaderValue::from_static(cc));
        }

        Ok(RawResponse::from_bytes(
            StatusCode::from_u16(page.status).unwrap(),
            headers,
            req.url.clone(),
            Bytes::from(page.body),
        ))
    }
}

fn quiet_config() -> Config {
    Config {
        robots_txt_disabled: true,
        log_disabled: true,
        ..Config::default()
    }
}

type Seen = Arc<Mutex<Vec<Response>>>;

// Builder whose default callback records every response
fn recording(config: Config, site: Arc<FakeSite>) -> (EngineBuilder, Seen) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let builder = EngineBuilder::new(config)
        .transport(site)
        .parse(move |_engine, res| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(res);
            }
        });
    (builder, seen)
}

fn urls(seen: &Seen) -> Vec<String> {
    let mut urls: Vec<String> = seen.lock().unwrap().iter().map(|r| r.url.to_string()).collect();
    urls.sort();
    urls
}

#[tokio::test]
async fn test_follows_links_within_allowed_domains() {
    let site = Arc::new(
        FakeSite::new()
            .html(
                "https://site.test/",
                &["/a", "/b", "/c", "https://other.test/x"],
            )
            .html("https://site.test/a", &[])
            .html("https://site.test/b", &[])
            .html("https://site.test/c", &[]),
    );

    let config = Config {
        start_urls: vec!["https://site.test/".to_string()],
        allowed_domains: vec!["site.test".to_string()],
        ..quiet_config()
    };

    let results = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&results);
    let engine = EngineBuilder::new(config)
        .transport(Arc::clone(&site) as Arc<dyn Transport>)
        .parse(move |engine: Engine, res: Response| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(res.url.to_string());
                for link in &res.links {
                    engine.get(link.as_str()).await;
                }
            }
        })
        .build()
        .unwrap();

    engine.start().await;

    assert_eq!(results.lock().unwrap().len(), 4);
    assert!(site.hits().iter().all(|h| h.starts_with("https://site.test/")));
    assert_eq!(engine.pending(), 0);
}

#[tokio::test]
async fn test_duplicate_requests_are_dropped() {
    let site = Arc::new(FakeSite::new().html("https://site.test/", &[]));
    let (builder, seen) = recording(quiet_config(), Arc::clone(&site));
    let engine = builder.build().unwrap();

    engine.get("https://site.test/").await;
    engine.get("https://site.test/").await;
    engine.await_idle().await;

    assert_eq!(site.hit_count("https://site.test/"), 1);
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_revisit_enabled_fetches_again() {
    let site = Arc::new(FakeSite::new().html("https://site.test/", &[]));
    let config = Config {
        url_revisit_enabled: true,
        ..quiet_config()
    };
    let (builder, seen) = recording(config, Arc::clone(&site));
    let engine = builder.build().unwrap();

    engine.get("https://site.test/").await;
    engine.get("https://site.test/").await;
    engine.await_idle().await;

    assert_eq!(site.hit_count("https://site.test/"), 2);
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_concurrency_limits_hold() {
    let mut site = FakeSite::new().with_delay(Duration::from_millis(30));
    for host in ["one.test", "two.test", "three.test"] {
        for i in 0..6 {
            site = site.html(&format!("https://{}/{}", host, i), &[]);
        }
    }
    let site = Arc::new(site);

    let config = Config {
        concurrent_requests: 4,
        concurrent_requests_per_domain: 2,
        ..quiet_config()
    };
    let (builder, seen) = recording(config, Arc::clone(&site));
    let engine = builder.build().unwrap();

    for host in ["one.test", "two.test", "three.test"] {
        for i in 0..6 {
            engine.get(&format!("https://{}/{}", host, i)).await;
        }
    }
    engine.await_idle().await;

    assert_eq!(seen.lock().unwrap().len(), 18);
    assert!(site.peak_per_host.load(Ordering::SeqCst) <= 2);
    assert!(site.peak_global.load(Ordering::SeqCst) <= 4);
    assert!(site.peak_global.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn test_shutdown_stops_new_requests_but_finishes_in_flight() {
    let site = Arc::new(
        FakeSite::new()
            .with_delay(Duration::from_millis(100))
            .html("https://site.test/slow", &[])
            .html("https://site.test/late", &[]),
    );
    let (builder, seen) = recording(quiet_config(), Arc::clone(&site));
    let engine = builder.build().unwrap();

    engine.get("https://site.test/slow").await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.interrupt();
    engine.get("https://site.test/late").await;
    engine.await_idle().await;

    assert_eq!(urls(&seen), vec!["https://site.test/slow"]);
    assert_eq!(site.hit_count("https://site.test/late"), 0);

    // A second interrupt changes nothing
    engine.interrupt();
    assert!(engine.is_shutting_down());
}

#[tokio::test]
async fn test_await_idle_is_idempotent() {
    let site = Arc::new(FakeSite::new().html("https://site.test/", &[]));
    let (builder, _seen) = recording(quiet_config(), site);
    let engine = builder.build().unwrap();

    engine.get("https://site.test/").await;
    engine.await_idle().await;

    let again = tokio::time::timeout(Duration::from_millis(200), engine.await_idle()).await;
    assert!(again.is_ok());
    let third = tokio::time::timeout(Duration::from_millis(200), engine.await_idle()).await;
    assert!(third.is_ok());
}

#[tokio::test]
async fn test_panicking_callback_is_recovered() {
    let site = Arc::new(
        FakeSite::new()
            .html("https://site.test/boom", &[])
            .html("https://site.test/fine", &[]),
    );
    let fine = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fine);

    let engine = EngineBuilder::new(quiet_config())
        .transport(site)
        .parse(move |_engine, res: Response| {
            let counter = Arc::clone(&counter);
            async move {
                if res.url.path() == "/boom" {
                    panic!("callback exploded");
                }
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .build()
        .unwrap();

    engine.get("https://site.test/boom").await;
    engine.get("https://site.test/fine").await;
    engine.await_idle().await;

    assert_eq!(fine.load(Ordering::SeqCst), 1);
    assert_eq!(engine.metrics().panics, 1);
    assert_eq!(engine.pending(), 0);
}

#[tokio::test]
async fn test_metadata_reaches_the_callback() {
    let site = Arc::new(FakeSite::new().html("https://site.test/", &[]));
    let (builder, seen) = recording(quiet_config(), site);
    let engine = builder.build().unwrap();

    let mut req = Request::get("https://site.test/").unwrap();
    req.meta.insert("category".to_string(), json!("books"));
    engine.request(req).await;
    engine.await_idle().await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].request.meta["category"], json!("books"));
}

#[tokio::test]
async fn test_request_with_overrides_default_callback() {
    let site = Arc::new(FakeSite::new().html("https://site.test/", &[]));
    let (builder, seen) = recording(quiet_config(), site);
    let engine = builder.build().unwrap();

    let hit = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hit);
    engine
        .request_with(Request::get("https://site.test/").unwrap(), move |_engine, _res| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;
    engine.await_idle().await;

    assert_eq!(hit.load(Ordering::SeqCst), 1);
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_retry_exhaustion_reaches_error_callback() {
    let site = Arc::new(FakeSite::new().page("https://site.test/flaky", 503, "down", None));
    let config = Config {
        retry_times: 1,
        ..quiet_config()
    };

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    let engine = EngineBuilder::new(config)
        .transport(Arc::clone(&site) as Arc<dyn Transport>)
        .on_error(move |_engine, req: Arc<Request>, err: FetchError| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push((req.retry_count(), err.to_string()));
            }
        })
        .build()
        .unwrap();

    engine.get("https://site.test/flaky").await;
    engine.await_idle().await;

    assert_eq!(site.hit_count("https://site.test/flaky"), 2);
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, 1);
    assert_eq!(errors[0].1, "error due to status code 503 after 2 attempt(s)");
    assert_eq!(engine.metrics().retries, 1);
}

#[tokio::test]
async fn test_robots_txt_is_honoured() {
    let site = Arc::new(
        FakeSite::new()
            .page(
                "https://site.test/robots.txt",
                200,
                "User-agent: *\nDisallow: /private\n",
                None,
            )
            .html("https://site.test/public", &[])
            .html("https://site.test/private/page", &[]),
    );
    let config = Config {
        robots_txt_disabled: false,
        ..quiet_config()
    };
    let (builder, seen) = recording(config, Arc::clone(&site));
    let engine = builder.build().unwrap();

    engine.get("https://site.test/public").await;
    engine.await_idle().await;
    engine.get("https://site.test/private/page").await;
    engine.await_idle().await;

    assert_eq!(urls(&seen), vec!["https://site.test/public"]);
    assert_eq!(site.hit_count("https://site.test/robots.txt"), 1);
    assert_eq!(site.hit_count("https://site.test/private/page"), 0);

    let stats = engine.metrics();
    assert_eq!(stats.robots_requests, 1);
    assert_eq!(stats.robots_forbidden, 1);
}

#[tokio::test]
async fn test_unavailable_robots_txt_closes_the_host() {
    let site = Arc::new(
        FakeSite::new()
            .page("https://site.test/robots.txt", 503, "down", None)
            .html("https://site.test/one", &[])
            .html("https://site.test/two", &[]),
    );
    let config = Config {
        log_disabled: true,
        ..Config::default()
    };
    let (builder, seen) = recording(config, Arc::clone(&site));
    let engine = builder.build().unwrap();

    engine.get("https://site.test/one").await;
    engine.await_idle().await;
    engine.get("https://site.test/two").await;
    engine.await_idle().await;

    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(site.hit_count("https://site.test/one"), 0);
    assert_eq!(site.hit_count("https://site.test/two"), 0);
    assert_eq!(site.hit_count("https://site.test/robots.txt"), 1);

    let stats = engine.metrics();
    assert_eq!(stats.robots_requests, 1);
    assert_eq!(stats.robots_forbidden, 2);
    assert_eq!(stats.retries, 0);
}

#[tokio::test]
async fn test_cached_pages_skip_the_network() {
    let site = Arc::new(FakeSite::new().page(
        "https://site.test/cached",
        200,
        "<html>hello</html>",
        Some("max-age=3600"),
    ));
    let config = Config {
        url_revisit_enabled: true,
        ..quiet_config()
    };
    let (builder, seen) = recording(config, Arc::clone(&site));
    let engine = builder.cache(Arc::new(MemoryStore::new())).build().unwrap();

    engine.get("https://site.test/cached").await;
    engine.await_idle().await;
    engine.get("https://site.test/cached").await;
    engine.await_idle().await;

    assert_eq!(site.hit_count("https://site.test/cached"), 1);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(!seen[0].from_cache);
    assert!(seen[1].from_cache);
    assert_eq!(engine.metrics().cache_hits, 1);
}

#[tokio::test]
async fn test_cancel_aborts_requests_waiting_for_admission() {
    let site = Arc::new(
        FakeSite::new()
            .with_delay(Duration::from_millis(200))
            .html("https://site.test/first", &[])
            .html("https://site.test/second", &[]),
    );
    let config = Config {
        concurrent_requests: 1,
        ..quiet_config()
    };

    let cancelled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&cancelled);
    let engine = EngineBuilder::new(config)
        .transport(Arc::clone(&site) as Arc<dyn Transport>)
        .on_error(move |_engine, _req, err: FetchError| {
            let counter = Arc::clone(&counter);
            async move {
                if matches!(err, FetchError::Cancelled { .. }) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }
        })
        .build()
        .unwrap();

    engine.get("https://site.test/first").await;
    engine.get("https://site.test/second").await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.cancel();
    engine.await_idle().await;

    assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    assert_eq!(site.hit_count("https://site.test/second"), 0);
}

// Collects exported items in memory
struct Collect(Arc<Mutex<Vec<Value>>>);

#[async_trait]
impl Exporter for Collect {
    async fn export(&self, mut items: mpsc::Receiver<Value>) -> Result<(), ExportError> {
        while let Some(item) = items.recv().await {
            self.0.lock().unwrap().push(item);
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_every_exporter_gets_every_item() {
    let site = Arc::new(
        FakeSite::new()
            .html("https://site.test/1", &[])
            .html("https://site.test/2", &[])
            .html("https://site.test/3", &[]),
    );
    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));
    let dir = tempfile::tempdir().unwrap();
    let lines_path = dir.path().join("out.jsonl");

    let config = Config {
        start_urls: (1..=3).map(|i| format!("https://site.test/{}", i)).collect(),
        ..quiet_config()
    };
    let engine = EngineBuilder::new(config)
        .transport(site)
        .exporter(Arc::new(Collect(Arc::clone(&first))))
        .exporter(Arc::new(Collect(Arc::clone(&second))))
        .exporter(Arc::new(JsonLines::new(&lines_path)))
        .parse(|engine: Engine, res: Response| async move {
            engine.export(json!({ "url": res.url.as_str() })).await;
        })
        .build()
        .unwrap();

    engine.start().await;

    assert_eq!(first.lock().unwrap().len(), 3);
    assert_eq!(second.lock().unwrap().len(), 3);
    let written = std::fs::read_to_string(&lines_path).unwrap();
    assert_eq!(written.lines().count(), 3);
}

#[tokio::test]
async fn test_start_function_replaces_seeds() {
    let site = Arc::new(
        FakeSite::new()
            .html("https://site.test/from-start", &[])
            .html("https://site.test/seed", &[]),
    );
    let config = Config {
        start_urls: vec!["https://site.test/seed".to_string()],
        ..quiet_config()
    };
    let (builder, seen) = recording(config, Arc::clone(&site));
    let engine = builder
        .start_with(|engine: Engine| async move {
            engine.get("https://site.test/from-start").await;
        })
        .build()
        .unwrap();

    engine.start().await;

    assert_eq!(urls(&seen), vec!["https://site.test/from-start"]);
    assert_eq!(site.hit_count("https://site.test/seed"), 0);
}
