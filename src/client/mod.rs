// src/client/mod.rs
// =============================================================================
// The fetch executor.
//
// Client turns a Request into a Response:
// - direct requests go through a Transport, the body is read up to
//   max_body_size and text bodies are decoded to UTF-8
// - rendered requests go through a Renderer, bounded by the render timeout
//   and by the request's cancellation token
//
// Retries happen here and only here. A transport error, or a status listed
// in retry_http_codes, bumps the request's retry counter and runs the whole
// executor again (decoding included). Retried requests never go back through
// the interceptor pipeline or the admission gates.
//
// Submodules:
// - transport: the raw HTTP exchange (reqwest by default)
// - decode: capped body reads and charset decoding
// - render: the headless browser collaborators
// =============================================================================

mod decode;
mod render;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use tracing::{debug, warn};
use url::Url;

pub use decode::charset_from_content_type;
pub use render::{renderer_for, LocalRenderer, RemoteRenderer, RenderAction, Rendered, Renderer};
pub use transport::{BodyStream, RawResponse, ReqwestTransport, Transport};

use crate::config::Config;
use crate::error::FetchError;
use crate::metrics::Metrics;
use crate::request::{Request, Response};

/// Anything that can turn a request into a response: the executor itself,
/// or the cache sitting in front of it.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, req: Arc<Request>) -> Result<Response, FetchError>;
}

pub struct Client {
    transport: Arc<dyn Transport>,
    renderer: Option<Arc<dyn Renderer>>,
    cookie_jar: Option<Arc<Jar>>,
    metrics: Arc<Metrics>,

    max_body_size: u64,
    charset_detect_disabled: bool,
    retry_times: u32,
    retry_http_codes: Vec<u16>,
    render_timeout: Duration,
}

impl Client {
    pub fn new(config: &Config, transport: Arc<dyn Transport>, metrics: Arc<Metrics>) -> Self {
        Self {
            transport,
            renderer: None,
            cookie_jar: None,
            metrics,
            max_body_size: config.max_body_size,
            charset_detect_disabled: config.charset_detect_disabled,
            retry_times: config.retry_times,
            retry_http_codes: config.retry_http_codes.clone(),
            render_timeout: config.render_timeout,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn with_cookie_jar(mut self, jar: Option<Arc<Jar>>) -> Self {
        self.cookie_jar = jar;
        self
    }

    // Selects the plain or rendered path and applies the retry policy.
    // Boxed because a retry re-enters this same function.
    pub fn do_request(&self, req: Arc<Request>) -> BoxFuture<'_, Result<Response, FetchError>> {
        Box::pin(async move {
            let result = if req.rendered {
                self.do_request_rendered(&req).await
            } else {
                self.do_request_client(&req).await
            };

            let retry_times = if req.retry_disabled { 0 } else { self.retry_times };
            match result {
                Err(err) if err.is_retryable() && req.retry_count() < retry_times => {
                    let attempt = req.increment_retry();
                    self.metrics.retried();
                    warn!(url = %req.url, attempt, error = %err, "retrying");
                    self.do_request(req).await
                }
                Err(err) => Err(err),
                Ok(res) if self.retry_http_codes.contains(&res.status.as_u16()) => {
                    if req.retry_count() < retry_times {
                        let attempt = req.increment_retry();
                        self.metrics.retried();
                        warn!(url = %req.url, attempt, status = res.status.as_u16(), "retrying");
                        return self.do_request(req).await;
                    }
                    Err(FetchError::RetryableStatus {
                        status: res.status.as_u16(),
                        attempts: req.retry_count() + 1,
                    })
                }
                Ok(res) => Ok(res),
            }
        })
    }

    async fn do_request_client(&self, req: &Arc<Request>) -> Result<Response, FetchError> {
        let raw = self.transport.round_trip(req).await?;
        let content_type = raw
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body = decode::read_capped(raw.body, self.max_body_size).await?;

        if req.method != Method::HEAD && !body.is_empty() {
            if let Some(label) = &req.encoding {
                body = decode::decode_with_label(body, label);
            } else if !self.charset_detect_disabled {
                body = decode::decode_detected(body, content_type.as_deref());
            }
        }

        debug!(url = %req.url, status = raw.status.as_u16(), bytes = body.len(), "fetched");

        let mut response = Response::new(Arc::clone(req), raw.status, raw.headers, body);
        response.url = raw.url;
        Ok(response)
    }

    async fn do_request_rendered(&self, req: &Arc<Request>) -> Result<Response, FetchError> {
        let renderer = self.renderer.as_ref().ok_or_else(|| FetchError::Render {
            url: req.url.to_string(),
            reason: "no renderer configured".to_string(),
        })?;
        let timed_out = || FetchError::RenderTimeout {
            url: req.url.to_string(),
        };

        let rendered = tokio::select! {
            biased;
            _ = req.context().cancelled() => return Err(timed_out()),
            result = tokio::time::timeout(self.render_timeout, renderer.render(req)) => {
                match result {
                    Ok(rendered) => rendered?,
                    Err(_) => return Err(timed_out()),
                }
            }
        };

        let mut response = Response::new(
            Arc::clone(req),
            rendered.status,
            rendered.headers,
            Bytes::from(rendered.document),
        );
        response.url = rendered.url;
        Ok(response)
    }

    /// Stores cookies (raw Set-Cookie strings) for `url`
    pub fn set_cookies(&self, url: &Url, cookies: &[&str]) -> Result<(), FetchError> {
        let jar = self.cookie_jar.as_ref().ok_or(FetchError::NoCookieJar)?;
        for cookie in cookies {
            jar.add_cookie_str(cookie, url);
        }
        Ok(())
    }

    /// The Cookie header that would be sent to `url`
    pub fn cookies(&self, url: &Url) -> Result<Option<HeaderValue>, FetchError> {
        let jar = self.cookie_jar.as_ref().ok_or(FetchError::NoCookieJar)?;
        Ok(jar.cookies(url))
    }
}

#[async_trait]
impl Fetch for Client {
    async fn fetch(&self, req: Arc<Request>) -> Result<Response, FetchError> {
        self.do_request(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderMap;
    use reqwest::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    // Replays a script of outcomes, one per call, repeating the last one.
    struct Scripted {
        script: Mutex<Vec<Result<u16, &'static str>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(script: Vec<Result<u16, &'static str>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn round_trip(&self, req: &Request) -> Result<RawResponse, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let script = self.script.lock().unwrap();
            let step = script[n.min(script.len() - 1)];
            match step {
                Ok(status) => Ok(RawResponse::from_bytes(
                    StatusCode::from_u16(status).unwrap(),
                    HeaderMap::new(),
                    req.url.clone(),
                    Bytes::from_static(b"hello"),
                )),
                Err(reason) => Err(FetchError::transport(req.url.as_str(), reason)),
            }
        }
    }

    fn client(transport: Arc<Scripted>, retry_times: u32) -> Client {
        let config = Config {
            retry_times,
            ..Config::default()
        };
        Client::new(&config, transport, Arc::new(Metrics::new()))
    }

    #[tokio::test]
    async fn test_success_without_retry() {
        let transport = Scripted::new(vec![Ok(200)]);
        let client = client(Arc::clone(&transport), 2);
        let req = Arc::new(Request::get("https://example.com/").unwrap());

        let res = client.fetch(Arc::clone(&req)).await.unwrap();
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.text(), "hello");
        assert_eq!(req.retry_count(), 0);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_n_transport_failures() {
        let transport = Scripted::new(vec![Err("reset"), Err("reset"), Err("reset"), Ok(200)]);
        let client = client(Arc::clone(&transport), 3);
        let req = Arc::new(Request::get("https://example.com/").unwrap());

        let res = client.fetch(Arc::clone(&req)).await.unwrap();
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(req.retry_count(), 3);
        assert_eq!(transport.calls(), 4);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_makes_exactly_three_attempts() {
        let transport = Scripted::new(vec![Err("connection refused")]);
        let client = client(Arc::clone(&transport), 2);
        let req = Arc::new(Request::get("https://example.com/").unwrap());

        let result = client.fetch(Arc::clone(&req)).await;
        assert!(matches!(result, Err(FetchError::Transport { .. })));
        assert_eq!(transport.calls(), 3);
        assert_eq!(req.retry_count(), 2);
    }

    #[tokio::test]
    async fn test_retryable_status_is_retried_then_surfaced() {
        let transport = Scripted::new(vec![Ok(503)]);
        let client = client(Arc::clone(&transport), 2);
        let req = Arc::new(Request::get("https://example.com/").unwrap());

        let result = client.fetch(req).await;
        assert!(matches!(
            result,
            Err(FetchError::RetryableStatus {
                status: 503,
                attempts: 3
            })
        ));
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_retry_disabled_makes_one_attempt() {
        let transport = Scripted::new(vec![Ok(503)]);
        let client = client(Arc::clone(&transport), 2);
        let mut req = Request::get("https://example.com/robots.txt").unwrap();
        req.retry_disabled = true;

        let result = client.fetch(Arc::new(req)).await;
        assert!(matches!(
            result,
            Err(FetchError::RetryableStatus {
                status: 503,
                attempts: 1
            })
        ));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_status_is_returned() {
        let transport = Scripted::new(vec![Ok(404)]);
        let client = client(Arc::clone(&transport), 2);
        let req = Arc::new(Request::get("https://example.com/missing").unwrap());

        let res = client.fetch(req).await.unwrap();
        assert_eq!(res.status, StatusCode::NOT_FOUND);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_body_is_capped() {
        let transport = Scripted::new(vec![Ok(200)]);
        let config = Config {
            max_body_size: 3,
            ..Config::default()
        };
        let client = Client::new(&config, transport, Arc::new(Metrics::new()));
        let req = Arc::new(Request::get("https://example.com/").unwrap());

        let res = client.fetch(req).await.unwrap();
        assert_eq!(res.text(), "hel");
    }

    struct SlowRenderer;

    #[async_trait]
    impl Renderer for SlowRenderer {
        async fn render(&self, req: &Request) -> Result<Rendered, FetchError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Rendered {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                url: req.url.clone(),
                document: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_render_cancelled_by_context() {
        let transport = Scripted::new(vec![Ok(200)]);
        let client = client(transport, 2).with_renderer(Arc::new(SlowRenderer));

        let token = CancellationToken::new();
        let mut req = Request::get("https://example.com/").unwrap().with_context(token.clone());
        req.rendered = true;
        token.cancel();

        let result = client.fetch(Arc::new(req)).await;
        assert!(matches!(result, Err(FetchError::RenderTimeout { .. })));
    }

    #[tokio::test]
    async fn test_render_timeout_is_not_retried() {
        let transport = Scripted::new(vec![Ok(200)]);
        let config = Config {
            render_timeout: Duration::from_millis(50),
            ..Config::default()
        };
        let client = Client::new(&config, Arc::clone(&transport) as Arc<dyn Transport>, Arc::new(Metrics::new()))
            .with_renderer(Arc::new(SlowRenderer));

        let mut req = Request::get("https://example.com/").unwrap();
        req.rendered = true;
        let req = Arc::new(req);

        let result = client.fetch(Arc::clone(&req)).await;
        assert!(matches!(result, Err(FetchError::RenderTimeout { .. })));
        assert_eq!(req.retry_count(), 0);
        assert_eq!(transport.calls(), 0);
    }

    #[test]
    fn test_cookies_without_jar() {
        let transport = Scripted::new(vec![Ok(200)]);
        let client = client(transport, 0);
        let url = Url::parse("https://example.com/").unwrap();

        assert!(matches!(
            client.set_cookies(&url, &["a=b"]),
            Err(FetchError::NoCookieJar)
        ));
        assert!(matches!(client.cookies(&url), Err(FetchError::NoCookieJar)));
    }

    #[test]
    fn test_cookies_with_jar() {
        let transport = Scripted::new(vec![Ok(200)]);
        let client = client(transport, 0).with_cookie_jar(Some(Arc::new(Jar::default())));
        let url = Url::parse("https://example.com/").unwrap();

        client.set_cookies(&url, &["session=abc; Path=/"]).unwrap();
        let header = client.cookies(&url).unwrap().unwrap();
        assert_eq!(header.to_str().unwrap(), "session=abc");
    }
}
