// src/client/transport.rs
// =============================================================================
// The raw HTTP exchange, below retries and decoding.
//
// Transport is the seam between the executor and the network. The default
// implementation wraps a reqwest::Client configured from Config (timeout,
// redirects, proxy, cookie jar). Tests plug in scripted transports.
//
// The body comes back as a stream so the executor decides how much of it to
// read.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use reqwest::cookie::Jar;
use reqwest::header::HeaderMap;
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use url::Url;

use crate::config::Config;
use crate::error::{ConfigError, FetchError};
use crate::request::Request;

pub type BodyStream = BoxStream<'static, Result<Bytes, FetchError>>;

pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// URL the body was finally served from
    pub url: Url,
    pub body: BodyStream,
}

impl RawResponse {
    // Convenience for transports that already hold the whole body
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, url: Url, body: Bytes) -> Self {
        Self {
            status,
            headers,
            url,
            body: Box::pin(futures::stream::once(async move { Ok(body) })),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, req: &Request) -> Result<RawResponse, FetchError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
    cookie_jar: Option<Arc<Jar>>,
}

impl ReqwestTransport {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let redirect = if config.max_redirects == 0 {
            Policy::none()
        } else {
            Policy::limited(config.max_redirects)
        };

        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(std::time::Duration::from_secs(10))
            .redirect(redirect)
            .pool_max_idle_per_host(1000);

        let cookie_jar = if config.cookies_disabled {
            None
        } else {
            let jar = Arc::new(Jar::default());
            builder = builder.cookie_provider(Arc::clone(&jar));
            Some(jar)
        };

        if let Some(proxy) = &config.proxy {
            let proxy =
                reqwest::Proxy::all(proxy).map_err(|_| ConfigError::InvalidProxy(proxy.clone()))?;
            builder = builder.proxy(proxy);
        }

        Ok(Self {
            client: builder.build()?,
            cookie_jar,
        })
    }

    pub fn cookie_jar(&self) -> Option<Arc<Jar>> {
        self.cookie_jar.clone()
    }

    // The underlying client, shared with the remote renderer
    pub fn http_client(&self) -> reqwest::Client {
        self.client.clone()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn round_trip(&self, req: &Request) -> Result<RawResponse, FetchError> {
        let response = self
            .client
            .request(req.method.clone(), req.url.clone())
            .headers(req.headers.clone())
            .body(req.body.clone())
            .send()
            .await?;

        Ok(RawResponse {
            status: response.status(),
            headers: response.headers().clone(),
            url: response.url().clone(),
            body: Box::pin(response.bytes_stream().map_err(FetchError::from)),
        })
    }
}
