// src/engine/builder.rs
// =============================================================================
// EngineBuilder: everything that is code rather than configuration.
//
// Config carries the data (limits, timeouts, flags). The builder collects the
// behaviour (callbacks, extra interceptors, exporters, a cache store, and
// optionally a replacement transport or renderer), validates the Config and
// wires the pieces together:
//
//   Transport -> Client (retries, decoding) -> CacheTransport (if a store is
//   set) -> used by both the engine and the robots.txt stage
//
// build() is the only place a configuration problem can surface.
// =============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use reqwest::cookie::Jar;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::{Callback, Engine, EngineInner, ErrorCallback, StartCallback, EXPORT_BUFFER};
use crate::admission::AdmissionController;
use crate::cache::{CacheStore, CacheTransport};
use crate::client::{renderer_for, Client, Fetch, Renderer, ReqwestTransport, Transport};
use crate::config::Config;
use crate::error::{ConfigError, FetchError};
use crate::export::Exporter;
use crate::metrics::Metrics;
use crate::pipeline::{Pipeline, RequestInterceptor, ResponseInterceptor};
use crate::request::{Request, Response};

pub struct EngineBuilder {
    config: Config,
    parse: Option<Callback>,
    start: Option<StartCallback>,
    on_error: Option<ErrorCallback>,
    request_stages: Vec<Arc<dyn RequestInterceptor>>,
    response_stages: Vec<Arc<dyn ResponseInterceptor>>,
    exporters: Vec<Arc<dyn Exporter>>,
    cache_store: Option<Arc<dyn CacheStore>>,
    transport: Option<Arc<dyn Transport>>,
    renderer: Option<Arc<dyn Renderer>>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            parse: None,
            start: None,
            on_error: None,
            request_stages: Vec::new(),
            response_stages: Vec::new(),
            exporters: Vec::new(),
            cache_store: None,
            transport: None,
            renderer: None,
        }
    }

    /// Default callback for every response
    pub fn parse<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Engine, Response) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.parse = Some(Arc::new(move |engine, res| f(engine, res).boxed()));
        self
    }

    /// Issues the first requests instead of `start_urls`
    pub fn start_with<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Engine) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.start = Some(Arc::new(move |engine| f(engine).boxed()));
        self
    }

    /// Receives fetch failures instead of the error log
    pub fn on_error<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Engine, Arc<Request>, FetchError) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_error = Some(Arc::new(move |engine, req, err| f(engine, req, err).boxed()));
        self
    }

    pub fn request_interceptor(mut self, stage: Arc<dyn RequestInterceptor>) -> Self {
        self.request_stages.push(stage);
        self
    }

    pub fn response_interceptor(mut self, stage: Arc<dyn ResponseInterceptor>) -> Self {
        self.response_stages.push(stage);
        self
    }

    pub fn exporter(mut self, exporter: Arc<dyn Exporter>) -> Self {
        self.exporters.push(exporter);
        self
    }

    pub fn cache(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    pub fn build(self) -> Result<Engine, ConfigError> {
        let config = self.config;
        config.validate()?;

        let metrics = Arc::new(Metrics::new());

        // A replacement transport brings its own cookie handling, if any
        let (transport, cookie_jar, http): (Arc<dyn Transport>, Option<Arc<Jar>>, reqwest::Client) =
            match self.transport {
                Some(transport) => (transport, None, reqwest::Client::default()),
                None => {
                    let reqwest_transport = ReqwestTransport::new(&config)?;
                    let jar = reqwest_transport.cookie_jar();
                    let http = reqwest_transport.http_client();
                    (Arc::new(reqwest_transport), jar, http)
                }
            };

        let renderer = self
            .renderer
            .unwrap_or_else(|| renderer_for(&config.allocator, http));

        let client = Arc::new(
            Client::new(&config, transport, Arc::clone(&metrics))
                .with_renderer(renderer)
                .with_cookie_jar(cookie_jar),
        );

        let fetcher: Arc<dyn Fetch> = match self.cache_store {
            Some(store) => Arc::new(CacheTransport::new(
                Arc::clone(&client) as Arc<dyn Fetch>,
                store,
                config.cache_policy,
                Arc::clone(&metrics),
            )),
            None => Arc::clone(&client) as Arc<dyn Fetch>,
        };

        let mut pipeline = Pipeline::standard(&config, Arc::clone(&fetcher), Arc::clone(&metrics));
        for stage in self.request_stages {
            pipeline = pipeline.with_request_stage(stage);
        }
        for stage in self.response_stages {
            pipeline = pipeline.with_response_stage(stage);
        }

        let (exports_tx, exports_rx) = mpsc::channel::<Value>(EXPORT_BUFFER);
        let (pending, _) = watch::channel(0usize);

        Ok(Engine {
            inner: Arc::new(EngineInner {
                admission: AdmissionController::new(&config),
                config,
                pipeline,
                fetcher,
                client,
                metrics,
                parse: self.parse,
                start: self.start,
                on_error: self.on_error,
                exporters: self.exporters,
                pending,
                shutdown: AtomicBool::new(false),
                interrupts: AtomicUsize::new(0),
                context: CancellationToken::new(),
                exports_tx: Mutex::new(Some(exports_tx)),
                exports_rx: Mutex::new(Some(exports_rx)),
                fan_out: Mutex::new(None),
            }),
        })
    }
}
