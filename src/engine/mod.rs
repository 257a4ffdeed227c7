// src/engine/mod.rs
// =============================================================================
// The crawl coordinator.
//
// An Engine is a cheap handle (Arc inside) that callbacks receive and use to
// issue more requests. Every request goes through the same path:
//
//   request() -> admission gates -> request interceptors -> fetch (cache or
//   executor, with retries) -> response interceptors -> callback
//
// Completion tracking:
// - a pending counter (tokio watch channel) goes up before a request is
//   dispatched and down, through a drop guard, after its terminal outcome
//   (response handled, cancelled, failed or panicked)
// - await_idle() waits for the counter to reach zero, closes the export
//   stream and waits for the exporters to drain
//
// Shutdown is two-phase: the first interrupt stops new requests from being
// admitted while in-flight ones finish; a second interrupt is only logged.
// =============================================================================

mod builder;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use builder::EngineBuilder;

use crate::admission::AdmissionController;
use crate::client::{Client, Fetch};
use crate::config::Config;
use crate::error::FetchError;
use crate::export::Exporter;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::pipeline::Pipeline;
use crate::request::{Request, Response};

/// Handles a response. Gets an engine handle to issue follow-up requests.
pub type Callback = Arc<dyn Fn(Engine, Response) -> BoxFuture<'static, ()> + Send + Sync>;
pub type StartCallback = Arc<dyn Fn(Engine) -> BoxFuture<'static, ()> + Send + Sync>;
pub type ErrorCallback =
    Arc<dyn Fn(Engine, Arc<Request>, FetchError) -> BoxFuture<'static, ()> + Send + Sync>;

// Items waiting between Engine::export and the exporters
const EXPORT_BUFFER: usize = 1;
const LIVENESS_TICK: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: Config,
    admission: AdmissionController,
    pipeline: Pipeline,
    fetcher: Arc<dyn Fetch>,
    client: Arc<Client>,
    metrics: Arc<Metrics>,

    parse: Option<Callback>,
    start: Option<StartCallback>,
    on_error: Option<ErrorCallback>,
    exporters: Vec<Arc<dyn Exporter>>,

    pending: watch::Sender<usize>,
    shutdown: AtomicBool,
    interrupts: AtomicUsize,
    context: CancellationToken,

    exports_tx: Mutex<Option<mpsc::Sender<Value>>>,
    exports_rx: Mutex<Option<mpsc::Receiver<Value>>>,
    fan_out: Mutex<Option<JoinHandle<()>>>,
}

// Marks one request as finished when dropped, whatever the exit path
struct PendingGuard(Arc<EngineInner>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    // -------------------------------------------------------------------------
    // Issuing requests
    // -------------------------------------------------------------------------

    /// Issues a request handled by the default callback
    pub async fn request(&self, req: Request) {
        self.dispatch(req, None).await
    }

    /// Issues a request handled by `callback` instead of the default one
    pub async fn request_with<F, Fut>(&self, req: Request, callback: F)
    where
        F: Fn(Engine, Response) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: Callback = Arc::new(move |engine, res| callback(engine, res).boxed());
        self.dispatch(req, Some(callback)).await
    }

    pub async fn get(&self, url: &str) {
        match Request::get(url) {
            Ok(req) => self.request(req).await,
            Err(e) => error!(error = %e, "request creation failed"),
        }
    }

    /// GET through the rendering collaborator
    pub async fn get_rendered(&self, url: &str) {
        match Request::get(url) {
            Ok(mut req) => {
                req.rendered = true;
                self.request(req).await
            }
            Err(e) => error!(error = %e, "request creation failed"),
        }
    }

    pub async fn head(&self, url: &str) {
        match Request::head(url) {
            Ok(req) => self.request(req).await,
            Err(e) => error!(error = %e, "request creation failed"),
        }
    }

    pub async fn post(&self, url: &str, body: impl Into<Bytes>) {
        match Request::post(url, body) {
            Ok(req) => self.request(req).await,
            Err(e) => error!(error = %e, "request creation failed"),
        }
    }

    // Counts the request and runs it, inline when synchronized, otherwise on
    // its own task. After shutdown nothing new is admitted.
    async fn dispatch(&self, mut req: Request, callback: Option<Callback>) {
        if self.is_shutting_down() {
            debug!(url = %req.url, "shutting down, request dropped");
            return;
        }

        req.adopt_context(&self.inner.context);
        self.inner.pending.send_modify(|n| *n += 1);
        let guard = PendingGuard(Arc::clone(&self.inner));

        let synchronized = req.synchronized;
        let run = self.clone().run(req, callback, guard);
        if synchronized {
            run.await
        } else {
            tokio::spawn(run);
        }
    }

    // One request from admission to callback. A panic anywhere inside is
    // caught here, counted and logged; the guard still releases the count.
    fn run(self, req: Request, callback: Option<Callback>, guard: PendingGuard) -> BoxFuture<'static, ()> {
        let url = req.url.clone();
        let metrics = Arc::clone(&self.inner.metrics);

        async move {
            let _guard = guard;
            let outcome = AssertUnwindSafe(self.process(req, callback))
                .catch_unwind()
                .await;
            if outcome.is_err() {
                metrics.panic_recovered();
                error!(url = %url, "recovered from panic while processing request");
            }
        }
        .boxed()
    }

    async fn process(&self, mut req: Request, callback: Option<Callback>) {
        let _admission = match self.inner.admission.acquire(&req).await {
            Ok(admission) => admission,
            Err(e) => return self.handle_error(Arc::new(req), e).await,
        };

        if !self.inner.pipeline.process_request(&mut req).await {
            return;
        }

        let req = Arc::new(req);
        let mut res = match self.inner.fetcher.fetch(Arc::clone(&req)).await {
            Ok(res) => res,
            Err(e) => return self.handle_error(req, e).await,
        };

        self.inner.pipeline.process_response(&mut res);

        match callback.as_ref().or(self.inner.parse.as_ref()) {
            Some(callback) => callback(self.clone(), res).await,
            None => debug!(url = %res.url, "no callback for response"),
        }
    }

    async fn handle_error(&self, req: Arc<Request>, err: FetchError) {
        match &self.inner.on_error {
            Some(on_error) => on_error(self.clone(), req, err).await,
            None => error!(url = %req.url, error = %err, "fetch failed"),
        }
    }

    // -------------------------------------------------------------------------
    // Results
    // -------------------------------------------------------------------------

    /// Sends an item to every exporter. Waits while the exporters are busy.
    pub async fn export(&self, item: Value) {
        self.ensure_exporting();

        let tx = self
            .inner
            .exports_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match tx {
            Some(tx) => {
                if tx.send(item).await.is_err() {
                    warn!("export stream closed, item dropped");
                }
            }
            None => warn!("export stream closed, item dropped"),
        }
    }

    // Starts the fan-out task the first time it is needed
    fn ensure_exporting(&self) {
        let rx = self
            .inner
            .exports_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(rx) = rx {
            let handle = tokio::spawn(fan_out(rx, self.inner.exporters.clone()));
            *self
                .inner
                .fan_out
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Runs the whole crawl: starts the exporters and the interrupt watcher,
    /// issues the seeds and returns once everything has finished.
    pub async fn start(&self) {
        self.ensure_exporting();
        let watcher = tokio::spawn(watch_interrupts(self.clone()));

        info!("crawl started");
        match &self.inner.start {
            Some(start) => start(self.clone()).await,
            None => {
                for url in &self.inner.config.start_urls {
                    self.get(url).await;
                }
            }
        }

        self.await_idle().await;
        watcher.abort();

        let stats = self.metrics();
        info!(
            requests = stats.requests,
            responses = stats.responses,
            retries = stats.retries,
            cache_hits = stats.cache_hits,
            "crawl finished"
        );
    }

    /// Waits until no request is pending, then closes the export stream and
    /// waits for the exporters. Calling it again returns immediately.
    pub async fn await_idle(&self) {
        let mut pending = self.inner.pending.subscribe();
        while *pending.borrow_and_update() != 0 {
            if pending.changed().await.is_err() {
                break;
            }
        }

        let tx = self
            .inner
            .exports_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(tx);

        // Nobody exported and start() was not used: drop the unused receiver
        // so a later export does not wait on a stream nobody reads.
        self.inner
            .exports_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let fan_out = self
            .inner
            .fan_out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = fan_out {
            if let Err(e) = handle.await {
                error!(error = %e, "export task failed");
            }
        }
    }

    /// First call: stop admitting new requests and let in-flight ones finish.
    /// Later calls are logged only.
    pub fn interrupt(&self) {
        let count = self.inner.interrupts.fetch_add(1, Ordering::SeqCst) + 1;
        if count == 1 {
            self.inner.shutdown.store(true, Ordering::SeqCst);
            info!("interrupted, waiting for in-flight requests; send again to force");
        } else {
            warn!("interrupted again, still waiting for in-flight requests");
        }
    }

    /// Stops admission and cancels every request's context: gate waits and
    /// rendering sessions give up. Exchanges already on the wire complete.
    pub fn cancel(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.context.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Requests issued but not finished yet
    pub fn pending(&self) -> usize {
        *self.inner.pending.borrow()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    // -------------------------------------------------------------------------
    // Cookies
    // -------------------------------------------------------------------------

    pub fn set_cookies(&self, url: &str, cookies: &[&str]) -> Result<(), FetchError> {
        let url = Request::parse_destination(url)?;
        self.inner.client.set_cookies(&url, cookies)
    }

    pub fn cookies(&self, url: &str) -> Result<Option<String>, FetchError> {
        let url = Request::parse_destination(url)?;
        let header = self.inner.client.cookies(&url)?;
        Ok(header
            .as_ref()
            .and_then(|v| v.to_str().ok())
            .map(str::to_string))
    }
}

// Copies every item to every exporter. With no exporters the stream is
// drained so Engine::export never blocks.
async fn fan_out(mut rx: mpsc::Receiver<Value>, exporters: Vec<Arc<dyn Exporter>>) {
    if exporters.is_empty() {
        while rx.recv().await.is_some() {}
        return;
    }

    let mut senders = Vec::with_capacity(exporters.len());
    let mut handles = Vec::with_capacity(exporters.len());
    for exporter in exporters {
        let (tx, exporter_rx) = mpsc::channel(EXPORT_BUFFER);
        senders.push(tx);
        handles.push(tokio::spawn(async move {
            if let Err(e) = exporter.export(exporter_rx).await {
                error!(error = %e, "exporter failed");
            }
        }));
    }

    while let Some(item) = rx.recv().await {
        for tx in &senders {
            // A failed exporter has dropped its receiver; the others go on
            let _ = tx.send(item.clone()).await;
        }
    }

    drop(senders);
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "exporter task failed");
        }
    }
}

// Turns Ctrl-C into Engine::interrupt. The tick keeps a heartbeat in the
// debug log while the crawl runs.
async fn watch_interrupts(engine: Engine) {
    let mut tick = tokio::time::interval(LIVENESS_TICK);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if signal.is_err() {
                    warn!("cannot listen for interrupts");
                    return;
                }
                engine.interrupt();
            }
            _ = tick.tick() => {
                debug!(pending = engine.pending(), "crawl in progress");
            }
        }
    }
}
