// src/lib.rs
// =============================================================================
// trawler: a concurrent web crawling engine.
//
// Modules, leaves first:
// - request: Request / Response
// - pipeline: request and response interceptors (politeness, dedup, headers,
//   delay, metrics, robots.txt, link extraction)
// - admission: rate, global and per-host concurrency gates
// - client: the fetch executor (transport, retries, decoding, rendering)
// - cache: HTTP response cache in front of the executor
// - engine: dispatch, completion tracking, exports and shutdown
//
// Quick start:
//
//   let engine = EngineBuilder::new(config)
//       .parse(|engine, res| async move { /* use res, issue more requests */ })
//       .build()?;
//   engine.start().await;
// =============================================================================

pub mod admission;
pub mod cache;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod metrics;
pub mod pipeline;
pub mod request;

pub use cache::{CacheStore, CacheTransport, DiskStore, MemoryStore, SledStore};
pub use client::{Fetch, RenderAction};
pub use config::{Allocator, CachePolicy, Config};
pub use engine::{Engine, EngineBuilder};
pub use error::{ConfigError, FetchError};
pub use export::{Exporter, JsonArray, JsonLines};
pub use metrics::MetricsSnapshot;
pub use request::{Request, Response};
