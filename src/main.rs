// src/main.rs
// =============================================================================
// This is the entry point of the trawler CLI.
//
// What happens here:
// 1. Parse command-line arguments using clap
// 2. Set up logging (tracing, to stderr so stdout stays clean for results)
// 3. Build an engine from the flags and run the crawl
// 4. Exit with proper code (0 = success, 2 = error)
//
// Every crawled page becomes one JSON record:
//   {"url": ..., "status": 200, "title": ..., "depth": 0, "links": 12, "cached": false}
// =============================================================================

mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use scraper::{Html, Selector};
use serde_json::{json, Value};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::{Cli, Commands, CrawlArgs};
use trawler::{DiskStore, Engine, EngineBuilder, Exporter, JsonArray, JsonLines, Request, Response};

const DEPTH_KEY: &str = "depth";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.quiet);

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e);
            2
        }
    };

    std::process::exit(exit_code);
}

fn init_tracing(quiet: bool) {
    let default_level = if quiet { "warn" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Crawl(args) => crawl(args).await,
    }
}

async fn crawl(args: CrawlArgs) -> Result<()> {
    let max_depth = args.max_depth;

    let exporter: Arc<dyn Exporter> = match (&args.output, args.json_array) {
        (Some(path), true) => Arc::new(JsonArray::new(path)),
        (Some(path), false) => Arc::new(JsonLines::new(path)),
        (None, _) => Arc::new(JsonLines::stdout()),
    };

    let cache = match &args.cache_dir {
        Some(dir) => Some(
            DiskStore::new(dir)
                .with_context(|| format!("could not open cache directory {}", dir.display()))?,
        ),
        None => None,
    };

    let mut builder = EngineBuilder::new(args.into_config())
        .parse(move |engine, res| handle_page(engine, res, max_depth))
        .exporter(exporter);
    if let Some(store) = cache {
        builder = builder.cache(Arc::new(store));
    }

    let engine = builder.build().context("invalid crawl configuration")?;
    engine.start().await;

    Ok(())
}

// Exports a record for the page and follows its links one level deeper
async fn handle_page(engine: Engine, res: Response, max_depth: usize) {
    let depth = res
        .request
        .meta
        .get(DEPTH_KEY)
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize;

    engine
        .export(json!({
            "url": res.url.as_str(),
            "status": res.status.as_u16(),
            "title": page_title(&res),
            "depth": depth,
            "links": res.links.len(),
            "cached": res.from_cache,
        }))
        .await;

    if depth + 1 >= max_depth {
        return;
    }

    for link in &res.links {
        let Ok(mut req) = Request::get(link.as_str()) else {
            continue;
        };
        req.meta.insert(DEPTH_KEY.to_string(), json!(depth + 1));
        engine.request(req).await;
    }
}

fn page_title(res: &Response) -> Option<String> {
    if !res.is_html() {
        return None;
    }
    let selector = Selector::parse("title").ok()?;
    let document = Html::parse_document(&res.text());
    let title = document.select(&selector).next()?.text().collect::<String>();
    let title = title.trim();
    (!title.is_empty()).then(|| title.to_string())
}
