// src/client/render.rs
// =============================================================================
// Rendered fetches: let a headless browser load the page and hand back the
// DOM after its network has settled.
//
// The engine only talks to the Renderer trait. Two allocators exist:
// - LocalRenderer: spawns a headless Chromium per request with --dump-dom.
//   The virtual time budget lets the page finish its network activity
//   before the DOM is printed.
// - RemoteRenderer: POSTs to a browserless-compatible /content endpoint and
//   waits for networkidle0.
//
// Dropping a render future tears the session down: the child process is
// killed (kill_on_drop) or the HTTP call is aborted. The executor relies on
// that for timeouts and cancellation.
// =============================================================================

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use tokio::process::Command;
use url::Url;

use crate::config::Allocator;
use crate::error::FetchError;
use crate::request::Request;

// How long the local browser may keep the page's network busy before the DOM
// is dumped, when the request does not ask for more.
const DEFAULT_SETTLE_BUDGET: Duration = Duration::from_secs(5);

/// Extra steps run in the browser after navigation
#[derive(Debug, Clone, PartialEq)]
pub enum RenderAction {
    /// Wait until an element matching the CSS selector exists
    WaitForSelector(String),
    /// Give the page extra time
    Wait(Duration),
    /// Inject and run a script
    Evaluate(String),
}

#[derive(Debug, Clone)]
pub struct Rendered {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub url: Url,
    pub document: String,
}

#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, req: &Request) -> Result<Rendered, FetchError>;
}

// Picks the renderer for the configured allocator
pub fn renderer_for(allocator: &Allocator, client: reqwest::Client) -> Arc<dyn Renderer> {
    match allocator {
        Allocator::Local { program } => Arc::new(LocalRenderer::new(program.clone())),
        Allocator::Remote { endpoint } => Arc::new(RemoteRenderer::new(endpoint.clone(), client)),
    }
}

pub struct LocalRenderer {
    program: String,
}

impl LocalRenderer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl Renderer for LocalRenderer {
    async fn render(&self, req: &Request) -> Result<Rendered, FetchError> {
        let mut budget = DEFAULT_SETTLE_BUDGET;
        for action in &req.actions {
            match action {
                RenderAction::Wait(extra) => budget += *extra,
                other => {
                    return Err(FetchError::Render {
                        url: req.url.to_string(),
                        reason: format!("{:?} needs a remote allocator", other),
                    })
                }
            }
        }

        let mut command = Command::new(&self.program);
        command
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--dump-dom")
            .arg(format!("--virtual-time-budget={}", budget.as_millis()));
        if let Some(agent) = req.user_agent() {
            command.arg(format!("--user-agent={}", agent));
        }
        command
            .arg(req.url.as_str())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = command.output().await.map_err(|e| FetchError::Render {
            url: req.url.to_string(),
            reason: format!("could not start {}: {}", self.program, e),
        })?;

        if !output.status.success() {
            return Err(FetchError::Render {
                url: req.url.to_string(),
                reason: format!("{} exited with {}", self.program, output.status),
            });
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));

        Ok(Rendered {
            status: StatusCode::OK,
            headers,
            url: req.url.clone(),
            document: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

pub struct RemoteRenderer {
    endpoint: Url,
    client: reqwest::Client,
}

impl RemoteRenderer {
    pub fn new(endpoint: Url, client: reqwest::Client) -> Self {
        Self { endpoint, client }
    }

    fn payload(req: &Request) -> Value {
        let mut payload = json!({
            "url": req.url.as_str(),
            "setExtraHTTPHeaders": header_map_to_json(&req.headers),
            "gotoOptions": { "waitUntil": "networkidle0" },
        });

        let mut scripts = Vec::new();
        let mut wait = Duration::ZERO;
        for action in &req.actions {
            match action {
                RenderAction::WaitForSelector(selector) => {
                    payload["waitForSelector"] = json!({ "selector": selector });
                }
                RenderAction::Wait(extra) => wait += *extra,
                RenderAction::Evaluate(script) => scripts.push(json!({ "content": script })),
            }
        }
        if !wait.is_zero() {
            payload["waitForTimeout"] = json!(wait.as_millis() as u64);
        }
        if !scripts.is_empty() {
            payload["addScriptTag"] = Value::Array(scripts);
        }

        payload
    }
}

#[async_trait]
impl Renderer for RemoteRenderer {
    async fn render(&self, req: &Request) -> Result<Rendered, FetchError> {
        let endpoint = self.endpoint.join("content").map_err(|e| FetchError::Render {
            url: req.url.to_string(),
            reason: format!("bad rendering endpoint: {}", e),
        })?;

        let response = self
            .client
            .post(endpoint)
            .json(&Self::payload(req))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::Render {
                url: req.url.to_string(),
                reason: format!("rendering service answered {}", response.status()),
            });
        }

        // The service reports the page's own status and final URL in headers
        let status = response
            .headers()
            .get("x-response-code")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u16>().ok())
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(StatusCode::OK);
        let url = response
            .headers()
            .get("x-response-url")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Url::parse(v).ok())
            .unwrap_or_else(|| req.url.clone());
        let headers = response.headers().clone();
        let document = response.text().await?;

        Ok(Rendered {
            status,
            headers,
            url,
            document,
        })
    }
}

fn header_map_to_json(headers: &HeaderMap) -> Map<String, Value> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), Value::from(v)))
        })
        .collect()
}
