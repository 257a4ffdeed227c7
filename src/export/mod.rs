// src/export/mod.rs
// =============================================================================
// Result consumers.
//
// Items passed to Engine::export travel through a bounded channel. The engine
// fans every item out to every registered Exporter; each exporter owns its
// receiving end and returns once the channel closes (after await_idle).
//
// Two file formats are provided:
// - JsonLines: one JSON document per line, appended as items arrive
// - JsonArray: a single JSON array, closed when the crawl ends
// =============================================================================

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("could not open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not write export: {0}")]
    Write(#[from] std::io::Error),
}

#[async_trait]
pub trait Exporter: Send + Sync {
    async fn export(&self, items: mpsc::Receiver<Value>) -> Result<(), ExportError>;
}

#[derive(Debug, Clone)]
enum Target {
    File(PathBuf),
    Stdout,
}

impl Target {
    async fn open(&self) -> Result<Box<dyn AsyncWrite + Send + Unpin>, ExportError> {
        match self {
            Target::Stdout => Ok(Box::new(tokio::io::stdout())),
            Target::File(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|source| ExportError::Open {
                        path: path.clone(),
                        source,
                    })?;
                Ok(Box::new(file))
            }
        }
    }
}

/// Streams items as JSON lines
#[derive(Debug, Clone)]
pub struct JsonLines {
    target: Target,
}

impl JsonLines {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            target: Target::File(path.into()),
        }
    }

    pub fn stdout() -> Self {
        Self {
            target: Target::Stdout,
        }
    }
}

#[async_trait]
impl Exporter for JsonLines {
    async fn export(&self, mut items: mpsc::Receiver<Value>) -> Result<(), ExportError> {
        let mut out = self.target.open().await?;

        while let Some(item) = items.recv().await {
            let mut line = match serde_json::to_vec(&item) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "could not encode exported item");
                    continue;
                }
            };
            line.push(b'\n');
            out.write_all(&line).await?;
        }

        out.flush().await?;
        Ok(())
    }
}

/// Collects items into one JSON array
#[derive(Debug, Clone)]
pub struct JsonArray {
    target: Target,
}

impl JsonArray {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            target: Target::File(path.into()),
        }
    }
}

#[async_trait]
impl Exporter for JsonArray {
    async fn export(&self, mut items: mpsc::Receiver<Value>) -> Result<(), ExportError> {
        let mut out = self.target.open().await?;
        out.write_all(b"[\n").await?;

        let mut first = true;
        while let Some(item) = items.recv().await {
            let encoded = match serde_json::to_string(&item) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(error = %e, "could not encode exported item");
                    continue;
                }
            };
            let prefix = if first { "\t" } else { ",\n\t" };
            first = false;
            out.write_all(prefix.as_bytes()).await?;
            out.write_all(encoded.as_bytes()).await?;
        }

        out.write_all(if first { b"]\n" as &[u8] } else { b"\n]\n" }).await?;
        out.flush().await?;
        Ok(())
    }
}
