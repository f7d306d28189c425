//! JSON-lines work sink for `siphon drain`.

use async_trait::async_trait;
use siphon_sync::{SinkError, WorkItem, WorkSink};
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Writes one JSON object per line to a file or stdout.
pub struct JsonlSink {
    out: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl JsonlSink {
    /// Append to `path`, or write to stdout when `None`.
    pub async fn open(path: Option<&Path>) -> std::io::Result<Self> {
        let out: Box<dyn AsyncWrite + Send + Unpin> = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }
                let file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?;
                Box::new(file)
            }
            None => Box::new(tokio::io::stdout()),
        };
        Ok(Self {
            out: Mutex::new(out),
        })
    }
}

#[async_trait]
impl WorkSink for JsonlSink {
    async fn deliver(&self, item: &WorkItem) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(item)
            .map_err(|e| SinkError::permanent(format!("encode work item: {e}")))?;
        line.push(b'\n');

        let mut out = self.out.lock().await;
        out.write_all(&line)
            .await
            .map_err(|e| SinkError::retryable(format!("write work item: {e}")))?;
        out.flush()
            .await
            .map_err(|e| SinkError::retryable(format!("flush work item: {e}")))?;
        Ok(())
    }
}
