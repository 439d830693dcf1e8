//! Broadcast-based event bus for pipeline observability.
//!
//! Wraps `tokio::sync::broadcast` so multiple consumers (JSONL logger,
//! console) each receive their own copy of every event. Slow consumers are
//! dropped via the channel's lag mechanism.

use anyhow::{Context, Result};
use marshal_core::event::{EventKind, PipelineEvent};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const DEFAULT_CAPACITY: usize = 4096;

/// Clone-friendly handle; all clones share one broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: Arc<broadcast::Sender<PipelineEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx: Arc::new(tx) }
    }

    /// Emit an event to all subscribers. Never blocks; with no subscribers
    /// the event is dropped.
    pub fn emit(&self, kind: EventKind) {
        let _ = self.tx.send(PipelineEvent::new(kind));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Append every event to `path` as one JSON object per line until
/// `shutdown` fires or the bus closes.
pub async fn spawn_jsonl_log(
    bus: &EventBus,
    path: &Path,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context(format!("failed to create {}", parent.display()))?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .context(format!("failed to open event log {}", path.display()))?;
    let mut rx = bus.subscribe();
    let path: PathBuf = path.to_path_buf();

    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event log fell behind");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            let mut line = match serde_json::to_string(&event) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!(error = %e, "unserializable event");
                    continue;
                }
            };
            line.push('\n');
            if let Err(e) = file.write_all(line.as_bytes()).await {
                tracing::warn!(path = %path.display(), error = %e, "failed to append event");
            }
        }
        let _ = file.flush().await;
    }))
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
