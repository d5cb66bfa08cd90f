//! Upstream streaming subscription, one per environment.
//!
//! Connects to the flag service's streaming endpoint, decodes the SSE wire
//! format incrementally, and applies `put`/`patch`/`delete` messages to the
//! environment's store. The connection is retried forever with exponential
//! backoff; errors are logged and never surfaced to downstream callers.

use crate::errors::StoreError;
use crate::store::{AllData, DataKind, FeatureStore, StoreItem};
use futures::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
// A connection that survived this long resets the backoff ladder.
const BACKOFF_RESET_AFTER: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
enum StreamError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// A decoded SSE message.
#[derive(Debug, PartialEq)]
struct MessageEvent {
    name: String,
    data: String,
}

/// Incremental SSE decoder. Chunks are fed as they arrive; complete events
/// come out once their terminating blank line has been seen.
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    fn feed(&mut self, chunk: &[u8]) -> Vec<MessageEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<MessageEvent> {
        if line.is_empty() {
            // Blank line dispatches the accumulated event, if any.
            let name = self.event_name.take();
            if self.data_lines.is_empty() {
                return None;
            }
            let data = std::mem::take(&mut self.data_lines).join("\n");
            return Some(MessageEvent {
                name: name.unwrap_or_else(|| "message".to_string()),
                data,
            });
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event_name = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            // id and retry are legal SSE fields this protocol does not use.
            _ => {}
        }
        None
    }
}

#[derive(Deserialize)]
struct PutMessage {
    data: PutData,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct PutData {
    flags: HashMap<String, serde_json::Value>,
    segments: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct PatchMessage {
    path: String,
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct DeleteMessage {
    path: String,
    version: u64,
}

/// Splits `/flags/<key>` / `/segments/<key>` into kind and key.
fn parse_item_path(path: &str) -> Option<(DataKind, &str)> {
    let (kind, key) = path.strip_prefix('/')?.split_once('/')?;
    Some((DataKind::from_path_name(kind)?, key))
}

fn items_from_json(raw: HashMap<String, serde_json::Value>) -> HashMap<String, StoreItem> {
    raw.into_iter()
        .map(|(key, value)| (key, StoreItem::from_json(value)))
        .collect()
}

/// Streaming client owned by an environment's supervisor. The store it
/// writes into is the environment's relay adapter, so every applied message
/// is simultaneously fanned out downstream.
pub struct StreamingClient {
    environment: String,
    sdk_key: String,
    stream_uri: String,
    store: Arc<dyn FeatureStore>,
    http: reqwest::Client,
    ready: watch::Sender<bool>,
}

impl StreamingClient {
    pub fn new(
        environment: &str,
        sdk_key: &str,
        stream_uri: &str,
        store: Arc<dyn FeatureStore>,
    ) -> Result<(Self, watch::Receiver<bool>), crate::errors::RelayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| crate::errors::RelayError::Internal(e.to_string()))?;

        let (ready, ready_rx) = watch::channel(false);
        Ok((
            StreamingClient {
                environment: environment.to_string(),
                sdk_key: sdk_key.to_string(),
                stream_uri: stream_uri.trim_end_matches('/').to_string(),
                store,
                http,
                ready,
            },
            ready_rx,
        ))
    }

    /// Runs the reconnect loop until the process exits.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;
            loop {
                let connected_at = Instant::now();
                match self.read_stream().await {
                    Ok(()) => {
                        tracing::info!(environment = %self.environment, "stream ended, reconnecting");
                    }
                    Err(err) => {
                        tracing::warn!(
                            environment = %self.environment,
                            error = %err,
                            "stream connection failed, reconnecting"
                        );
                    }
                }

                if connected_at.elapsed() >= BACKOFF_RESET_AFTER {
                    backoff = INITIAL_BACKOFF;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        })
    }

    async fn read_stream(&self) -> Result<(), StreamError> {
        let response = self
            .http
            .get(format!("{}/all", self.stream_uri))
            .header(AUTHORIZATION, &self.sdk_key)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?
            .error_for_status()?;

        tracing::debug!(environment = %self.environment, "stream connected");

        let mut decoder = SseDecoder::default();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            for event in decoder.feed(&chunk?) {
                self.dispatch(event).await?;
            }
        }
        Ok(())
    }

    async fn dispatch(&self, event: MessageEvent) -> Result<(), StreamError> {
        match event.name.as_str() {
            "put" => {
                let message: PutMessage = serde_json::from_str(&event.data)
                    .map_err(|e| StreamError::Protocol(format!("bad put event: {e}")))?;
                self.store
                    .init(AllData {
                        flags: items_from_json(message.data.flags),
                        segments: items_from_json(message.data.segments),
                    })
                    .await?;
                self.ready.send_replace(true);
                tracing::info!(environment = %self.environment, "received initial flag data");
            }
            "patch" => {
                let message: PatchMessage = serde_json::from_str(&event.data)
                    .map_err(|e| StreamError::Protocol(format!("bad patch event: {e}")))?;
                let Some((kind, key)) = parse_item_path(&message.path) else {
                    tracing::debug!(path = %message.path, "ignoring patch with unknown path");
                    return Ok(());
                };
                self.store
                    .upsert(kind, key, StoreItem::from_json(message.data))
                    .await?;
            }
            "delete" => {
                let message: DeleteMessage = serde_json::from_str(&event.data)
                    .map_err(|e| StreamError::Protocol(format!("bad delete event: {e}")))?;
                let Some((kind, key)) = parse_item_path(&message.path) else {
                    tracing::debug!(path = %message.path, "ignoring delete with unknown path");
                    return Ok(());
                };
                self.store.delete(kind, key, message.version).await?;
            }
            other => {
                tracing::debug!(event = other, "ignoring unrecognized stream event");
            }
        }
        Ok(())
    }
}
